use super::{DownloadTask, TaskState};
use crate::progress::RunId;
use crate::resolver::{DependencyCycle, Resolution, UnknownPresetWarning};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Error category surfaced per failed path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    Network,
    HttpStatus,
    ChecksumMismatch,
    SizeMismatch,
    DiskFull,
    Io,
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Network => "Network",
            Self::HttpStatus => "HttpStatus",
            Self::ChecksumMismatch => "ChecksumMismatch",
            Self::SizeMismatch => "SizeMismatch",
            Self::DiskFull => "DiskFull",
            Self::Io => "Io",
            Self::Internal => "Internal",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedTask {
    pub path: String,
    pub preset_id: String,
    pub kind: FailureKind,
    pub message: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReportCounts {
    pub skipped: usize,
    pub downloaded: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Paths left to another run holding the lease
    pub deferred: usize,
}

/// Outcome of one scheduler run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TerminalReport {
    pub run_id: RunId,
    pub counts: ReportCounts,
    pub failed: Vec<FailedTask>,
    pub deferred: Vec<String>,
    pub cancelled: Vec<String>,
    pub unknown: Vec<UnknownPresetWarning>,
    pub unresolved: Vec<DependencyCycle>,
    pub finished_at: String,
}

impl TerminalReport {
    #[must_use]
    pub fn from_tasks(run_id: RunId, tasks: &[DownloadTask]) -> Self {
        let mut counts = ReportCounts::default();
        let mut failed = Vec::new();
        let mut deferred = Vec::new();
        let mut cancelled = Vec::new();

        for task in tasks {
            match task.state {
                TaskState::Skipped => counts.skipped += 1,
                TaskState::Done => counts.downloaded += 1,
                TaskState::Deferred => {
                    counts.deferred += 1;
                    deferred.push(task.spec.path.clone());
                }
                TaskState::Cancelled => {
                    counts.cancelled += 1;
                    cancelled.push(task.spec.path.clone());
                }
                // Anything not terminal at the end of a run counts as failed
                TaskState::Failed
                | TaskState::Pending
                | TaskState::InProgress
                | TaskState::Verifying => {
                    counts.failed += 1;
                    let (kind, message) = task.last_error.as_ref().map_or_else(
                        || {
                            (
                                FailureKind::Internal,
                                format!("task ended in state '{}'", task.state),
                            )
                        },
                        |e| (e.kind, e.message.clone()),
                    );
                    failed.push(FailedTask {
                        path: task.spec.path.clone(),
                        preset_id: task.preset_id.clone(),
                        kind,
                        message,
                        attempts: task.attempts,
                    });
                }
            }
        }

        Self {
            run_id,
            counts,
            failed,
            deferred,
            cancelled,
            unknown: Vec::new(),
            unresolved: Vec::new(),
            finished_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Attach resolver warnings and unresolved presets
    #[must_use]
    pub fn with_resolution(mut self, resolution: &Resolution) -> Self {
        self.unknown = resolution.unknown.clone();
        self.unresolved = resolution.cycles.clone();
        self
    }

    /// Nothing failed, nothing was cancelled, and every requested preset resolved
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.unresolved.is_empty() && self.counts.cancelled == 0
    }

    #[must_use]
    pub fn failure(&self, path: &str) -> Option<&FailedTask> {
        self.failed.iter().find(|f| f.path == path)
    }
}

impl fmt::Display for TerminalReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.counts;
        writeln!(
            f,
            "Run {}: {} downloaded, {} skipped, {} failed, {} cancelled, {} already downloading",
            self.run_id, c.downloaded, c.skipped, c.failed, c.cancelled, c.deferred
        )?;
        for failed in &self.failed {
            writeln!(
                f,
                "  FAILED {} [{}] after {} attempt(s): {}",
                failed.path, failed.kind, failed.attempts, failed.message
            )?;
        }
        for path in &self.deferred {
            writeln!(f, "  AlreadyDownloading {path}")?;
        }
        for warning in &self.unknown {
            writeln!(f, "  warning: {warning}")?;
        }
        for cycle in &self.unresolved {
            writeln!(f, "  unresolved: {cycle}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::TaskFailure;
    use crate::registry::FileSpec;
    use crate::resolver::ManifestEntry;

    fn task(id: usize, path: &str, size: u64, state: TaskState) -> DownloadTask {
        let mut task = DownloadTask::from_entry(
            id,
            &ManifestEntry {
                preset_id: "p".to_string(),
                required_by: vec!["p".to_string()],
                spec: FileSpec {
                    path: path.to_string(),
                    url: format!("https://example.invalid/{path}"),
                    size,
                    checksum: None,
                    source: None,
                },
            },
        );
        task.state = state;
        task
    }

    #[test]
    fn test_report_counts_and_failures() {
        let ok = task(0, "ok.bin", 10, TaskState::Done);
        let mut corrupt = task(1, "corrupt.bin", 20, TaskState::Failed);
        corrupt.attempts = 2;
        corrupt.last_error = Some(TaskFailure::new(
            FailureKind::ChecksumMismatch,
            "Checksum mismatch",
        ));

        let report = TerminalReport::from_tasks(RunId::new(), &[ok, corrupt]);
        assert_eq!(report.counts.downloaded, 1);
        assert_eq!(report.counts.failed, 1);
        assert_eq!(
            report.failure("corrupt.bin").unwrap().kind,
            FailureKind::ChecksumMismatch
        );
        assert!(!report.is_success());

        let text = report.to_string();
        assert!(text.contains("1 downloaded"));
        assert!(text.contains("corrupt.bin [ChecksumMismatch]"));
    }

    #[test]
    fn test_deferred_is_not_failure() {
        let report = TerminalReport::from_tasks(
            RunId::new(),
            &[
                task(0, "a.bin", 1, TaskState::Skipped),
                task(1, "b.bin", 1, TaskState::Deferred),
            ],
        );
        assert_eq!(report.counts.deferred, 1);
        assert_eq!(report.deferred, vec!["b.bin"]);
        assert!(report.is_success());
    }

    #[test]
    fn test_unresolved_presets_fail_the_run() {
        let resolution = Resolution {
            cycles: vec![DependencyCycle {
                requested: "a".to_string(),
                cycle: vec!["a".to_string(), "b".to_string(), "a".to_string()],
            }],
            ..Resolution::default()
        };
        let report = TerminalReport::from_tasks(RunId::new(), &[]).with_resolution(&resolution);
        assert!(!report.is_success());
        assert!(report.to_string().contains("unresolved: dependency cycle in 'a'"));
    }
}
