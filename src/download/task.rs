use super::FailureKind;
use crate::error::{FetchError, IntegrityError};
use crate::integrity::temp_path_for;
use crate::registry::FileSpec;
use crate::resolver::ManifestEntry;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Lifecycle of a single file download
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Skipped,
    InProgress,
    Verifying,
    Done,
    Failed,
    Cancelled,
    /// Another run holds the lease for this path
    Deferred,
}

impl TaskState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Skipped | Self::Done | Self::Failed | Self::Cancelled | Self::Deferred
        )
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Skipped => "skipped",
            Self::InProgress => "in progress",
            Self::Verifying => "verifying",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Deferred => "already downloading",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Classified failure of one task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn from_fetch(err: &FetchError) -> Self {
        let kind = match err {
            FetchError::Timeout(_) | FetchError::Connect(_) | FetchError::Stream(_) => {
                FailureKind::Network
            }
            FetchError::Status { .. } => FailureKind::HttpStatus,
            FetchError::Io(_) if err.is_disk_full() => FailureKind::DiskFull,
            FetchError::Io(_) => FailureKind::Io,
            FetchError::Cancelled => FailureKind::Internal,
        };
        Self::new(kind, err.to_string())
    }

    #[must_use]
    pub fn from_integrity(err: &IntegrityError) -> Self {
        let kind = match err {
            IntegrityError::SizeMismatch { .. } => FailureKind::SizeMismatch,
            IntegrityError::ChecksumMismatch { .. } => FailureKind::ChecksumMismatch,
            IntegrityError::Io(_) => FailureKind::Io,
        };
        Self::new(kind, err.to_string())
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// One manifest entry as owned by the scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    pub id: usize,
    pub preset_id: String,
    pub spec: FileSpec,
    pub state: TaskState,
    pub bytes_transferred: u64,
    pub attempts: u32,
    pub last_error: Option<TaskFailure>,
    /// Completed downloads rejected by the validator
    pub integrity_failures: u32,
}

impl DownloadTask {
    #[must_use]
    pub fn from_entry(id: usize, entry: &ManifestEntry) -> Self {
        Self {
            id,
            preset_id: entry.preset_id.clone(),
            spec: entry.spec.clone(),
            state: TaskState::Pending,
            bytes_transferred: 0,
            attempts: 0,
            last_error: None,
            integrity_failures: 0,
        }
    }

    #[must_use]
    pub fn target_path(&self, root: &Path) -> PathBuf {
        self.spec.target_path(root)
    }

    #[must_use]
    pub fn temp_path(&self, root: &Path) -> PathBuf {
        temp_path_for(&self.target_path(root))
    }
}
