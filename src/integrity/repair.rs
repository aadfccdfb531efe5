use super::verify_file;
use crate::error::IntegrityError;
use crate::resolver::{Manifest, ManifestEntry};
use futures_util::stream::{self, StreamExt};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptFile {
    pub path: String,
    pub preset_id: String,
    pub error: IntegrityError,
}

/// Result of checking installed files against their specs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairReport {
    pub healthy: Vec<String>,
    pub missing: Vec<String>,
    pub corrupt: Vec<CorruptFile>,
}

impl RepairReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.corrupt.is_empty()
    }

    /// Paths an operator should re-fetch
    #[must_use]
    pub fn needs_refetch(&self) -> Vec<&str> {
        self.missing
            .iter()
            .map(String::as_str)
            .chain(self.corrupt.iter().map(|c| c.path.as_str()))
            .collect()
    }
}

enum Finding {
    Healthy,
    Missing,
    Corrupt(IntegrityError),
}

async fn inspect(entry: &ManifestEntry, root: &Path) -> Finding {
    let target = entry.spec.target_path(root);
    match tokio::fs::metadata(&target).await {
        Ok(meta) if meta.is_file() => {}
        _ => return Finding::Missing,
    }

    match verify_file(&target, &entry.spec).await {
        Ok(()) => Finding::Healthy,
        Err(err) => Finding::Corrupt(err),
    }
}

/// Verify installed files without modifying anything
pub async fn repair_scan(manifest: &Manifest, root: &Path, concurrency: usize) -> RepairReport {
    let findings: Vec<(&ManifestEntry, Finding)> = stream::iter(manifest.entries())
        .map(|entry| async move { (entry, inspect(entry, root).await) })
        .buffered(concurrency.max(1))
        .collect()
        .await;

    let mut report = RepairReport::default();
    for (entry, finding) in findings {
        match finding {
            Finding::Healthy => report.healthy.push(entry.spec.path.clone()),
            Finding::Missing => report.missing.push(entry.spec.path.clone()),
            Finding::Corrupt(error) => {
                tracing::warn!("Corrupt file {}: {error}", entry.spec.path);
                report.corrupt.push(CorruptFile {
                    path: entry.spec.path.clone(),
                    preset_id: entry.preset_id.clone(),
                    error,
                });
            }
        }
    }

    tracing::info!(
        "Repair scan: {} healthy, {} missing, {} corrupt",
        report.healthy.len(),
        report.missing.len(),
        report.corrupt.len()
    );
    report
}
