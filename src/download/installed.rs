use super::{DownloadTask, TaskState};
use crate::error::{PresetError, Result};
use crate::registry::loader::write_atomic;
use crate::registry::PresetDescriptor;
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

/// Information about a file installed by a completed download
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstalledFile {
    pub path: String,
    pub preset_id: String,
    pub size_bytes: u64,
    pub checksum: Option<String>,
    pub revision: Option<String>,
    pub downloaded_at: String,
}

/// Ledger of downloaded files under one target root
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallLedger {
    pub files: Vec<InstalledFile>,
    pub last_updated: String,
}

impl Default for InstallLedger {
    fn default() -> Self {
        Self {
            files: Vec::new(),
            last_updated: chrono::Utc::now().to_rfc3339(),
        }
    }
}

impl InstallLedger {
    /// Load ledger from file, empty if it doesn't exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;

        serde_json::from_str(&content)
            .map_err(|e| PresetError::Other(format!("Failed to parse install ledger: {e}")))
    }

    /// Save ledger atomically (tmp + rename)
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| PresetError::Other(format!("Failed to serialize install ledger: {e}")))?;
        write_atomic(path, content.as_bytes())?;
        Ok(())
    }

    /// Add or replace the entry for a path
    pub fn record(&mut self, file: InstalledFile) {
        self.files.retain(|f| f.path != file.path);
        self.files.push(file);
        self.last_updated = chrono::Utc::now().to_rfc3339();
    }

    /// Record every task that finished downloading
    pub fn record_tasks(&mut self, tasks: &[DownloadTask]) -> usize {
        let mut recorded = 0;
        for task in tasks.iter().filter(|t| t.state == TaskState::Done) {
            self.record(InstalledFile {
                path: task.spec.path.clone(),
                preset_id: task.preset_id.clone(),
                size_bytes: task.bytes_transferred,
                checksum: task.spec.checksum.as_ref().map(|c| c.value.clone()),
                revision: task.spec.revision().map(str::to_string),
                downloaded_at: chrono::Utc::now().to_rfc3339(),
            });
            recorded += 1;
        }
        recorded
    }

    pub fn remove(&mut self, path: &str) -> bool {
        let before_len = self.files.len();
        self.files.retain(|f| f.path != path);
        let removed = self.files.len() != before_len;
        if removed {
            self.last_updated = chrono::Utc::now().to_rfc3339();
        }
        removed
    }

    #[must_use]
    pub fn find(&self, path: &str) -> Option<&InstalledFile> {
        self.files.iter().find(|f| f.path == path)
    }

    /// Every file of the preset is recorded
    #[must_use]
    pub fn is_installed(&self, preset: &PresetDescriptor) -> bool {
        !preset.files.is_empty() && preset.files.iter().all(|f| self.find(&f.path).is_some())
    }
}

/// Ledger location under a target root
#[must_use]
pub fn ledger_path(root: &Path) -> PathBuf {
    root.join(".preset-fetch/installed.json")
}

/// Read-modify-write the ledger while holding its file lock.
/// Blocks until concurrent runs release the lock.
pub fn update_ledger<F>(root: &Path, update: F) -> Result<()>
where
    F: FnOnce(&mut InstallLedger),
{
    let path = ledger_path(root);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let lock_file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path.with_extension("lock"))?;
    let _lock = Flock::lock(lock_file, FlockArg::LockExclusive)
        .map_err(|(_, errno)| PresetError::Io(errno.into()))?;

    let mut ledger = InstallLedger::load(&path)?;
    update(&mut ledger);
    ledger.save(&path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn file(path: &str, size: u64) -> InstalledFile {
        InstalledFile {
            path: path.to_string(),
            preset_id: "p".to_string(),
            size_bytes: size,
            checksum: None,
            revision: None,
            downloaded_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn test_record_replaces_existing() {
        let mut ledger = InstallLedger::default();
        ledger.record(file("a.bin", 100));
        ledger.record(file("a.bin", 200));
        assert_eq!(ledger.files.len(), 1);
        assert_eq!(ledger.find("a.bin").unwrap().size_bytes, 200);
    }

    #[test]
    fn test_remove() {
        let mut ledger = InstallLedger::default();
        ledger.record(file("a.bin", 1));
        assert!(ledger.remove("a.bin"));
        assert!(!ledger.remove("a.bin"));
    }

    #[test]
    fn test_load_nonexistent_ledger() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = InstallLedger::load(&ledger_path(temp_dir.path())).unwrap();
        assert!(ledger.files.is_empty());
    }

    #[test]
    fn test_update_ledger_persists() {
        let temp_dir = TempDir::new().unwrap();
        update_ledger(temp_dir.path(), |l| l.record(file("a.bin", 1))).unwrap();
        update_ledger(temp_dir.path(), |l| l.record(file("b.bin", 2))).unwrap();

        let ledger = InstallLedger::load(&ledger_path(temp_dir.path())).unwrap();
        assert_eq!(ledger.files.len(), 2);
        assert!(ledger.find("b.bin").is_some());
    }
}
