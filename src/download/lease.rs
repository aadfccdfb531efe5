use crate::progress::{RunId, StateStore, TaskControl};
use crate::registry::FileSpec;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Contents of a lock file while its lease is held
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseHolder {
    pub pid: u32,
    pub run_id: RunId,
    pub acquired_at: String,
}

impl std::fmt::Display for LeaseHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "pid {} (run {}) since {}",
            self.pid, self.run_id, self.acquired_at
        )
    }
}

/// Exclusive right to write one target path.
/// Releases both the in-process entry and the file lock on drop.
pub struct PathLease {
    store: StateStore,
    target: PathBuf,
    _lock: Flock<File>,
}

impl PathLease {
    #[must_use]
    pub fn target(&self) -> &Path {
        &self.target
    }
}

impl Drop for PathLease {
    fn drop(&mut self) {
        self.store.release_lease(&self.target);
    }
}

pub enum LeaseAttempt {
    Acquired(PathLease),
    /// Someone else holds the path
    Held(String),
}

/// Lock file guarding `rel_path` under `root`
#[must_use]
pub fn lock_path(root: &Path, rel_path: &str) -> PathBuf {
    root.join(".preset-fetch/locks")
        .join(format!("{rel_path}.lock"))
}

/// Try once to take the lease for `spec` without waiting
pub fn try_acquire(
    store: &StateStore,
    run_id: RunId,
    root: &Path,
    spec: &FileSpec,
) -> io::Result<LeaseAttempt> {
    let target = spec.target_path(root);
    if !store.try_lease(&target, run_id) {
        let holder = store
            .lease_holder(&target)
            .map_or_else(|| "this process".to_string(), |run| format!("run {run}"));
        return Ok(LeaseAttempt::Held(holder));
    }

    match lock_file(root, spec, run_id) {
        Ok(Ok(lock)) => Ok(LeaseAttempt::Acquired(PathLease {
            store: store.clone(),
            target,
            _lock: lock,
        })),
        Ok(Err(holder)) => {
            store.release_lease(&target);
            Ok(LeaseAttempt::Held(holder))
        }
        Err(e) => {
            store.release_lease(&target);
            Err(e)
        }
    }
}

fn lock_file(
    root: &Path,
    spec: &FileSpec,
    run_id: RunId,
) -> io::Result<std::result::Result<Flock<File>, String>> {
    let path = lock_path(root, &spec.path);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)?;

    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(mut lock) => {
            let holder = LeaseHolder {
                pid: std::process::id(),
                run_id,
                acquired_at: chrono::Utc::now().to_rfc3339(),
            };
            let json = serde_json::to_vec(&holder).map_err(io::Error::other)?;
            lock.set_len(0)?;
            lock.write_all(&json)?;
            Ok(Ok(lock))
        }
        Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
            let holder = fs::read_to_string(&path)
                .ok()
                .and_then(|text| serde_json::from_str::<LeaseHolder>(&text).ok())
                .map_or_else(|| "another process".to_string(), |h| h.to_string());
            Ok(Err(holder))
        }
        Err((_, errno)) => Err(io::Error::from(errno)),
    }
}

/// Poll for the lease until `wait` elapses or the task is cancelled
pub async fn acquire(
    store: &StateStore,
    run_id: RunId,
    root: &Path,
    spec: &FileSpec,
    wait: Duration,
    control: &TaskControl,
) -> io::Result<LeaseAttempt> {
    let started = Instant::now();
    let mut logged = false;

    loop {
        let holder = match try_acquire(store, run_id, root, spec)? {
            LeaseAttempt::Acquired(lease) => return Ok(LeaseAttempt::Acquired(lease)),
            LeaseAttempt::Held(holder) => holder,
        };

        let elapsed = started.elapsed();
        if elapsed >= wait || control.is_cancelled() {
            return Ok(LeaseAttempt::Held(holder));
        }
        if !logged {
            tracing::info!("{} is being downloaded by {holder}, waiting", spec.path);
            logged = true;
        }

        let pause = POLL_INTERVAL.min(wait - elapsed);
        tokio::select! {
            () = control.cancelled() => return Ok(LeaseAttempt::Held(holder)),
            () = tokio::time::sleep(pause) => {}
        }
    }
}
