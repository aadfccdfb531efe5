use super::disk::{format_bytes, SpaceClaim, SpaceReservations};
use super::fetch::{Fetcher, HttpFetcher};
use super::installed::update_ledger;
use super::lease::{self, LeaseAttempt};
use super::{DownloadTask, FailureKind, TaskFailure, TaskState, TerminalReport};
use crate::config::schema::DownloadConfig;
use crate::error::{FetchError, IntegrityError, Result};
use crate::integrity;
use crate::progress::{RunId, StateStore, TaskControl};
use crate::resolver::Manifest;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Validator rejections after which a task fails for good
const MAX_INTEGRITY_FAILURES: u32 = 2;

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Re-download even when the target looks complete
    pub force: bool,
    /// Hash existing files before skipping them
    pub verify_existing: bool,
    pub lease_wait: Duration,
    /// Free space kept in reserve on top of each file's size
    pub min_free_bytes: u64,
    pub record_installs: bool,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self::from_config(&DownloadConfig::default())
    }
}

impl SchedulerOptions {
    #[must_use]
    pub fn from_config(config: &DownloadConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            max_attempts: config.max_attempts.max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            read_timeout: Duration::from_secs(config.read_timeout_secs),
            force: false,
            verify_existing: config.verify_existing,
            lease_wait: Duration::from_secs(config.lease_wait_secs),
            min_free_bytes: config.min_free_mb * 1024 * 1024,
            record_installs: true,
        }
    }

    /// Delay before retrying after `attempt` failed attempts
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_max)
    }
}

/// Runs manifests through a bounded worker pool
pub struct Scheduler {
    options: SchedulerOptions,
    fetcher: Arc<dyn Fetcher>,
    store: StateStore,
    space: SpaceReservations,
}

impl Scheduler {
    pub fn new(options: SchedulerOptions, fetcher: Arc<dyn Fetcher>, store: StateStore) -> Self {
        Self {
            options,
            fetcher,
            store,
            space: SpaceReservations::new(),
        }
    }

    /// Scheduler backed by the streaming HTTP fetcher
    pub fn http(options: SchedulerOptions, store: StateStore) -> Result<Self> {
        let fetcher = HttpFetcher::new(options.connect_timeout, options.read_timeout)?;
        Ok(Self::new(options, Arc::new(fetcher), store))
    }

    #[must_use]
    pub const fn store(&self) -> &StateStore {
        &self.store
    }

    #[must_use]
    pub const fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    pub async fn run(&self, manifest: &Manifest, root: &Path) -> TerminalReport {
        self.run_with_id(RunId::new(), manifest, root).await
    }

    /// Download every manifest entry under `root`.
    /// Per-task failures end up in the report; nothing here aborts the run.
    pub async fn run_with_id(&self, run_id: RunId, manifest: &Manifest, root: &Path) -> TerminalReport {
        let mut tasks: Vec<DownloadTask> = manifest
            .entries()
            .iter()
            .enumerate()
            .map(|(id, entry)| DownloadTask::from_entry(id, entry))
            .collect();
        let control = self.store.begin_run(run_id, &tasks);

        tracing::info!(
            "Run {run_id}: {} files, {} declared, concurrency {}",
            tasks.len(),
            format_bytes(manifest.total_bytes()),
            self.options.concurrency
        );

        let semaphore = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let mut workers = JoinSet::new();
        let mut spawned = HashSet::new();

        // Permits are taken in manifest order, so earlier entries start first
        for task in &tasks {
            let permit = tokio::select! {
                biased;
                () = control.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let worker = Worker {
                options: self.options.clone(),
                fetcher: Arc::clone(&self.fetcher),
                store: self.store.clone(),
                space: self.space.clone(),
                run_id,
                root: root.to_path_buf(),
                control: control.task(task.id),
            };
            let task = task.clone();
            spawned.insert(task.id);
            workers.spawn(async move {
                let _permit = permit;
                worker.run(task).await
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(finished) => {
                    let id = finished.id;
                    tasks[id] = finished;
                }
                Err(e) => tracing::error!("Download worker stopped unexpectedly: {e}"),
            }
        }

        // Tasks that never reported back
        for task in tasks.iter_mut().filter(|t| !t.state.is_terminal()) {
            if spawned.contains(&task.id) {
                let failure = TaskFailure::new(FailureKind::Internal, "download worker stopped");
                task.state = TaskState::Failed;
                task.last_error = Some(failure.clone());
                self.store
                    .transition(run_id, task.id, TaskState::Failed, Some(&failure));
            } else {
                task.state = TaskState::Cancelled;
                self.store
                    .transition(run_id, task.id, TaskState::Cancelled, None);
            }
        }

        if self.options.record_installs {
            self.record_installs(root, &tasks).await;
        }

        self.store.finish_run(run_id);
        let report = TerminalReport::from_tasks(run_id, &tasks);
        tracing::info!(
            "Run {run_id} finished: {} downloaded, {} skipped, {} failed, {} cancelled, {} already downloading",
            report.counts.downloaded,
            report.counts.skipped,
            report.counts.failed,
            report.counts.cancelled,
            report.counts.deferred
        );
        report
    }

    async fn record_installs(&self, root: &Path, tasks: &[DownloadTask]) {
        let done: Vec<DownloadTask> = tasks
            .iter()
            .filter(|t| t.state == TaskState::Done)
            .cloned()
            .collect();
        if done.is_empty() {
            return;
        }

        let root = root.to_path_buf();
        let result = tokio::task::spawn_blocking(move || {
            update_ledger(&root, |ledger| {
                ledger.record_tasks(&done);
            })
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Failed to update install ledger: {e}"),
            Err(e) => tracing::warn!("Install ledger update did not complete: {e}"),
        }
    }
}

/// Everything one spawned task needs
struct Worker {
    options: SchedulerOptions,
    fetcher: Arc<dyn Fetcher>,
    store: StateStore,
    space: SpaceReservations,
    run_id: RunId,
    root: PathBuf,
    control: TaskControl,
}

impl Worker {
    async fn run(self, mut task: DownloadTask) -> DownloadTask {
        if self.control.is_cancelled() {
            return self.finish(task, TaskState::Cancelled);
        }

        let lease = match lease::acquire(
            &self.store,
            self.run_id,
            &self.root,
            &task.spec,
            self.options.lease_wait,
            &self.control,
        )
        .await
        {
            Ok(LeaseAttempt::Acquired(lease)) => lease,
            Ok(LeaseAttempt::Held(holder)) => {
                if self.control.is_cancelled() {
                    return self.finish(task, TaskState::Cancelled);
                }
                tracing::warn!("{}: AlreadyDownloading by {holder}", task.spec.path);
                return self.finish(task, TaskState::Deferred);
            }
            Err(e) => {
                let failure =
                    TaskFailure::new(FailureKind::Io, format!("Failed to take lease: {e}"));
                return self.fail(task, failure);
            }
        };

        let target = lease.target().to_path_buf();
        let temp = task.temp_path(&self.root);
        // Leftover from an interrupted run
        remove_temp(&temp).await;

        if !self.options.force && self.is_present(&task, &target).await {
            tracing::info!("{} already present, skipping", task.spec.path);
            return self.finish(task, TaskState::Skipped);
        }

        let parent = target.parent().unwrap_or(&self.root).to_path_buf();
        if let Err(e) = tokio::fs::create_dir_all(&parent).await {
            return self.fail(task, TaskFailure::from_fetch(&FetchError::Io(e)));
        }

        // Released when the transfer ends
        let space = match self
            .space
            .reserve(&parent, task.spec.size, self.options.min_free_bytes)
        {
            Ok(Ok(claim)) => Some(claim),
            Ok(Err(shortfall)) => {
                return self.fail(task, TaskFailure::new(FailureKind::DiskFull, shortfall.to_string()));
            }
            Err(e) => {
                tracing::warn!("Could not check free space at {}: {e}", parent.display());
                None
            }
        };

        let final_state = self.attempts(&mut task, &target, &temp, space.as_ref()).await;
        drop(space);
        drop(lease);
        self.finish(task, final_state)
    }

    /// Retry loop; returns the terminal state, failures already recorded on `task`
    async fn attempts(
        &self,
        task: &mut DownloadTask,
        target: &Path,
        temp: &Path,
        space: Option<&SpaceClaim>,
    ) -> TaskState {
        loop {
            if !self.control.checkpoint().await {
                return TaskState::Cancelled;
            }

            task.attempts += 1;
            task.bytes_transferred = 0;
            self.transition(task, TaskState::InProgress, None);

            let store = self.store.clone();
            let (run_id, task_id) = (self.run_id, task.id);
            let progress = move |bytes: u64| {
                store.record_progress(run_id, task_id, bytes);
                if let Some(space) = space {
                    space.record_written(bytes);
                }
            };

            let fetched = self
                .fetcher
                .fetch(&task.spec, temp, &self.control, &progress)
                .await;

            let failure = match fetched {
                Ok(bytes) => {
                    task.bytes_transferred = bytes;
                    match self.verify_and_promote(task, temp, target).await {
                        Ok(()) => return TaskState::Done,
                        Err(err) => {
                            task.integrity_failures += 1;
                            let failure = TaskFailure::from_integrity(&err);
                            let refetch = !matches!(err, IntegrityError::Io(_))
                                && task.integrity_failures < MAX_INTEGRITY_FAILURES
                                && task.attempts < self.options.max_attempts;
                            if !refetch {
                                return self.record_failure(task, failure);
                            }
                            tracing::warn!("{}: {err}; fetching once more", task.spec.path);
                            failure
                        }
                    }
                }
                Err(FetchError::Cancelled) => {
                    remove_temp(temp).await;
                    return TaskState::Cancelled;
                }
                Err(err) => {
                    remove_temp(temp).await;
                    let failure = TaskFailure::from_fetch(&err);
                    if !err.is_retryable() || task.attempts >= self.options.max_attempts {
                        return self.record_failure(task, failure);
                    }
                    tracing::warn!(
                        "{}: attempt {}/{} failed: {err}",
                        task.spec.path,
                        task.attempts,
                        self.options.max_attempts
                    );
                    failure
                }
            };

            self.transition(task, TaskState::Failed, Some(failure));
            self.transition(task, TaskState::Pending, None);

            let delay = self.options.backoff_delay(task.attempts);
            tracing::debug!("Retrying {} in {delay:?}", task.spec.path);
            tokio::select! {
                () = self.control.cancelled() => return TaskState::Cancelled,
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn verify_and_promote(
        &self,
        task: &mut DownloadTask,
        temp: &Path,
        target: &Path,
    ) -> std::result::Result<(), IntegrityError> {
        self.transition(task, TaskState::Verifying, None);
        integrity::verify_download(temp, &task.spec).await?;

        if let Err(e) = tokio::fs::rename(temp, target).await {
            remove_temp(temp).await;
            return Err(e.into());
        }
        tracing::info!(
            "Downloaded {} ({})",
            task.spec.path,
            format_bytes(task.bytes_transferred)
        );
        Ok(())
    }

    async fn is_present(&self, task: &DownloadTask, target: &Path) -> bool {
        let Ok(meta) = tokio::fs::metadata(target).await else {
            return false;
        };
        if !meta.is_file() {
            return false;
        }
        if task.spec.size > 0 && meta.len() != task.spec.size {
            tracing::info!(
                "{} has {} bytes, expected {}; downloading again",
                task.spec.path,
                meta.len(),
                task.spec.size
            );
            return false;
        }
        if self.options.verify_existing && task.spec.checksum.is_some() {
            if let Err(e) = integrity::verify_file(target, &task.spec).await {
                tracing::warn!("{} failed verification ({e}); downloading again", task.spec.path);
                return false;
            }
        }
        true
    }

    fn record_failure(&self, task: &mut DownloadTask, failure: TaskFailure) -> TaskState {
        tracing::error!("{} failed: {failure}", task.spec.path);
        task.last_error = Some(failure);
        TaskState::Failed
    }

    fn transition(&self, task: &mut DownloadTask, state: TaskState, failure: Option<TaskFailure>) {
        task.state = state;
        self.store
            .transition(self.run_id, task.id, state, failure.as_ref());
        if let Some(failure) = failure {
            task.last_error = Some(failure);
        }
    }

    fn finish(&self, mut task: DownloadTask, state: TaskState) -> DownloadTask {
        let failure = if state == TaskState::Failed {
            task.last_error.clone()
        } else {
            None
        };
        self.transition(&mut task, state, failure);
        task
    }

    fn fail(&self, mut task: DownloadTask, failure: TaskFailure) -> DownloadTask {
        let state = self.record_failure(&mut task, failure);
        self.finish(task, state)
    }
}

async fn remove_temp(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!("Removed {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove {}: {e}", path.display()),
    }
}
