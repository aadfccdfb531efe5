use super::{ProgressEvent, RunControl, RunId};
use crate::download::{DownloadTask, TaskFailure, TaskState};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

const EVENT_CAPACITY: usize = 1024;
/// Minimum byte delta between two `Progress` events for one task
const PROGRESS_EVENT_STEP: u64 = 1024 * 1024;

/// Read model of a single task
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskView {
    pub task_id: usize,
    pub preset_id: String,
    pub path: String,
    pub state: TaskState,
    pub bytes_done: u64,
    pub bytes_total: u64,
    /// Bytes per second of the current attempt
    pub rate: f64,
    /// Seconds remaining at the current rate
    pub eta: Option<u64>,
    pub attempts: u32,
    pub last_error: Option<TaskFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub counts: BTreeMap<TaskState, usize>,
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub rate: f64,
    pub paused: bool,
    pub finished: bool,
    pub elapsed_secs: f64,
    pub tasks: Vec<TaskView>,
}

impl RunSnapshot {
    /// Number of tasks currently in `state`
    #[must_use]
    pub fn count(&self, state: TaskState) -> usize {
        self.counts.get(&state).copied().unwrap_or(0)
    }
}

struct TaskRecord {
    task_id: usize,
    preset_id: String,
    path: String,
    state: TaskState,
    bytes_done: u64,
    bytes_total: u64,
    attempts: u32,
    last_error: Option<TaskFailure>,
    attempt_started: Option<Instant>,
    last_event_bytes: u64,
    cancel: CancellationToken,
}

impl TaskRecord {
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn view(&self, now: Instant) -> TaskView {
        let rate = match (self.state, self.attempt_started) {
            (TaskState::InProgress, Some(started)) => {
                let elapsed = now.duration_since(started).as_secs_f64();
                if elapsed > 0.0 {
                    self.bytes_done as f64 / elapsed
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };

        let eta = (rate > 0.0 && self.bytes_total > self.bytes_done)
            .then(|| ((self.bytes_total - self.bytes_done) as f64 / rate).ceil() as u64);

        TaskView {
            task_id: self.task_id,
            preset_id: self.preset_id.clone(),
            path: self.path.clone(),
            state: self.state,
            bytes_done: self.bytes_done,
            bytes_total: self.bytes_total,
            rate,
            eta,
            attempts: self.attempts,
            last_error: self.last_error.clone(),
        }
    }
}

struct RunState {
    tasks: Vec<TaskRecord>,
    cancel: CancellationToken,
    paused: watch::Sender<bool>,
    started: Instant,
    finished: bool,
}

struct Inner {
    runs: RwLock<HashMap<RunId, Arc<RwLock<RunState>>>>,
    leases: Mutex<HashMap<PathBuf, RunId>>,
    events: broadcast::Sender<ProgressEvent>,
}

/// Shared status store; cheap to clone
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<Inner>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                runs: RwLock::new(HashMap::new()),
                leases: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    /// Subscribe to state transitions of all runs
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: ProgressEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    fn run(&self, run_id: RunId) -> Option<Arc<RwLock<RunState>>> {
        self.inner.runs.read().get(&run_id).cloned()
    }

    /// Register a run and hand out its controls
    pub fn begin_run(&self, run_id: RunId, tasks: &[DownloadTask]) -> RunControl {
        let cancel = CancellationToken::new();
        let (paused_tx, paused_rx) = watch::channel(false);

        let records: Vec<TaskRecord> = tasks
            .iter()
            .map(|task| TaskRecord {
                task_id: task.id,
                preset_id: task.preset_id.clone(),
                path: task.spec.path.clone(),
                state: task.state,
                bytes_done: 0,
                bytes_total: task.spec.size,
                attempts: 0,
                last_error: None,
                attempt_started: None,
                last_event_bytes: 0,
                cancel: cancel.child_token(),
            })
            .collect();
        let tokens = records.iter().map(|r| r.cancel.clone()).collect();

        let state = RunState {
            tasks: records,
            cancel: cancel.clone(),
            paused: paused_tx,
            started: Instant::now(),
            finished: false,
        };
        self.inner
            .runs
            .write()
            .insert(run_id, Arc::new(RwLock::new(state)));

        RunControl::new(cancel, paused_rx, tokens)
    }

    /// Record a state change pushed by the scheduler
    pub fn transition(
        &self,
        run_id: RunId,
        task_id: usize,
        state: TaskState,
        failure: Option<&TaskFailure>,
    ) {
        let Some(run) = self.run(run_id) else {
            return;
        };

        let event = {
            let mut run = run.write();
            let Some(task) = run.tasks.get_mut(task_id) else {
                return;
            };
            task.state = state;
            if let Some(failure) = failure {
                task.last_error = Some(failure.clone());
            }

            match (state, failure) {
                (TaskState::InProgress, _) => {
                    task.attempts += 1;
                    task.bytes_done = 0;
                    task.last_event_bytes = 0;
                    task.attempt_started = Some(Instant::now());
                    ProgressEvent::Started {
                        run_id,
                        task_id,
                        path: task.path.clone(),
                        attempt: task.attempts,
                        bytes_total: task.bytes_total,
                    }
                }
                (TaskState::Done | TaskState::Skipped, _) => {
                    if state == TaskState::Skipped {
                        task.bytes_done = task.bytes_total;
                    }
                    task.attempt_started = None;
                    ProgressEvent::Complete {
                        run_id,
                        task_id,
                        path: task.path.clone(),
                        state,
                    }
                }
                (TaskState::Failed, Some(failure)) => {
                    task.attempt_started = None;
                    ProgressEvent::Error {
                        run_id,
                        task_id,
                        path: task.path.clone(),
                        kind: failure.kind,
                        message: failure.message.clone(),
                    }
                }
                _ => {
                    if state.is_terminal() {
                        task.attempt_started = None;
                    }
                    ProgressEvent::StateChanged {
                        run_id,
                        task_id,
                        state,
                    }
                }
            }
        };

        self.emit(event);
    }

    /// Record bytes written by the current attempt
    pub fn record_progress(&self, run_id: RunId, task_id: usize, bytes_done: u64) {
        let Some(run) = self.run(run_id) else {
            return;
        };

        let event = {
            let mut run = run.write();
            let Some(task) = run.tasks.get_mut(task_id) else {
                return;
            };
            task.bytes_done = bytes_done;

            let step_reached = bytes_done.saturating_sub(task.last_event_bytes) >= PROGRESS_EVENT_STEP;
            let completed = task.bytes_total > 0 && bytes_done >= task.bytes_total;
            if bytes_done != task.last_event_bytes && (step_reached || completed) {
                task.last_event_bytes = bytes_done;
                Some(ProgressEvent::Progress {
                    run_id,
                    task_id,
                    bytes_done,
                    bytes_total: task.bytes_total,
                })
            } else {
                None
            }
        };

        if let Some(event) = event {
            self.emit(event);
        }
    }

    /// Mark a run complete; its snapshot stays available until forgotten
    pub fn finish_run(&self, run_id: RunId) {
        if let Some(run) = self.run(run_id) {
            run.write().finished = true;
            self.emit(ProgressEvent::RunFinished { run_id });
        }
    }

    /// Drop a run's state
    pub fn forget_run(&self, run_id: RunId) -> bool {
        self.inner.runs.write().remove(&run_id).is_some()
    }

    #[must_use]
    pub fn run_ids(&self) -> Vec<RunId> {
        self.inner.runs.read().keys().copied().collect()
    }

    /// Copy of the current state of one run
    #[must_use]
    pub fn snapshot(&self, run_id: RunId) -> Option<RunSnapshot> {
        let handle = self.run(run_id)?;
        let run = handle.read();
        let now = Instant::now();
        let paused = *run.paused.borrow();

        let tasks: Vec<TaskView> = run.tasks.iter().map(|t| t.view(now)).collect();
        let mut counts = BTreeMap::new();
        for task in &tasks {
            *counts.entry(task.state).or_insert(0) += 1;
        }

        let snapshot = RunSnapshot {
            run_id,
            counts,
            bytes_done: tasks.iter().map(|t| t.bytes_done).sum(),
            bytes_total: tasks.iter().map(|t| t.bytes_total).sum(),
            rate: tasks.iter().map(|t| t.rate).sum(),
            paused,
            finished: run.finished,
            elapsed_secs: now.duration_since(run.started).as_secs_f64(),
            tasks,
        };
        Some(snapshot)
    }

    /// Cancel one task; false if unknown or already terminal
    pub fn cancel_task(&self, run_id: RunId, task_id: usize) -> bool {
        let Some(run) = self.run(run_id) else {
            return false;
        };
        let run = run.read();
        match run.tasks.get(task_id) {
            Some(task) if !task.state.is_terminal() => {
                tracing::info!("Cancelling {} in run {run_id}", task.path);
                task.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Cancel every non-terminal task of a run; returns how many were affected
    pub fn cancel_run(&self, run_id: RunId) -> usize {
        let Some(run) = self.run(run_id) else {
            return 0;
        };
        let run = run.read();
        run.cancel.cancel();
        let affected = run
            .tasks
            .iter()
            .filter(|t| !t.state.is_terminal())
            .count();
        tracing::info!("Cancelled run {run_id} ({affected} unfinished tasks)");
        affected
    }

    pub fn pause_run(&self, run_id: RunId) -> bool {
        self.set_paused(run_id, true)
    }

    pub fn resume_run(&self, run_id: RunId) -> bool {
        self.set_paused(run_id, false)
    }

    fn set_paused(&self, run_id: RunId, paused: bool) -> bool {
        let Some(run) = self.run(run_id) else {
            return false;
        };
        run.read().paused.send_replace(paused);
        tracing::info!(
            "Run {run_id} {}",
            if paused { "paused" } else { "resumed" }
        );
        true
    }

    /// Take the in-process lease on a target path
    pub fn try_lease(&self, path: &Path, run_id: RunId) -> bool {
        let mut leases = self.inner.leases.lock();
        if leases.contains_key(path) {
            return false;
        }
        leases.insert(path.to_path_buf(), run_id);
        true
    }

    pub fn release_lease(&self, path: &Path) {
        self.inner.leases.lock().remove(path);
    }

    #[must_use]
    pub fn lease_holder(&self, path: &Path) -> Option<RunId> {
        self.inner.leases.lock().get(path).copied()
    }
}
