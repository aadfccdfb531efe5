use super::RunId;
use crate::download::{FailureKind, TaskState};
use serde::Serialize;

/// Push notifications for status consumers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started {
        run_id: RunId,
        task_id: usize,
        path: String,
        attempt: u32,
        bytes_total: u64,
    },
    Progress {
        run_id: RunId,
        task_id: usize,
        bytes_done: u64,
        bytes_total: u64,
    },
    Complete {
        run_id: RunId,
        task_id: usize,
        path: String,
        state: TaskState,
    },
    Error {
        run_id: RunId,
        task_id: usize,
        path: String,
        kind: FailureKind,
        message: String,
    },
    StateChanged {
        run_id: RunId,
        task_id: usize,
        state: TaskState,
    },
    RunFinished {
        run_id: RunId,
    },
}

impl ProgressEvent {
    #[must_use]
    pub const fn run_id(&self) -> RunId {
        match self {
            Self::Started { run_id, .. }
            | Self::Progress { run_id, .. }
            | Self::Complete { run_id, .. }
            | Self::Error { run_id, .. }
            | Self::StateChanged { run_id, .. }
            | Self::RunFinished { run_id } => *run_id,
        }
    }
}
