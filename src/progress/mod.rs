//! Live status of download runs.
//!
//! The scheduler pushes every state transition and byte count into the
//! [`StateStore`]; readers poll [`StateStore::snapshot`] or subscribe to
//! [`ProgressEvent`]s. The store never drives the scheduler except through
//! the cancel/pause controls it hands out.

pub mod control;
pub mod events;
pub mod store;

pub use control::{RunControl, TaskControl};
pub use events::ProgressEvent;
pub use store::{RunSnapshot, StateStore, TaskView};

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of one scheduler invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}
