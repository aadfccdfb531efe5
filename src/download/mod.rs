//! Bounded, retrying, lease-guarded downloads of a resolved manifest.
//!
//! Each manifest entry becomes a [`DownloadTask`]. Files are streamed to a
//! `.part` file next to their target, verified, and only then renamed into
//! place, so an interrupted run never leaves a partial file at a final path.

pub mod disk;
pub mod fetch;
pub mod installed;
pub mod lease;
pub mod report;
pub mod scheduler;
pub mod task;

pub use fetch::{Fetcher, HttpFetcher};
pub use installed::{InstallLedger, InstalledFile};
pub use report::{FailedTask, FailureKind, ReportCounts, TerminalReport};
pub use scheduler::{Scheduler, SchedulerOptions};
pub use task::{DownloadTask, TaskFailure, TaskState};
