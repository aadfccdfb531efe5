use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Run-wide controls held by the scheduler
#[derive(Debug, Clone)]
pub struct RunControl {
    cancel: CancellationToken,
    paused: watch::Receiver<bool>,
    tasks: Vec<CancellationToken>,
}

impl RunControl {
    pub(crate) fn new(
        cancel: CancellationToken,
        paused: watch::Receiver<bool>,
        tasks: Vec<CancellationToken>,
    ) -> Self {
        Self {
            cancel,
            paused,
            tasks,
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Controls for one task of this run
    #[must_use]
    pub fn task(&self, task_id: usize) -> TaskControl {
        let cancel = self
            .tasks
            .get(task_id)
            .cloned()
            .unwrap_or_else(|| self.cancel.child_token());
        TaskControl {
            cancel,
            paused: self.paused.clone(),
        }
    }
}

/// Cooperative cancel/pause checks for a single task
#[derive(Debug, Clone)]
pub struct TaskControl {
    cancel: CancellationToken,
    paused: watch::Receiver<bool>,
}

impl TaskControl {
    /// Control that is never cancelled or paused
    #[must_use]
    pub fn detached() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self {
            cancel: CancellationToken::new(),
            paused: rx,
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Safe point between chunks: waits while paused.
    /// Returns false once the task is cancelled.
    pub async fn checkpoint(&self) -> bool {
        let mut paused = self.paused.clone();
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            let is_paused = *paused.borrow_and_update();
            if !is_paused {
                return true;
            }
            tokio::select! {
                () = self.cancel.cancelled() => return false,
                changed = paused.changed() => {
                    // Sender gone means nobody can resume or pause us anymore
                    if changed.is_err() {
                        return !self.cancel.is_cancelled();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn control() -> (CancellationToken, watch::Sender<bool>, RunControl) {
        let cancel = CancellationToken::new();
        let (tx, rx) = watch::channel(false);
        let tasks = vec![cancel.child_token(), cancel.child_token()];
        let run = RunControl::new(cancel.clone(), rx, tasks);
        (cancel, tx, run)
    }

    #[tokio::test]
    async fn test_checkpoint_passes_when_idle() {
        let (_cancel, _tx, run) = control();
        assert!(run.task(0).checkpoint().await);
    }

    #[tokio::test]
    async fn test_run_cancel_reaches_tasks() {
        let (cancel, _tx, run) = control();
        cancel.cancel();
        assert!(run.task(1).is_cancelled());
        assert!(!run.task(1).checkpoint().await);
    }

    #[tokio::test]
    async fn test_pause_blocks_until_resume() {
        let (_cancel, tx, run) = control();
        tx.send(true).unwrap();

        let task = run.task(0);
        let waiter = tokio::spawn(async move { task.checkpoint().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        tx.send(false).unwrap();
        let resumed = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("checkpoint did not resume")
            .unwrap();
        assert!(resumed);
    }

    #[tokio::test]
    async fn test_cancel_while_paused() {
        let (cancel, tx, run) = control();
        tx.send(true).unwrap();

        let task = run.task(0);
        let waiter = tokio::spawn(async move { task.checkpoint().await });
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("checkpoint ignored cancellation")
            .unwrap();
        assert!(!result);
    }
}
