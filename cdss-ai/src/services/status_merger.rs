//! Job status merger
//!
//! Single source of truth for one in-flight job. Both reconcilers write
//! here; the UI reads here.
//!
//! The snapshot lives in a `tokio::sync::watch` channel. Every transition
//! runs inside `send_if_modified`, which holds the channel's write lock for
//! the duration of the closure, so "is it terminal yet?" and "write the
//! terminal state" happen as one step. Whichever channel reaches the lock
//! first with a terminal update wins; every later update is a no-op and
//! watchers are not woken for it.

use tokio::sync::watch;
use tracing::{debug, info};

use crate::models::{InferenceJob, JobUpdate};

/// Result of offering an update to the merger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The update changed the job state
    Applied,
    /// The job was already terminal, or the update changed nothing
    Ignored,
}

/// Monotonic state holder for one job
#[derive(Debug)]
pub struct JobStatusMerger {
    tx: watch::Sender<InferenceJob>,
}

impl JobStatusMerger {
    pub fn new(initial: InferenceJob) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// Offer an update; idempotent and monotonic
    pub fn apply(&self, update: JobUpdate) -> ApplyOutcome {
        let terminal = update.is_terminal();
        let source = update.source();

        let applied = self.tx.send_if_modified(|job| job.apply(update));

        if applied && terminal {
            let job = self.tx.borrow();
            info!(
                job_id = job.job_id.as_deref().unwrap_or("-"),
                state = ?job.state,
                source = ?source,
                "Job reached terminal state"
            );
        } else if !applied && terminal {
            debug!(source = ?source, "Terminal update ignored (job already terminal)");
        }

        if applied {
            ApplyOutcome::Applied
        } else {
            ApplyOutcome::Ignored
        }
    }

    /// Current state, synchronously
    pub fn snapshot(&self) -> InferenceJob {
        self.tx.borrow().clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.tx.borrow().is_terminal()
    }

    pub fn job_id(&self) -> Option<String> {
        self.tx.borrow().job_id.clone()
    }

    /// Receiver woken on every applied update
    pub fn subscribe(&self) -> watch::Receiver<InferenceJob> {
        self.tx.subscribe()
    }

    /// Wait until the job is terminal and return the final state
    pub async fn wait_terminal(&self) -> InferenceJob {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so the channel cannot close while we wait
        let terminal = rx
            .wait_for(|job| job.is_terminal())
            .await
            .map(|job| job.clone());
        terminal.unwrap_or_else(|_| self.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FailureKind, InputRefs, JobState, ModelType, UpdateSource};
    use cdss_common::events::RemoteStatus;
    use serde_json::json;
    use std::sync::Arc;

    fn merger() -> JobStatusMerger {
        JobStatusMerger::new(InferenceJob::new(
            ModelType::SingleModality,
            InputRefs::new().with("ocs_id", 42),
            Some("job-123".to_string()),
        ))
    }

    fn completed(source: UpdateSource) -> JobUpdate {
        JobUpdate::Completed {
            result: json!({"grade": "II", "source": format!("{:?}", source)}),
            source,
        }
    }

    fn failed(source: UpdateSource) -> JobUpdate {
        JobUpdate::Failed {
            kind: FailureKind::ServerReported,
            message: "model crashed".to_string(),
            source,
        }
    }

    #[test]
    fn test_same_terminal_twice_is_idempotent() {
        let merger = merger();
        assert_eq!(merger.apply(completed(UpdateSource::Push)), ApplyOutcome::Applied);
        let first = merger.snapshot();

        assert_eq!(merger.apply(completed(UpdateSource::Poll)), ApplyOutcome::Ignored);
        assert_eq!(merger.snapshot(), first);
        assert_eq!(merger.snapshot().source, Some(UpdateSource::Push));
    }

    #[test]
    fn test_completed_then_failed_keeps_completed() {
        let merger = merger();
        merger.apply(completed(UpdateSource::Poll));
        assert_eq!(merger.apply(failed(UpdateSource::Push)), ApplyOutcome::Ignored);

        let job = merger.snapshot();
        assert_eq!(job.state, JobState::Completed);
        assert!(job.error_message.is_none());
        assert!(job.failure.is_none());
    }

    #[test]
    fn test_failed_then_completed_keeps_failed() {
        let merger = merger();
        merger.apply(failed(UpdateSource::Push));
        assert_eq!(merger.apply(completed(UpdateSource::Poll)), ApplyOutcome::Ignored);

        let job = merger.snapshot();
        assert_eq!(job.state, JobState::Failed);
        assert!(job.result.is_none());
        assert_eq!(job.error_message.as_deref(), Some("model crashed"));
    }

    #[test]
    fn test_progress_after_terminal_ignored() {
        let merger = merger();
        merger.apply(JobUpdate::Cancelled);
        let outcome = merger.apply(JobUpdate::Progress {
            status: RemoteStatus::Processing,
            source: UpdateSource::Poll,
        });
        assert_eq!(outcome, ApplyOutcome::Ignored);
        assert_eq!(merger.snapshot().state, JobState::Cancelled);
    }

    #[test]
    fn test_repeated_progress_does_not_wake_watchers() {
        let merger = merger();
        let mut rx = merger.subscribe();
        let progress = JobUpdate::Progress {
            status: RemoteStatus::Processing,
            source: UpdateSource::Poll,
        };

        assert_eq!(merger.apply(progress.clone()), ApplyOutcome::Applied);
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        assert_eq!(merger.apply(progress), ApplyOutcome::Ignored);
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_terminal_writers_single_winner() {
        for _ in 0..50 {
            let merger = Arc::new(merger());
            let mut rx = merger.subscribe();

            let a = {
                let m = Arc::clone(&merger);
                tokio::spawn(async move { m.apply(completed(UpdateSource::Poll)) })
            };
            let b = {
                let m = Arc::clone(&merger);
                tokio::spawn(async move { m.apply(failed(UpdateSource::Push)) })
            };

            let outcomes = [a.await.unwrap(), b.await.unwrap()];
            let winners = outcomes.iter().filter(|o| **o == ApplyOutcome::Applied).count();
            assert_eq!(winners, 1);

            // Exactly one terminal state observed by the UI side
            let observed = rx.borrow_and_update().clone();
            assert!(observed.is_terminal());
            match observed.state {
                JobState::Completed => assert_eq!(outcomes[0], ApplyOutcome::Applied),
                JobState::Failed => assert_eq!(outcomes[1], ApplyOutcome::Applied),
                other => panic!("unexpected state {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_wait_terminal() {
        let merger = Arc::new(merger());
        let waiter = {
            let m = Arc::clone(&merger);
            tokio::spawn(async move { m.wait_terminal().await })
        };

        merger.apply(JobUpdate::Progress {
            status: RemoteStatus::Validating,
            source: UpdateSource::Push,
        });
        merger.apply(completed(UpdateSource::Push));

        let job = waiter.await.unwrap();
        assert_eq!(job.state, JobState::Completed);
    }
}
