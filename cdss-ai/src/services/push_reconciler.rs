//! Push reconciler
//!
//! Consumes the session-wide push topic on behalf of one job. The topic is
//! shared by every screen, so messages for other jobs (and other message
//! types) are skipped. A terminal message for this job is applied to the
//! merger and fires the job's cancellation token, which stops the polling
//! reconciler at its next check.
//!
//! The receiver must be subscribed before the submission request is sent:
//! a fast backend can push the result before the job id is even known here,
//! and broadcast receivers only see messages sent after they subscribe.

use cdss_common::events::{InferenceResultMessage, PushEvent};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::{JobUpdate, UpdateSource};
use crate::services::status_merger::{ApplyOutcome, JobStatusMerger};

/// Why the push reconciler stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Terminal message for this job; `Ignored` means polling got there first
    Terminal(ApplyOutcome),
    /// Job token fired (poll terminal, user cancel, navigation away)
    Cancelled,
    /// Push topic closed; polling remains the only channel
    HubClosed,
}

/// Push-channel reconciler for one job
pub struct PushReconciler {
    job_id: String,
    merger: Arc<JobStatusMerger>,
    cancel: CancellationToken,
}

impl PushReconciler {
    pub fn new(job_id: impl Into<String>, merger: Arc<JobStatusMerger>, cancel: CancellationToken) -> Self {
        Self {
            job_id: job_id.into(),
            merger,
            cancel,
        }
    }

    /// Run as a background task
    pub fn spawn(self, rx: broadcast::Receiver<PushEvent>) -> JoinHandle<PushOutcome> {
        tokio::spawn(self.run(rx))
    }

    /// Consume messages until terminal, cancelled, or the topic closes
    pub async fn run(self, mut rx: broadcast::Receiver<PushEvent>) -> PushOutcome {
        debug!(job_id = %self.job_id, "Push reconciler started");

        loop {
            let received = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!(job_id = %self.job_id, "Push reconciler cancelled");
                    return PushOutcome::Cancelled;
                }
                received = rx.recv() => received,
            };

            match received {
                Ok(PushEvent::AiInferenceResult(msg)) if msg.job_id == self.job_id => {
                    if let Some(outcome) = self.handle(msg) {
                        return PushOutcome::Terminal(outcome);
                    }
                }
                Ok(_) => {
                    // Other job or other message type
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        job_id = %self.job_id,
                        skipped,
                        "Push reconciler lagged, polling will cover any missed result"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!(job_id = %self.job_id, "Push topic closed");
                    return PushOutcome::HubClosed;
                }
            }
        }
    }

    /// Apply one relevant message; returns the outcome if it was terminal
    fn handle(&self, msg: InferenceResultMessage) -> Option<ApplyOutcome> {
        let terminal = msg.status.is_terminal();
        let status = msg.status;
        let outcome = self.merger.apply(JobUpdate::from_remote(
            msg.status,
            msg.result,
            msg.error,
            UpdateSource::Push,
        ));

        if !terminal {
            debug!(job_id = %self.job_id, %status, "Push progress");
            return None;
        }

        info!(job_id = %self.job_id, %status, ?outcome, "Push delivered terminal status");
        // Stop polling promptly; the job is settled either way
        self.cancel.cancel();
        Some(outcome)
    }
}
