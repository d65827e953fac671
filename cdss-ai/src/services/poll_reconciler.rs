//! Polling reconciler
//!
//! Pull channel for job status. Queries the status endpoint until the job is
//! terminal, the attempt budget runs out, lookups keep failing, or the job's
//! cancellation token fires.
//!
//! **Per attempt:**
//! 1. Query status (token checked before the query and again when it resolves)
//! 2. Terminal → apply to merger, stop
//! 3. Non-terminal → apply progress, reset the error counter, consume the
//!    attempt, wait `interval`
//! 4. Query error → count it; at the limit apply `LookupFailed` and stop,
//!    otherwise wait `recovery_delay` and retry the same attempt
//! 5. Attempts exhausted → apply `TimedOut`
//!
//! A cancelled reconciler never writes to the merger. Requests already in
//! flight are not aborted; their responses are discarded.

use cdss_common::config::PollingConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::InferenceApi;
use crate::models::{FailureKind, JobUpdate, UpdateSource};
use crate::services::status_merger::{ApplyOutcome, JobStatusMerger};

/// Message applied when lookups keep failing
pub const LOOKUP_FAILED_MESSAGE: &str = "result lookup failed, retry available";

/// Polling bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Status queries that may return a non-terminal status
    pub max_attempts: u32,
    /// Consecutive failed queries tolerated before giving up
    pub max_consecutive_errors: u32,
    /// Wait after a non-terminal status
    pub interval: Duration,
    /// Wait after a failed query
    pub recovery_delay: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self::from(&PollingConfig::default())
    }
}

impl From<&PollingConfig> for PollSettings {
    fn from(config: &PollingConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            max_consecutive_errors: config.max_consecutive_errors.max(1),
            interval: Duration::from_millis(config.interval_ms),
            recovery_delay: Duration::from_millis(config.recovery_delay_ms),
        }
    }
}

/// Why polling stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Terminal status observed; `Ignored` means the push channel got there first
    Terminal(ApplyOutcome),
    /// Attempts exhausted; `TimedOut` offered to the merger
    TimedOut,
    /// Too many consecutive lookup errors; `LookupFailed` offered to the merger
    LookupFailed,
    /// Cancellation token fired; nothing written
    Cancelled,
}

/// Summary of one polling run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollReport {
    pub outcome: PollOutcome,
    /// Status queries issued (including failed ones)
    pub queries: u32,
}

/// Pull-channel reconciler
#[derive(Clone)]
pub struct PollingReconciler {
    api: Arc<dyn InferenceApi>,
    settings: PollSettings,
}

impl PollingReconciler {
    pub fn new(api: Arc<dyn InferenceApi>, settings: PollSettings) -> Self {
        Self { api, settings }
    }

    pub fn settings(&self) -> &PollSettings {
        &self.settings
    }

    /// Poll `job_id` until a terminal outcome or cancellation
    pub async fn poll(
        &self,
        job_id: &str,
        merger: &JobStatusMerger,
        cancel: &CancellationToken,
    ) -> PollReport {
        let max_errors = self.settings.max_consecutive_errors.max(1);
        let mut attempt: u32 = 0;
        let mut consecutive_errors: u32 = 0;
        let mut queries: u32 = 0;

        let report = |outcome, queries| PollReport { outcome, queries };

        while attempt < self.settings.max_attempts {
            if cancel.is_cancelled() {
                debug!(job_id, attempt, "Polling cancelled before query");
                return report(PollOutcome::Cancelled, queries);
            }

            queries += 1;
            let response = self.api.job_status(job_id).await;

            if cancel.is_cancelled() {
                debug!(job_id, attempt, "Polling cancelled, discarding late status response");
                return report(PollOutcome::Cancelled, queries);
            }

            match response {
                Ok(status) if status.status.is_terminal() => {
                    let outcome = merger.apply(JobUpdate::from_remote(
                        status.status,
                        status.result,
                        status.error_message,
                        UpdateSource::Poll,
                    ));
                    info!(job_id, attempt, status = %status.status, ?outcome, "Polling observed terminal status");
                    return report(PollOutcome::Terminal(outcome), queries);
                }
                Ok(status) => {
                    merger.apply(JobUpdate::Progress {
                        status: status.status,
                        source: UpdateSource::Poll,
                    });
                    consecutive_errors = 0;
                    attempt += 1;
                    debug!(job_id, attempt, status = %status.status, "Job not finished yet");

                    if attempt < self.settings.max_attempts
                        && wait_or_cancel(cancel, self.settings.interval).await
                    {
                        return report(PollOutcome::Cancelled, queries);
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    warn!(
                        job_id,
                        attempt,
                        consecutive_errors,
                        max_errors,
                        error = %e,
                        "Status lookup failed"
                    );

                    if consecutive_errors >= max_errors {
                        merger.apply(JobUpdate::Failed {
                            kind: FailureKind::LookupFailed,
                            message: LOOKUP_FAILED_MESSAGE.to_string(),
                            source: UpdateSource::Poll,
                        });
                        return report(PollOutcome::LookupFailed, queries);
                    }

                    if wait_or_cancel(cancel, self.settings.recovery_delay).await {
                        return report(PollOutcome::Cancelled, queries);
                    }
                }
            }
        }

        warn!(job_id, attempts = self.settings.max_attempts, "Polling attempts exhausted");
        merger.apply(JobUpdate::Failed {
            kind: FailureKind::TimedOut,
            message: timed_out_message(self.settings.max_attempts),
            source: UpdateSource::Poll,
        });
        report(PollOutcome::TimedOut, queries)
    }
}

/// Message applied when attempts run out
pub fn timed_out_message(attempts: u32) -> String {
    format!(
        "timed out waiting for result after {} status checks, retry available",
        attempts
    )
}

/// Sleep for `delay`; returns true if the token fired first or during the wait
async fn wait_or_cancel(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(delay) => cancel.is_cancelled(),
    }
}
