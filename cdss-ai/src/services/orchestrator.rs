//! Inference orchestrator
//!
//! One orchestrator per screen. It owns the screen's current job and drives
//! it through submission, dual-channel reconciliation and, for volumetric
//! results, fetch and decode.
//!
//! **Workflow:**
//! 1. Validate input slots for the model
//! 2. Subscribe to the push topic, then submit through the gateway
//! 3. Cached result → terminal immediately, no reconciler started
//! 4. Pending job → push reconciler task + polling reconciler, both writing
//!    one merger
//! 5. Completed with volumetric data → fetch (`binary`) and decode
//!
//! **Cancellation:** the screen token is the parent of every job token.
//! Closing the screen (or dropping the orchestrator) fires it, which stops
//! whichever reconcilers are still running.

use cdss_common::events::{PushEvent, PushHub};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::{InferenceApi, SubmitMode};
use crate::error::{InferenceError, InferenceResult};
use crate::models::{
    DecodedVolume, FailureKind, InferenceJob, InputRefs, JobState, JobUpdate, ModelType,
    RetryAction, UpdateSource, VisualizationState, VolumeRequest,
};
use crate::services::gateway::{JobSubmissionGateway, Submission};
use crate::services::poll_reconciler::{PollSettings, PollingReconciler};
use crate::services::push_reconciler::PushReconciler;
use crate::services::status_merger::JobStatusMerger;
use crate::services::volume_decoder::decode_payload;

/// Tunables for one orchestrator
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    pub poll: PollSettings,
    /// Default label channel names for volume decode
    pub label_channels: Vec<String>,
    pub mode: SubmitMode,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            poll: PollSettings::default(),
            label_channels: cdss_common::config::VolumeConfig::default().label_channels,
            mode: SubmitMode::Manual,
        }
    }
}

/// Per-screen mutable state
#[derive(Default)]
struct ScreenSession {
    input_refs: Option<InputRefs>,
    merger: Option<Arc<JobStatusMerger>>,
    job_token: Option<CancellationToken>,
    visualization: Option<VisualizationState>,
    /// Bumped by every new run; a volume load only lands in the epoch it started in
    epoch: u64,
    in_flight: bool,
}

impl ScreenSession {
    fn in_flight_error(&self) -> InferenceError {
        let job_id = self
            .merger
            .as_ref()
            .and_then(|m| m.job_id())
            .unwrap_or_else(|| "pending submission".to_string());
        InferenceError::JobInFlight(job_id)
    }
}

/// Clears the in-flight flag when a run ends, including when its future is dropped
struct InFlightGuard<'a> {
    session: &'a Mutex<ScreenSession>,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        lock(self.session).in_flight = false;
    }
}

fn lock(session: &Mutex<ScreenSession>) -> MutexGuard<'_, ScreenSession> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-screen inference workflow
pub struct InferenceOrchestrator {
    screen_id: Uuid,
    model_type: ModelType,
    api: Arc<dyn InferenceApi>,
    gateway: JobSubmissionGateway,
    poller: PollingReconciler,
    push_hub: Option<PushHub>,
    label_channels: Vec<String>,
    screen_token: CancellationToken,
    session: Mutex<ScreenSession>,
}

impl InferenceOrchestrator {
    pub fn new(api: Arc<dyn InferenceApi>, model_type: ModelType) -> Self {
        Self::with_settings(api, model_type, OrchestratorSettings::default())
    }

    pub fn with_settings(
        api: Arc<dyn InferenceApi>,
        model_type: ModelType,
        settings: OrchestratorSettings,
    ) -> Self {
        let screen_id = Uuid::new_v4();
        debug!(%screen_id, model = %model_type, "Inference orchestrator created");

        Self {
            screen_id,
            model_type,
            gateway: JobSubmissionGateway::new(api.clone()).with_mode(settings.mode),
            poller: PollingReconciler::new(api.clone(), settings.poll),
            api,
            push_hub: None,
            label_channels: settings.label_channels,
            screen_token: CancellationToken::new(),
            session: Mutex::new(ScreenSession::default()),
        }
    }

    /// Attach the session push topic; without it only polling is used
    pub fn with_push_hub(mut self, hub: PushHub) -> Self {
        self.push_hub = Some(hub);
        self
    }

    /// Tie the screen to an outer lifetime (e.g. application shutdown)
    pub fn with_parent_token(mut self, parent: &CancellationToken) -> Self {
        self.screen_token = parent.child_token();
        self
    }

    pub fn screen_id(&self) -> Uuid {
        self.screen_id
    }

    pub fn model_type(&self) -> ModelType {
        self.model_type
    }

    /// Submit a new job and drive it to a terminal state
    ///
    /// Submission and reconciliation failures are resolved into the returned
    /// job (`Failed` with a [`FailureKind`]), not returned as errors.
    ///
    /// # Errors
    /// - `InvalidInput` if the slots do not satisfy the model
    /// - `JobInFlight` if this screen is already awaiting a job
    pub async fn submit(&self, input_refs: InputRefs) -> InferenceResult<InferenceJob> {
        let coverage = input_refs.validate(self.model_type)?;
        debug!(screen_id = %self.screen_id, model = %self.model_type, ?coverage, "Inputs validated");

        let (_guard, token) = self.begin(Some(input_refs.clone()))?;
        self.run_submission(input_refs, token).await
    }

    /// Retry the current job
    ///
    /// Repolls the existing job id when one was issued, otherwise resubmits
    /// the stored inputs.
    ///
    /// # Errors
    /// - `NoJob` if nothing was submitted yet
    /// - `InvalidInput` if the current job is not retryable
    /// - `JobInFlight` if a job is still being awaited
    pub async fn retry(&self) -> InferenceResult<InferenceJob> {
        let current = self.snapshot().ok_or(InferenceError::NoJob)?;
        let action = current.retry_action().ok_or_else(|| {
            InferenceError::InvalidInput(format!("job in state {:?} cannot be retried", current.state))
        })?;

        let (_guard, token) = self.begin(None)?;

        match (action, current.job_id) {
            (RetryAction::Repoll, Some(job_id)) => {
                info!(screen_id = %self.screen_id, job_id = %job_id, "Retrying by repolling existing job");
                let rx = self.push_hub.as_ref().map(PushHub::subscribe);
                Ok(self.run_reconciliation(job_id, current.input_refs, rx, token).await)
            }
            _ => {
                let input_refs = lock(&self.session)
                    .input_refs
                    .clone()
                    .unwrap_or(current.input_refs);
                info!(screen_id = %self.screen_id, "Retrying by resubmitting");
                self.run_submission(input_refs, token).await
            }
        }
    }

    /// User-initiated cancel of the current job
    ///
    /// # Errors
    /// `NoJob` if nothing was submitted yet
    pub fn cancel(&self) -> InferenceResult<Option<InferenceJob>> {
        let session = lock(&self.session);
        let token = session.job_token.clone().ok_or(InferenceError::NoJob)?;

        // Applied before the token fires, so the reconcilers never see a
        // cancelled token on a non-terminal job
        let snapshot = session.merger.as_ref().map(|merger| {
            merger.apply(JobUpdate::Cancelled);
            merger.snapshot()
        });
        drop(session);

        token.cancel();
        info!(screen_id = %self.screen_id, "Inference job cancelled by user");
        Ok(snapshot)
    }

    /// Navigation away: stop every reconciler and discard the volume
    pub fn close(&self) {
        self.screen_token.cancel();
        lock(&self.session).visualization = None;
        debug!(screen_id = %self.screen_id, "Inference orchestrator closed");
    }

    pub fn is_closed(&self) -> bool {
        self.screen_token.is_cancelled()
    }

    pub fn is_in_flight(&self) -> bool {
        lock(&self.session).in_flight
    }

    /// Current job, if any
    pub fn snapshot(&self) -> Option<InferenceJob> {
        lock(&self.session).merger.as_ref().map(|m| m.snapshot())
    }

    /// Live updates of the current job
    ///
    /// Each submission or repoll creates a new merger; subscribe again after
    /// starting one.
    pub fn subscribe(&self) -> Option<watch::Receiver<InferenceJob>> {
        lock(&self.session).merger.as_ref().map(|m| m.subscribe())
    }

    /// Visualization of the current job
    pub fn visualization(&self) -> VisualizationState {
        lock(&self.session)
            .visualization
            .clone()
            .unwrap_or(VisualizationState::NotApplicable)
    }

    /// Refetch and re-decode the volume of the current completed job
    ///
    /// # Errors
    /// - `JobInFlight` while a submission or repoll is running
    /// - `NoJob` if there is no completed job with an id
    pub async fn retry_visualization(&self) -> InferenceResult<VisualizationState> {
        let job = {
            let session = lock(&self.session);
            if session.in_flight {
                return Err(session.in_flight_error());
            }
            session
                .merger
                .as_ref()
                .map(|m| m.snapshot())
                .ok_or(InferenceError::NoJob)?
        };
        let (job_id, result) = match (job.state, job.job_id, job.result) {
            (JobState::Completed, Some(job_id), Some(result)) => (job_id, result),
            _ => return Err(InferenceError::NoJob),
        };
        Ok(self.load_visualization(&job_id, &result).await)
    }

    /// Mark a run as in flight and mint its job token
    fn begin(
        &self,
        input_refs: Option<InputRefs>,
    ) -> InferenceResult<(InFlightGuard<'_>, CancellationToken)> {
        if self.screen_token.is_cancelled() {
            return Err(InferenceError::InvalidInput("screen is closed".to_string()));
        }

        let mut session = lock(&self.session);
        if session.in_flight {
            return Err(session.in_flight_error());
        }

        let token = self.screen_token.child_token();
        session.in_flight = true;
        session.job_token = Some(token.clone());
        session.visualization = None;
        session.epoch += 1;
        if let Some(refs) = input_refs {
            session.input_refs = Some(refs);
        }

        Ok((
            InFlightGuard {
                session: &self.session,
            },
            token,
        ))
    }

    async fn run_submission(
        &self,
        input_refs: InputRefs,
        token: CancellationToken,
    ) -> InferenceResult<InferenceJob> {
        // Subscribe before submitting: a fast backend may push the result
        // before the submission response arrives
        let rx = self.push_hub.as_ref().map(PushHub::subscribe);

        let submission = match self.gateway.submit(self.model_type, &input_refs).await {
            Ok(submission) => submission,
            Err(e) => {
                warn!(screen_id = %self.screen_id, error = %e, "Submission failed");
                let merger = self.install(InferenceJob::new(self.model_type, input_refs, None));
                if token.is_cancelled() {
                    merger.apply(JobUpdate::Cancelled);
                } else {
                    merger.apply(JobUpdate::Failed {
                        kind: FailureKind::Submission,
                        message: e.to_string(),
                        source: UpdateSource::Local,
                    });
                }
                return Ok(merger.snapshot());
            }
        };

        match submission {
            Submission::Cached { job_id, result } => {
                drop(rx);
                let merger = self.install(InferenceJob::new(
                    self.model_type,
                    input_refs,
                    Some(job_id.clone()),
                ));
                merger.apply(JobUpdate::Completed {
                    result: result.clone(),
                    source: UpdateSource::Cache,
                });
                if !token.is_cancelled() {
                    self.load_visualization(&job_id, &result).await;
                }
                Ok(merger.snapshot())
            }
            Submission::Pending { job_id } => {
                Ok(self.run_reconciliation(job_id, input_refs, rx, token).await)
            }
        }
    }

    /// Run both reconcilers against a fresh merger until the job settles
    async fn run_reconciliation(
        &self,
        job_id: String,
        input_refs: InputRefs,
        rx: Option<broadcast::Receiver<PushEvent>>,
        token: CancellationToken,
    ) -> InferenceJob {
        let merger = self.install(InferenceJob::new(
            self.model_type,
            input_refs,
            Some(job_id.clone()),
        ));
        merger.apply(JobUpdate::Reconciling);

        let push_task = rx.map(|rx| {
            PushReconciler::new(job_id.clone(), merger.clone(), token.clone()).spawn(rx)
        });

        let report = self.poller.poll(&job_id, &merger, &token).await;
        debug!(
            screen_id = %self.screen_id,
            job_id = %job_id,
            outcome = ?report.outcome,
            queries = report.queries,
            "Polling finished"
        );

        // Stops the push reconciler if polling settled the job
        token.cancel();
        if let Some(task) = push_task {
            match task.await {
                Ok(outcome) => debug!(job_id = %job_id, ?outcome, "Push reconciler finished"),
                Err(e) => warn!(job_id = %job_id, error = %e, "Push reconciler task failed"),
            }
        }

        // Screen closed mid-run: the job is abandoned
        if !merger.is_terminal() {
            merger.apply(JobUpdate::Cancelled);
        }

        let job = merger.snapshot();
        if let (JobState::Completed, Some(result)) = (job.state, job.result.as_ref()) {
            if !self.screen_token.is_cancelled() {
                self.load_visualization(&job_id, result).await;
            }
        }

        info!(
            screen_id = %self.screen_id,
            job_id = %job_id,
            state = ?job.state,
            source = ?job.source,
            "Inference job settled"
        );
        job
    }

    /// Create the merger for a new run and make it current
    fn install(&self, job: InferenceJob) -> Arc<JobStatusMerger> {
        let merger = Arc::new(JobStatusMerger::new(job));
        lock(&self.session).merger = Some(merger.clone());
        merger
    }

    /// Fetch and decode the volume if the result carries one
    ///
    /// The state is stored only if no new run started meanwhile and the
    /// screen is still open.
    async fn load_visualization(&self, job_id: &str, result: &Value) -> VisualizationState {
        let epoch = lock(&self.session).epoch;

        let state = if !signals_volume(result) {
            VisualizationState::NotApplicable
        } else {
            match self.fetch_and_decode(job_id).await {
                Ok(volume) => {
                    info!(
                        job_id,
                        shape = %volume.shape,
                        channels = volume.channels.len(),
                        "Volume ready"
                    );
                    VisualizationState::Ready(volume)
                }
                Err(e) => {
                    warn!(job_id, error = %e, "Volume unavailable, result kept");
                    VisualizationState::Unavailable(e.to_string())
                }
            }
        };

        let mut session = lock(&self.session);
        if session.epoch == epoch && !self.screen_token.is_cancelled() {
            session.visualization = Some(state.clone());
        }
        state
    }

    async fn fetch_and_decode(&self, job_id: &str) -> InferenceResult<DecodedVolume> {
        let payload = self.api.fetch_volume(&VolumeRequest::binary(job_id)).await?;

        // Full MRI volumes take a while to unpack; keep it off the reactor
        let label_channels = self.label_channels.clone();
        let volume = tokio::task::spawn_blocking(move || decode_payload(&payload, &label_channels))
            .await
            .map_err(|e| InferenceError::Internal(format!("Volume decode task failed: {}", e)))??;
        Ok(volume)
    }
}

impl Drop for InferenceOrchestrator {
    fn drop(&mut self) {
        self.screen_token.cancel();
    }
}

/// Whether a completed result points at volumetric data
pub fn signals_volume(result: &Value) -> bool {
    result.get("visualizationAvailable").and_then(Value::as_bool) == Some(true)
        || result.get("volume").is_some_and(Value::is_object)
}
