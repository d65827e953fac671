//! Job submission gateway
//!
//! One round trip: start the analysis and classify the immediate answer as
//! a cached terminal result or a pending job handle. No retries here; a
//! failed submission goes straight back to the caller.

use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use crate::client::{InferenceApi, SubmitMode, SubmitRequest};
use crate::error::{InferenceError, InferenceResult};
use crate::models::{InputRefs, ModelType};

/// Classified submission response
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// Equivalent job already computed; result is terminal
    Cached { job_id: String, result: Value },
    /// Job accepted; reconcile to learn the outcome
    Pending { job_id: String },
}

impl Submission {
    pub fn job_id(&self) -> &str {
        match self {
            Submission::Cached { job_id, .. } | Submission::Pending { job_id } => job_id,
        }
    }
}

/// Issues start-analysis requests
#[derive(Clone)]
pub struct JobSubmissionGateway {
    api: Arc<dyn InferenceApi>,
    mode: SubmitMode,
}

impl JobSubmissionGateway {
    pub fn new(api: Arc<dyn InferenceApi>) -> Self {
        Self {
            api,
            mode: SubmitMode::Manual,
        }
    }

    pub fn with_mode(mut self, mode: SubmitMode) -> Self {
        self.mode = mode;
        self
    }

    /// Submit a job
    ///
    /// # Errors
    /// - whatever the API reports (including `UpstreamUnavailable`)
    /// - `Protocol` if the response is cached without a result, or pending
    ///   without a job id
    pub async fn submit(
        &self,
        model_type: ModelType,
        input_refs: &InputRefs,
    ) -> InferenceResult<Submission> {
        let request = SubmitRequest::new(model_type, input_refs.clone(), self.mode);

        let response = self.api.submit(&request).await.map_err(|e| {
            warn!(model = %model_type, error = %e, "Inference submission failed");
            e
        })?;

        if response.cached {
            let result = response.result.ok_or_else(|| {
                InferenceError::Protocol("cached response carries no result".to_string())
            })?;
            info!(model = %model_type, job_id = %response.job_id, "Inference result served from cache");
            return Ok(Submission::Cached {
                job_id: response.job_id,
                result,
            });
        }

        if response.job_id.trim().is_empty() {
            return Err(InferenceError::Protocol(
                "pending response carries no job id".to_string(),
            ));
        }

        info!(model = %model_type, job_id = %response.job_id, "Inference job submitted");
        Ok(Submission::Pending {
            job_id: response.job_id,
        })
    }
}
