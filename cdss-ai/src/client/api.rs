//! Backend contract for inference jobs
//!
//! [`InferenceApi`] is the seam between the orchestration logic and the
//! transport. The HTTP implementation lives in [`super::http`]; tests plug
//! in scripted implementations.

use async_trait::async_trait;
use cdss_common::events::RemoteStatus;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::InferenceResult;
use crate::models::{InputRefs, ModelType, VolumeRequest, VolumetricPayload};

/// Who triggered the submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmitMode {
    /// Clinician pressed "analyze"
    #[default]
    Manual,
    /// Triggered by an automated workflow (e.g. order completion)
    Auto,
}

/// Start-analysis request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub model_type: ModelType,
    /// Backend model code (`M1`, `MG`, `MM`)
    pub model_code: String,
    pub input_refs: InputRefs,
    pub mode: SubmitMode,
}

impl SubmitRequest {
    pub fn new(model_type: ModelType, input_refs: InputRefs, mode: SubmitMode) -> Self {
        Self {
            model_type,
            model_code: model_type.code().to_string(),
            input_refs,
            mode,
        }
    }
}

/// Start-analysis response
///
/// `{cached: true, jobId, result}` or `{cached: false, jobId}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    #[serde(default)]
    pub cached: bool,
    #[serde(default)]
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

/// Job status response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: RemoteStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, alias = "error", skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Backend operations consumed by the inference subsystem
///
/// Implementations perform exactly one round trip per call and never retry;
/// retry policy belongs to the reconcilers.
#[async_trait]
pub trait InferenceApi: Send + Sync {
    /// Start an analysis job
    async fn submit(&self, request: &SubmitRequest) -> InferenceResult<SubmitResponse>;

    /// Query the status of a job
    async fn job_status(&self, job_id: &str) -> InferenceResult<StatusResponse>;

    /// Fetch the volumetric data of a completed job
    async fn fetch_volume(&self, request: &VolumeRequest) -> InferenceResult<VolumetricPayload>;
}
