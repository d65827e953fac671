//! Job status types shared by the push channel and the status endpoint

use serde::{Deserialize, Serialize};

/// Job status as reported by the backend
///
/// The backend reports PascalCase names; upper- and lower-case spellings are
/// accepted for older deployments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemoteStatus {
    #[serde(alias = "PENDING", alias = "pending")]
    Pending,
    #[serde(alias = "VALIDATING", alias = "validating")]
    Validating,
    #[serde(alias = "PROCESSING", alias = "processing")]
    Processing,
    #[serde(alias = "COMPLETED", alias = "completed")]
    Completed,
    #[serde(alias = "FAILED", alias = "failed")]
    Failed,
}

impl RemoteStatus {
    /// Whether the backend will never report another status for this job
    pub fn is_terminal(&self) -> bool {
        matches!(self, RemoteStatus::Completed | RemoteStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteStatus::Pending => "Pending",
            RemoteStatus::Validating => "Validating",
            RemoteStatus::Processing => "Processing",
            RemoteStatus::Completed => "Completed",
            RemoteStatus::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for RemoteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of an `AI_INFERENCE_RESULT` push message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceResultMessage {
    /// Server-assigned job identifier
    pub job_id: String,
    /// Reported status
    pub status: RemoteStatus,
    /// Model-dependent result payload (terminal Completed only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Server error message (terminal Failed only)
    #[serde(default, alias = "errorMessage", skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
