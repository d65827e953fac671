//! Error types for cdss-ai
//!
//! Errors here never reach the UI directly: the orchestrator resolves every
//! one of them into a finite job state plus an optional message. They are
//! the currency between the components and the `InferenceApi` seam.

use crate::services::volume_decoder::DecodeError;
use thiserror::Error;

/// Inference subsystem error type
#[derive(Debug, Error)]
pub enum InferenceError {
    /// Missing or unknown input slots, malformed request parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Backend reported the inference engine as unavailable (503)
    #[error("Inference engine unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Transport failure (connection refused, timeout, reset)
    #[error("Network error: {0}")]
    Network(String),

    /// Backend returned a non-success status
    #[error("API error {0}: {1}")]
    Api(u16, String),

    /// Backend response did not match the expected contract
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A job is already being awaited by this orchestrator
    #[error("Job already in flight: {0}")]
    JobInFlight(String),

    /// Operation requires a prior job
    #[error("No job to operate on")]
    NoJob,

    /// Volumetric payload could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Background task failed to complete
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<reqwest::Error> for InferenceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            InferenceError::Protocol(err.to_string())
        } else {
            InferenceError::Network(err.to_string())
        }
    }
}

/// Result type for inference operations
pub type InferenceResult<T> = Result<T, InferenceError>;
