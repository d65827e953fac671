//! Inference services

pub mod gateway;
pub mod orchestrator;
pub mod poll_reconciler;
pub mod push_reconciler;
pub mod status_merger;
pub mod volume_decoder;

pub use gateway::{JobSubmissionGateway, Submission};
pub use orchestrator::{InferenceOrchestrator, OrchestratorSettings};
pub use poll_reconciler::{PollOutcome, PollReport, PollSettings, PollingReconciler};
pub use push_reconciler::{PushOutcome, PushReconciler};
pub use status_merger::{ApplyOutcome, JobStatusMerger};
pub use volume_decoder::{decode_payload, decode_volume, encode_volume, DecodeError};
