//! cdss-ai library interface
//!
//! AI inference job orchestration for the clinical decision support client:
//! submission, dual-channel (push + poll) result reconciliation, result cache
//! short-circuit, and volumetric result decoding.

pub mod client;
pub mod config;
pub mod error;
pub mod models;
pub mod services;

pub use crate::error::{InferenceError, InferenceResult};
pub use crate::services::{InferenceOrchestrator, OrchestratorSettings};
