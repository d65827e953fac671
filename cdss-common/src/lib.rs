//! # CDSS Common Library
//!
//! Shared code for the clinical-decision-support client crates:
//! - Error types
//! - Push-channel event types and the process-wide PushHub
//! - Bootstrap configuration loading

pub mod config;
pub mod error;
pub mod events;

pub use error::{Error, Result};
