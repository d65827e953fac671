//! Backend access: the `InferenceApi` seam, its HTTP implementation and the
//! push-channel listener

pub mod api;
pub mod http;
pub mod push_listener;

pub use api::{InferenceApi, StatusResponse, SubmitMode, SubmitRequest, SubmitResponse};
pub use http::{HttpInferenceApi, HttpInferenceApiBuilder};
pub use push_listener::{parse_push_event, PushChannelListener, SseParser};
