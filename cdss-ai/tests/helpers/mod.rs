//! Shared test helpers: a scripted in-memory backend

#![allow(dead_code)]

use async_trait::async_trait;
use cdss_ai::client::{InferenceApi, StatusResponse, SubmitRequest, SubmitResponse};
use cdss_ai::models::{ChannelData, VolumeEncoding, VolumeRequest, VolumeShape, VolumetricPayload};
use cdss_ai::services::volume_decoder::encode_flat;
use cdss_ai::{InferenceError, InferenceResult};
use cdss_common::events::RemoteStatus;
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

type StatusHook = Box<dyn Fn(usize) + Send + Sync>;

/// Backend replaying scripted responses and counting calls
///
/// Status replies are consumed in order; once the script runs out the
/// fallback reply repeats forever. `Err(msg)` entries become
/// `UpstreamUnavailable` for submissions and `Network` errors elsewhere.
#[derive(Default)]
pub struct ScriptedApi {
    submits: Mutex<VecDeque<Result<SubmitResponse, String>>>,
    statuses: Mutex<VecDeque<Result<StatusResponse, String>>>,
    status_fallback: Mutex<Option<Result<StatusResponse, String>>>,
    volume: Mutex<Option<Result<VolumetricPayload, String>>>,
    status_hook: Mutex<Option<StatusHook>>,
    pub submit_calls: AtomicUsize,
    pub status_calls: AtomicUsize,
    pub volume_calls: AtomicUsize,
    pub submitted: Mutex<Vec<SubmitRequest>>,
    pub polled_ids: Mutex<Vec<String>>,
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit_reply(self, reply: Result<SubmitResponse, String>) -> Self {
        self.submits.lock().unwrap().push_back(reply);
        self
    }

    pub fn status_reply(self, reply: Result<StatusResponse, String>) -> Self {
        self.statuses.lock().unwrap().push_back(reply);
        self
    }

    pub fn status_replies(self, replies: impl IntoIterator<Item = Result<StatusResponse, String>>) -> Self {
        self.statuses.lock().unwrap().extend(replies);
        self
    }

    pub fn status_forever(self, reply: Result<StatusResponse, String>) -> Self {
        *self.status_fallback.lock().unwrap() = Some(reply);
        self
    }

    pub fn volume_reply(self, reply: Result<VolumetricPayload, String>) -> Self {
        *self.volume.lock().unwrap() = Some(reply);
        self
    }

    /// Swap the volume reply on a shared instance
    pub fn set_volume(&self, reply: Result<VolumetricPayload, String>) {
        *self.volume.lock().unwrap() = Some(reply);
    }

    /// Called with the 1-based query number before each status reply is returned
    pub fn on_status(self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        *self.status_hook.lock().unwrap() = Some(Box::new(hook));
        self
    }

    pub fn submits(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn polls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn volume_fetches(&self) -> usize {
        self.volume_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceApi for ScriptedApi {
    async fn submit(&self, request: &SubmitRequest) -> InferenceResult<SubmitResponse> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        self.submitted.lock().unwrap().push(request.clone());
        match self.submits.lock().unwrap().pop_front() {
            Some(Ok(response)) => Ok(response),
            Some(Err(msg)) => Err(InferenceError::UpstreamUnavailable(msg)),
            None => Err(InferenceError::Network("no scripted submission".to_string())),
        }
    }

    async fn job_status(&self, job_id: &str) -> InferenceResult<StatusResponse> {
        let n = self.status_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.polled_ids.lock().unwrap().push(job_id.to_string());

        if let Some(hook) = self.status_hook.lock().unwrap().as_ref() {
            hook(n);
        }

        let next = self.statuses.lock().unwrap().pop_front();
        let reply = next.or_else(|| self.status_fallback.lock().unwrap().clone());
        match reply {
            Some(Ok(status)) => Ok(status),
            Some(Err(msg)) => Err(InferenceError::Network(msg)),
            None => Err(InferenceError::Network("no scripted status".to_string())),
        }
    }

    async fn fetch_volume(&self, _request: &VolumeRequest) -> InferenceResult<VolumetricPayload> {
        self.volume_calls.fetch_add(1, Ordering::SeqCst);
        match self.volume.lock().unwrap().clone() {
            Some(Ok(payload)) => Ok(payload),
            Some(Err(msg)) => Err(InferenceError::Network(msg)),
            None => Err(InferenceError::Api(404, "no volume".to_string())),
        }
    }
}

pub fn pending(job_id: &str) -> Result<SubmitResponse, String> {
    Ok(SubmitResponse {
        cached: false,
        job_id: job_id.to_string(),
        result: None,
    })
}

pub fn cached(job_id: &str, result: Value) -> Result<SubmitResponse, String> {
    Ok(SubmitResponse {
        cached: true,
        job_id: job_id.to_string(),
        result: Some(result),
    })
}

pub fn status(status: RemoteStatus) -> Result<StatusResponse, String> {
    Ok(StatusResponse {
        status,
        result: None,
        error_message: None,
    })
}

pub fn completed(result: Value) -> Result<StatusResponse, String> {
    Ok(StatusResponse {
        status: RemoteStatus::Completed,
        result: Some(result),
        error_message: None,
    })
}

pub fn failed(message: &str) -> Result<StatusResponse, String> {
    Ok(StatusResponse {
        status: RemoteStatus::Failed,
        result: None,
        error_message: Some(message.to_string()),
    })
}

/// Result announcing volumetric data
pub fn volumetric_result() -> Value {
    json!({
        "grade": "Glioblastoma (WHO grade 4)",
        "confidence": 0.91,
        "visualizationAvailable": true
    })
}

/// 2x2x2 payload: an MRI intensity channel and a segmentation label channel
pub fn segmentation_payload() -> VolumetricPayload {
    let t1: Vec<f32> = (0..8).map(|v| v as f32 * 0.5).collect();
    let segmentation = [0.0, 0.0, 1.0, 1.0, 2.0, 2.0, 3.9, 0.2];

    let mut channels = BTreeMap::new();
    channels.insert("t1".to_string(), ChannelData::Encoded(encode_flat(&t1)));
    channels.insert(
        "segmentation".to_string(),
        ChannelData::Encoded(encode_flat(&segmentation)),
    );

    VolumetricPayload {
        shape: VolumeShape::new(2, 2, 2),
        encoding: VolumeEncoding::Base64,
        channels,
        label_channels: None,
    }
}
