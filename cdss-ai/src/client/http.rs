//! HTTP implementation of [`InferenceApi`]
//!
//! Endpoints (relative to the configured base URL):
//! - `POST /api/ai/inference/` start analysis
//! - `GET  /api/ai/inference/{job_id}/status/` job status
//! - `GET  /api/ai/inference/{job_id}/volume/?encoding=binary` volumetric data
//!
//! The job id is a single percent-encoded path segment, whatever it contains.
//!
//! Every call is exactly one round trip bounded by the client timeout. A 503
//! means the inference engine behind the API is down and maps to
//! [`InferenceError::UpstreamUnavailable`]; any other non-success status maps
//! to [`InferenceError::Api`].

use async_trait::async_trait;
use reqwest::{header, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

use super::api::{InferenceApi, StatusResponse, SubmitRequest, SubmitResponse};
use crate::error::{InferenceError, InferenceResult};
use crate::models::{VolumeRequest, VolumetricPayload};

const USER_AGENT: &str = concat!("cdss-ai/", env!("CARGO_PKG_VERSION"));
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Builder for [`HttpInferenceApi`]
#[derive(Debug, Clone)]
pub struct HttpInferenceApiBuilder {
    base_url: String,
    token: Option<String>,
    timeout: Duration,
    user_agent: String,
}

impl HttpInferenceApiBuilder {
    pub fn token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// # Errors
    /// `InvalidInput` if the base URL cannot carry endpoint paths
    pub fn build(self) -> InferenceResult<HttpInferenceApi> {
        let base_url = self.base_url.trim_end_matches('/').to_string();
        let base = Url::parse(&base_url).map_err(|e| {
            InferenceError::InvalidInput(format!("invalid base URL '{}': {}", self.base_url, e))
        })?;
        if base.cannot_be_a_base() {
            return Err(InferenceError::InvalidInput(format!(
                "base URL '{}' cannot carry a path",
                self.base_url
            )));
        }

        let http_client = reqwest::Client::builder()
            .user_agent(self.user_agent)
            .timeout(self.timeout)
            .build()
            .map_err(|e| InferenceError::Network(e.to_string()))?;

        Ok(HttpInferenceApi {
            http_client,
            base,
            base_url,
            token: self.token,
        })
    }
}

/// Inference backend over HTTP
#[derive(Debug, Clone)]
pub struct HttpInferenceApi {
    http_client: reqwest::Client,
    base: Url,
    base_url: String,
    token: Option<String>,
}

impl HttpInferenceApi {
    pub fn builder(base_url: impl Into<String>) -> HttpInferenceApiBuilder {
        HttpInferenceApiBuilder {
            base_url: base_url.into(),
            token: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            user_agent: USER_AGENT.to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Base URL extended by `segments`, each percent-encoded
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.header(header::AUTHORIZATION, format!("Bearer {}", token)),
            None => request,
        }
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> InferenceResult<T> {
        let response = self.authorized(request).send().await?;
        let response = check_status(response).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| InferenceError::Protocol(e.to_string()))
    }
}

/// Map non-success statuses to errors
pub(crate) async fn check_status(response: Response) -> InferenceResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    if status == StatusCode::SERVICE_UNAVAILABLE {
        let reason = if body.is_empty() {
            "upstream inference engine unavailable".to_string()
        } else {
            body
        };
        return Err(InferenceError::UpstreamUnavailable(reason));
    }
    Err(InferenceError::Api(status.as_u16(), body))
}

#[async_trait]
impl InferenceApi for HttpInferenceApi {
    async fn submit(&self, request: &SubmitRequest) -> InferenceResult<SubmitResponse> {
        let url = self.endpoint(&["api", "ai", "inference", ""]);
        debug!(url = %url, model = %request.model_code, mode = ?request.mode, "Submitting inference job");
        self.send_json(self.http_client.post(url).json(request)).await
    }

    async fn job_status(&self, job_id: &str) -> InferenceResult<StatusResponse> {
        let url = self.endpoint(&["api", "ai", "inference", job_id, "status", ""]);
        debug!(job_id, url = %url, "Querying job status");
        self.send_json(self.http_client.get(url)).await
    }

    async fn fetch_volume(&self, request: &VolumeRequest) -> InferenceResult<VolumetricPayload> {
        let url = self.endpoint(&["api", "ai", "inference", &request.job_id, "volume", ""]);
        debug!(job_id = %request.job_id, url = %url, "Fetching volumetric data");
        self.send_json(
            self.http_client
                .get(url)
                .query(&[("encoding", request.encoding_preference.as_str())]),
        )
        .await
    }
}
