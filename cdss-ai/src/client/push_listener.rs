//! Push channel listener
//!
//! Holds the session's Server-Sent Events connection to `GET /api/events/`
//! and republishes every parsed frame into the [`PushHub`]. Delivery is
//! best-effort: frames that fail to parse are logged and skipped, and while
//! the connection is down messages are simply lost (polling covers them).
//!
//! Reconnects with exponential backoff, capped, reset after every successful
//! connection. Stops when its cancellation token fires.

use cdss_common::config::PushConfig;
use cdss_common::events::{PushEvent, PushHub};
use futures::StreamExt;
use reqwest::header;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::http::check_status;
use crate::error::{InferenceError, InferenceResult};

const EVENTS_PATH: &str = "/api/events/";
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Longest line, or joined event data, accepted from the push stream
pub const MAX_EVENT_BYTES: usize = 1 << 20;

/// Incremental parser for `text/event-stream` bodies
///
/// Yields the `data` payload of each complete event. Multi-line data is
/// joined with `\n`; comments and other fields are ignored. Input is
/// bounded: a line or event larger than the limit is a protocol error.
#[derive(Debug)]
pub struct SseParser {
    buffer: Vec<u8>,
    data: Vec<String>,
    data_len: usize,
    max_bytes: usize,
}

impl Default for SseParser {
    fn default() -> Self {
        Self::with_limit(MAX_EVENT_BYTES)
    }
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(max_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            data: Vec::new(),
            data_len: 0,
            max_bytes,
        }
    }

    /// Feed a chunk; returns the payloads of events completed by it
    ///
    /// # Errors
    /// `Protocol` if a line or an event outgrows the limit. The parser is
    /// left empty and the connection should be dropped.
    pub fn feed(&mut self, chunk: &[u8]) -> InferenceResult<Vec<String>> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            if pos > self.max_bytes {
                return Err(self.overflow("line"));
            }
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                    self.data_len = 0;
                }
            } else if let Some(value) = line.strip_prefix("data:") {
                let value = value.strip_prefix(' ').unwrap_or(value);
                self.data_len += value.len() + 1;
                if self.data_len > self.max_bytes {
                    return Err(self.overflow("event"));
                }
                self.data.push(value.to_string());
            }
        }

        if self.buffer.len() > self.max_bytes {
            return Err(self.overflow("line"));
        }
        Ok(events)
    }

    fn overflow(&mut self, what: &str) -> InferenceError {
        self.buffer.clear();
        self.data.clear();
        self.data_len = 0;
        InferenceError::Protocol(format!("push stream {} exceeds {} bytes", what, self.max_bytes))
    }
}

/// Parse one event payload; `None` (logged) if it is not a push event
pub fn parse_push_event(data: &str) -> Option<PushEvent> {
    match serde_json::from_str::<PushEvent>(data) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(error = %e, "Skipping malformed push frame");
            None
        }
    }
}

/// Session-wide SSE consumer feeding the push topic
pub struct PushChannelListener {
    http_client: reqwest::Client,
    url: String,
    token: Option<String>,
    hub: PushHub,
    reconnect_initial: Duration,
    reconnect_max: Duration,
}

impl PushChannelListener {
    pub fn new(
        base_url: &str,
        token: Option<String>,
        hub: PushHub,
        config: &PushConfig,
    ) -> InferenceResult<Self> {
        // No total timeout: the stream stays open for the whole session
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| InferenceError::Network(e.to_string()))?;

        let reconnect_initial = Duration::from_millis(config.reconnect_initial_ms.max(1));
        Ok(Self {
            http_client,
            url: format!("{}{}", base_url.trim_end_matches('/'), EVENTS_PATH),
            token,
            hub,
            reconnect_initial,
            reconnect_max: Duration::from_millis(config.reconnect_max_ms).max(reconnect_initial),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Run as a background task
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    /// Connect, consume, reconnect until cancelled
    pub async fn run(self, cancel: CancellationToken) {
        info!(url = %self.url, "Push listener started");
        let mut backoff = self.reconnect_initial;

        while !cancel.is_cancelled() {
            match self.consume(&cancel).await {
                Ok(events) => {
                    debug!(events, "Push stream ended");
                    backoff = self.reconnect_initial;
                }
                Err(e) => {
                    warn!(error = %e, retry_in_ms = backoff.as_millis() as u64, "Push stream unavailable");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.reconnect_max);
        }

        info!("Push listener stopped");
    }

    /// One connection; returns the number of events published
    async fn consume(&self, cancel: &CancellationToken) -> InferenceResult<u64> {
        let mut request = self
            .http_client
            .get(&self.url)
            .header(header::ACCEPT, "text/event-stream");
        if let Some(token) = &self.token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Ok(0),
            response = request.send() => check_status(response?).await?,
        };
        debug!(url = %self.url, "Push stream connected");

        let mut stream = response.bytes_stream();
        let mut parser = SseParser::new();
        let mut published = 0u64;

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Ok(published),
                chunk = stream.next() => chunk,
            };

            match chunk {
                Some(Ok(bytes)) => {
                    for data in parser.feed(&bytes)? {
                        if let Some(event) = parse_push_event(&data) {
                            debug!(event_type = event.event_type(), job_id = ?event.job_id(), "Push event received");
                            self.hub.publish_lossy(event);
                            published += 1;
                        }
                    }
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(published),
            }
        }
    }
}
