//! Push-channel event types and the process-wide PushHub
//!
//! The backend delivers unsolicited notifications over one persistent
//! subscription per session. Every screen shares that subscription; each
//! consumer filters by the identifier it cares about.

mod job_types;

pub use job_types::{InferenceResultMessage, RemoteStatus};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Messages delivered over the push channel
///
/// Delivery is at-most-once, unordered and best-effort. Message types this
/// client does not consume (order updates, chat, ...) deserialize to
/// [`PushEvent::Other`] and are dropped by every filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PushEvent {
    /// Status change of an AI inference job
    #[serde(rename = "AI_INFERENCE_RESULT")]
    AiInferenceResult(InferenceResultMessage),

    /// Any message type not consumed by this client
    #[serde(other)]
    Other,
}

impl PushEvent {
    /// Returns the event type string used on the wire
    pub fn event_type(&self) -> &'static str {
        match self {
            PushEvent::AiInferenceResult(_) => "AI_INFERENCE_RESULT",
            PushEvent::Other => "OTHER",
        }
    }

    /// Job identifier carried by the event, if any
    pub fn job_id(&self) -> Option<&str> {
        match self {
            PushEvent::AiInferenceResult(msg) => Some(msg.job_id.as_str()),
            PushEvent::Other => None,
        }
    }
}

/// Process-wide publish/subscribe topic for push-channel events
///
/// Uses tokio::broadcast internally:
/// - Non-blocking publish (slow subscribers don't block the listener)
/// - Multiple concurrent subscribers (one per awaited job)
/// - Automatic cleanup when subscribers drop
/// - Lagged message detection for slow subscribers
///
/// Subscribers only see events published after they subscribe, so a job
/// consumer must subscribe before the request that could trigger its event.
#[derive(Clone)]
pub struct PushHub {
    tx: broadcast::Sender<PushEvent>,
    capacity: usize,
}

impl PushHub {
    /// Creates a new PushHub with specified channel capacity
    ///
    /// `capacity` is the number of events buffered per subscriber before the
    /// oldest are dropped for that subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<PushEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn publish(
        &self,
        event: PushEvent,
    ) -> Result<usize, broadcast::error::SendError<PushEvent>> {
        self.tx.send(event)
    }

    /// Publish an event, ignoring if no subscribers are listening
    ///
    /// Push delivery is best-effort, so an event nobody awaits is simply lost.
    pub fn publish_lossy(&self, event: PushEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
