//! Invalidation Broadcast Bus capability.
//!
//! ## Delivery Modes
//!
//! - **Broadcast** (default): every subscriber identity receives its own copy
//!   of every message. Required for correctness: each process must evict its
//!   own local tier.
//! - **Competing**: each message goes to exactly one subscriber. Only useful
//!   for work distribution; selecting it for invalidation leaves every other
//!   process stale, so it must be chosen explicitly.
//!
//! ## Wire Format
//!
//! ```text
//! {"tag": "cache_invalidation", "message": { ...InvalidationMessage... }}
//! ```
//!
//! Subscribers drop envelopes whose tag does not match their selector.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::message::{InvalidationMessage, InvalidationMessageError};

/// Default topic for invalidation messages.
pub const DEFAULT_TOPIC: &str = "cache_invalidation_topic";

/// Default tag stamped on, and selected by, invalidation envelopes.
pub const DEFAULT_TAG: &str = "cache_invalidation";

/// Default subscriber group.
pub const DEFAULT_GROUP: &str = "cache_invalidation_group";

// =============================================================================
// Types
// =============================================================================

/// How messages are distributed among subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    Broadcast,
    Competing,
}

impl Default for DeliveryMode {
    fn default() -> Self {
        Self::Broadcast
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Broadcast => f.write_str("broadcast"),
            Self::Competing => f.write_str("competing"),
        }
    }
}

/// Topic, selector and identity of one bus participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusSettings {
    pub topic: String,
    pub tag: String,
    /// Competing consumers in the same group share one queue.
    pub group: String,
    /// Unique per process instance.
    pub subscriber_id: String,
    pub mode: DeliveryMode,
}

impl BusSettings {
    pub fn new(subscriber_id: impl Into<String>) -> Self {
        Self {
            topic: DEFAULT_TOPIC.to_string(),
            tag: DEFAULT_TAG.to_string(),
            group: DEFAULT_GROUP.to_string(),
            subscriber_id: subscriber_id.into(),
            mode: DeliveryMode::Broadcast,
        }
    }

    #[must_use]
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    #[must_use]
    pub fn with_mode(mut self, mode: DeliveryMode) -> Self {
        self.mode = mode;
        self
    }

    /// Name of the queue shared by competing consumers: `topic:group:queue`.
    pub fn queue_key(&self) -> String {
        format!("{}:{}:queue", self.topic, self.group)
    }
}

/// Errors raised by bus implementations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Bus connection error: {0}")]
    Connection(String),

    #[error("Bus publish error: {0}")]
    Publish(String),

    #[error("Bus subscribe error: {0}")]
    Subscribe(String),

    #[error("Bus already has a subscriber")]
    AlreadySubscribed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid message: {0}")]
    InvalidMessage(#[from] InvalidationMessageError),
}

/// Error returned by a message handler. The bus logs it and moves on.
#[derive(Debug, thiserror::Error)]
#[error("Handler error: {0}")]
pub struct HandlerError(pub String);

/// Callback invoked once per delivered message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &InvalidationMessage) -> Result<(), HandlerError>;
}

/// Publish/subscribe channel for invalidation messages.
#[async_trait]
pub trait InvalidationBus: Send + Sync {
    /// Serialize and send one message to the topic.
    async fn publish(&self, message: &InvalidationMessage) -> Result<(), BusError>;

    /// Register `handler` and start the consuming task. One handler per bus.
    async fn subscribe(&self, handler: Arc<dyn MessageHandler>) -> Result<(), BusError>;

    /// Shut down publishing and consuming. Errors are logged, never returned.
    async fn stop(&self);

    fn settings(&self) -> &BusSettings;

    fn stats(&self) -> BusStats;
}

// =============================================================================
// Counters
// =============================================================================

/// Bus counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub published: u64,
    pub received: u64,
    /// Envelopes whose tag did not match the selector.
    pub filtered: u64,
    /// Deliveries that failed to decode or whose handler failed.
    pub failed: u64,
}

#[derive(Debug, Default)]
pub struct BusCounters {
    published: AtomicU64,
    received: AtomicU64,
    filtered: AtomicU64,
    failed: AtomicU64,
}

impl BusCounters {
    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BusStats {
        BusStats {
            published: self.published.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Envelope
// =============================================================================

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    tag: &'a str,
    message: &'a InvalidationMessage,
}

#[derive(Deserialize)]
struct Envelope {
    tag: String,
    message: InvalidationMessage,
}

/// Encode `message` for the wire.
pub fn encode_envelope(tag: &str, message: &InvalidationMessage) -> Result<String, BusError> {
    message.validate()?;
    Ok(serde_json::to_string(&EnvelopeRef { tag, message })?)
}

/// Decode a delivery. `Ok(None)` if its tag does not match `selector`.
pub fn decode_envelope(
    payload: &str,
    selector: &str,
) -> Result<Option<InvalidationMessage>, BusError> {
    let envelope: Envelope = serde_json::from_str(payload)?;
    if envelope.tag != selector {
        return Ok(None);
    }
    envelope.message.validate()?;
    Ok(Some(envelope.message))
}

/// Decode one delivery and hand it to `handler`.
///
/// Failures are logged and counted; the caller keeps consuming.
pub async fn dispatch(
    payload: &str,
    settings: &BusSettings,
    handler: &dyn MessageHandler,
    counters: &BusCounters,
) {
    counters.received.fetch_add(1, Ordering::Relaxed);

    let message = match decode_envelope(payload, &settings.tag) {
        Ok(Some(message)) => message,
        Ok(None) => {
            counters.filtered.fetch_add(1, Ordering::Relaxed);
            debug!(subscriber = %settings.subscriber_id, "Ignoring message with foreign tag");
            return;
        }
        Err(e) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                subscriber = %settings.subscriber_id,
                error = %e,
                "Failed to decode invalidation message"
            );
            return;
        }
    };

    debug!(
        subscriber = %settings.subscriber_id,
        table = %message.table,
        keys = ?message.keys,
        "Received invalidation message"
    );

    if let Err(e) = handler.handle(&message).await {
        counters.failed.fetch_add(1, Ordering::Relaxed);
        warn!(
            subscriber = %settings.subscriber_id,
            trace_id = ?message.trace_id,
            error = %e,
            "Invalidation handler failed"
        );
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::InvalidationReason;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<InvalidationMessage>>,
        fail: bool,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle(&self, message: &InvalidationMessage) -> Result<(), HandlerError> {
            self.seen.lock().push(message.clone());
            if self.fail {
                return Err(HandlerError("boom".into()));
            }
            Ok(())
        }
    }

    fn message() -> InvalidationMessage {
        InvalidationMessage::new(
            InvalidationReason::CdcInvalidated,
            "web_product",
            ["web_product:1"],
        )
        .unwrap()
    }

    #[test]
    fn test_delivery_mode_defaults_to_broadcast() {
        assert_eq!(DeliveryMode::default(), DeliveryMode::Broadcast);
        assert_eq!(BusSettings::new("a").mode, DeliveryMode::Broadcast);
    }

    #[test]
    fn test_queue_key_names_topic_and_group() {
        let settings = BusSettings::new("a").with_topic("inval").with_group("dc-b");
        assert_eq!(settings.queue_key(), "inval:dc-b:queue");
        assert_eq!(
            BusSettings::new("a").queue_key(),
            "cache_invalidation_topic:cache_invalidation_group:queue"
        );
    }

    #[test]
    fn test_envelope_tag_selection() {
        let payload = encode_envelope(DEFAULT_TAG, &message()).unwrap();
        assert!(decode_envelope(&payload, DEFAULT_TAG).unwrap().is_some());
        assert!(decode_envelope(&payload, "other_tag").unwrap().is_none());
    }

    #[test]
    fn test_decode_rejects_empty_keys() {
        let payload = r#"{"tag":"cache_invalidation","message":{"timestamp":"2024-01-01T00:00:00Z","reason":"manual","table":"t","keys":[],"version":"1.0"}}"#;
        assert!(matches!(
            decode_envelope(payload, DEFAULT_TAG),
            Err(BusError::InvalidMessage(_))
        ));
    }

    #[tokio::test]
    async fn test_dispatch_counts_failures_and_keeps_going() {
        let settings = BusSettings::new("p1");
        let counters = BusCounters::default();
        let handler = Recorder {
            fail: true,
            ..Default::default()
        };

        dispatch("not json", &settings, &handler, &counters).await;
        let good = encode_envelope(DEFAULT_TAG, &message()).unwrap();
        dispatch(&good, &settings, &handler, &counters).await;
        let foreign = encode_envelope("audit", &message()).unwrap();
        dispatch(&foreign, &settings, &handler, &counters).await;

        let stats = counters.snapshot();
        assert_eq!(stats.received, 3);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.filtered, 1);
        assert_eq!(handler.seen.lock().len(), 1);
    }
}
