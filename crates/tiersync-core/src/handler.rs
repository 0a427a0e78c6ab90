//! Per-process bus subscriber that evicts the local tier.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::bus::{HandlerError, MessageHandler};
use crate::event_log::{EventLog, note};
use crate::message::InvalidationMessage;
use crate::tiers::TierManager;

/// Deletes every key of a received message from the local tier.
///
/// The shared tier was already cleared by the publishing side and is never
/// touched here.
pub struct LocalInvalidationHandler<V> {
    tiers: Arc<TierManager<V>>,
    log: Option<EventLog>,
}

impl<V> LocalInvalidationHandler<V> {
    pub fn new(tiers: Arc<TierManager<V>>) -> Self {
        Self { tiers, log: None }
    }

    #[must_use]
    pub fn with_event_log(mut self, log: EventLog) -> Self {
        self.log = Some(log);
        self
    }
}

#[async_trait]
impl<V: Clone + Send + Sync + 'static> MessageHandler for LocalInvalidationHandler<V> {
    async fn handle(&self, message: &InvalidationMessage) -> Result<(), HandlerError> {
        note(
            &self.log,
            format!(
                "Received invalidation message: table={}, keys={:?}, reason={}",
                message.table, message.keys, message.reason
            ),
        );

        for key in &message.keys {
            let removed = self.tiers.delete(key);
            debug!(key = %key, removed, "Local cache invalidated");
            note(&self.log, format!("Deleted from local cache: {key}"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemorySharedCache;
    use crate::message::InvalidationReason;
    use crate::tiers::SharedCache;
    use std::time::Duration;

    #[tokio::test]
    async fn test_evicts_local_only() {
        let shared = Arc::new(MemorySharedCache::new());
        shared
            .set("web_product:1", b"{}".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        let tiers = Arc::new(TierManager::new(shared.clone() as Arc<dyn SharedCache>));
        tiers.set("web_product:1", 1);
        tiers.set("web_product:2", 2);

        let log = EventLog::new();
        let handler = LocalInvalidationHandler::new(Arc::clone(&tiers)).with_event_log(log.clone());
        let message = InvalidationMessage::new(
            InvalidationReason::CdcInvalidated,
            "web_product",
            ["web_product:1", "web_product:9"],
        )
        .unwrap();

        handler.handle(&message).await.unwrap();

        assert_eq!(tiers.get("web_product:1"), None);
        assert_eq!(tiers.get("web_product:2"), Some(2));
        assert!(shared.get("web_product:1").await.unwrap().is_some());
        assert_eq!(log.len(), 3);
    }
}
