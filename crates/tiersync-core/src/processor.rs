//! Change Event Processor.
//!
//! Drains the listener's queue. For every record on a cached table it
//! deletes the shared-tier entry and then publishes one invalidation message.
//! The delete is always attempted before the publish, so a process that
//! re-populates the shared tier on receipt cannot race ahead of it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::InvalidationBus;
use crate::event_log::{EventLog, note};
use crate::keys::KeySpace;
use crate::message::{InvalidationMessage, InvalidationReason};
use crate::record::ChangeRecord;
use crate::tiers::SharedCache;

/// Processor counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessorStats {
    pub processed: u64,
    /// Records on tables without a key rule, or without key values.
    pub skipped: u64,
    pub delete_failures: u64,
    pub publish_failures: u64,
}

#[derive(Debug, Default)]
pub(crate) struct ProcessorCounters {
    processed: AtomicU64,
    skipped: AtomicU64,
    delete_failures: AtomicU64,
    publish_failures: AtomicU64,
}

impl ProcessorCounters {
    pub(crate) fn snapshot(&self) -> ProcessorStats {
        ProcessorStats {
            processed: self.processed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            delete_failures: self.delete_failures.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
        }
    }
}

pub struct ChangeEventProcessor {
    events: mpsc::Receiver<ChangeRecord>,
    shared: Arc<dyn SharedCache>,
    bus: Arc<dyn InvalidationBus>,
    keys: Arc<KeySpace>,
    counters: Arc<ProcessorCounters>,
    log: Option<EventLog>,
}

impl ChangeEventProcessor {
    pub fn new(
        events: mpsc::Receiver<ChangeRecord>,
        shared: Arc<dyn SharedCache>,
        bus: Arc<dyn InvalidationBus>,
        keys: Arc<KeySpace>,
    ) -> Self {
        Self {
            events,
            shared,
            bus,
            keys,
            counters: Arc::new(ProcessorCounters::default()),
            log: None,
        }
    }

    #[must_use]
    pub fn with_event_log(mut self, log: EventLog) -> Self {
        self.log = Some(log);
        self
    }

    pub(crate) fn counters(&self) -> Arc<ProcessorCounters> {
        Arc::clone(&self.counters)
    }

    pub fn stats(&self) -> ProcessorStats {
        self.counters.snapshot()
    }

    /// Run in a background task until `cancel` fires or the queue closes.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    /// Drain the queue until `cancel` fires or every sender is gone.
    pub async fn run(mut self, cancel: CancellationToken) {
        note(&self.log, "Change event processor started");

        loop {
            let record = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                record = self.events.recv() => record,
            };
            match record {
                Some(record) => self.process(record).await,
                None => {
                    info!("Change queue closed");
                    break;
                }
            }
        }

        note(&self.log, "Change event processor stopped");
    }

    /// Invalidate the shared tier and broadcast for one record.
    pub async fn process(&self, record: ChangeRecord) {
        note(
            &self.log,
            format!(
                "Processing change event: {} {}.{}",
                record.operation, record.schema, record.table
            ),
        );

        if !self.keys.is_monitored(&record.schema, &record.table) {
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            debug!(
                schema = %record.schema,
                table = %record.table,
                "Ignoring change on uncached table"
            );
            return;
        }

        let keys = self.keys.keys_for(&record);
        if keys.is_empty() {
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            warn!(
                table = %record.table,
                primary_key = ?record.primary_key,
                "Cannot derive cache key from change event"
            );
            note(&self.log, "Failed to extract primary key from change event");
            return;
        }

        for key in &keys {
            match self.shared.delete(key).await {
                Ok(()) => note(&self.log, format!("Deleted shared cache key: {key}")),
                Err(e) => {
                    self.counters.delete_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key, error = %e, "Shared cache delete failed, TTL will reclaim it");
                    note(&self.log, format!("Failed to delete shared cache key {key}: {e}"));
                }
            }
        }

        let message =
            match InvalidationMessage::new(InvalidationReason::CdcInvalidated, &record.table, keys) {
                Ok(message) => message,
                Err(e) => {
                    warn!(error = %e, "Cannot build invalidation message");
                    return;
                }
            };

        match self.bus.publish(&message).await {
            Ok(()) => note(
                &self.log,
                format!("Published invalidation message: {}", message.keys.join(", ")),
            ),
            Err(e) => {
                self.counters.publish_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    table = %message.table,
                    keys = ?message.keys,
                    error = %e,
                    "Failed to publish invalidation message"
                );
                note(&self.log, format!("Failed to publish invalidation message: {e}"));
            }
        }

        self.counters.processed.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusSettings, HandlerError, MessageHandler};
    use crate::memory::{MemoryBroker, MemorySharedCache};
    use crate::record::{RowChange, RowsEvent, row};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    struct Collect(Arc<Mutex<Vec<InvalidationMessage>>>);

    #[async_trait]
    impl MessageHandler for Collect {
        async fn handle(&self, message: &InvalidationMessage) -> Result<(), HandlerError> {
            self.0.lock().push(message.clone());
            Ok(())
        }
    }

    fn update_record(table: &str, id: i64) -> ChangeRecord {
        update_in("playground", table, id)
    }

    fn update_in(schema: &str, table: &str, id: i64) -> ChangeRecord {
        let event = RowsEvent::new(schema, table).with_primary_key(["id"]);
        ChangeRecord::from_row(
            &event,
            RowChange::Update {
                before: row(&[("id", json!(id)), ("extra", json!("old"))]),
                after: row(&[("id", json!(id)), ("extra", json!("new"))]),
            },
        )
    }

    async fn fixture() -> (
        ChangeEventProcessor,
        Arc<MemorySharedCache>,
        Arc<Mutex<Vec<InvalidationMessage>>>,
        mpsc::Sender<ChangeRecord>,
    ) {
        let broker = MemoryBroker::new();
        let bus = Arc::new(broker.bus(BusSettings::new("processor-test")));
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(Arc::new(Collect(Arc::clone(&seen)))).await.unwrap();

        let shared = Arc::new(MemorySharedCache::new());
        let (tx, rx) = mpsc::channel(16);
        let processor = ChangeEventProcessor::new(
            rx,
            shared.clone(),
            bus,
            Arc::new(KeySpace::new().with_rule("playground", "web_product", "web_product", ["id"])),
        );
        (processor, shared, seen, tx)
    }

    async fn wait_for<F: Fn() -> bool>(check: F) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_update_deletes_shared_and_publishes() {
        let (processor, shared, seen, _tx) = fixture().await;
        shared
            .set("web_product:101", b"{}".to_vec(), Duration::from_secs(600))
            .await
            .unwrap();

        processor.process(update_record("web_product", 101)).await;

        assert_eq!(shared.get("web_product:101").await.unwrap(), None);
        wait_for(|| seen.lock().len() == 1).await;
        let msg = seen.lock()[0].clone();
        assert_eq!(msg.keys, vec!["web_product:101"]);
        assert_eq!(msg.reason, InvalidationReason::CdcInvalidated);
        assert_eq!(processor.stats().processed, 1);
    }

    #[tokio::test]
    async fn test_unmonitored_table_is_skipped() {
        let (processor, _shared, seen, _tx) = fixture().await;
        processor.process(update_record("audit_log", 1)).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(seen.lock().is_empty());
        assert_eq!(processor.stats().skipped, 1);
    }

    #[tokio::test]
    async fn test_same_table_in_other_schema_is_skipped() {
        let (processor, shared, seen, _tx) = fixture().await;
        shared
            .set("web_product:101", b"{}".to_vec(), Duration::from_secs(600))
            .await
            .unwrap();

        processor.process(update_in("archive", "web_product", 101)).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(seen.lock().is_empty());
        assert!(shared.get("web_product:101").await.unwrap().is_some());
        assert_eq!(processor.stats().skipped, 1);
    }

    #[tokio::test]
    async fn test_delete_failure_still_publishes() {
        let (processor, shared, seen, _tx) = fixture().await;
        shared.fail_deletes(true);

        processor.process(update_record("web_product", 5)).await;

        wait_for(|| seen.lock().len() == 1).await;
        let stats = processor.stats();
        assert_eq!(stats.delete_failures, 1);
        assert_eq!(stats.processed, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (processor, _shared, seen, tx) = fixture().await;
        let counters = processor.counters();
        let cancel = CancellationToken::new();
        let handle = processor.spawn(cancel.clone());

        tx.send(update_record("web_product", 1)).await.unwrap();
        wait_for(|| seen.lock().len() == 1).await;

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(counters.snapshot().processed, 1);
    }
}
