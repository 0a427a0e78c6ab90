use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::{
    BusCounters, BusError, BusSettings, BusStats, DeliveryMode, InvalidationBus, MessageHandler,
    dispatch, encode_envelope,
};
use crate::message::InvalidationMessage;

const BROADCAST_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
struct Delivery {
    topic: Arc<str>,
    payload: Arc<str>,
}

type SharedQueue = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>>;

struct Queue {
    sender: mpsc::UnboundedSender<String>,
    receiver: SharedQueue,
}

struct BrokerInner {
    broadcast: broadcast::Sender<Delivery>,
    queues: Mutex<HashMap<String, Queue>>,
}

/// In-process message broker shared by several [`MemoryBus`] participants.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (broadcast, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: Arc::new(BrokerInner {
                broadcast,
                queues: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Create a participant. Use one per simulated process.
    pub fn bus(&self, settings: BusSettings) -> MemoryBus {
        MemoryBus {
            broker: self.clone(),
            settings,
            counters: Arc::new(BusCounters::default()),
            consumer: Mutex::new(None),
            subscribed: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            fail_publish: AtomicBool::new(false),
        }
    }

    fn queue(&self, key: &str) -> (mpsc::UnboundedSender<String>, SharedQueue) {
        let mut queues = self.inner.queues.lock();
        let queue = queues.entry(key.to_string()).or_insert_with(|| {
            let (sender, receiver) = mpsc::unbounded_channel();
            Queue {
                sender,
                receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            }
        });
        (queue.sender.clone(), Arc::clone(&queue.receiver))
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

struct Consumer {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// One participant on a [`MemoryBroker`].
pub struct MemoryBus {
    broker: MemoryBroker,
    settings: BusSettings,
    counters: Arc<BusCounters>,
    consumer: Mutex<Option<Consumer>>,
    subscribed: AtomicBool,
    stopped: AtomicBool,
    fail_publish: AtomicBool,
}

impl MemoryBus {
    /// Make every `publish` fail.
    pub fn fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl InvalidationBus for MemoryBus {
    async fn publish(&self, message: &InvalidationMessage) -> Result<(), BusError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(BusError::Publish("bus stopped".into()));
        }
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(BusError::Publish("broker unavailable".into()));
        }

        let payload = encode_envelope(&self.settings.tag, message)?;
        match self.settings.mode {
            DeliveryMode::Broadcast => {
                // No receivers is not an error: nobody needs invalidating.
                let _ = self.broker.inner.broadcast.send(Delivery {
                    topic: Arc::from(self.settings.topic.as_str()),
                    payload: Arc::from(payload),
                });
            }
            DeliveryMode::Competing => {
                let (sender, _) = self.broker.queue(&self.settings.queue_key());
                sender
                    .send(payload)
                    .map_err(|e| BusError::Publish(e.to_string()))?;
            }
        }

        self.counters.record_published();
        debug!(topic = %self.settings.topic, keys = ?message.keys, "Published invalidation message");
        Ok(())
    }

    async fn subscribe(&self, handler: Arc<dyn MessageHandler>) -> Result<(), BusError> {
        if self.subscribed.swap(true, Ordering::SeqCst) {
            return Err(BusError::AlreadySubscribed);
        }

        let cancel = CancellationToken::new();
        let settings = self.settings.clone();
        let counters = Arc::clone(&self.counters);

        let task = match self.settings.mode {
            DeliveryMode::Broadcast => {
                // Subscribe before returning so nothing published afterwards
                // is missed.
                let receiver = self.broker.inner.broadcast.subscribe();
                tokio::spawn(consume_broadcast(
                    receiver,
                    settings,
                    handler,
                    counters,
                    cancel.clone(),
                ))
            }
            DeliveryMode::Competing => {
                let (_, queue) = self.broker.queue(&self.settings.queue_key());
                tokio::spawn(consume_queue(queue, settings, handler, counters, cancel.clone()))
            }
        };

        *self.consumer.lock() = Some(Consumer { cancel, task });
        Ok(())
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let consumer = self.consumer.lock().take();
        if let Some(Consumer { cancel, task }) = consumer {
            cancel.cancel();
            if let Err(e) = task.await {
                warn!(subscriber = %self.settings.subscriber_id, error = %e, "Bus consumer ended abnormally");
            }
        }
    }

    fn settings(&self) -> &BusSettings {
        &self.settings
    }

    fn stats(&self) -> BusStats {
        self.counters.snapshot()
    }
}

async fn consume_broadcast(
    mut receiver: broadcast::Receiver<Delivery>,
    settings: BusSettings,
    handler: Arc<dyn MessageHandler>,
    counters: Arc<BusCounters>,
    cancel: CancellationToken,
) {
    loop {
        let delivery = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            delivery = receiver.recv() => delivery,
        };
        match delivery {
            Ok(delivery) if *delivery.topic == *settings.topic => {
                dispatch(&delivery.payload, &settings, handler.as_ref(), &counters).await;
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(subscriber = %settings.subscriber_id, skipped, "Bus consumer lagged, messages lost");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn consume_queue(
    queue: SharedQueue,
    settings: BusSettings,
    handler: Arc<dyn MessageHandler>,
    counters: Arc<BusCounters>,
    cancel: CancellationToken,
) {
    loop {
        let payload = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            payload = async { queue.lock().await.recv().await } => payload,
        };
        match payload {
            Some(payload) => dispatch(&payload, &settings, handler.as_ref(), &counters).await,
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::HandlerError;
    use crate::message::InvalidationReason;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct Count(AtomicUsize);

    #[async_trait]
    impl MessageHandler for Count {
        async fn handle(&self, _message: &InvalidationMessage) -> Result<(), HandlerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn message(n: usize) -> InvalidationMessage {
        InvalidationMessage::new(
            InvalidationReason::CdcInvalidated,
            "web_product",
            [format!("web_product:{n}")],
        )
        .unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_subscriber() {
        let broker = MemoryBroker::new();
        let publisher = broker.bus(BusSettings::new("pub"));
        let handlers: Vec<Arc<Count>> = (0..3).map(|_| Arc::new(Count::default())).collect();
        let mut buses = Vec::new();
        for (i, handler) in handlers.iter().enumerate() {
            let bus = broker.bus(BusSettings::new(format!("p{i}")));
            bus.subscribe(handler.clone()).await.unwrap();
            buses.push(bus);
        }

        for n in 0..4 {
            publisher.publish(&message(n)).await.unwrap();
        }
        settle().await;

        for handler in &handlers {
            assert_eq!(handler.0.load(Ordering::SeqCst), 4);
        }
        assert_eq!(publisher.stats().published, 4);
    }

    #[tokio::test]
    async fn test_competing_delivers_each_message_once() {
        let broker = MemoryBroker::new();
        let settings = |id: &str| BusSettings::new(id).with_mode(DeliveryMode::Competing);
        let publisher = broker.bus(settings("pub"));
        let a = Arc::new(Count::default());
        let b = Arc::new(Count::default());
        let bus_a = broker.bus(settings("a"));
        let bus_b = broker.bus(settings("b"));
        bus_a.subscribe(a.clone()).await.unwrap();
        bus_b.subscribe(b.clone()).await.unwrap();

        for n in 0..6 {
            publisher.publish(&message(n)).await.unwrap();
        }
        settle().await;

        let total = a.0.load(Ordering::SeqCst) + b.0.load(Ordering::SeqCst);
        assert_eq!(total, 6);
    }

    #[tokio::test]
    async fn test_competing_queue_is_scoped_by_group() {
        let broker = MemoryBroker::new();
        let settings = |id: &str, group: &str| {
            BusSettings::new(id)
                .with_group(group)
                .with_mode(DeliveryMode::Competing)
        };
        let publisher = broker.bus(settings("pub", "orders"));
        let same = Arc::new(Count::default());
        let other = Arc::new(Count::default());
        let bus_same = broker.bus(settings("a", "orders"));
        let bus_other = broker.bus(settings("b", "billing"));
        bus_same.subscribe(same.clone()).await.unwrap();
        bus_other.subscribe(other.clone()).await.unwrap();

        for n in 0..3 {
            publisher.publish(&message(n)).await.unwrap();
        }
        settle().await;

        assert_eq!(same.0.load(Ordering::SeqCst), 3);
        assert_eq!(other.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_other_topic_is_not_delivered() {
        let broker = MemoryBroker::new();
        let publisher = broker.bus(BusSettings::new("pub").with_topic("audit_topic"));
        let handler = Arc::new(Count::default());
        let bus = broker.bus(BusSettings::new("p1"));
        bus.subscribe(handler.clone()).await.unwrap();

        publisher.publish(&message(1)).await.unwrap();
        settle().await;

        assert_eq!(handler.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_subscribe_twice_and_publish_after_stop() {
        let broker = MemoryBroker::new();
        let bus = broker.bus(BusSettings::new("p1"));
        bus.subscribe(Arc::new(Count::default())).await.unwrap();
        assert!(matches!(
            bus.subscribe(Arc::new(Count::default())).await,
            Err(BusError::AlreadySubscribed)
        ));

        bus.stop().await;
        bus.stop().await;
        assert!(matches!(bus.publish(&message(1)).await, Err(BusError::Publish(_))));
    }
}
