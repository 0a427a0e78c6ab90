//! Invalidation bus on Redis.
//!
//! ## Broadcast (default)
//!
//! ```text
//! publisher: PUBLISH <topic> <envelope>
//!   ↓
//! process 1: SUBSCRIBE <topic> → handler
//! process 2: SUBSCRIBE <topic> → handler
//! ```
//!
//! Every process holds its own `SUBSCRIBE` connection, so every process
//! receives every message.
//!
//! ## Competing
//!
//! `RPUSH <topic>:<group>:queue` / `BLPOP` with a one-second block. Each message is
//! taken by exactly one consumer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::Pool;
use futures_util::StreamExt;
use parking_lot::Mutex;
use redis::AsyncCommands;
use redis::aio::PubSub;
use tiersync_core::bus::{dispatch, encode_envelope};
use tiersync_core::{
    BusCounters, BusError, BusSettings, BusStats, DeliveryMode, InvalidationBus,
    InvalidationMessage, MessageHandler,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::RedisError;

// =============================================================================
// Constants
// =============================================================================

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// `BLPOP` block time in seconds.
const QUEUE_BLOCK_SECS: f64 = 1.0;

// =============================================================================
// Bus
// =============================================================================

struct Consumer {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct RedisInvalidationBus {
    pool: Pool,
    url: String,
    settings: BusSettings,
    counters: Arc<BusCounters>,
    consumer: Mutex<Option<Consumer>>,
    subscribed: AtomicBool,
    stopped: AtomicBool,
}

impl RedisInvalidationBus {
    /// `url` is used for the dedicated `SUBSCRIBE` connection; pooled
    /// connections cannot subscribe.
    pub fn new(pool: Pool, url: impl Into<String>, settings: BusSettings) -> Self {
        if settings.mode == DeliveryMode::Competing {
            warn!(
                topic = %settings.topic,
                "Invalidation bus in competing mode: only one process will see each message"
            );
        }
        Self {
            pool,
            url: url.into(),
            settings,
            counters: Arc::new(BusCounters::default()),
            consumer: Mutex::new(None),
            subscribed: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl InvalidationBus for RedisInvalidationBus {
    async fn publish(&self, message: &InvalidationMessage) -> Result<(), BusError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(BusError::Publish("bus stopped".into()));
        }
        let payload = encode_envelope(&self.settings.tag, message)?;
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;

        match self.settings.mode {
            DeliveryMode::Broadcast => {
                let receivers: i64 = conn
                    .publish(&self.settings.topic, &payload)
                    .await
                    .map_err(|e| BusError::Publish(e.to_string()))?;
                debug!(topic = %self.settings.topic, receivers, "Published invalidation message");
            }
            DeliveryMode::Competing => {
                let _: i64 = conn
                    .rpush(self.settings.queue_key(), &payload)
                    .await
                    .map_err(|e| BusError::Publish(e.to_string()))?;
                debug!(topic = %self.settings.topic, "Queued invalidation message");
            }
        }

        self.counters.record_published();
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
                // Attach now so a broken Redis fails the caller's startup.
                let pubsub = match open_pubsub(&self.url, &self.settings.topic).await {
                    Ok(pubsub) => pubsub,
                    Err(e) => {
                        self.subscribed.store(false, Ordering::SeqCst);
                        return Err(BusError::Subscribe(e.to_string()));
                    }
                };
                tokio::spawn(consume_pubsub(
                    pubsub,
                    self.url.clone(),
                    settings,
                    handler,
                    counters,
                    cancel.clone(),
                ))
            }
            DeliveryMode::Competing => tokio::spawn(consume_queue(
                self.pool.clone(),
                settings,
                handler,
                counters,
                cancel.clone(),
            )),
        };

        info!(
            topic = %self.settings.topic,
            group = %self.settings.group,
            subscriber = %self.settings.subscriber_id,
            mode = %self.settings.mode,
            "Invalidation bus consumer started"
        );
        *self.consumer.lock() = Some(Consumer { cancel, task });
        Ok(())
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let consumer = self.consumer.lock().take();
        if let Some(Consumer { cancel, task }) = consumer {
            cancel.cancel();
            if let Err(e) = task.await {
                warn!(error = %e, "Invalidation bus consumer ended abnormally");
            }
            info!(subscriber = %self.settings.subscriber_id, "Invalidation bus consumer stopped");
        }
    }

    fn settings(&self) -> &BusSettings {
        &self.settings
    }

    fn stats(&self) -> BusStats {
        self.counters.snapshot()
    }
}

// =============================================================================
// Consumers
// =============================================================================

async fn open_pubsub(url: &str, topic: &str) -> Result<PubSub, RedisError> {
    let client = redis::Client::open(url).map_err(|e| RedisError::Connection(e.to_string()))?;
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .map_err(|e| RedisError::Connection(e.to_string()))?;
    pubsub.subscribe(topic).await?;
    info!(topic = %topic, "Subscribed to invalidation topic");
    Ok(pubsub)
}

async fn consume_pubsub(
    mut pubsub: PubSub,
    url: String,
    settings: BusSettings,
    handler: Arc<dyn MessageHandler>,
    counters: Arc<BusCounters>,
    cancel: CancellationToken,
) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        {
            let mut stream = pubsub.on_message();
            loop {
                let msg = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    msg = stream.next() => msg,
                };
                let Some(msg) = msg else {
                    break;
                };
                backoff = INITIAL_BACKOFF;
                match msg.get_payload::<String>() {
                    Ok(payload) => {
                        dispatch(&payload, &settings, handler.as_ref(), &counters).await;
                    }
                    Err(e) => warn!(error = %e, "Failed to read invalidation payload"),
                }
            }
        }

        warn!(topic = %settings.topic, "Pub/sub connection closed, reconnecting");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            match open_pubsub(&url, &settings.topic).await {
                Ok(fresh) => {
                    pubsub = fresh;
                    break;
                }
                Err(e) => {
                    error!(
                        error = %e,
                        backoff_secs = backoff.as_secs(),
                        "Invalidation bus reconnect failed"
                    );
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }
}

async fn consume_queue(
    pool: Pool,
    settings: BusSettings,
    handler: Arc<dyn MessageHandler>,
    counters: Arc<BusCounters>,
    cancel: CancellationToken,
) {
    let key = settings.queue_key();
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let popped = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            popped = pop(&pool, &key) => popped,
        };
        match popped {
            Ok(Some(payload)) => {
                backoff = INITIAL_BACKOFF;
                dispatch(&payload, &settings, handler.as_ref(), &counters).await;
            }
            Ok(None) => {}
            Err(e) => {
                error!(error = %e, backoff_secs = backoff.as_secs(), "Invalidation queue read failed");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

async fn pop(pool: &Pool, key: &str) -> Result<Option<String>, RedisError> {
    let mut conn = pool.get().await?;
    let popped: Option<(String, String)> = conn.blpop(key, QUEUE_BLOCK_SECS).await?;
    Ok(popped.map(|(_, payload)| payload))
}
