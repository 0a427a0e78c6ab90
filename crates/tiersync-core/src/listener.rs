//! Change Stream Listener.
//!
//! Attaches to a [`ChangeSource`], filters events by table, turns every row
//! mutation into a [`ChangeRecord`] and offers it to a bounded queue.
//!
//! The queue never applies backpressure to the stream: when it is full the
//! record is dropped and counted.
//!
//! # Example
//!
//! ```ignore
//! let listener = ChangeStreamListener::new(source);
//! listener.add_table_filter("public", "web_product");
//! let mut events = listener.events().expect("receiver already taken");
//!
//! listener.start().await?;
//! while let Some(record) = events.recv().await {
//!     println!("{} {}", record.operation, record.table);
//! }
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::record::{ChangeRecord, RowsEvent, table_key};
use crate::source::{ChangeSource, ChangeStream, StreamError};

// =============================================================================
// Constants
// =============================================================================

/// Capacity of the listener's output queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Delay before re-attaching after the stream failed mid-run.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

// =============================================================================
// Types
// =============================================================================

/// Errors returned by [`ChangeStreamListener::start`].
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("change stream listener is already running")]
    AlreadyRunning,

    #[error("failed to attach change stream: {0}")]
    Connect(#[source] StreamError),
}

/// Listener counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ListenerStats {
    /// Records placed on the queue.
    pub forwarded: u64,
    /// Records dropped because the queue was full or closed.
    pub dropped: u64,
    /// Events rejected by the table filter.
    pub filtered: u64,
    /// Events skipped because they could not be decoded.
    pub decode_errors: u64,
}

#[derive(Default)]
struct Counters {
    forwarded: AtomicU64,
    dropped: AtomicU64,
    filtered: AtomicU64,
    decode_errors: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ListenerStats {
        ListenerStats {
            forwarded: self.forwarded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }
}

/// Filters and converts raw events, then offers records to the queue.
///
/// Shared between the listener handle and its background task.
#[derive(Clone)]
struct RowRouter {
    filter: Arc<RwLock<HashSet<String>>>,
    sender: mpsc::Sender<ChangeRecord>,
    counters: Arc<Counters>,
}

impl RowRouter {
    fn accepts(&self, event: &RowsEvent) -> bool {
        let filter = self.filter.read();
        filter.is_empty() || filter.contains(&event.table_key())
    }

    fn route(&self, mut event: RowsEvent) {
        if !self.accepts(&event) {
            self.counters.filtered.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let rows = std::mem::take(&mut event.rows);
        for change in rows {
            self.offer(ChangeRecord::from_row(&event, change));
        }
    }

    fn offer(&self, record: ChangeRecord) {
        match self.sender.try_send(record) {
            Ok(()) => {
                self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(record)) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    table = %record.table,
                    operation = %record.operation,
                    dropped,
                    "Change queue is full, dropping record"
                );
            }
            Err(TrySendError::Closed(record)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(table = %record.table, "Change queue closed, dropping record");
            }
        }
    }
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

// =============================================================================
// Listener
// =============================================================================

/// Consumes the origin's change log in a background task.
pub struct ChangeStreamListener {
    source: Arc<dyn ChangeSource>,
    router: RowRouter,
    receiver: Mutex<Option<mpsc::Receiver<ChangeRecord>>>,
    running: tokio::sync::Mutex<Option<Running>>,
    reconnect_delay: Duration,
}

impl ChangeStreamListener {
    /// Create a listener with the default queue capacity (1000).
    pub fn new(source: Arc<dyn ChangeSource>) -> Self {
        Self::with_capacity(source, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(source: Arc<dyn ChangeSource>, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            source,
            router: RowRouter {
                filter: Arc::new(RwLock::new(HashSet::new())),
                sender,
                counters: Arc::new(Counters::default()),
            },
            receiver: Mutex::new(Some(receiver)),
            running: tokio::sync::Mutex::new(None),
            reconnect_delay: RECONNECT_DELAY,
        }
    }

    #[must_use]
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Accept events for `schema.table`.
    ///
    /// While no filter is registered every table is accepted.
    pub fn add_table_filter(&self, schema: &str, table: &str) {
        self.router.filter.write().insert(table_key(schema, table));
    }

    /// Receive side of the output queue. Handed out once; later calls
    /// return `None`.
    pub fn events(&self) -> Option<mpsc::Receiver<ChangeRecord>> {
        self.receiver.lock().take()
    }

    pub fn stats(&self) -> ListenerStats {
        self.router.counters.snapshot()
    }

    pub fn dropped(&self) -> u64 {
        self.router.counters.dropped.load(Ordering::Relaxed)
    }

    pub fn forwarded(&self) -> u64 {
        self.router.counters.forwarded.load(Ordering::Relaxed)
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }

    /// Attach to the stream and start consuming it in the background.
    ///
    /// # Errors
    ///
    /// [`ListenerError::AlreadyRunning`] if a previous start was not stopped,
    /// [`ListenerError::Connect`] if the stream cannot be attached.
    pub async fn start(&self) -> Result<(), ListenerError> {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return Err(ListenerError::AlreadyRunning);
        }

        let source = self.source.describe();
        let stream = self.source.connect().await.map_err(ListenerError::Connect)?;
        info!(source = %source, "Change stream attached");

        let cancel = CancellationToken::new();
        let task = tokio::spawn(consume(
            stream,
            Arc::clone(&self.source),
            self.router.clone(),
            cancel.clone(),
            self.reconnect_delay,
        ));

        *running = Some(Running { cancel, task });
        Ok(())
    }

    /// Stop the background task and release the stream. No-op when not
    /// running.
    pub async fn stop(&self) {
        let Some(Running { cancel, task }) = self.running.lock().await.take() else {
            return;
        };
        cancel.cancel();
        if let Err(e) = task.await {
            warn!(error = %e, "Change stream task ended abnormally");
        }
        info!("Change stream listener stopped");
    }
}

async fn consume(
    mut stream: Box<dyn ChangeStream>,
    source: Arc<dyn ChangeSource>,
    router: RowRouter,
    cancel: CancellationToken,
    reconnect_delay: Duration,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = stream.next_event() => next,
        };

        match next {
            Ok(Some(event)) => router.route(event),
            Ok(None) => {
                info!("Change stream ended");
                break;
            }
            Err(e) if e.is_decode() => {
                router.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Skipping undecodable change event");
            }
            Err(e) => {
                error!(
                    error = %e,
                    delay_secs = reconnect_delay.as_secs_f64(),
                    "Change stream failed, reconnecting"
                );
                stream.close().await;
                match reconnect(source.as_ref(), &cancel, reconnect_delay).await {
                    Some(fresh) => stream = fresh,
                    None => return,
                }
            }
        }
    }

    stream.close().await;
}

/// Re-attach until it succeeds or the listener is cancelled.
async fn reconnect(
    source: &dyn ChangeSource,
    cancel: &CancellationToken,
    delay: Duration,
) -> Option<Box<dyn ChangeStream>> {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
        match source.connect().await {
            Ok(stream) => {
                info!("Change stream re-attached");
                return Some(stream);
            }
            Err(e) => warn!(error = %e, "Change stream reconnect failed"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
