use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

use crate::record::RowsEvent;
use crate::source::{ChangeSource, ChangeStream, StreamError};

type Feed = Result<RowsEvent, StreamError>;

/// Change source fed by hand through a [`MemoryFeed`].
///
/// Every attached stream reads from the same feed, so events pushed while a
/// stream is being re-attached are not lost.
pub struct MemoryChangeSource {
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Feed>>>,
    fail_connect: AtomicBool,
    connects: AtomicU64,
}

/// Write side of a [`MemoryChangeSource`]. Dropping every feed ends the
/// stream.
#[derive(Clone)]
pub struct MemoryFeed {
    sender: mpsc::UnboundedSender<Feed>,
}

impl MemoryChangeSource {
    pub fn new() -> (Self, MemoryFeed) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                receiver: Arc::new(Mutex::new(receiver)),
                fail_connect: AtomicBool::new(false),
                connects: AtomicU64::new(0),
            },
            MemoryFeed { sender },
        )
    }

    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Successful attaches so far.
    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }
}

impl MemoryFeed {
    /// Deliver one raw event. Returns `false` once the source is gone.
    pub fn push(&self, event: RowsEvent) -> bool {
        self.sender.send(Ok(event)).is_ok()
    }

    /// Make the attached stream fail with `error`.
    pub fn push_error(&self, error: StreamError) -> bool {
        self.sender.send(Err(error)).is_ok()
    }
}

#[async_trait]
impl ChangeSource for MemoryChangeSource {
    async fn connect(&self) -> Result<Box<dyn ChangeStream>, StreamError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(StreamError::Connect("memory source refused connection".into()));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryStream {
            receiver: Arc::clone(&self.receiver),
        }))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

struct MemoryStream {
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Feed>>>,
}

#[async_trait]
impl ChangeStream for MemoryStream {
    async fn next_event(&mut self) -> Result<Option<RowsEvent>, StreamError> {
        match self.receiver.lock().await.recv().await {
            Some(Ok(event)) => Ok(Some(event)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}
