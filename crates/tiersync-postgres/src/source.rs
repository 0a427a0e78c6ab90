//! Change-log stream over `LISTEN/NOTIFY`.

use async_trait::async_trait;
use sqlx_postgres::PgListener;
use tiersync_core::{ChangeSource, ChangeStream, RowsEvent, StreamError};
use tracing::{debug, info, warn};

use crate::PgPool;
use crate::payload::decode_payload;

/// Attaches a dedicated `LISTEN` connection per stream.
///
/// `LISTEN` starts at the current position; notifications sent while no
/// stream is attached are not replayed.
pub struct PgChangeSource {
    pool: PgPool,
    channel: String,
}

impl PgChangeSource {
    pub fn new(pool: PgPool, channel: impl Into<String>) -> Self {
        Self {
            pool,
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl ChangeSource for PgChangeSource {
    async fn connect(&self) -> Result<Box<dyn ChangeStream>, StreamError> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| StreamError::Connect(e.to_string()))?;
        listener
            .listen(&self.channel)
            .await
            .map_err(|e| StreamError::Connect(e.to_string()))?;

        info!(channel = %self.channel, "Listening for change notifications");
        Ok(Box::new(PgChangeStream {
            listener,
            channel: self.channel.clone(),
        }))
    }

    fn describe(&self) -> String {
        format!("postgres LISTEN {}", self.channel)
    }
}

struct PgChangeStream {
    listener: PgListener,
    channel: String,
}

#[async_trait]
impl ChangeStream for PgChangeStream {
    async fn next_event(&mut self) -> Result<Option<RowsEvent>, StreamError> {
        let notification = self
            .listener
            .recv()
            .await
            .map_err(|e| StreamError::Io(e.to_string()))?;
        let payload = notification.payload();
        debug!(channel = %notification.channel(), payload = %payload, "Received change NOTIFY");

        decode_payload(payload).map(Some)
    }

    async fn close(&mut self) {
        if let Err(e) = self.listener.unlisten(&self.channel).await {
            warn!(channel = %self.channel, error = %e, "Failed to UNLISTEN");
        }
    }
}
