//! Change-log stream capability.

use async_trait::async_trait;

use crate::record::RowsEvent;

/// Errors raised while attaching to or reading the change-log stream.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The stream could not be attached.
    #[error("Change stream connection error: {0}")]
    Connect(String),

    /// The attached stream failed; the connection is unusable.
    #[error("Change stream I/O error: {0}")]
    Io(String),

    /// One event could not be decoded; the stream itself is still healthy.
    #[error("Change event decode error: {0}")]
    Decode(String),
}

impl StreamError {
    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Decode(_))
    }
}

/// Something that can attach to the origin's change log at its current
/// position.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn ChangeStream>, StreamError>;

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}

/// An attached change-log stream.
#[async_trait]
pub trait ChangeStream: Send {
    /// Wait for the next decoded event. `Ok(None)` means the stream ended.
    async fn next_event(&mut self) -> Result<Option<RowsEvent>, StreamError>;

    /// Release the underlying connection.
    async fn close(&mut self) {}
}
