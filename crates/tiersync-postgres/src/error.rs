//! Error types for the PostgreSQL collaborators.

use sqlx_core::error::Error as SqlxError;
use tiersync_core::OriginError;

#[derive(Debug, thiserror::Error)]
pub enum PostgresError {
    #[error("Database error: {0}")]
    Database(#[from] SqlxError),

    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl PostgresError {
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

/// Whether `err` means the database could not be reached at all.
pub(crate) fn is_connection_error(err: &SqlxError) -> bool {
    matches!(
        err,
        SqlxError::Io(_) | SqlxError::Tls(_) | SqlxError::PoolTimedOut | SqlxError::PoolClosed
    )
}

impl From<PostgresError> for OriginError {
    fn from(err: PostgresError) -> Self {
        match err {
            PostgresError::Database(e) if is_connection_error(&e) => {
                OriginError::Connection(e.to_string())
            }
            PostgresError::Database(e) => OriginError::Query(e.to_string()),
            PostgresError::Config { message } => OriginError::InvalidRecord(message),
        }
    }
}

/// Result type alias for PostgreSQL operations.
pub type Result<T> = std::result::Result<T, PostgresError>;
