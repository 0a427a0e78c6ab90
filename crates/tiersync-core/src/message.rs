//! Invalidation messages broadcast to every process.

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Wire protocol version stamped on every message.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Why a set of keys is being invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvalidationReason {
    /// Derived from a row mutation on the change stream.
    CdcInvalidated,
    /// Requested explicitly by an operator.
    Manual,
}

impl InvalidationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CdcInvalidated => "cdc-invalidated",
            Self::Manual => "manual",
        }
    }
}

impl std::fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Instruction to evict keys from every process's local tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidationMessage {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub reason: InvalidationReason,
    pub table: String,
    pub keys: Vec<String>,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidationMessageError {
    #[error("invalidation message for table '{table}' has no keys")]
    EmptyKeys { table: String },
}

impl InvalidationMessage {
    /// Build a message; duplicate keys are collapsed, first occurrence wins.
    pub fn new<I, S>(
        reason: InvalidationReason,
        table: impl Into<String>,
        keys: I,
    ) -> Result<Self, InvalidationMessageError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let table = table.into();
        let keys: IndexSet<String> = keys.into_iter().map(Into::into).collect();
        if keys.is_empty() {
            return Err(InvalidationMessageError::EmptyKeys { table });
        }

        Ok(Self {
            timestamp: OffsetDateTime::now_utc(),
            reason,
            table,
            keys: keys.into_iter().collect(),
            version: PROTOCOL_VERSION.to_string(),
            trace_id: Some(format!("cdc-{}", Uuid::new_v4())),
        })
    }

    /// Check invariants of a message received from the wire.
    pub fn validate(&self) -> Result<(), InvalidationMessageError> {
        if self.keys.is_empty() {
            return Err(InvalidationMessageError::EmptyKeys {
                table: self.table.clone(),
            });
        }
        Ok(())
    }
}
