//! Change-driven two-tier cache invalidation.
//!
//! ## Architecture
//!
//! - **Local tier**: in-process map, no TTL, evicted only by invalidation
//! - **Shared tier**: network cache shared by every process, always with a TTL
//! - **Change stream**: row mutations observed on the origin store's change log
//! - **Broadcast bus**: every process receives every invalidation message
//!
//! ## Data Flow
//!
//! ```text
//! origin write → change log → ChangeStreamListener → queue (1000)
//!                                                      ↓
//!                                          ChangeEventProcessor
//!                                            ↓              ↓
//!                                  shared-tier DEL   bus PUBLISH
//!                                                           ↓
//!                                every process: LocalInvalidationHandler
//!                                                           ↓
//!                                                   local-tier delete
//! ```
//!
//! Reads go through [`CacheAside`]: local → shared → origin, populating each
//! tier on the way back. Writes never touch the caches; convergence is owned
//! entirely by the change-stream pipeline.
//!
//! Network collaborators (PostgreSQL change stream, Redis shared tier and bus)
//! live in sibling crates. The [`memory`] module provides in-process versions
//! of every collaborator for single-process runs and tests.

pub mod bus;
pub mod event_log;
pub mod handler;
pub mod keys;
pub mod listener;
pub mod memory;
pub mod message;
pub mod orchestrator;
pub mod pipeline;
pub mod processor;
pub mod record;
pub mod source;
pub mod tiers;

pub use bus::{
    BusCounters, BusError, BusSettings, BusStats, DeliveryMode, HandlerError, InvalidationBus,
    MessageHandler,
};
pub use event_log::EventLog;
pub use handler::LocalInvalidationHandler;
pub use keys::{KeyRule, KeySpace, cache_key};
pub use listener::{ChangeStreamListener, ListenerError, ListenerStats, DEFAULT_QUEUE_CAPACITY};
pub use message::{InvalidationMessage, InvalidationMessageError, InvalidationReason};
pub use orchestrator::{CacheAside, Lookup, OriginError, OriginStore, ReadSource};
pub use pipeline::{InvalidationPipeline, PipelineError, PipelineStats};
pub use processor::{ChangeEventProcessor, ProcessorStats};
pub use record::{ChangeOperation, ChangeRecord, Row, RowChange, RowsEvent};
pub use source::{ChangeSource, ChangeStream, StreamError};
pub use tiers::{CacheError, CacheStats, LocalCache, SharedCache, TierManager};
