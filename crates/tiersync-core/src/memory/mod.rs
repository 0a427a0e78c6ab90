//! In-process collaborators.
//!
//! Every capability the pipeline consumes has an in-memory version here so a
//! single process, or a test, can run the whole invalidation path without
//! PostgreSQL or Redis. Several [`MemoryBus`] instances created from the same
//! [`MemoryBroker`] behave like several processes sharing one topic.

mod bus;
mod cache;
mod origin;
mod source;

pub use bus::{MemoryBroker, MemoryBus};
pub use cache::MemorySharedCache;
pub use origin::MemoryOrigin;
pub use source::{MemoryChangeSource, MemoryFeed};
