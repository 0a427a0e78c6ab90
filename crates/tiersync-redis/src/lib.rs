//! Redis collaborators for tiersync.
//!
//! - [`RedisSharedCache`]: the shared tier (`GET` / `SET EX` / `DEL`)
//! - [`RedisInvalidationBus`]: invalidation broadcast over pub/sub, or
//!   competing delivery over a list when explicitly configured

mod bus;
mod cache;
mod config;
mod error;
mod pool;

pub use bus::RedisInvalidationBus;
pub use cache::RedisSharedCache;
pub use config::RedisConfig;
pub use error::{RedisError, Result};
pub use pool::create_pool;

/// Re-export of the pool type.
pub type Pool = deadpool_redis::Pool;
