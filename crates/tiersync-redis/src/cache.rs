use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::Pool;
use redis::AsyncCommands;
use tiersync_core::{CacheError, SharedCache};
use tracing::debug;

/// Shared tier on Redis. Values are stored as given; TTLs are rounded up to
/// whole seconds.
#[derive(Clone)]
pub struct RedisSharedCache {
    pool: Pool,
}

impl RedisSharedCache {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, CacheError> {
        self.pool
            .get()
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))
    }
}

fn command_error(err: redis::RedisError) -> CacheError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
        CacheError::Connection(err.to_string())
    } else {
        CacheError::Command(err.to_string())
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    let secs = ttl.as_secs();
    if ttl.subsec_nanos() > 0 { secs + 1 } else { secs.max(1) }
}

#[async_trait]
impl SharedCache for RedisSharedCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.conn().await?;
        conn.get::<_, Option<Vec<u8>>>(key).await.map_err(command_error)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        let ttl_secs = ttl_secs(ttl);
        conn.set_ex::<_, _, ()>(key, value, ttl_secs)
            .await
            .map_err(command_error)?;
        debug!(key = %key, ttl_secs, "Shared cache set");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(key).await.map_err(command_error)?;
        debug!(key = %key, "Shared cache delete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_rounds_up() {
        assert_eq!(ttl_secs(Duration::from_secs(600)), 600);
        assert_eq!(ttl_secs(Duration::from_millis(1500)), 2);
        assert_eq!(ttl_secs(Duration::from_millis(10)), 1);
        assert_eq!(ttl_secs(Duration::ZERO), 1);
    }
}
