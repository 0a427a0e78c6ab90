use std::time::Duration;

use deadpool_redis::{Pool, Runtime};
use tracing::{info, instrument};

use crate::config::RedisConfig;
use crate::error::{RedisError, Result};

/// Create a pool and make sure Redis answers `PING`.
#[instrument(skip(config), fields(url = %config.url))]
pub async fn create_pool(config: &RedisConfig) -> Result<Pool> {
    let mut redis_config = deadpool_redis::Config::from_url(&config.url);
    let timeout = Some(Duration::from_millis(config.timeout_ms));
    let mut pool_config = redis_config.get_pool_config();
    pool_config.max_size = config.pool_size;
    pool_config.timeouts.wait = timeout;
    pool_config.timeouts.create = timeout;
    pool_config.timeouts.recycle = timeout;
    redis_config.pool = Some(pool_config);

    let pool = redis_config
        .create_pool(Some(Runtime::Tokio1))
        .map_err(|e| RedisError::Connection(e.to_string()))?;

    let mut conn = pool.get().await?;
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;

    info!(pool_size = config.pool_size, "Connected to Redis");
    Ok(pool)
}
