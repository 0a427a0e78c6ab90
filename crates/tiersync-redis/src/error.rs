/// Errors raised while talking to Redis.
#[derive(Debug, thiserror::Error)]
pub enum RedisError {
    #[error("Redis pool error: {0}")]
    Pool(String),

    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(#[from] redis::RedisError),
}

impl From<deadpool_redis::PoolError> for RedisError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        Self::Pool(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RedisError>;
