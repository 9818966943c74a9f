//! Shared key-value backends
//!
//! Redis holds only short-lived advisory state here: dedup locks and the
//! live-instance heartbeat set. Nothing in it is a source of durable truth.

pub mod instances;
pub mod lock;

pub use instances::{InstanceRegistry, ServiceInstance, StaticInstanceRegistry};
pub use lock::{DedupLock, InMemoryDedupLock, LockKey};

#[cfg(feature = "cache")]
pub use instances::RedisInstanceRegistry;
#[cfg(feature = "cache")]
pub use lock::RedisDedupLock;

#[cfg(feature = "cache")]
pub type RedisPool = bb8::Pool<bb8_redis::RedisConnectionManager>;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[cfg(feature = "cache")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("invalid cache entry: {0}")]
    InvalidEntry(String),
}

#[cfg(feature = "cache")]
impl From<bb8::RunError<redis::RedisError>> for CacheError {
    fn from(err: bb8::RunError<redis::RedisError>) -> Self {
        CacheError::Pool(err.to_string())
    }
}

/// Builds the Redis connection pool
#[cfg(feature = "cache")]
pub async fn connect(url: &str, pool_size: u32) -> Result<RedisPool, CacheError> {
    let manager = bb8_redis::RedisConnectionManager::new(url)?;
    let pool = bb8::Pool::builder().max_size(pool_size).build(manager).await?;
    tracing::info!(pool_size, "Redis connection pool ready");
    Ok(pool)
}
