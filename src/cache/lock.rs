//! Distributed dedup lock
//!
//! Serializes concurrent deliveries of the same provider event. The lock only
//! cuts redundant work; correctness comes from the conditional order update.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::CacheError;
use crate::payments::{EventKind, ProviderName};

/// `paygate:lock:{provider}:{kind}:{order_ref}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey(String);

impl LockKey {
    pub fn new(provider: ProviderName, order_ref: &str, kind: EventKind) -> Self {
        Self(format!("paygate:lock:{}:{}:{}", provider, kind, order_ref))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
pub trait DedupLock: Send + Sync {
    /// Atomic set-if-absent with expiry. `false` means someone else holds it.
    async fn acquire(&self, key: &LockKey, holder: &str, ttl: Duration) -> Result<bool, CacheError>;

    /// Deletes the key only if `holder` still owns it.
    async fn release(&self, key: &LockKey, holder: &str) -> Result<bool, CacheError>;
}

// ============================================================================
// Redis
// ============================================================================

#[cfg(feature = "cache")]
pub use redis_lock::RedisDedupLock;

#[cfg(feature = "cache")]
mod redis_lock {
    use super::*;
    use crate::cache::RedisPool;

    const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

    #[derive(Clone)]
    pub struct RedisDedupLock {
        pool: RedisPool,
    }

    impl RedisDedupLock {
        pub fn new(pool: RedisPool) -> Self {
            Self { pool }
        }
    }

    #[async_trait]
    impl DedupLock for RedisDedupLock {
        async fn acquire(
            &self,
            key: &LockKey,
            holder: &str,
            ttl: Duration,
        ) -> Result<bool, CacheError> {
            let mut conn = self.pool.get().await?;
            let reply: Option<String> = redis::cmd("SET")
                .arg(key.as_str())
                .arg(holder)
                .arg("NX")
                .arg("PX")
                .arg(ttl.as_millis() as u64)
                .query_async(&mut *conn)
                .await?;
            Ok(reply.is_some())
        }

        async fn release(&self, key: &LockKey, holder: &str) -> Result<bool, CacheError> {
            let mut conn = self.pool.get().await?;
            let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
                .key(key.as_str())
                .arg(holder)
                .invoke_async(&mut *conn)
                .await?;
            Ok(deleted == 1)
        }
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Process-local lock with the same expiry and holder semantics as Redis
#[derive(Default)]
pub struct InMemoryDedupLock {
    entries: Mutex<HashMap<LockKey, (String, Instant)>>,
}

impl InMemoryDedupLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DedupLock for InMemoryDedupLock {
    async fn acquire(&self, key: &LockKey, holder: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        // Expired holders are gone in Redis too; drop them so the map stays bounded
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.clone(), (holder.to_string(), now + ttl));
        Ok(true)
    }

    async fn release(&self, key: &LockKey, holder: &str) -> Result<bool, CacheError> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((owner, expires_at)) if owner == holder && *expires_at > Instant::now() => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
