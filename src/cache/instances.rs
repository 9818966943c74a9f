//! Live service instances, used for reconciliation leader election
//!
//! Election picks the instance with the earliest start time. It is not fenced:
//! during a partition two instances can both sweep, which the conditional
//! order update turns into harmless no-ops.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use super::CacheError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstance {
    pub instance_id: String,
    pub started_at: DateTime<Utc>,
}

impl ServiceInstance {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            started_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait InstanceRegistry: Send + Sync {
    /// Registers or refreshes the instance heartbeat
    async fn register(&self, instance: &ServiceInstance) -> Result<(), CacheError>;

    async fn list_instances(&self) -> Result<Vec<ServiceInstance>, CacheError>;
}

/// Earliest `(started_at, instance_id)` wins; the id breaks start-time ties.
pub fn earliest_instance(instances: &[ServiceInstance]) -> Option<&ServiceInstance> {
    instances
        .iter()
        .min_by(|a, b| (a.started_at, &a.instance_id).cmp(&(b.started_at, &b.instance_id)))
}

/// Refreshes the registration until shutdown
pub fn spawn_heartbeat(
    registry: Arc<dyn InstanceRegistry>,
    instance: ServiceInstance,
    every: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    debug!(instance_id = %instance.instance_id, "Heartbeat stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = registry.register(&instance).await {
                        warn!(instance_id = %instance.instance_id, error = %e, "Instance heartbeat failed");
                    }
                }
            }
        }
    })
}

// ============================================================================
// Static
// ============================================================================

/// Fixed membership; a single-instance deployment is always its own leader.
#[derive(Default)]
pub struct StaticInstanceRegistry {
    instances: RwLock<Vec<ServiceInstance>>,
}

impl StaticInstanceRegistry {
    pub fn new(instances: Vec<ServiceInstance>) -> Self {
        Self {
            instances: RwLock::new(instances),
        }
    }
}

#[async_trait]
impl InstanceRegistry for StaticInstanceRegistry {
    async fn register(&self, instance: &ServiceInstance) -> Result<(), CacheError> {
        let mut instances = self.instances.write().await;
        match instances
            .iter_mut()
            .find(|i| i.instance_id == instance.instance_id)
        {
            Some(existing) => existing.started_at = instance.started_at,
            None => instances.push(instance.clone()),
        }
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<ServiceInstance>, CacheError> {
        Ok(self.instances.read().await.clone())
    }
}

// ============================================================================
// Redis
// ============================================================================

#[cfg(feature = "cache")]
pub use redis_registry::RedisInstanceRegistry;

#[cfg(feature = "cache")]
mod redis_registry {
    use super::*;
    use crate::cache::RedisPool;
    use chrono::TimeZone;

    const HEARTBEAT_KEY: &str = "paygate:instances:heartbeat";
    const STARTED_KEY: &str = "paygate:instances:started";

    /// Heartbeats in a sorted set scored by last-seen millis; start times in a hash.
    #[derive(Clone)]
    pub struct RedisInstanceRegistry {
        pool: RedisPool,
        ttl: Duration,
    }

    impl RedisInstanceRegistry {
        pub fn new(pool: RedisPool, ttl: Duration) -> Self {
            Self { pool, ttl }
        }
    }

    #[async_trait]
    impl InstanceRegistry for RedisInstanceRegistry {
        async fn register(&self, instance: &ServiceInstance) -> Result<(), CacheError> {
            let mut conn = self.pool.get().await?;
            redis::pipe()
                .atomic()
                .cmd("ZADD")
                .arg(HEARTBEAT_KEY)
                .arg(Utc::now().timestamp_millis())
                .arg(&instance.instance_id)
                .ignore()
                .cmd("HSET")
                .arg(STARTED_KEY)
                .arg(&instance.instance_id)
                .arg(instance.started_at.timestamp_millis())
                .ignore()
                .query_async::<()>(&mut *conn)
                .await?;
            Ok(())
        }

        async fn list_instances(&self) -> Result<Vec<ServiceInstance>, CacheError> {
            let mut conn = self.pool.get().await?;
            let cutoff = Utc::now().timestamp_millis() - self.ttl.as_millis() as i64;

            let expired: Vec<String> = redis::cmd("ZRANGEBYSCORE")
                .arg(HEARTBEAT_KEY)
                .arg("-inf")
                .arg(cutoff)
                .query_async(&mut *conn)
                .await?;
            if !expired.is_empty() {
                info!(count = expired.len(), "Pruning expired service instances");
                redis::pipe()
                    .atomic()
                    .cmd("ZREM")
                    .arg(HEARTBEAT_KEY)
                    .arg(&expired)
                    .ignore()
                    .cmd("HDEL")
                    .arg(STARTED_KEY)
                    .arg(&expired)
                    .ignore()
                    .query_async::<()>(&mut *conn)
                    .await?;
            }

            let live: Vec<String> = redis::cmd("ZRANGEBYSCORE")
                .arg(HEARTBEAT_KEY)
                .arg(format!("({}", cutoff))
                .arg("+inf")
                .query_async(&mut *conn)
                .await?;
            if live.is_empty() {
                return Ok(Vec::new());
            }

            let started: Vec<Option<i64>> = redis::cmd("HMGET")
                .arg(STARTED_KEY)
                .arg(&live)
                .query_async(&mut *conn)
                .await?;

            let mut instances = Vec::with_capacity(live.len());
            for (instance_id, started_ms) in live.into_iter().zip(started) {
                let Some(ms) = started_ms else {
                    continue;
                };
                let started_at = Utc
                    .timestamp_millis_opt(ms)
                    .single()
                    .ok_or_else(|| CacheError::InvalidEntry(format!("start time {}", ms)))?;
                instances.push(ServiceInstance {
                    instance_id,
                    started_at,
                });
            }
            Ok(instances)
        }
    }
}
