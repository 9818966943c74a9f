//! Service configuration
//!
//! Layered: optional TOML file (`PAYGATE_CONFIG`, default `paygate.toml`), then
//! `PAYGATE__SECTION__KEY` environment variables. Every section has defaults
//! except provider credentials, which must be supplied.

use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::time::Duration;

use crate::payments::ProviderCredentials;
use crate::services::{NotifierConfig, TransitionConfig};
use crate::workers::ReconciliationConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/paygate".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    pub pool_size: u32,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            pool_size: 16,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub ttl_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self { ttl_ms: 10_000 }
    }
}

impl LockConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Defaults to `HOSTNAME`, then a random id
    pub id: Option<String>,
    pub heartbeat_ttl_secs: u64,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            id: None,
            heartbeat_ttl_secs: 30,
        }
    }
}

impl InstanceConfig {
    pub fn instance_id(&self) -> String {
        self.id
            .clone()
            .filter(|id| !id.is_empty())
            .or_else(|| env::var("HOSTNAME").ok().filter(|h| !h.is_empty()))
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_ttl_secs)
    }

    /// Refresh three times per TTL so one missed beat does not drop the instance
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis((self.heartbeat_ttl_secs * 1_000 / 3).max(1_000))
    }
}

// ============================================================================
// Root
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub lock: LockConfig,
    pub transition: TransitionConfig,
    pub notifier: NotifierConfig,
    pub reconciliation: ReconciliationConfig,
    pub instance: InstanceConfig,
    pub providers: Vec<ProviderCredentials>,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let path = env::var("PAYGATE_CONFIG").unwrap_or_else(|_| "paygate.toml".to_string());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path).required(false))
            .add_source(
                ::config::Environment::with_prefix("PAYGATE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Startup checks. Missing or duplicate provider credentials are fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.providers.is_empty() {
            return Err(ConfigError::Invalid(
                "no provider credentials configured".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for creds in &self.providers {
            creds
                .validate()
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
            if !seen.insert((creds.provider, creds.app_id.clone())) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate credentials for {}/{}",
                    creds.provider, creds.app_id
                )));
            }
        }

        if self.database.url.is_empty() {
            return Err(ConfigError::Invalid("database.url is empty".to_string()));
        }
        if self.redis.url.is_empty() {
            return Err(ConfigError::Invalid("redis.url is empty".to_string()));
        }
        if self.lock.ttl_ms == 0 {
            return Err(ConfigError::Invalid("lock.ttl_ms must be positive".to_string()));
        }
        if self.transition.amount_tolerance < 0 {
            return Err(ConfigError::Invalid(
                "transition.amount_tolerance must not be negative".to_string(),
            ));
        }
        if self.notifier.max_attempts == 0 || self.notifier.workers == 0 {
            return Err(ConfigError::Invalid(
                "notifier.max_attempts and notifier.workers must be positive".to_string(),
            ));
        }
        if self.reconciliation.page_size <= 0 || self.reconciliation.query_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "reconciliation.page_size and reconciliation.query_concurrency must be positive"
                    .to_string(),
            ));
        }

        Ok(())
    }
}
