//! Configuration management for Tollgate.
//!
//! Values are layered: defaults, then an optional YAML file, then
//! environment variables prefixed with `TOLLGATE` (nested keys separated by
//! `__`, e.g. `TOLLGATE__STORE__REDIS_URL`).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::clock::Clock;
use crate::entitlement::{EntitlementSource, StaticEntitlementSource};
use crate::error::{Result, TollgateError};
use crate::ratelimit::{
    EntitlementCache, LocalEntitlementCache, StoreEntitlementCache, SubscriptionSettings,
};
use crate::store::{CounterStore, MemoryCounterStore, RedisCounterStore};

/// Main configuration for Tollgate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Entitlement cache configuration
    #[serde(default)]
    pub entitlements: EntitlementConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which counter store to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store; quotas are per instance
    Memory,
    /// Redis or Valkey; quotas are shared by every instance
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    /// Connection URL for the redis backend
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Prefix applied to every key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Timeout for a single store round trip in milliseconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            command_timeout_ms: default_command_timeout(),
        }
    }
}

fn default_backend() -> StoreBackend {
    StoreBackend::Memory
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "tollgate".to_string()
}

fn default_command_timeout() -> u64 {
    500
}

impl StoreConfig {
    /// Whether counters are shared with other processes.
    pub fn is_shared(&self) -> bool {
        self.backend == StoreBackend::Redis
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Open the configured counter store.
    pub async fn connect(&self, clock: Arc<dyn Clock>) -> Result<Arc<dyn CounterStore>> {
        match self.backend {
            StoreBackend::Memory => {
                info!("Using in-memory counter store");
                Ok(Arc::new(MemoryCounterStore::with_clock(clock)))
            }
            StoreBackend::Redis => {
                let store = RedisCounterStore::connect(
                    &self.redis_url,
                    &self.key_prefix,
                    self.command_timeout(),
                )
                .await?;
                store.ping().await?;
                Ok(Arc::new(store))
            }
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Path to the rate limit rules file
    pub rules_path: Option<String>,
}

/// Where cached entitlements are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntitlementCacheKind {
    /// In this process only
    Local,
    /// In the counter store
    Store,
}

/// Entitlement cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementConfig {
    /// Seconds a fetched entitlement is used before refreshing
    #[serde(default = "default_staleness_horizon")]
    pub staleness_horizon_secs: u64,

    /// Serve a stale entitlement when the refresh fails
    #[serde(default = "default_serve_stale")]
    pub serve_stale_on_error: bool,

    #[serde(default = "default_cache_kind")]
    pub cache: EntitlementCacheKind,

    /// YAML file of entitlements keyed by access token
    #[serde(default)]
    pub source_path: Option<String>,
}

impl Default for EntitlementConfig {
    fn default() -> Self {
        Self {
            staleness_horizon_secs: default_staleness_horizon(),
            serve_stale_on_error: default_serve_stale(),
            cache: default_cache_kind(),
            source_path: None,
        }
    }
}

fn default_staleness_horizon() -> u64 {
    86400
}

fn default_serve_stale() -> bool {
    true
}

fn default_cache_kind() -> EntitlementCacheKind {
    EntitlementCacheKind::Local
}

impl EntitlementConfig {
    pub fn settings(&self) -> SubscriptionSettings {
        SubscriptionSettings {
            staleness_horizon: Duration::from_secs(self.staleness_horizon_secs),
            serve_stale_on_error: self.serve_stale_on_error,
        }
    }

    /// Load the file-backed entitlement source.
    pub fn build_source(&self) -> Result<Arc<dyn EntitlementSource>> {
        let path = self.source_path.as_ref().ok_or_else(|| {
            TollgateError::Config(
                "entitlements.source_path is required for access tokens".to_string(),
            )
        })?;
        Ok(Arc::new(StaticEntitlementSource::from_file(path)?))
    }

    /// Build the configured cache.
    pub fn build_cache(&self, store: Arc<dyn CounterStore>) -> Arc<dyn EntitlementCache> {
        match self.cache {
            EntitlementCacheKind::Local => Arc::new(LocalEntitlementCache::new()),
            EntitlementCacheKind::Store => Arc::new(StoreEntitlementCache::new(store)),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of text
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TollgateConfig {
    /// Load configuration from defaults, an optional file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Yaml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix("TOLLGATE")
                .separator("__")
                .try_parsing(true),
        );

        let config: TollgateConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TollgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the limiter misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.store.command_timeout_ms == 0 {
            return Err(TollgateError::Config(
                "store.command_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.entitlements.staleness_horizon_secs == 0 {
            return Err(TollgateError::Config(
                "entitlements.staleness_horizon_secs must be greater than zero".to_string(),
            ));
        }
        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_empty() {
            return Err(TollgateError::Config(
                "store.redis_url is required for the redis backend".to_string(),
            ));
        }
        Ok(())
    }
}
