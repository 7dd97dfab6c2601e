use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::storage::DEFAULT_PERSISTED_KEYS;
use crate::store::{EscalationPolicy, HealthThresholds, StorePolicy};

/// Main configuration for the resilience engine
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Error state store policy
    pub store: StoreConfig,
    /// Recovery strategy settings
    pub recovery: RecoveryConfig,
    /// Resilient fetch defaults
    pub fetch: FetchConfig,
    /// Persisted key/value storage
    pub storage: StorageConfig,
    /// Failure capture settings
    pub capture: CaptureConfig,
    /// Logging settings
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Fallback ladder thresholds
    pub escalation: EscalationPolicy,
    /// System health thresholds
    pub health: HealthThresholds,
    /// Maximum records kept in the global log
    pub max_global_errors: usize,
    /// Records older than this are pruned
    pub retention_seconds: u64,
    pub prune_interval_seconds: u64,
    pub health_poll_interval_seconds: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            escalation: EscalationPolicy::default(),
            health: HealthThresholds::default(),
            max_global_errors: 50,
            retention_seconds: 300,
            prune_interval_seconds: 60,
            health_poll_interval_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Reported to strategies as the retry budget of a unit
    pub max_retries: u32,
    /// Delay before a scheduled full reload fires
    pub reload_delay_ms: u64,
    /// Allow-listed values larger than this are purged
    pub storage_size_ceiling_bytes: usize,
    /// The only keys storage purges may touch
    pub persisted_keys: Vec<String>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            reload_delay_ms: 2000,
            storage_size_ceiling_bytes: 1024 * 1024,
            persisted_keys: DEFAULT_PERSISTED_KEYS.iter().map(|key| key.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FetchConfig {
    pub max_retries: u32,
    /// Base of the linear backoff (`retry_delay * attempt`)
    pub retry_delay_ms: u64,
    /// Per-attempt timeout
    pub timeout_ms: u64,
    /// Validity of the persisted last-known-good payload
    pub cache_ttl_hours: u64,
    /// Validity of the in-memory response cache
    pub response_cache_ttl_seconds: u64,
    pub response_cache_capacity: u64,
    /// Add up to 10% random jitter to backoff delays
    pub jitter: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_delay_ms: 1000,
            timeout_ms: 10_000,
            cache_ttl_hours: 24,
            response_cache_ttl_seconds: 300,
            response_cache_capacity: 256,
            jitter: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// JSON file backing persisted storage; in-memory when unset
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Record panics through a process-wide panic hook
    pub install_panic_hook: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            install_panic_hook: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (overridden by RUST_LOG)
    pub log_level: String,
    /// Emit JSON log lines
    pub json_logs: bool,
    /// Log a metrics summary on dispose
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: true,
            metrics_enabled: true,
        }
    }
}

impl FetchConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_hours * 3600)
    }

    pub fn response_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.response_cache_ttl_seconds)
    }
}

impl ResilienceConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (resilience.toml, .resilience-rc)
    /// 3. Environment variables (prefixed with RESILIENCE_, `__` between sections)
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("."))
    }

    /// Same as [`load`](Self::load), with configuration files looked up in `dir`
    pub fn load_from(dir: &Path) -> Result<Self> {
        let mut builder = Config::builder();

        let toml_path = dir.join("resilience.toml");
        if toml_path.exists() {
            builder = builder.add_source(File::from(toml_path));
        }
        let rc_path = dir.join(".resilience-rc");
        if rc_path.exists() {
            builder = builder.add_source(File::from(rc_path).format(config::FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix("RESILIENCE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }

    pub fn to_store_policy(&self) -> StorePolicy {
        StorePolicy {
            escalation: self.store.escalation,
            health: self.store.health,
            max_global_errors: self.store.max_global_errors,
            retention: Duration::from_secs(self.store.retention_seconds),
            prune_interval: Duration::from_secs(self.store.prune_interval_seconds),
            health_poll_interval: Duration::from_secs(self.store.health_poll_interval_seconds),
        }
    }
}
