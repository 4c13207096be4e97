//! Configuration management for collector-lease
//!
//! This module handles loading and validating configuration from environment
//! variables and TOML files.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::utils::retry::RetryConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identifier this process claims under; generated when absent
    pub instance_id: Option<String>,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Lease timing and error policy
    pub lease: LeaseConfig,

    /// Claim loop pacing
    pub rebalance: RebalanceConfig,

    /// Read API server
    pub api: ApiConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// PostgreSQL connection string
    pub postgres_url: String,

    /// Maximum pool size
    pub pool_size: usize,

    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
}

/// Lease timing and processing-error policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Fixed lease length; 0 derives it from each unit's heartbeat interval
    pub lease_duration_secs: u64,

    /// Lease length in heartbeat intervals when derived
    pub lease_multiplier: u32,

    /// Floor applied to every lease
    pub min_lease_secs: u64,

    /// Timeout applied to every store call
    pub store_timeout_ms: u64,

    /// Consecutive processing errors before a unit is parked in `error`
    pub error_threshold: u32,

    /// How long `error`/`offline` units stay parked
    pub error_cooldown_secs: u64,

    /// Local lease is treated as lost this long before it actually expires
    pub safety_margin_ms: u64,

    /// Heartbeat retry backoff
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_max_attempts: u32,
}

/// Claim loop pacing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RebalanceConfig {
    /// Claims attempted per discovery cycle
    pub batch_size: usize,

    /// Upper bound of the random sleep before each claim
    pub max_jitter_ms: u64,

    /// Units one instance may hold in total; 0 is unlimited
    pub max_units_per_instance: usize,

    /// Discovery period; 0 uses half the platform's default heartbeat interval
    pub poll_interval_secs: u64,
}

/// Read API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address to bind to
    pub bind_address: String,

    /// Enable CORS
    pub enable_cors: bool,

    /// Enable request tracing
    pub enable_tracing: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

/// Configuration rejected by validation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Store timeout ({timeout_ms}ms) must be shorter than the shortest lease ({lease_ms}ms)")]
    TimeoutNotBelowLease { timeout_ms: u64, lease_ms: u64 },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Defaults
// ============================================================================

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            postgres_url: String::from("postgresql://localhost/collectors"),
            pool_size: 10,
            connect_timeout_secs: 10,
        }
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_duration_secs: 0,
            lease_multiplier: 3,
            min_lease_secs: 15,
            store_timeout_ms: 5000,
            error_threshold: 5,
            error_cooldown_secs: 300,
            safety_margin_ms: 2000,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 4000,
            retry_max_attempts: 5,
        }
    }
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            max_jitter_ms: 2000,
            max_units_per_instance: 0,
            poll_interval_secs: 0,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: String::from("0.0.0.0:8090"),
            enable_cors: true,
            enable_tracing: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

// ============================================================================
// Loading and Validation
// ============================================================================

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let postgres_url = std::env::var("DATABASE_URL")
            .or_else(|_| std::env::var("POSTGRES_URL"))
            .unwrap_or(defaults.database.postgres_url);

        let pool_size = env_parse("DB_POOL_SIZE").unwrap_or(defaults.database.pool_size);

        let lease = LeaseConfig {
            lease_duration_secs: env_parse("LEASE_DURATION_SECS")
                .unwrap_or(defaults.lease.lease_duration_secs),
            store_timeout_ms: env_parse("LEASE_STORE_TIMEOUT_MS")
                .unwrap_or(defaults.lease.store_timeout_ms),
            error_threshold: env_parse("LEASE_ERROR_THRESHOLD")
                .unwrap_or(defaults.lease.error_threshold),
            error_cooldown_secs: env_parse("LEASE_ERROR_COOLDOWN_SECS")
                .unwrap_or(defaults.lease.error_cooldown_secs),
            ..defaults.lease
        };

        let rebalance = RebalanceConfig {
            batch_size: env_parse("LEASE_BATCH_SIZE").unwrap_or(defaults.rebalance.batch_size),
            max_jitter_ms: env_parse("LEASE_MAX_JITTER_MS")
                .unwrap_or(defaults.rebalance.max_jitter_ms),
            max_units_per_instance: env_parse("LEASE_MAX_UNITS")
                .unwrap_or(defaults.rebalance.max_units_per_instance),
            poll_interval_secs: env_parse("LEASE_POLL_INTERVAL_SECS")
                .unwrap_or(defaults.rebalance.poll_interval_secs),
        };

        let instance_id = std::env::var("INSTANCE_ID")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let bind_address =
            std::env::var("API_BIND_ADDRESS").unwrap_or(defaults.api.bind_address);

        let level = std::env::var("LOG_LEVEL").unwrap_or(defaults.logging.level);
        let format = std::env::var("LOG_FORMAT").unwrap_or(defaults.logging.format);

        Ok(Self {
            instance_id,
            database: DatabaseConfig {
                postgres_url,
                pool_size,
                ..defaults.database
            },
            lease,
            rebalance,
            api: ApiConfig {
                bind_address,
                ..defaults.api
            },
            logging: LoggingConfig { level, format },
        })
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.database.pool_size == 0 {
            return Err(ConfigError::invalid("database.pool_size", "must be greater than 0"));
        }
        if self.rebalance.batch_size == 0 {
            return Err(ConfigError::invalid("rebalance.batch_size", "must be greater than 0"));
        }
        if self.instance_id.as_deref().is_some_and(|id| id.trim().is_empty()) {
            return Err(ConfigError::invalid("instance_id", "must not be blank"));
        }
        self.lease.validate()
    }
}

impl LeaseConfig {
    /// Validate lease timing
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.error_threshold == 0 {
            return Err(ConfigError::invalid("lease.error_threshold", "must be greater than 0"));
        }
        if self.lease_multiplier < 2 {
            return Err(ConfigError::invalid(
                "lease.lease_multiplier",
                "a lease must span at least two heartbeat intervals",
            ));
        }
        if self.min_lease_secs == 0 {
            return Err(ConfigError::invalid("lease.min_lease_secs", "must be greater than 0"));
        }

        let shortest_ms = self.shortest_lease().as_millis() as u64;
        if self.store_timeout_ms == 0 {
            return Err(ConfigError::invalid("lease.store_timeout_ms", "must be greater than 0"));
        }
        if self.store_timeout_ms >= shortest_ms {
            return Err(ConfigError::TimeoutNotBelowLease {
                timeout_ms: self.store_timeout_ms,
                lease_ms: shortest_ms,
            });
        }
        if self.safety_margin_ms >= shortest_ms {
            return Err(ConfigError::invalid(
                "lease.safety_margin_ms",
                "must be shorter than the shortest lease",
            ));
        }
        Ok(())
    }

    /// Lease granted to a unit with the given heartbeat interval
    ///
    /// Never shorter than `min_lease_secs` or two heartbeat intervals.
    pub fn lease_for(&self, heartbeat_interval_secs: i32) -> Duration {
        let interval = heartbeat_interval_secs.max(1) as u64;
        let base = if self.lease_duration_secs > 0 {
            self.lease_duration_secs
        } else {
            interval * self.lease_multiplier as u64
        };
        Duration::from_secs(base.max(self.min_lease_secs).max(interval * 2))
    }

    /// Shortest lease this configuration can grant
    pub fn shortest_lease(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs.max(self.min_lease_secs))
    }

    #[must_use]
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    #[must_use]
    pub fn error_cooldown(&self) -> Duration {
        Duration::from_secs(self.error_cooldown_secs)
    }

    #[must_use]
    pub fn safety_margin(&self) -> Duration {
        Duration::from_millis(self.safety_margin_ms)
    }

    /// Threshold as stored in the `error_count` column
    pub fn error_threshold_i32(&self) -> i32 {
        i32::try_from(self.error_threshold).unwrap_or(i32::MAX)
    }

    /// Backoff used while renewing a lease
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::with_delays(
            self.retry_max_attempts,
            self.retry_base_delay_ms,
            self.retry_max_delay_ms,
        )
    }
}

impl RebalanceConfig {
    #[must_use]
    pub fn max_jitter(&self) -> Duration {
        Duration::from_millis(self.max_jitter_ms)
    }

    /// Discovery period for a platform whose default heartbeat is `heartbeat_secs`
    pub fn poll_interval(&self, heartbeat_secs: i32) -> Duration {
        if self.poll_interval_secs > 0 {
            Duration::from_secs(self.poll_interval_secs)
        } else {
            Duration::from_millis(heartbeat_secs.max(1) as u64 * 500)
        }
    }
}

impl DatabaseConfig {
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
