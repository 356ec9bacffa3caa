//! Configuration for the Courier dispatch service.

use std::time::Duration;

use anyhow::{Context, Result};
use courier_dispatch::{broker::topics, ClientConfig, RetryPolicy};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "config.toml";

/// Service configuration with defaults, file, and environment overrides.
///
/// Sources are merged in priority order:
/// 1. Environment variables (highest priority)
/// 2. Configuration file (`config.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// Without `DATABASE_URL` the ledger lives in memory, and without
/// `BROKER_ADDRESSES` the consumer reads from an in-process broker.
/// Producer tuning is not configured here; event sources construct their
/// own `ProducerConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Database
    /// PostgreSQL connection URL.
    ///
    /// Environment variable: `DATABASE_URL`
    #[serde(default, alias = "DATABASE_URL")]
    pub database_url: Option<String>,
    /// Maximum number of database connections in the pool.
    ///
    /// Environment variable: `DATABASE_MAX_CONNECTIONS`
    #[serde(default = "default_max_connections", alias = "DATABASE_MAX_CONNECTIONS")]
    pub database_max_connections: u32,

    // Broker
    /// Comma separated broker `host:port` list.
    ///
    /// Environment variable: `BROKER_ADDRESSES`
    #[serde(default, alias = "BROKER_ADDRESSES")]
    pub broker_addresses: Option<String>,
    /// Consumer group the dispatch consumer joins.
    ///
    /// Environment variable: `CONSUMER_GROUP_ID`
    #[serde(default = "default_consumer_group_id", alias = "CONSUMER_GROUP_ID")]
    pub consumer_group_id: String,
    /// Topic webhook dispatch events are consumed from.
    ///
    /// Environment variable: `DISPATCH_TOPIC`
    #[serde(default = "default_dispatch_topic", alias = "DISPATCH_TOPIC")]
    pub dispatch_topic: String,

    // Delivery
    /// Retries after the first delivery attempt before a callback expires.
    ///
    /// Environment variable: `MAX_RETRIES`
    #[serde(default = "default_max_retries", alias = "MAX_RETRIES")]
    pub max_retries: u32,
    /// Timeout for one merchant callback in seconds.
    ///
    /// Environment variable: `REQUEST_TIMEOUT_SECONDS`
    #[serde(default = "default_request_timeout", alias = "REQUEST_TIMEOUT_SECONDS")]
    pub request_timeout_seconds: u64,
    /// Wait before each retry in milliseconds; the last entry repeats.
    ///
    /// Environment variable: `RETRY_INTERVALS_MS`, e.g. `[1000,5000,8000]`
    #[serde(default = "default_retry_intervals", alias = "RETRY_INTERVALS_MS")]
    pub retry_intervals_ms: Vec<u64>,
    /// Seconds between sweeps for overdue ledger rows.
    ///
    /// Environment variable: `SWEEP_INTERVAL_SECONDS`
    #[serde(default = "default_sweep_interval", alias = "SWEEP_INTERVAL_SECONDS")]
    pub sweep_interval_seconds: u64,

    // Logging
    /// Log filter used when `RUST_LOG` is not a valid directive.
    ///
    /// Environment variable: `RUST_LOG`
    #[serde(default = "default_log_level", alias = "RUST_LOG")]
    pub rust_log: String,
}

impl Config {
    /// Loads configuration from defaults, config file, and environment.
    ///
    /// # Errors
    ///
    /// Fails if a source cannot be parsed or the merged values are invalid.
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(""));

        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Convert to the delivery retry policy.
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            retry_intervals: self
                .retry_intervals_ms
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
            request_timeout: self.request_timeout(),
        }
    }

    /// Convert to client configuration.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig { timeout: self.request_timeout(), ..ClientConfig::default() }
    }

    /// Interval between sweeps.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    /// Get database URL with password masked for logging.
    pub fn database_url_masked(&self) -> Option<String> {
        let url = self.database_url.as_ref()?;
        if let Some(at_pos) = url.find('@') {
            if let Some(colon_pos) = url[..at_pos].rfind(':') {
                let mut masked = url.clone();
                masked.replace_range(colon_pos + 1..at_pos, "***");
                return Some(masked);
            }
        }
        Some(url.clone())
    }

    /// Validate configuration values.
    fn validate(&self) -> Result<()> {
        if self.database_max_connections == 0 {
            anyhow::bail!("database_max_connections must be greater than 0");
        }

        if self.max_retries == 0 {
            anyhow::bail!("max_retries must be greater than 0");
        }

        if self.retry_intervals_ms.is_empty() {
            anyhow::bail!("retry_intervals_ms must not be empty");
        }

        if self.request_timeout_seconds == 0 {
            anyhow::bail!("request_timeout_seconds must be greater than 0");
        }

        if self.sweep_interval_seconds == 0 {
            anyhow::bail!("sweep_interval_seconds must be greater than 0");
        }

        if self.dispatch_topic.trim().is_empty() {
            anyhow::bail!("dispatch_topic must not be empty");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            database_max_connections: default_max_connections(),
            broker_addresses: None,
            consumer_group_id: default_consumer_group_id(),
            dispatch_topic: default_dispatch_topic(),
            max_retries: default_max_retries(),
            request_timeout_seconds: default_request_timeout(),
            retry_intervals_ms: default_retry_intervals(),
            sweep_interval_seconds: default_sweep_interval(),
            rust_log: default_log_level(),
        }
    }
}

fn default_max_connections() -> u32 {
    10
}

fn default_consumer_group_id() -> String {
    "courier-dispatch".to_string()
}

fn default_dispatch_topic() -> String {
    topics::WEBHOOK_DISPATCH.to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_request_timeout() -> u64 {
    30
}

fn default_retry_intervals() -> Vec<u64> {
    vec![1000, 5000, 8000]
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_log_level() -> String {
    "info,courier=debug".to_string()
}
