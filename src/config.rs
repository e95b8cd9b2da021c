//! Configuration for the hookrelay worker process.

use std::time::Duration;

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use hookrelay_core::storage::StoreConfig;
use hookrelay_delivery::{ClientConfig, DeliveryConfig, RetryPolicy};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "hookrelay.toml";
const ENV_PREFIX: &str = "HOOKRELAY_";

/// Worker configuration with defaults, file, and environment overrides.
///
/// Sources in priority order:
/// 1. `HOOKRELAY_*` environment variables (e.g. `HOOKRELAY_WORKER_COUNT`)
/// 2. `hookrelay.toml` in the working directory
/// 3. Built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Store
    /// Redis connection URL.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// Sorted-set key holding ready job IDs.
    #[serde(default = "default_queue_key")]
    pub queue_key: String,
    /// Seconds a finalized job hash is kept.
    #[serde(default = "default_job_retention")]
    pub job_retention_seconds: u64,
    /// Seconds status and history live after their last write.
    #[serde(default = "default_status_retention")]
    pub status_retention_seconds: u64,
    /// Attempt records kept per event.
    #[serde(default = "default_history_max_len")]
    pub history_max_len: usize,

    // Workers
    /// Number of concurrent delivery workers.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Idle sleep between empty polls, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Sleep after a store error, in milliseconds.
    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,
    /// Seconds to wait for workers on shutdown.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_seconds: u64,

    // Client
    /// Total timeout of one delivery attempt.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    /// Default `User-Agent` for deliveries.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    // Retry
    /// Attempts allowed when a job does not set its own.
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,
    /// Delay before the first retry.
    #[serde(default = "default_backoff_base")]
    pub backoff_base_seconds: f64,
    /// Growth factor between retries.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Upper bound of the uniform jitter added to each delay.
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter_seconds: f64,
    /// Ceiling applied before jitter.
    #[serde(default = "default_backoff_max")]
    pub backoff_max_seconds: f64,

    // Failure notification
    /// Receives a JSON POST for every permanently failed job.
    #[serde(default)]
    pub failure_notify_url: Option<String>,
    /// Timeout of the failure notification POST.
    #[serde(default = "default_notify_timeout")]
    pub notify_timeout_seconds: u64,

    // Logging
    /// Filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Config {
    /// Loads and validates configuration from all sources.
    pub fn load() -> Result<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Serialized::defaults(Self::default()))
                .merge(Toml::file(CONFIG_FILE))
                .merge(Env::prefixed(ENV_PREFIX)),
        )
    }

    fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Engine configuration.
    pub fn to_delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            worker_count: self.worker_count,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            error_backoff: Duration::from_millis(self.error_backoff_ms),
            client_config: self.to_client_config(),
            retry_policy: self.to_retry_policy(),
            failure_notify_url: self.failure_notify_url.clone().filter(|url| !url.is_empty()),
            notify_timeout: Duration::from_secs(self.notify_timeout_seconds),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_seconds),
        }
    }

    /// HTTP client configuration.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_secs(self.request_timeout_seconds),
            user_agent: self.user_agent.clone(),
            ..ClientConfig::default()
        }
    }

    /// Engine-wide retry policy.
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.default_max_attempts,
            base_delay: seconds(self.backoff_base_seconds),
            factor: self.backoff_factor,
            jitter: seconds(self.backoff_jitter_seconds),
            max_delay: seconds(self.backoff_max_seconds),
        }
    }

    /// Redis store settings.
    pub fn to_store_config(&self) -> StoreConfig {
        StoreConfig {
            queue_key: self.queue_key.clone(),
            job_retention: Duration::from_secs(self.job_retention_seconds),
            status_retention: Duration::from_secs(self.status_retention_seconds),
            history_max_len: self.history_max_len,
        }
    }

    /// Redis URL with the password replaced by `***`.
    pub fn redis_url_masked(&self) -> String {
        let Some(scheme_end) = self.redis_url.find("://").map(|i| i + 3) else {
            return self.redis_url.clone();
        };
        let Some(at_pos) = self.redis_url[scheme_end..].rfind('@').map(|i| i + scheme_end) else {
            return self.redis_url.clone();
        };

        let mut masked = self.redis_url.clone();
        match self.redis_url[scheme_end..at_pos].find(':') {
            Some(colon) => masked.replace_range(scheme_end + colon + 1..at_pos, "***"),
            None => masked.replace_range(scheme_end..at_pos, "***"),
        }
        masked
    }

    fn validate(&self) -> Result<()> {
        if self.redis_url.trim().is_empty() {
            anyhow::bail!("redis_url must not be empty");
        }

        if self.queue_key.trim().is_empty() {
            anyhow::bail!("queue_key must not be empty");
        }

        if self.worker_count == 0 {
            anyhow::bail!("worker_count must be greater than 0");
        }

        if self.request_timeout_seconds == 0 {
            anyhow::bail!("request_timeout_seconds must be greater than 0");
        }

        if self.default_max_attempts == 0 {
            anyhow::bail!("default_max_attempts must be greater than 0");
        }

        if self.history_max_len == 0 {
            anyhow::bail!("history_max_len must be greater than 0");
        }

        for (name, value) in [
            ("backoff_base_seconds", self.backoff_base_seconds),
            ("backoff_jitter_seconds", self.backoff_jitter_seconds),
            ("backoff_max_seconds", self.backoff_max_seconds),
        ] {
            if !value.is_finite() || value < 0.0 {
                anyhow::bail!("{name} must be a non-negative number");
            }
        }

        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            anyhow::bail!("backoff_factor must be at least 1.0");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            queue_key: default_queue_key(),
            job_retention_seconds: default_job_retention(),
            status_retention_seconds: default_status_retention(),
            history_max_len: default_history_max_len(),
            worker_count: default_worker_count(),
            poll_interval_ms: default_poll_interval_ms(),
            error_backoff_ms: default_error_backoff_ms(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
            request_timeout_seconds: default_request_timeout(),
            user_agent: default_user_agent(),
            default_max_attempts: default_max_attempts(),
            backoff_base_seconds: default_backoff_base(),
            backoff_factor: default_backoff_factor(),
            backoff_jitter_seconds: default_backoff_jitter(),
            backoff_max_seconds: default_backoff_max(),
            failure_notify_url: None,
            notify_timeout_seconds: default_notify_timeout(),
            log_level: default_log_level(),
        }
    }
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_queue_key() -> String {
    "webhook:queue".to_string()
}

fn default_job_retention() -> u64 {
    24 * 60 * 60
}

fn default_status_retention() -> u64 {
    7 * 24 * 60 * 60
}

fn default_history_max_len() -> usize {
    100
}

fn default_worker_count() -> usize {
    3
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_error_backoff_ms() -> u64 {
    500
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    10
}

fn default_user_agent() -> String {
    "hookrelay/1.0".to_string()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base() -> f64 {
    2.0
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_backoff_jitter() -> f64 {
    1.0
}

fn default_backoff_max() -> f64 {
    300.0
}

fn default_notify_timeout() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}
