//! Tuning configuration for reconciliation runs.
//!
//! Loaded from an optional YAML file; every field has a default.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::{Error, Result};

/// Default number of channel-days processed concurrently
pub const DEFAULT_CONCURRENCY: usize = 8;
/// Default deadline for a single store call in milliseconds
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 30_000;
/// Default PostgreSQL pool size. Must exceed the concurrency: the summary
/// stream keeps one connection for the whole run.
pub const DEFAULT_POOL_SIZE: usize = 10;
/// Default attempts per channel-day for transient failures
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default delay before the first retry in milliseconds
pub const DEFAULT_BASE_DELAY_MS: u64 = 200;
/// Default upper bound for the retry delay in milliseconds
pub const DEFAULT_MAX_DELAY_MS: u64 = 5_000;

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn default_store_timeout_ms() -> u64 {
    DEFAULT_STORE_TIMEOUT_MS
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}

fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}

/// Bounded exponential backoff for transient channel-day failures
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    /// Delay after failed attempt number `attempt` (1-based): doubles each
    /// time, capped at `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TuningConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            store_timeout_ms: default_store_timeout_ms(),
            pool_size: default_pool_size(),
            retry: RetryConfig::default(),
        }
    }
}

impl TuningConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::Config("concurrency must be greater than zero".into()));
        }
        if self.store_timeout_ms == 0 {
            return Err(Error::Config("store_timeout_ms must be greater than zero".into()));
        }
        if self.pool_size <= self.concurrency {
            return Err(Error::Config(format!(
                "pool_size ({}) must exceed concurrency ({}), one connection serves the summary stream",
                self.pool_size, self.concurrency
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".into()));
        }
        Ok(())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}
