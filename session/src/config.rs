//! Configuration management for the session layer.

use std::env;
use std::time::Duration;

/// Session configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base delay for the first retry of a failed table batch
    pub retry_base_ms: u64,
    /// Ceiling for the backoff delay
    pub retry_max_ms: u64,
    /// Attempts before a failed batch is dropped
    pub retry_max_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retry_base_ms: 500,
            retry_max_ms: 30_000,
            retry_max_attempts: 5,
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        Ok(Self {
            retry_base_ms: read_var("DRIFT_RETRY_BASE_MS", defaults.retry_base_ms)?,
            retry_max_ms: read_var("DRIFT_RETRY_MAX_MS", defaults.retry_max_ms)?,
            retry_max_attempts: read_var("DRIFT_RETRY_MAX_ATTEMPTS", defaults.retry_max_attempts)?,
        })
    }

    /// Exponential backoff with full jitter, capped at `retry_max_ms`.
    ///
    /// `attempt` is zero-based: attempt 0 waits up to `retry_base_ms`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .retry_base_ms
            .saturating_mul(1u64 << attempt.min(16))
            .min(self.retry_max_ms);
        // Full jitter keeps concurrent vaults from retrying in lockstep.
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u64)
            .unwrap_or(0);
        Duration::from_millis(exp / 2 + nanos % (exp / 2 + 1))
    }
}

fn read_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid(name.to_string())),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}")]
    Invalid(String),
}
