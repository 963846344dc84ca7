//! Queue configuration: defaults, environment loading, validation and
//! partial (hot) updates.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicy;

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Parse {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Runtime settings of a delivery queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Upper bound on tasks in `processing` at once
    pub max_concurrent_jobs: usize,
    /// Dispatcher tick period
    pub tick_interval: Duration,
    /// Back-off between attempts of the same task
    pub retry: RetryPolicy,
    /// `max_retries` for tasks admitted without one
    pub default_max_retries: u32,
    /// Upper bound on a single transport call
    pub attempt_timeout: Duration,
    /// Upper bound on a single record store write
    pub record_timeout: Duration,
    /// Cleaner period
    pub cleanup_interval: Duration,
    /// Age after which terminal tasks are evicted
    pub retention: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 5,
            tick_interval: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            default_max_retries: 3,
            attempt_timeout: Duration::from_secs(30),
            record_timeout: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(60 * 60),
            retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

pub const ENV_MAX_CONCURRENT_JOBS: &str = "COURIER_MAX_CONCURRENT_JOBS";
pub const ENV_TICK_INTERVAL_MS: &str = "COURIER_TICK_INTERVAL_MS";
pub const ENV_RETRY_DELAY_MS: &str = "COURIER_RETRY_DELAY_MS";
pub const ENV_RETRY_MULTIPLIER: &str = "COURIER_RETRY_MULTIPLIER";
pub const ENV_MAX_RETRY_DELAY_MS: &str = "COURIER_MAX_RETRY_DELAY_MS";
pub const ENV_MAX_RETRIES: &str = "COURIER_MAX_RETRIES";
pub const ENV_ATTEMPT_TIMEOUT_MS: &str = "COURIER_ATTEMPT_TIMEOUT_MS";
pub const ENV_RECORD_TIMEOUT_MS: &str = "COURIER_RECORD_TIMEOUT_MS";
pub const ENV_CLEANUP_INTERVAL_SECS: &str = "COURIER_CLEANUP_INTERVAL_SECS";
pub const ENV_RETENTION_SECS: &str = "COURIER_RETENTION_SECS";

impl QueueConfig {
    /// Defaults overlaid with `COURIER_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`QueueConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let mut update = ConfigUpdate::default();

        update.max_concurrent_jobs = parse_var(&lookup, ENV_MAX_CONCURRENT_JOBS)?;
        update.tick_interval = parse_var(&lookup, ENV_TICK_INTERVAL_MS)?.map(Duration::from_millis);
        update.retry_delay = parse_var(&lookup, ENV_RETRY_DELAY_MS)?.map(Duration::from_millis);
        update.retry_multiplier = parse_var(&lookup, ENV_RETRY_MULTIPLIER)?;
        update.max_retry_delay =
            parse_var(&lookup, ENV_MAX_RETRY_DELAY_MS)?.map(Duration::from_millis);
        update.default_max_retries = parse_var(&lookup, ENV_MAX_RETRIES)?;
        update.attempt_timeout =
            parse_var(&lookup, ENV_ATTEMPT_TIMEOUT_MS)?.map(Duration::from_millis);
        update.record_timeout =
            parse_var(&lookup, ENV_RECORD_TIMEOUT_MS)?.map(Duration::from_millis);
        update.cleanup_interval =
            parse_var(&lookup, ENV_CLEANUP_INTERVAL_SECS)?.map(Duration::from_secs);
        update.retention = parse_var(&lookup, ENV_RETENTION_SECS)?.map(Duration::from_secs);

        update.apply_to(&Self::default())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_jobs == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_jobs must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("tick_interval", self.tick_interval),
            ("attempt_timeout", self.attempt_timeout),
            ("record_timeout", self.record_timeout),
            ("cleanup_interval", self.cleanup_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "retry multiplier must be a finite value >= 1.0, got {}",
                self.retry.multiplier
            )));
        }
        if self.retry.max_delay < self.retry.base_delay {
            return Err(ConfigError::Invalid(
                "max retry delay must not be shorter than the base delay".to_string(),
            ));
        }
        Ok(())
    }
}

/// Partial configuration; `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigUpdate {
    pub max_concurrent_jobs: Option<usize>,
    pub tick_interval: Option<Duration>,
    pub retry_delay: Option<Duration>,
    pub retry_multiplier: Option<f64>,
    pub max_retry_delay: Option<Duration>,
    pub default_max_retries: Option<u32>,
    pub attempt_timeout: Option<Duration>,
    pub record_timeout: Option<Duration>,
    pub cleanup_interval: Option<Duration>,
    pub retention: Option<Duration>,
}

impl ConfigUpdate {
    pub fn max_concurrent_jobs(mut self, value: usize) -> Self {
        self.max_concurrent_jobs = Some(value);
        self
    }

    pub fn tick_interval(mut self, value: Duration) -> Self {
        self.tick_interval = Some(value);
        self
    }

    pub fn retry_delay(mut self, value: Duration) -> Self {
        self.retry_delay = Some(value);
        self
    }

    pub fn default_max_retries(mut self, value: u32) -> Self {
        self.default_max_retries = Some(value);
        self
    }

    pub fn record_timeout(mut self, value: Duration) -> Self {
        self.record_timeout = Some(value);
        self
    }

    pub fn cleanup_interval(mut self, value: Duration) -> Self {
        self.cleanup_interval = Some(value);
        self
    }

    pub fn retention(mut self, value: Duration) -> Self {
        self.retention = Some(value);
        self
    }

    /// Produce the merged configuration, validated. `base` is left untouched.
    pub fn apply_to(&self, base: &QueueConfig) -> Result<QueueConfig, ConfigError> {
        let mut next = base.clone();

        if let Some(v) = self.max_concurrent_jobs {
            next.max_concurrent_jobs = v;
        }
        if let Some(v) = self.tick_interval {
            next.tick_interval = v;
        }
        if let Some(v) = self.retry_delay {
            next.retry.base_delay = v;
        }
        if let Some(v) = self.retry_multiplier {
            next.retry.multiplier = v;
        }
        if let Some(v) = self.max_retry_delay {
            next.retry.max_delay = v;
        }
        if let Some(v) = self.default_max_retries {
            next.default_max_retries = v;
        }
        if let Some(v) = self.attempt_timeout {
            next.attempt_timeout = v;
        }
        if let Some(v) = self.record_timeout {
            next.record_timeout = v;
        }
        if let Some(v) = self.cleanup_interval {
            next.cleanup_interval = v;
        }
        if let Some(v) = self.retention {
            next.retention = v;
        }

        next.validate()?;
        Ok(next)
    }
}

fn parse_var<F, T>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&'static str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|e| ConfigError::Parse {
            var,
            value: raw.clone(),
            reason: e.to_string(),
        })
}
