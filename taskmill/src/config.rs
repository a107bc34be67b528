//! Worker pool configuration.
//!
//! All durations are expressed in milliseconds so that the configuration can be loaded from
//! JSON (or any other serde format) unchanged. Every field has a default, so an empty object is a
//! valid configuration.
//!
//! ```
//! # use taskmill::config::PoolConfig;
//! let config = PoolConfig::from_json(r#"{
//!     "concurrency": 5,
//!     "rate_limit": { "max": 20, "window_ms": 1000 },
//!     "max_attempts": { "generate": 5 },
//!     "job_timeout_ms": 120000
//! }"#).unwrap();
//!
//! assert_eq!(config.concurrency, 5);
//! assert_eq!(config.max_attempts_for("generate"), 5);
//! assert_eq!(config.max_attempts_for("summarise"), 3);
//! assert_eq!(config.base_delay_ms, 1_000);
//! ```
use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backoff::{BackoffStrategy, Exponential, Jitter};

/// The proportion of jitter applied to retry delays.
pub const RETRY_JITTER: f64 = 0.2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of jobs executing at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Attempt ceilings per job kind.
    #[serde(default)]
    pub max_attempts: HashMap<String, u16>,

    /// Attempt ceiling for kinds missing from `max_attempts`.
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u16,

    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// How long `stop` waits for in-flight jobs before releasing them.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_ms: u64,

    /// Per attempt timeout. Unbounded when absent.
    #[serde(default)]
    pub job_timeout_ms: Option<u64>,

    /// How long an idle slot waits before polling the queue again.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Seed for retry jitter, for reproducible delays.
    #[serde(default)]
    pub jitter_seed: Option<u64>,

    /// Initial delay before retrying a failed queue operation.
    #[serde(default = "default_claim_backoff_base")]
    pub claim_backoff_base_ms: u64,

    #[serde(default = "default_claim_backoff_max")]
    pub claim_backoff_max_ms: u64,

    /// How many times an ack, release or dead-letter call is attempted.
    #[serde(default = "default_broker_retry_attempts")]
    pub broker_retry_attempts: u16,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            rate_limit: RateLimitConfig::default(),
            max_attempts: HashMap::new(),
            default_max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            drain_timeout_ms: default_drain_timeout(),
            job_timeout_ms: None,
            poll_interval_ms: default_poll_interval(),
            jitter_seed: None,
            claim_backoff_base_ms: default_claim_backoff_base(),
            claim_backoff_max_ms: default_claim_backoff_max(),
            broker_retry_attempts: default_broker_retry_attempts(),
        }
    }
}

/// At most `max` dispatches in any `window_ms` milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_limit_max")]
    pub max: usize,
    #[serde(default = "default_rate_limit_window")]
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max: default_rate_limit_max(),
            window_ms: default_rate_limit_window(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}

fn default_max_attempts() -> u16 {
    3
}

fn default_base_delay() -> u64 {
    1_000
}

fn default_max_delay() -> u64 {
    30_000
}

fn default_drain_timeout() -> u64 {
    30_000
}

fn default_poll_interval() -> u64 {
    250
}

fn default_claim_backoff_base() -> u64 {
    100
}

fn default_claim_backoff_max() -> u64 {
    5_000
}

fn default_broker_retry_attempts() -> u16 {
    3
}

fn default_rate_limit_max() -> usize {
    10
}

fn default_rate_limit_window() -> u64 {
    1_000
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {field} {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
    #[error("Error decoding configuration")]
    Decode(#[from] serde_json::Error),
}

impl PoolConfig {
    /// Parses and validates a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason| Err(ConfigError::Invalid { field, reason });
        if self.concurrency == 0 {
            return invalid("concurrency", "must be at least 1");
        }
        if self.rate_limit.max == 0 {
            return invalid("rate_limit.max", "must be at least 1");
        }
        if self.rate_limit.window_ms == 0 {
            return invalid("rate_limit.window_ms", "must be positive");
        }
        if self.default_max_attempts == 0 || self.max_attempts.values().any(|max| *max == 0) {
            return invalid("max_attempts", "must be at least 1");
        }
        if self.base_delay_ms == 0 {
            return invalid("base_delay_ms", "must be positive");
        }
        if self.max_delay_ms < self.base_delay_ms {
            return invalid("max_delay_ms", "must not be below base_delay_ms");
        }
        if self.job_timeout_ms == Some(0) {
            return invalid("job_timeout_ms", "must be positive");
        }
        if self.broker_retry_attempts == 0 {
            return invalid("broker_retry_attempts", "must be at least 1");
        }
        Ok(())
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_rate_limit(mut self, max: usize, window: Duration) -> Self {
        self.rate_limit = RateLimitConfig {
            max,
            window_ms: window.as_millis() as u64,
        };
        self
    }

    pub fn with_max_attempts(mut self, kind: impl Into<String>, max_attempts: u16) -> Self {
        self.max_attempts.insert(kind.into(), max_attempts);
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay_ms = base.as_millis() as u64;
        self.max_delay_ms = max.as_millis() as u64;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_jitter_seed(mut self, seed: u64) -> Self {
        self.jitter_seed = Some(seed);
        self
    }

    /// The attempt ceiling for `kind`.
    pub fn max_attempts_for(&self, kind: &str) -> u16 {
        self.max_attempts
            .get(kind)
            .copied()
            .unwrap_or(self.default_max_attempts)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_millis(self.rate_limit.window_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_ms.map(Duration::from_millis)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// The retry policy described by the delay settings.
    pub fn retry_backoff(&self) -> BackoffStrategy<Exponential> {
        let strategy = BackoffStrategy::exponential(Duration::from_millis(self.base_delay_ms))
            .with_max(Duration::from_millis(self.max_delay_ms))
            .with_jitter(Jitter::Relative(RETRY_JITTER));
        match self.jitter_seed {
            Some(seed) => strategy.with_seed(seed),
            None => strategy,
        }
    }

    /// The policy for retrying failed queue operations. Not jittered.
    pub fn broker_backoff(&self) -> BackoffStrategy<Exponential> {
        BackoffStrategy::exponential(Duration::from_millis(self.claim_backoff_base_ms))
            .with_max(Duration::from_millis(self.claim_backoff_max_ms))
    }
}
