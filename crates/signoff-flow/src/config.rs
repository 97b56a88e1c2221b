//! Runtime configuration for the orchestration kernel.
//!
//! Loaded from the environment at startup; every knob has a default so
//! tests construct configs without touching the process environment.

use std::time::Duration;

use signoff_core::signing::SigningConfig;

use crate::error::{Error, Result};

/// Event bus tuning.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Capacity of the bounded publish queue. Publishers block when full.
    pub queue_size: usize,
    /// Total delivery attempts per subscriber before dead-lettering.
    pub max_attempts: u32,
    /// Delay before the first redelivery.
    pub backoff_initial: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_multiplier: f64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_size: 1000,
            max_attempts: 3,
            backoff_initial: Duration::from_millis(100),
            backoff_multiplier: 2.0,
        }
    }
}

/// Timeout manager tuning.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// How often the scanner wakes.
    pub scan_interval: Duration,
    /// Maximum expired approvals processed per tick.
    pub scan_batch_size: usize,
    /// Whether `FAILED` workflows are retried by the scanner. `TIMEOUT`
    /// workflows are always retried while budget remains.
    pub retry_failed_workflows: bool,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(10),
            scan_batch_size: 100,
            retry_failed_workflows: true,
        }
    }
}

/// Workflow retry backoff policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Multiplier applied per consumed retry.
    pub multiplier: f64,
    /// Upper bound on the computed delay.
    pub max: Duration,
}

impl RetryPolicy {
    /// Computes the backoff delay for the given retry count, without
    /// jitter.
    #[must_use]
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = self.multiplier.powi(i32::try_from(retry_count).unwrap_or(i32::MAX));
        let secs = self.initial.as_secs_f64() * factor;
        Duration::from_secs_f64(secs.min(self.max.as_secs_f64()))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            max: Duration::from_secs(60),
        }
    }
}

/// Top-level kernel configuration.
#[derive(Debug, Clone, Default)]
pub struct FlowConfig {
    /// Callback-token signing. Unconfigured means every token and inbound
    /// signature verification fails closed.
    pub signing: SigningConfig,
    /// Relational store connection string (Postgres). Unused by the
    /// in-memory store.
    pub database_url: Option<String>,
    /// Approval expiry applied when a request does not carry one.
    pub default_approval_timeout: DurationSecs,
    /// Retry budget applied to new workflows.
    pub default_max_retries: u32,
    /// Event bus tuning.
    pub bus: BusConfig,
    /// Timeout manager tuning.
    pub timeout: TimeoutConfig,
    /// Workflow retry backoff.
    pub retry: RetryPolicy,
}

/// Seconds-granularity duration wrapper with a sensible default.
#[derive(Debug, Clone, Copy)]
pub struct DurationSecs(
    /// Whole seconds.
    pub u64,
);

impl DurationSecs {
    /// Returns the wrapped value as a `Duration`.
    #[must_use]
    pub const fn as_duration(self) -> Duration {
        Duration::from_secs(self.0)
    }
}

impl Default for DurationSecs {
    fn default() -> Self {
        Self(3600)
    }
}

impl FlowConfig {
    /// Loads configuration from the environment.
    ///
    /// Recognized variables: `SIGNING_KEY`, `DATABASE_URL`,
    /// `TIMEOUT_SCAN_INTERVAL_SECONDS`, `TIMEOUT_SCAN_BATCH_SIZE`,
    /// `EVENT_BUS_QUEUE_SIZE`, `EVENT_BUS_MAX_RETRIES`,
    /// `EVENT_BUS_BACKOFF_INITIAL` (milliseconds),
    /// `EVENT_BUS_BACKOFF_MULTIPLIER`, `DEFAULT_APPROVAL_TIMEOUT_SECONDS`,
    /// `DEFAULT_MAX_RETRIES`, `RETRY_BACKOFF_INITIAL_SECONDS`,
    /// `RETRY_BACKOFF_MULTIPLIER`, `RETRY_BACKOFF_MAX_SECONDS`,
    /// `RETRY_FAILED_WORKFLOWS`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when a variable is present but
    /// unparseable.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            signing: SigningConfig::from_env(),
            database_url: optional_env("DATABASE_URL"),
            default_approval_timeout: DurationSecs(parse_env(
                "DEFAULT_APPROVAL_TIMEOUT_SECONDS",
                defaults.default_approval_timeout.0,
            )?),
            default_max_retries: parse_env("DEFAULT_MAX_RETRIES", defaults.default_max_retries)?,
            bus: BusConfig {
                queue_size: parse_env("EVENT_BUS_QUEUE_SIZE", defaults.bus.queue_size)?,
                max_attempts: parse_env("EVENT_BUS_MAX_RETRIES", defaults.bus.max_attempts)?,
                backoff_initial: Duration::from_millis(parse_env(
                    "EVENT_BUS_BACKOFF_INITIAL",
                    u64::try_from(defaults.bus.backoff_initial.as_millis())
                        .unwrap_or(u64::MAX),
                )?),
                backoff_multiplier: parse_env(
                    "EVENT_BUS_BACKOFF_MULTIPLIER",
                    defaults.bus.backoff_multiplier,
                )?,
            },
            timeout: TimeoutConfig {
                scan_interval: Duration::from_secs(parse_env(
                    "TIMEOUT_SCAN_INTERVAL_SECONDS",
                    defaults.timeout.scan_interval.as_secs(),
                )?),
                scan_batch_size: parse_env(
                    "TIMEOUT_SCAN_BATCH_SIZE",
                    defaults.timeout.scan_batch_size,
                )?,
                retry_failed_workflows: parse_bool_env(
                    "RETRY_FAILED_WORKFLOWS",
                    defaults.timeout.retry_failed_workflows,
                ),
            },
            retry: RetryPolicy {
                initial: Duration::from_secs_f64(parse_env(
                    "RETRY_BACKOFF_INITIAL_SECONDS",
                    defaults.retry.initial.as_secs_f64(),
                )?),
                multiplier: parse_env("RETRY_BACKOFF_MULTIPLIER", defaults.retry.multiplier)?,
                max: Duration::from_secs_f64(parse_env(
                    "RETRY_BACKOFF_MAX_SECONDS",
                    defaults.retry.max.as_secs_f64(),
                )?),
            },
        })
    }
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .map_err(|_| Error::configuration(format!("invalid {key}: '{value}'"))),
        Err(_) => Ok(default),
    }
}

fn parse_bool_env(key: &str, default: bool) -> bool {
    std::env::var(key).map_or(default, |value| value.eq_ignore_ascii_case("true"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_grows_exponentially_and_caps() {
        let policy = RetryPolicy {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            max: Duration::from_secs(5),
        };

        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(5));
        assert_eq!(policy.delay_for(10), Duration::from_secs(5));
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = FlowConfig::default();
        assert_eq!(config.default_approval_timeout.0, 3600);
        assert_eq!(config.bus.queue_size, 1000);
        assert_eq!(config.bus.max_attempts, 3);
        assert_eq!(config.timeout.scan_interval, Duration::from_secs(10));
        assert!(config.timeout.retry_failed_workflows);
        assert!(!config.signing.is_configured());
    }
}
