//! Environment-derived gateway configuration.
//!
//! All keys are read with the `SENTINEL_` prefix (`SENTINEL_MODE`,
//! `SENTINEL_BLOCK_THRESHOLD`, ...). Invalid values are a startup error,
//! never a silent default: a gateway that boots with a misread threshold is
//! worse than one that refuses to boot.

use std::time::Duration;

use thiserror::Error;

use crate::mode::GatewayMode;

/// Prefix for all recognized environment variables.
pub const ENV_PREFIX: &str = "SENTINEL_";

/// Errors produced while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A variable was present but could not be parsed.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// Full environment variable name.
        key: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// The block threshold must stay strictly above the approval threshold.
    #[error(
        "BLOCK_THRESHOLD ({block}) must be greater than APPROVAL_THRESHOLD ({approval})"
    )]
    ThresholdOrder {
        /// Configured approval threshold.
        approval: f64,
        /// Configured block threshold.
        block: f64,
    },
}

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Initial operating mode.
    pub mode: GatewayMode,
    /// Risk score at or above which a request goes to human approval.
    pub approval_threshold: f64,
    /// Risk score at or above which a request is denied.
    pub block_threshold: f64,
    /// Default per-agent request budget per window.
    pub rate_limit_requests: u32,
    /// Rate window length in seconds.
    pub rate_limit_window_seconds: u64,
    /// Approval webhook target. `None` disables webhook delivery.
    pub approval_webhook_url: Option<String>,
    /// Lifetime of a pending approval before it expires.
    pub approval_expiry_seconds: u64,
    /// Connection string for the counter/cache store, when external.
    pub counter_store_url: Option<String>,
    /// Connection string (path) for the relational audit store.
    pub audit_store_url: Option<String>,
    /// Interval of the background policy snapshot refresh.
    pub policy_refresh_seconds: u64,
    /// Budget for a single PII scan before degrading to the fallback
    /// detector.
    pub pii_scan_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: GatewayMode::Enforce,
            approval_threshold: 0.8,
            block_threshold: 1.0,
            rate_limit_requests: 1000,
            rate_limit_window_seconds: 60,
            approval_webhook_url: None,
            approval_expiry_seconds: 86_400,
            counter_store_url: None,
            audit_store_url: None,
            policy_refresh_seconds: 300,
            pii_scan_timeout: Duration::from_millis(500),
        }
    }
}

impl Config {
    /// Loads configuration from `SENTINEL_*` environment variables,
    /// falling back to defaults for absent keys.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for any present-but-invalid value, and for
    /// threshold orderings that would make the decision table degenerate.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(raw) = read("MODE") {
            config.mode = raw
                .parse()
                .map_err(|err: crate::mode::InvalidMode| invalid("MODE", err.to_string()))?;
        }
        if let Some(raw) = read("APPROVAL_THRESHOLD") {
            config.approval_threshold = parse_unit_interval("APPROVAL_THRESHOLD", &raw)?;
        }
        if let Some(raw) = read("BLOCK_THRESHOLD") {
            config.block_threshold = parse_unit_interval("BLOCK_THRESHOLD", &raw)?;
        }
        if let Some(raw) = read("RATE_LIMIT_REQUESTS") {
            config.rate_limit_requests = parse_positive("RATE_LIMIT_REQUESTS", &raw)?;
        }
        if let Some(raw) = read("RATE_LIMIT_WINDOW_SECONDS") {
            config.rate_limit_window_seconds = parse_positive("RATE_LIMIT_WINDOW_SECONDS", &raw)?;
        }
        if let Some(raw) = read("APPROVAL_WEBHOOK_URL") {
            // An empty value explicitly disables webhook delivery.
            config.approval_webhook_url = if raw.trim().is_empty() { None } else { Some(raw) };
        }
        if let Some(raw) = read("APPROVAL_EXPIRY_SECONDS") {
            config.approval_expiry_seconds = parse_positive("APPROVAL_EXPIRY_SECONDS", &raw)?;
        }
        if let Some(raw) = read("COUNTER_STORE_URL") {
            config.counter_store_url = Some(raw);
        }
        if let Some(raw) = read("AUDIT_STORE_URL") {
            config.audit_store_url = Some(raw);
        }
        if let Some(raw) = read("POLICY_REFRESH_SECONDS") {
            config.policy_refresh_seconds = parse_positive("POLICY_REFRESH_SECONDS", &raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field invariants.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ThresholdOrder`] when the block threshold does
    /// not exceed the approval threshold.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_threshold <= self.approval_threshold {
            return Err(ConfigError::ThresholdOrder {
                approval: self.approval_threshold,
                block: self.block_threshold,
            });
        }
        Ok(())
    }

    /// The rate window as a [`Duration`].
    #[must_use]
    pub const fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_seconds)
    }

    /// The approval lifetime as a [`Duration`].
    #[must_use]
    pub const fn approval_expiry(&self) -> Duration {
        Duration::from_secs(self.approval_expiry_seconds)
    }
}

fn read(key: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{key}")).ok()
}

fn invalid(key: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: format!("{ENV_PREFIX}{key}"),
        reason: reason.into(),
    }
}

fn parse_unit_interval(key: &str, raw: &str) -> Result<f64, ConfigError> {
    let value: f64 = raw
        .parse()
        .map_err(|_| invalid(key, format!("{raw:?} is not a number")))?;
    if !(0.0..=1.0).contains(&value) {
        return Err(invalid(key, format!("{value} is outside [0, 1]")));
    }
    Ok(value)
}

fn parse_positive<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + From<u8>,
{
    let value: T = raw
        .parse()
        .map_err(|_| invalid(key, format!("{raw:?} is not a positive integer")))?;
    if value < T::from(1u8) {
        return Err(invalid(key, "must be positive"));
    }
    Ok(value)
}
