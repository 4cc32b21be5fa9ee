//! Per-agent fixed-window rate limiting over the shared counter store.
//!
//! Each request increments the counter for the current window key
//! `rate:{agent_id}:{window_start}`; the increment is atomic in the store,
//! so concurrent gateway instances share one budget.
//!
//! When the store is unreachable the limiter **fails open**: the request is
//! allowed and a degradation event is recorded. Denying legitimate traffic
//! on an infrastructure blip is worse than briefly exceeding a soft budget.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tracing::warn;

use crate::auth::AgentIdentity;
use crate::store::{SharedStore, StoreError};

/// Deadline for one counter-store round trip. A store slower than this is
/// treated as unreachable.
pub const RATE_CHECK_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(200);

/// Limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Default request budget per window.
    pub max_requests: u32,
    /// Window length in seconds.
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 1000,
            window_secs: 60,
        }
    }
}

/// Outcome of a rate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Budget left in the current window.
    pub remaining: u32,
    /// When the current window resets.
    pub reset_at: DateTime<Utc>,
    /// True when the store was unreachable and the limiter failed open.
    pub degraded: bool,
}

/// Fixed-window limiter keyed by agent.
pub struct RateLimiter {
    config: RateLimitConfig,
    store: Arc<dyn SharedStore>,
    store_failures: AtomicU64,
}

impl RateLimiter {
    /// Creates a limiter over the given store.
    #[must_use]
    pub fn new(config: RateLimitConfig, store: Arc<dyn SharedStore>) -> Self {
        Self {
            config,
            store,
            store_failures: AtomicU64::new(0),
        }
    }

    /// Checks and consumes one request from the agent's budget.
    ///
    /// The identity's `rate_limit_override` takes precedence over the
    /// configured default. Store failures fail open and are counted.
    pub async fn check(&self, identity: &AgentIdentity, now: DateTime<Utc>) -> RateDecision {
        let limit = identity
            .rate_limit_override
            .unwrap_or(self.config.max_requests);
        let window = self.config.window_secs as i64;
        let window_start = now.timestamp().div_euclid(window) * window;
        let reset_at = Utc
            .timestamp_opt(window_start + window, 0)
            .single()
            .unwrap_or(now);

        let key = format!("rate:{}:{}", identity.agent_id, window_start);
        let increment = tokio::time::timeout(
            RATE_CHECK_TIMEOUT,
            self.store.incr(&key, self.config_window()),
        )
        .await
        .unwrap_or_else(|_| Err(StoreError::Unavailable("rate check deadline exceeded".into())));
        match increment {
            Ok(count) => {
                let used = u32::try_from(count).unwrap_or(u32::MAX);
                RateDecision {
                    allowed: used <= limit,
                    remaining: limit.saturating_sub(used),
                    reset_at,
                    degraded: false,
                }
            }
            Err(err) => {
                self.store_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    agent_id = %identity.agent_id,
                    error = %err,
                    "rate counter store unreachable; failing open"
                );
                RateDecision {
                    allowed: true,
                    remaining: limit,
                    reset_at,
                    degraded: true,
                }
            }
        }
    }

    /// Current-window usage without consuming budget.
    pub async fn info(&self, identity: &AgentIdentity, now: DateTime<Utc>) -> RateWindowInfo {
        let limit = identity
            .rate_limit_override
            .unwrap_or(self.config.max_requests);
        let window = self.config.window_secs as i64;
        let window_start = now.timestamp().div_euclid(window) * window;
        let key = format!("rate:{}:{}", identity.agent_id, window_start);

        let used = match self.store.get(&key).await {
            Ok(value) => value.and_then(|v| v.parse::<u32>().ok()).unwrap_or(0),
            Err(_) => 0,
        };
        RateWindowInfo {
            agent_id: identity.agent_id.clone(),
            current_requests: used,
            limit,
            remaining: limit.saturating_sub(used),
            reset_in_seconds: u64::try_from(window_start + window - now.timestamp()).unwrap_or(0),
            window_seconds: self.config.window_secs,
        }
    }

    /// The budget in effect for an identity (override or default).
    #[must_use]
    pub fn limit_for(&self, identity: &AgentIdentity) -> u32 {
        identity
            .rate_limit_override
            .unwrap_or(self.config.max_requests)
    }

    /// Number of store failures absorbed by failing open.
    #[must_use]
    pub fn store_failures(&self) -> u64 {
        self.store_failures.load(Ordering::Relaxed)
    }

    /// The configured window length.
    #[must_use]
    pub const fn window_secs(&self) -> u64 {
        self.config.window_secs
    }

    fn config_window(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.config.window_secs)
    }
}

/// Snapshot of an agent's current rate window, for the info endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RateWindowInfo {
    /// Agent the window belongs to.
    pub agent_id: String,
    /// Requests consumed so far in this window.
    pub current_requests: u32,
    /// Window budget.
    pub limit: u32,
    /// Budget left.
    pub remaining: u32,
    /// Seconds until the window resets.
    pub reset_in_seconds: u64,
    /// Window length.
    pub window_seconds: u64,
}
