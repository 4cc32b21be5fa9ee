//! Shared application state for the HTTP surface.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use prometheus::Registry;
use rusqlite::Connection;
use sentinel_core::approval::ApprovalCoordinator;
use sentinel_core::audit::AuditWriter;
use sentinel_core::auth::KeyStore;
use sentinel_core::config::Config;
use sentinel_core::decision::Thresholds;
use sentinel_core::forward::ForwardSink;
use sentinel_core::gateway::Gateway;
use sentinel_core::metrics::GatewayMetrics;
use sentinel_core::mode::ModeController;
use sentinel_core::pii::{RegexDetector, Sanitizer};
use sentinel_core::policy::PolicyStore;
use sentinel_core::ratelimit::{RateLimitConfig, RateLimiter};
use sentinel_core::store::{MemoryStore, SharedStore};
use tracing::{info, warn};

/// Everything the handlers share. Cheap to clone; all components are
/// `Arc`-wrapped.
#[derive(Clone)]
pub struct AppState {
    /// The evaluation pipeline.
    pub gateway: Arc<Gateway>,
    /// API key resolution.
    pub keys: Arc<KeyStore>,
    /// Per-agent rate limiting.
    pub limiter: Arc<RateLimiter>,
    /// Rule CRUD and snapshot.
    pub policies: Arc<PolicyStore>,
    /// Approval lifecycle.
    pub approvals: Arc<ApprovalCoordinator>,
    /// Process-wide mode.
    pub mode: Arc<ModeController>,
    /// Audit trail.
    pub audit: Arc<AuditWriter>,
    /// Shared counter/cache store.
    pub shared: Arc<dyn SharedStore>,
    /// Metric recording.
    pub metrics: Arc<GatewayMetrics>,
    /// Registry backing `/metrics`.
    pub registry: Arc<Registry>,
    /// Process start, for uptime reporting.
    pub started_at: Instant,
}

impl AppState {
    /// Wires every component from configuration.
    ///
    /// `sink` is the pluggable target-system transport; `keys` the key
    /// population (the daemon seeds the demo agents, tests inject their
    /// own).
    pub fn build(
        config: &Config,
        sink: Arc<dyn ForwardSink>,
        keys: Arc<KeyStore>,
    ) -> anyhow::Result<Self> {
        let conn = match &config.audit_store_url {
            Some(path) => {
                Connection::open(path).with_context(|| format!("opening audit store {path}"))?
            }
            None => {
                warn!("no audit store configured; using in-memory database");
                Connection::open_in_memory().context("opening in-memory audit store")?
            }
        };
        let conn = Arc::new(Mutex::new(conn));

        if config.counter_store_url.is_some() {
            info!("external counter store configured; this build serves it from process memory");
        }
        let shared: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());

        let registry = Arc::new(Registry::new());
        let metrics = Arc::new(
            GatewayMetrics::new(&registry).context("registering gateway metrics")?,
        );

        let policies = Arc::new(PolicyStore::open(conn.clone()).context("opening policy store")?);
        policies.seed_defaults().context("seeding default rules")?;
        metrics.set_active_policies(policies.snapshot().len());

        let audit = Arc::new(
            AuditWriter::open(conn.clone())
                .context("opening audit writer")?
                .with_metrics(metrics.clone()),
        );

        let mode = Arc::new(ModeController::new(config.mode, Some(shared.clone())));

        let approvals = Arc::new(
            ApprovalCoordinator::open(
                conn,
                config.approval_webhook_url.clone(),
                config.approval_expiry(),
                audit.clone(),
                sink.clone(),
                mode.clone(),
                metrics.clone(),
            )
            .context("opening approval coordinator")?,
        );

        let limiter = Arc::new(RateLimiter::new(
            RateLimitConfig {
                max_requests: config.rate_limit_requests,
                window_secs: config.rate_limit_window_seconds,
            },
            shared.clone(),
        ));

        let sanitizer = Arc::new(Sanitizer::new(
            Arc::new(RegexDetector::new()),
            config.pii_scan_timeout,
        ));

        let gateway = Arc::new(Gateway::new(
            policies.clone(),
            sanitizer,
            mode.clone(),
            Thresholds {
                approval: config.approval_threshold,
                block: config.block_threshold,
            },
            approvals.clone(),
            audit.clone(),
            sink,
            metrics.clone(),
        ));

        Ok(Self {
            gateway,
            keys,
            limiter,
            policies,
            approvals,
            mode,
            audit,
            shared,
            metrics,
            registry,
            started_at: Instant::now(),
        })
    }

    /// Spawns the periodic policy refresh and the approval expiry sweeper.
    pub fn spawn_background_tasks(&self, config: &Config) {
        let policies = self.policies.clone();
        let refresh_every = Duration::from_secs(config.policy_refresh_seconds.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(refresh_every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; the snapshot is already
            // fresh at startup.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = policies.refresh() {
                    warn!(error = %err, "periodic policy refresh failed");
                }
            }
        });

        let approvals = self.approvals.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = approvals.sweep_expired(chrono::Utc::now()).await {
                    warn!(error = %err, "approval expiry sweep failed");
                }
            }
        });
    }
}
