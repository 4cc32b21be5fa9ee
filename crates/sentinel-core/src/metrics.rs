//! Prometheus metrics for gateway observability.
//!
//! All metrics use interior mutability and are safe to share across
//! request handlers. Label values are truncated to a fixed maximum so an
//! attacker cannot inflate the label space through crafted agent ids.

use std::sync::Arc;

use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use thiserror::Error;

/// Maximum length for label values.
pub const MAX_LABEL_VALUE_LEN: usize = 64;

/// Buckets for request latency (seconds).
pub const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0];

/// Buckets for risk scores.
pub const RISK_BUCKETS: &[f64] = &[0.1, 0.3, 0.5, 0.8, 1.0, 1.5, 2.0, 3.0];

/// Errors from metrics registration or encoding.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// A metric failed to register (e.g. duplicate name).
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    /// Text encoding failed.
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// Gateway metrics, registered against a shared registry.
#[derive(Clone)]
pub struct GatewayMetrics {
    /// Requests by agent, action, and emitted decision.
    requests_total: CounterVec,

    /// End-to-end evaluate latency.
    request_latency_seconds: HistogramVec,

    /// Distribution of computed risk scores.
    risk_score: Histogram,

    /// PII detections by entity type.
    pii_detections_total: CounterVec,

    /// Requests rejected by the rate limiter, by agent.
    rate_limited_total: CounterVec,

    /// Number of active policy rules.
    active_policies: Gauge,

    /// Number of approvals currently pending.
    pending_approvals: Gauge,

    /// Rate-limit store failures absorbed by failing open.
    rate_limit_degraded_total: prometheus::Counter,

    /// Audit entries dropped from the degradation buffer.
    audit_dropped_total: prometheus::Counter,

    /// Webhook deliveries that exhausted their retries.
    webhook_failures_total: prometheus::Counter,

    /// PII scans that fell back to the degraded detector.
    sanitizer_degraded_total: prometheus::Counter,
}

impl GatewayMetrics {
    /// Creates the metric families and registers them.
    ///
    /// # Errors
    ///
    /// Returns an error if any metric fails to register.
    pub fn new(registry: &Registry) -> Result<Self, MetricsError> {
        let requests_total = CounterVec::new(
            Opts::new(
                "sentinel_requests_total",
                "Evaluated requests by agent, action, and decision",
            ),
            &["agent_id", "action_type", "decision"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let request_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "sentinel_request_latency_seconds",
                "End-to-end evaluate latency",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["decision"],
        )?;
        registry.register(Box::new(request_latency_seconds.clone()))?;

        let risk_score = Histogram::with_opts(
            HistogramOpts::new("sentinel_risk_score", "Computed risk scores")
                .buckets(RISK_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(risk_score.clone()))?;

        let pii_detections_total = CounterVec::new(
            Opts::new(
                "sentinel_pii_detections_total",
                "PII detections by entity type",
            ),
            &["entity_type"],
        )?;
        registry.register(Box::new(pii_detections_total.clone()))?;

        let rate_limited_total = CounterVec::new(
            Opts::new(
                "sentinel_rate_limited_total",
                "Requests rejected by the rate limiter",
            ),
            &["agent_id"],
        )?;
        registry.register(Box::new(rate_limited_total.clone()))?;

        let active_policies = Gauge::with_opts(Opts::new(
            "sentinel_active_policies",
            "Number of active policy rules",
        ))?;
        registry.register(Box::new(active_policies.clone()))?;

        let pending_approvals = Gauge::with_opts(Opts::new(
            "sentinel_pending_approvals",
            "Approvals currently pending",
        ))?;
        registry.register(Box::new(pending_approvals.clone()))?;

        let rate_limit_degraded_total = prometheus::Counter::with_opts(Opts::new(
            "sentinel_rate_limit_degraded_total",
            "Rate checks that failed open because the counter store was unreachable",
        ))?;
        registry.register(Box::new(rate_limit_degraded_total.clone()))?;

        let audit_dropped_total = prometheus::Counter::with_opts(Opts::new(
            "sentinel_audit_dropped_total",
            "Audit entries dropped from the degradation buffer",
        ))?;
        registry.register(Box::new(audit_dropped_total.clone()))?;

        let webhook_failures_total = prometheus::Counter::with_opts(Opts::new(
            "sentinel_webhook_failures_total",
            "Approval webhook deliveries that exhausted their retries",
        ))?;
        registry.register(Box::new(webhook_failures_total.clone()))?;

        let sanitizer_degraded_total = prometheus::Counter::with_opts(Opts::new(
            "sentinel_sanitizer_degraded_total",
            "PII scans that fell back to the degraded detector",
        ))?;
        registry.register(Box::new(sanitizer_degraded_total.clone()))?;

        Ok(Self {
            requests_total,
            request_latency_seconds,
            risk_score,
            pii_detections_total,
            rate_limited_total,
            active_policies,
            pending_approvals,
            rate_limit_degraded_total,
            audit_dropped_total,
            webhook_failures_total,
            sanitizer_degraded_total,
        })
    }

    /// Creates metrics on a private registry. Handy for tests.
    #[must_use]
    pub fn unregistered() -> Arc<Self> {
        let registry = Registry::new();
        Arc::new(Self::new(&registry).expect("fresh registry accepts all metrics"))
    }

    /// Records one completed evaluation.
    pub fn record_request(
        &self,
        agent_id: &str,
        action_type: &str,
        decision: &str,
        latency_seconds: f64,
        risk_score: f64,
    ) {
        self.requests_total
            .with_label_values(&[truncate(agent_id), truncate(action_type), decision])
            .inc();
        self.request_latency_seconds
            .with_label_values(&[decision])
            .observe(latency_seconds);
        self.risk_score.observe(risk_score);
    }

    /// Records a PII detection.
    pub fn record_pii_detection(&self, entity_type: &str) {
        self.pii_detections_total
            .with_label_values(&[truncate(entity_type)])
            .inc();
    }

    /// Records a rate-limited request.
    pub fn record_rate_limited(&self, agent_id: &str) {
        self.rate_limited_total
            .with_label_values(&[truncate(agent_id)])
            .inc();
    }

    /// Updates the active-policy gauge.
    pub fn set_active_policies(&self, count: usize) {
        #[allow(clippy::cast_precision_loss)]
        self.active_policies.set(count as f64);
    }

    /// An approval entered `PENDING`.
    pub fn approval_opened(&self) {
        self.pending_approvals.inc();
    }

    /// An approval left `PENDING`.
    pub fn approval_closed(&self) {
        self.pending_approvals.dec();
    }

    /// A rate check failed open.
    pub fn record_rate_limit_degraded(&self) {
        self.rate_limit_degraded_total.inc();
    }

    /// An audit entry was dropped.
    pub fn record_audit_drop(&self) {
        self.audit_dropped_total.inc();
    }

    /// A webhook delivery exhausted its retries.
    pub fn record_webhook_failure(&self) {
        self.webhook_failures_total.inc();
    }

    /// A PII scan degraded to the fallback detector.
    pub fn record_sanitizer_degraded(&self) {
        self.sanitizer_degraded_total.inc();
    }
}

/// Encodes a registry in Prometheus text exposition format.
///
/// # Errors
///
/// Returns [`MetricsError::EncodingFailed`] when encoding or UTF-8
/// conversion fails.
pub fn encode_text(registry: &Registry) -> Result<String, MetricsError> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
}

fn truncate(value: &str) -> &str {
    let mut end = value.len().min(MAX_LABEL_VALUE_LEN);
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_and_encode() {
        let registry = Registry::new();
        let metrics = GatewayMetrics::new(&registry).unwrap();

        metrics.record_request("support-bot", "refund", "deny", 0.012, 1.0);
        metrics.record_pii_detection("SSN");
        metrics.set_active_policies(6);
        metrics.approval_opened();

        let text = encode_text(&registry).unwrap();
        assert!(text.contains("sentinel_requests_total"));
        assert!(text.contains("sentinel_pii_detections_total"));
        assert!(text.contains("sentinel_active_policies 6"));
        assert!(text.contains("sentinel_pending_approvals 1"));
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = Registry::new();
        GatewayMetrics::new(&registry).unwrap();
        assert!(GatewayMetrics::new(&registry).is_err());
    }

    #[test]
    fn test_label_values_are_truncated() {
        let registry = Registry::new();
        let metrics = GatewayMetrics::new(&registry).unwrap();
        let long_agent = "a".repeat(500);
        metrics.record_request(&long_agent, "refund", "allow", 0.001, 0.0);

        let text = encode_text(&registry).unwrap();
        assert!(!text.contains(&long_agent));
        assert!(text.contains(&"a".repeat(MAX_LABEL_VALUE_LEN)));
    }

    #[test]
    fn test_pending_gauge_balances() {
        let registry = Registry::new();
        let metrics = GatewayMetrics::new(&registry).unwrap();
        metrics.approval_opened();
        metrics.approval_opened();
        metrics.approval_closed();

        let text = encode_text(&registry).unwrap();
        assert!(text.contains("sentinel_pending_approvals 1"));
    }
}
