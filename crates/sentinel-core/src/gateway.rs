//! The request-evaluation pipeline.
//!
//! One linear pass per request: sanitize → evaluate → decide → escalate →
//! forward → audit. Stages share no mutable state across requests except
//! through the policy snapshot (read-only), the approval store, and the
//! audit writer.
//!
//! # Ordering
//!
//! The audit entry is durable (or enqueued in the degradation buffer)
//! before [`Gateway::evaluate`] returns; callers respond to the agent only
//! after the trail has the decision.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::approval::ApprovalCoordinator;
use crate::audit::{AuditEntry, AuditWriter};
use crate::decision::{apply_mode, Decision, ModedDecision, RiskLevel, Thresholds};
use crate::error::GatewayError;
use crate::forward::ForwardSink;
use crate::metrics::GatewayMetrics;
use crate::mode::{GatewayMode, ModeController};
use crate::pii::{PiiFinding, Sanitizer};
use crate::policy::PolicyStore;
use crate::request::AgentRequest;
use crate::risk;

/// Everything the serving layer needs to answer one evaluate call.
#[derive(Debug, Clone)]
pub struct EvaluateOutcome {
    /// Server-assigned request id.
    pub request_id: Uuid,
    /// The decision returned to the caller.
    pub decision: Decision,
    /// The true decision, when observe mode rewrote it.
    pub observed_decision: Option<Decision>,
    /// Mode in effect.
    pub mode: GatewayMode,
    /// Human-readable summary of the decision.
    pub message: String,
    /// Computed risk score (sum of matched modifiers).
    pub risk_score: f64,
    /// Derived risk level.
    pub risk_level: RiskLevel,
    /// Matched rule ids, highest priority first.
    pub matched_policies: Vec<String>,
    /// Approval raised for pending decisions.
    pub approval_id: Option<Uuid>,
    /// Whether the action was forwarded to the target system.
    pub forwarded: bool,
    /// Digest of the target response, when one was received.
    pub target_response_digest: Option<String>,
    /// PII findings from the sanitization stage.
    pub pii_findings: Vec<PiiFinding>,
    /// True when the PII scan ran degraded.
    pub low_confidence_pii: bool,
}

/// The assembled pipeline.
pub struct Gateway {
    policies: Arc<PolicyStore>,
    sanitizer: Arc<Sanitizer>,
    mode: Arc<ModeController>,
    thresholds: Thresholds,
    approvals: Arc<ApprovalCoordinator>,
    audit: Arc<AuditWriter>,
    sink: Arc<dyn ForwardSink>,
    metrics: Arc<GatewayMetrics>,
}

impl Gateway {
    /// Assembles the pipeline from its stages.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        policies: Arc<PolicyStore>,
        sanitizer: Arc<Sanitizer>,
        mode: Arc<ModeController>,
        thresholds: Thresholds,
        approvals: Arc<ApprovalCoordinator>,
        audit: Arc<AuditWriter>,
        sink: Arc<dyn ForwardSink>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            policies,
            sanitizer,
            mode,
            thresholds,
            approvals,
            audit,
            sink,
            metrics,
        }
    }

    /// The mode controller, for the mode endpoints.
    #[must_use]
    pub fn mode(&self) -> &Arc<ModeController> {
        &self.mode
    }

    /// Runs one request through the pipeline.
    ///
    /// # Errors
    ///
    /// Only unexpected failures (e.g. the approval store refusing a write)
    /// surface as errors; policy-store degradation fails closed into a
    /// regular deny outcome instead.
    pub async fn evaluate(&self, request: AgentRequest) -> Result<EvaluateOutcome, GatewayError> {
        let started = Instant::now();
        let now = Utc::now();

        // 1. Sanitize parameters and context. The masked copy is the only
        //    one that reaches the audit trail or leaves the process.
        let sanitized_params = self.sanitizer.sanitize(&request.parameters).await;
        let sanitized_context = self.sanitizer.sanitize(&request.context).await;
        let low_confidence_pii = sanitized_params.low_confidence || sanitized_context.low_confidence;
        if low_confidence_pii {
            self.metrics.record_sanitizer_degraded();
        }
        let mut pii_findings = sanitized_params.findings;
        pii_findings.extend(sanitized_context.findings);
        for finding in &pii_findings {
            self.metrics.record_pii_detection(&finding.entity_type);
        }

        // 2. Take the rule snapshot. With no snapshot and an unhealthy
        //    store there is nothing to evaluate against: fail closed.
        let snapshot = self.policies.snapshot();
        let fail_closed = snapshot.is_empty() && !self.policies.is_healthy();

        // 3. Assess risk (pure function of request, snapshot, now).
        let assessment = risk::assess(&request, &snapshot, now);

        // 4. Map to a decision and apply the circuit-breaker mode.
        let raw = if fail_closed {
            Decision::Deny
        } else {
            self.thresholds.decide(assessment.risk_score)
        };
        let moded = apply_mode(raw, self.mode.current());

        // 5. Escalate pending decisions to the approval coordinator.
        let approval = if moded.emitted == Decision::Pending {
            let record = self
                .approvals
                .request_approval(
                    &request,
                    sanitized_params.value.clone(),
                    sanitized_context.value.clone(),
                    assessment.risk_score,
                    assessment.matched_rule_ids(),
                )
                .map_err(GatewayError::internal)?;
            Some(record.approval_id)
        } else {
            None
        };

        // 6. Forward allowed actions. The original parameters take this
        //    path; nothing else does.
        let (forwarded, digest) = if moded.emitted == Decision::Allow {
            match self.sink.forward(&request).await {
                Ok(receipt) => (true, receipt.response_digest),
                Err(err) => {
                    warn!(request_id = %request.request_id, error = %err, "forward sink failed");
                    (false, None)
                }
            }
        } else {
            (false, None)
        };

        // 7. Compose the caller-facing message.
        let reason = if fail_closed {
            Some("policy store unavailable and no rule snapshot exists".to_string())
        } else {
            assessment.reason().map(str::to_string)
        };
        let message = build_message(&moded, approval, reason.as_deref());

        // 8. Audit the true decision before anything is returned.
        self.audit.append(AuditEntry {
            request_id: request.request_id,
            agent_id: request.agent_id.clone(),
            action_type: request.action_type,
            target_resource: request.target_resource.clone(),
            sanitized_parameters: sanitized_params.value,
            decision: moded.audited(),
            risk_score: assessment.risk_score,
            matched_rules: assessment.matched_rule_ids(),
            mode_in_effect: moded.mode,
            approval_id: approval,
            forwarded,
            target_response_digest: digest.clone(),
            ts: now,
        });

        // 9. Record metrics.
        self.metrics.record_request(
            &request.agent_id,
            request.action_type.as_str(),
            moded.emitted.as_str(),
            started.elapsed().as_secs_f64(),
            assessment.risk_score,
        );
        self.metrics.set_active_policies(snapshot.len());

        info!(
            request_id = %request.request_id,
            agent_id = %request.agent_id,
            action_type = %request.action_type,
            decision = %moded.emitted,
            observed = ?moded.observed.map(Decision::as_str),
            risk_score = assessment.risk_score,
            matched = assessment.matched.len(),
            "request evaluated"
        );

        Ok(EvaluateOutcome {
            request_id: request.request_id,
            decision: moded.emitted,
            observed_decision: moded.observed,
            mode: moded.mode,
            message,
            risk_score: assessment.risk_score,
            risk_level: RiskLevel::from_score(assessment.risk_score),
            matched_policies: assessment.matched_rule_ids(),
            approval_id: approval,
            forwarded,
            target_response_digest: digest,
            pii_findings,
            low_confidence_pii,
        })
    }
}

fn build_message(moded: &ModedDecision, approval: Option<Uuid>, reason: Option<&str>) -> String {
    match (moded.emitted, moded.observed) {
        (Decision::Allow, None) => "Request approved".to_string(),
        (Decision::Allow, Some(Decision::Deny)) => {
            "Request approved (observe mode - would be denied in enforce mode)".to_string()
        }
        (Decision::Allow, Some(_)) => {
            "Request approved (observe mode - would require approval in enforce mode)".to_string()
        }
        (Decision::Deny, _) => match reason {
            Some(reason) => format!("Request denied: {reason}"),
            None => "Request denied by policy".to_string(),
        },
        (Decision::Pending, _) => match approval {
            Some(id) => format!("Request requires human approval. Approval ID: {id}"),
            None => "Request requires human approval".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use rusqlite::Connection;
    use serde_json::{json, Map};

    use super::*;
    use crate::forward::RecordingSink;
    use crate::pii::RegexDetector;
    use crate::request::ActionType;

    struct Fixture {
        gateway: Gateway,
        audit: Arc<AuditWriter>,
        sink: Arc<RecordingSink>,
        approvals: Arc<ApprovalCoordinator>,
        mode: Arc<ModeController>,
    }

    fn fixture(initial_mode: GatewayMode) -> Fixture {
        let conn = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        let metrics = GatewayMetrics::unregistered();
        let policies = Arc::new(PolicyStore::open(conn.clone()).unwrap());
        policies.seed_defaults().unwrap();
        let audit = Arc::new(AuditWriter::open(conn.clone()).unwrap());
        let sink = Arc::new(RecordingSink::new());
        let mode = Arc::new(ModeController::new(initial_mode, None));
        let approvals = Arc::new(
            ApprovalCoordinator::open(
                conn,
                None,
                Duration::from_secs(86_400),
                audit.clone(),
                sink.clone() as Arc<dyn ForwardSink>,
                mode.clone(),
                metrics.clone(),
            )
            .unwrap(),
        );
        let sanitizer = Arc::new(Sanitizer::new(
            Arc::new(RegexDetector::new()),
            Duration::from_millis(500),
        ));
        let gateway = Gateway::new(
            policies,
            sanitizer,
            mode.clone(),
            Thresholds::default(),
            approvals.clone(),
            audit.clone(),
            sink.clone() as Arc<dyn ForwardSink>,
            metrics,
        );
        Fixture {
            gateway,
            audit,
            sink,
            approvals,
            mode,
        }
    }

    fn request(action: ActionType, parameters: serde_json::Value) -> AgentRequest {
        AgentRequest::new(
            "support-bot",
            action,
            "payments/refund",
            parameters.as_object().cloned().unwrap_or_default(),
            Map::new(),
        )
    }

    fn audit_entries(fixture: &Fixture) -> Vec<crate::audit::AuditEntry> {
        fixture
            .audit
            .query(&crate::audit::AuditQuery::default())
            .unwrap()
    }

    #[tokio::test]
    async fn test_small_refund_is_allowed_and_forwarded() {
        let fixture = fixture(GatewayMode::Enforce);
        let outcome = fixture
            .gateway
            .evaluate(request(ActionType::Refund, json!({"amount": 100})))
            .await
            .unwrap();

        assert_eq!(outcome.decision, Decision::Allow);
        assert!(matches!(outcome.risk_level, RiskLevel::Low | RiskLevel::Medium));
        assert!(outcome.forwarded);
        assert!(outcome.target_response_digest.is_some());
        assert_eq!(fixture.sink.forwarded().len(), 1);

        let entries = audit_entries(&fixture);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].decision, Decision::Allow);
    }

    #[tokio::test]
    async fn test_large_refund_is_denied() {
        let fixture = fixture(GatewayMode::Enforce);
        let outcome = fixture
            .gateway
            .evaluate(request(ActionType::Refund, json!({"amount": 750})))
            .await
            .unwrap();

        assert_eq!(outcome.decision, Decision::Deny);
        assert!(outcome
            .matched_policies
            .contains(&"refund_limit_500".to_string()));
        assert!(outcome.risk_score >= 1.0);
        assert!(!outcome.forwarded);
        assert!(fixture.sink.forwarded().is_empty());
        assert!(outcome.message.contains("denied"));
    }

    #[tokio::test]
    async fn test_large_payment_goes_pending_with_approval() {
        let fixture = fixture(GatewayMode::Enforce);
        let outcome = fixture
            .gateway
            .evaluate(request(ActionType::Payment, json!({"amount": 15000})))
            .await
            .unwrap();

        assert_eq!(outcome.decision, Decision::Pending);
        let approval_id = outcome.approval_id.expect("pending raises an approval");
        assert!(!outcome.forwarded);

        let record = fixture.approvals.status(approval_id).unwrap();
        assert_eq!(record.state, crate::approval::ApprovalState::Pending);
        assert_eq!(record.request_id, outcome.request_id);
    }

    #[tokio::test]
    async fn test_pii_is_masked_in_audit_trail() {
        let fixture = fixture(GatewayMode::Enforce);
        fixture
            .gateway
            .evaluate(request(
                ActionType::ApiCall,
                json!({"ssn": "123-45-6789", "email": "a@b.com"}),
            ))
            .await
            .unwrap();

        let entries = audit_entries(&fixture);
        assert_eq!(entries.len(), 1);
        let audited = serde_json::to_string(&entries[0].sanitized_parameters).unwrap();
        assert!(audited.contains("<SSN>"));
        assert!(audited.contains("<EMAIL>"));
        assert!(!audited.contains("123-45-6789"));
        assert!(!audited.contains("a@b.com"));
    }

    #[tokio::test]
    async fn test_observe_mode_rewrites_deny_but_audits_truth() {
        let fixture = fixture(GatewayMode::Observe);
        let outcome = fixture
            .gateway
            .evaluate(request(ActionType::Refund, json!({"amount": 750})))
            .await
            .unwrap();

        assert_eq!(outcome.decision, Decision::Allow);
        assert_eq!(outcome.observed_decision, Some(Decision::Deny));
        assert!(outcome.forwarded);
        assert!(outcome.message.contains("observe mode"));

        let entries = audit_entries(&fixture);
        assert_eq!(entries[0].decision, Decision::Deny);
        assert_eq!(entries[0].mode_in_effect, GatewayMode::Observe);
    }

    #[tokio::test]
    async fn test_observe_mode_never_raises_approvals() {
        let fixture = fixture(GatewayMode::Observe);
        let outcome = fixture
            .gateway
            .evaluate(request(ActionType::Payment, json!({"amount": 15000})))
            .await
            .unwrap();

        assert_eq!(outcome.decision, Decision::Allow);
        assert_eq!(outcome.observed_decision, Some(Decision::Pending));
        assert!(outcome.approval_id.is_none());
        assert_eq!(fixture.approvals.pending_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mode_switch_takes_effect_immediately() {
        let fixture = fixture(GatewayMode::Enforce);
        let denied = fixture
            .gateway
            .evaluate(request(ActionType::Refund, json!({"amount": 750})))
            .await
            .unwrap();
        assert_eq!(denied.decision, Decision::Deny);

        fixture.mode.set(GatewayMode::Observe).await;
        let observed = fixture
            .gateway
            .evaluate(request(ActionType::Refund, json!({"amount": 750})))
            .await
            .unwrap();
        assert_eq!(observed.decision, Decision::Allow);
        assert_eq!(observed.observed_decision, Some(Decision::Deny));
    }

    #[tokio::test]
    async fn test_protected_table_write_is_denied() {
        let fixture = fixture(GatewayMode::Enforce);
        let mut req = request(ActionType::DatabaseWrite, json!({"table": "users"}));
        req.target_resource = "db/main".into();
        let outcome = fixture.gateway.evaluate(req).await.unwrap();

        assert_eq!(outcome.decision, Decision::Deny);
        assert!(outcome
            .matched_policies
            .contains(&"database_write_protection".to_string()));
    }

    #[tokio::test]
    async fn test_missing_parameters_treated_as_empty() {
        let fixture = fixture(GatewayMode::Enforce);
        let outcome = fixture
            .gateway
            .evaluate(request(ActionType::Refund, json!({})))
            .await
            .unwrap();
        // No amount parameter: the refund limit cannot fire.
        assert_eq!(outcome.decision, Decision::Allow);
    }

    #[tokio::test]
    async fn test_boundary_scores() {
        let fixture = fixture(GatewayMode::Enforce);

        // admin_action_high_risk contributes exactly 0.85 ≥ approval
        // threshold 0.8: pending.
        let outcome = fixture
            .gateway
            .evaluate(request(ActionType::AdminAction, json!({})))
            .await
            .unwrap();
        assert_eq!(outcome.decision, Decision::Pending);
    }

    #[tokio::test]
    async fn test_fail_closed_without_snapshot() {
        // A store with no rules and a broken backing table: deny with an
        // explanatory reason.
        let conn = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        let metrics = GatewayMetrics::unregistered();
        let policies = Arc::new(PolicyStore::open(conn.clone()).unwrap());
        conn.lock().unwrap().execute("DROP TABLE rules", []).unwrap();
        let _ = policies.refresh();
        assert!(!policies.is_healthy());

        let audit_conn = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        let audit = Arc::new(AuditWriter::open(audit_conn.clone()).unwrap());
        let sink = Arc::new(RecordingSink::new());
        let mode = Arc::new(ModeController::new(GatewayMode::Enforce, None));
        let approvals = Arc::new(
            ApprovalCoordinator::open(
                audit_conn,
                None,
                Duration::from_secs(60),
                audit.clone(),
                sink.clone() as Arc<dyn ForwardSink>,
                mode.clone(),
                metrics.clone(),
            )
            .unwrap(),
        );
        let gateway = Gateway::new(
            policies,
            Arc::new(Sanitizer::default()),
            mode,
            Thresholds::default(),
            approvals,
            audit,
            sink as Arc<dyn ForwardSink>,
            metrics,
        );

        let outcome = gateway
            .evaluate(request(ActionType::Refund, json!({"amount": 1})))
            .await
            .unwrap();
        assert_eq!(outcome.decision, Decision::Deny);
        assert!(outcome.message.contains("policy store unavailable"));
    }

    #[tokio::test]
    async fn test_every_request_produces_an_audit_entry() {
        let fixture = fixture(GatewayMode::Enforce);
        for (action, params) in [
            (ActionType::Refund, json!({"amount": 100})),
            (ActionType::Refund, json!({"amount": 750})),
            (ActionType::Payment, json!({"amount": 15000})),
        ] {
            fixture.gateway.evaluate(request(action, params)).await.unwrap();
        }
        assert_eq!(audit_entries(&fixture).len(), 3);
    }

    #[tokio::test]
    async fn test_identical_requests_get_identical_decisions() {
        let fixture = fixture(GatewayMode::Enforce);
        let a = fixture
            .gateway
            .evaluate(request(ActionType::Refund, json!({"amount": 750})))
            .await
            .unwrap();
        let b = fixture
            .gateway
            .evaluate(request(ActionType::Refund, json!({"amount": 750})))
            .await
            .unwrap();
        assert_eq!(a.decision, b.decision);
        assert_eq!(a.matched_policies, b.matched_policies);
        assert!((a.risk_score - b.risk_score).abs() < f64::EPSILON);
    }
}
