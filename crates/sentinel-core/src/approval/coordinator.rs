//! The approval coordinator: record ownership, webhook delivery, expiry.
//!
//! The coordinator is the only component that mutates approval records.
//! A resolve is a read-modify-write under one connection lock: the state
//! machine check and the persisted update are a single critical section,
//! and no lock is held across a suspension point. Side effects (forwarding,
//! the terminal audit entry) run after the transition is durable.
//!
//! # Webhook delivery
//!
//! The approval request is POSTed to the configured webhook best-effort:
//! bounded exponential backoff, capped per-attempt timeout, total deadline
//! [`WEBHOOK_TOTAL_DEADLINE`]. Delivery failure never fails the request;
//! the record stays `PENDING` and the next state change can only come from
//! a callback or expiry.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::record::{ApprovalRecord, ApprovalState, Transition, TransitionConflict, TransitionOutcome};
use crate::audit::{AuditEntry, AuditWriter};
use crate::decision::Decision;
use crate::forward::ForwardSink;
use crate::metrics::GatewayMetrics;
use crate::mode::ModeController;
use crate::request::{ActionType, AgentRequest};

/// Per-attempt webhook timeout.
pub const WEBHOOK_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Total webhook delivery deadline across all attempts.
pub const WEBHOOK_TOTAL_DEADLINE: Duration = Duration::from_secs(30);

/// First backoff step; doubles per attempt, capped at
/// [`WEBHOOK_BACKOFF_CAP`].
const WEBHOOK_BACKOFF_START: Duration = Duration::from_secs(1);
const WEBHOOK_BACKOFF_CAP: Duration = Duration::from_secs(8);

/// Errors from approval coordination.
#[derive(Debug, Error)]
pub enum ApprovalError {
    /// No record with this id exists.
    #[error("approval {0} not found")]
    NotFound(Uuid),

    /// The record is terminal in a different state.
    #[error(transparent)]
    Conflict(#[from] TransitionConflict),

    /// The underlying store failed.
    #[error("approval storage failed: {0}")]
    Storage(String),
}

impl From<rusqlite::Error> for ApprovalError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

/// The payload POSTed to the approval webhook. Carries only sanitized
/// request material.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload {
    /// Constant event discriminator.
    pub event: &'static str,
    /// The approval awaiting decision.
    pub approval_id: Uuid,
    /// The evaluation that raised it.
    pub request_id: Uuid,
    /// The acting agent.
    pub agent_id: String,
    /// The action under review.
    pub action_type: ActionType,
    /// The targeted resource.
    pub target_resource: String,
    /// Risk score at decision time.
    pub risk_score: f64,
    /// Matched rule ids.
    pub matched_rules: Vec<String>,
    /// Masked parameters.
    pub parameters: Map<String, Value>,
    /// Masked context.
    pub context: Map<String, Value>,
    /// Record creation time.
    pub created_at: DateTime<Utc>,
    /// Record expiry.
    pub expires_at: DateTime<Utc>,
    /// Where the approval service posts its decision.
    pub callback_url: String,
}

/// Owns approval records end to end.
pub struct ApprovalCoordinator {
    conn: Arc<Mutex<Connection>>,
    http: reqwest::Client,
    webhook_url: Option<String>,
    expiry: chrono::Duration,
    audit: Arc<AuditWriter>,
    sink: Arc<dyn ForwardSink>,
    mode: Arc<ModeController>,
    metrics: Arc<GatewayMetrics>,
}

impl ApprovalCoordinator {
    /// Opens the coordinator over an existing connection, creating the
    /// schema.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::Storage`] if schema creation or HTTP client
    /// construction fails.
    pub fn open(
        conn: Arc<Mutex<Connection>>,
        webhook_url: Option<String>,
        expiry: Duration,
        audit: Arc<AuditWriter>,
        sink: Arc<dyn ForwardSink>,
        mode: Arc<ModeController>,
        metrics: Arc<GatewayMetrics>,
    ) -> Result<Self, ApprovalError> {
        {
            let guard = lock(&conn)?;
            Self::init_schema(&guard)?;
        }
        let http = reqwest::Client::builder()
            .timeout(WEBHOOK_ATTEMPT_TIMEOUT)
            .build()
            .map_err(|e| ApprovalError::Storage(e.to_string()))?;
        Ok(Self {
            conn,
            http,
            webhook_url,
            expiry: chrono::Duration::from_std(expiry)
                .unwrap_or_else(|_| chrono::Duration::hours(24)),
            audit,
            sink,
            mode,
            metrics,
        })
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS approvals (
                approval_id TEXT PRIMARY KEY,
                request_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                action_type TEXT NOT NULL,
                target_resource TEXT NOT NULL,
                risk_score REAL NOT NULL,
                matched_rules TEXT NOT NULL,
                original_parameters TEXT NOT NULL,
                sanitized_parameters TEXT NOT NULL,
                sanitized_context TEXT NOT NULL,
                state TEXT NOT NULL,
                decided_by TEXT,
                decided_at TEXT,
                webhook_url TEXT,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_approvals_state ON approvals(state)",
            [],
        )?;
        Ok(())
    }

    /// Creates a `PENDING` record for a request and dispatches the webhook.
    ///
    /// The webhook runs in a background task; this returns as soon as the
    /// record is durable.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::Storage`] when the record cannot be
    /// persisted.
    pub fn request_approval(
        &self,
        request: &AgentRequest,
        sanitized_parameters: Map<String, Value>,
        sanitized_context: Map<String, Value>,
        risk_score: f64,
        matched_rules: Vec<String>,
    ) -> Result<ApprovalRecord, ApprovalError> {
        let now = Utc::now();
        let record = ApprovalRecord {
            approval_id: Uuid::new_v4(),
            request_id: request.request_id,
            agent_id: request.agent_id.clone(),
            action_type: request.action_type,
            target_resource: request.target_resource.clone(),
            risk_score,
            matched_rules,
            original_parameters: request.parameters.clone(),
            sanitized_parameters,
            sanitized_context,
            state: ApprovalState::Pending,
            decided_by: None,
            decided_at: None,
            webhook_url: self.webhook_url.clone(),
            created_at: now,
            expires_at: now + self.expiry,
        };

        self.insert(&record)?;
        self.metrics.approval_opened();
        info!(
            approval_id = %record.approval_id,
            request_id = %record.request_id,
            "approval requested"
        );

        if let Some(url) = &self.webhook_url {
            let payload = WebhookPayload {
                event: "approval_requested",
                approval_id: record.approval_id,
                request_id: record.request_id,
                agent_id: record.agent_id.clone(),
                action_type: record.action_type,
                target_resource: record.target_resource.clone(),
                risk_score: record.risk_score,
                matched_rules: record.matched_rules.clone(),
                parameters: record.sanitized_parameters.clone(),
                context: record.sanitized_context.clone(),
                created_at: record.created_at,
                expires_at: record.expires_at,
                callback_url: format!("/api/v1/approvals/{}/callback", record.approval_id),
            };
            tokio::spawn(deliver_webhook(
                self.http.clone(),
                url.clone(),
                payload,
                Arc::clone(&self.metrics),
            ));
        }

        Ok(record)
    }

    /// Current state of a record.
    ///
    /// # Errors
    ///
    /// [`ApprovalError::NotFound`] for unknown ids, [`ApprovalError::Storage`]
    /// on read failure.
    pub fn status(&self, approval_id: Uuid) -> Result<ApprovalRecord, ApprovalError> {
        let conn = lock(&self.conn)?;
        Self::load(&conn, approval_id)?.ok_or(ApprovalError::NotFound(approval_id))
    }

    /// Applies a terminal transition.
    ///
    /// Duplicate callbacks on a terminal record return the record unchanged
    /// with [`TransitionOutcome::AlreadyApplied`]; a conflicting decision is
    /// an error. On `APPROVED`, the original request re-enters the forward
    /// path; on `REJECTED`/`EXPIRED` the terminal audit entry is recorded.
    ///
    /// # Errors
    ///
    /// [`ApprovalError::NotFound`], [`ApprovalError::Conflict`], or
    /// [`ApprovalError::Storage`].
    pub async fn resolve(
        &self,
        approval_id: Uuid,
        transition: Transition,
    ) -> Result<(ApprovalRecord, TransitionOutcome), ApprovalError> {
        let now = Utc::now();

        // Critical section: load, apply, persist under one lock.
        let (record, outcome) = {
            let conn = lock(&self.conn)?;
            let mut record =
                Self::load(&conn, approval_id)?.ok_or(ApprovalError::NotFound(approval_id))?;
            let outcome = record.apply(&transition, now)?;
            if outcome == TransitionOutcome::Applied {
                conn.execute(
                    "UPDATE approvals SET state = ?1, decided_by = ?2, decided_at = ?3
                     WHERE approval_id = ?4",
                    params![
                        record.state.as_str(),
                        record.decided_by,
                        record.decided_at.map(|dt| dt.to_rfc3339()),
                        approval_id.to_string(),
                    ],
                )?;
            }
            (record, outcome)
        };

        if outcome == TransitionOutcome::Applied {
            self.metrics.approval_closed();
            info!(
                approval_id = %approval_id,
                state = %record.state,
                decided_by = record.decided_by.as_deref().unwrap_or("-"),
                "approval resolved"
            );
            self.finalize(&record).await;
        } else {
            debug!(
                approval_id = %approval_id,
                state = %record.state,
                "duplicate terminal callback; returning existing state"
            );
        }

        Ok((record, outcome))
    }

    /// Transitions stale `PENDING` records to `EXPIRED`. Returns how many
    /// were expired.
    ///
    /// # Errors
    ///
    /// [`ApprovalError::Storage`] when the candidate scan fails. Individual
    /// expiry conflicts (a callback racing the sweeper) are skipped.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize, ApprovalError> {
        let candidates: Vec<Uuid> = {
            let conn = lock(&self.conn)?;
            let mut stmt = conn.prepare(
                "SELECT approval_id FROM approvals WHERE state = 'PENDING' AND expires_at <= ?1",
            )?;
            let ids: Vec<Uuid> = stmt
                .query_map(params![now.to_rfc3339()], |row| {
                    let id: String = row.get(0)?;
                    Ok(id)
                })?
                .filter_map(Result::ok)
                .filter_map(|id| id.parse().ok())
                .collect();
            ids
        };

        let mut expired = 0;
        for approval_id in candidates {
            match self.resolve(approval_id, Transition::Expire).await {
                Ok((_, TransitionOutcome::Applied)) => expired += 1,
                Ok((_, TransitionOutcome::AlreadyApplied)) | Err(ApprovalError::Conflict(_)) => {}
                Err(err) => warn!(approval_id = %approval_id, error = %err, "expiry sweep failed"),
            }
        }
        if expired > 0 {
            info!(expired, "expired stale approvals");
        }
        Ok(expired)
    }

    /// Number of records currently `PENDING`.
    ///
    /// # Errors
    ///
    /// [`ApprovalError::Storage`] on read failure.
    pub fn pending_count(&self) -> Result<u64, ApprovalError> {
        let conn = lock(&self.conn)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM approvals WHERE state = 'PENDING'",
            [],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Side effects of a terminal transition. The transition is already
    /// durable when this runs.
    async fn finalize(&self, record: &ApprovalRecord) {
        let (decision, forwarded, digest) = match record.state {
            ApprovalState::Approved => {
                // Policy: the original parameters are forwarded; the
                // sanitized copy is what gets audited.
                let request = AgentRequest {
                    request_id: record.request_id,
                    agent_id: record.agent_id.clone(),
                    action_type: record.action_type,
                    target_resource: record.target_resource.clone(),
                    parameters: record.original_parameters.clone(),
                    context: Map::new(),
                    received_at: record.created_at,
                };
                match self.sink.forward(&request).await {
                    Ok(receipt) => (Decision::Allow, true, receipt.response_digest),
                    Err(err) => {
                        warn!(
                            approval_id = %record.approval_id,
                            error = %err,
                            "forwarding approved request failed"
                        );
                        (Decision::Allow, false, None)
                    }
                }
            }
            ApprovalState::Rejected | ApprovalState::Expired => (Decision::Deny, false, None),
            ApprovalState::Pending => return,
        };

        self.audit.append(AuditEntry {
            request_id: record.request_id,
            agent_id: record.agent_id.clone(),
            action_type: record.action_type,
            target_resource: record.target_resource.clone(),
            sanitized_parameters: record.sanitized_parameters.clone(),
            decision,
            risk_score: record.risk_score,
            matched_rules: record.matched_rules.clone(),
            mode_in_effect: self.mode.current(),
            approval_id: Some(record.approval_id),
            forwarded,
            target_response_digest: digest,
            ts: Utc::now(),
        });
    }

    fn insert(&self, record: &ApprovalRecord) -> Result<(), ApprovalError> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO approvals (approval_id, request_id, agent_id, action_type,
                                    target_resource, risk_score, matched_rules,
                                    original_parameters, sanitized_parameters, sanitized_context,
                                    state, decided_by, decided_at, webhook_url,
                                    created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                record.approval_id.to_string(),
                record.request_id.to_string(),
                record.agent_id,
                record.action_type.as_str(),
                record.target_resource,
                record.risk_score,
                json_string(&record.matched_rules)?,
                json_string(&record.original_parameters)?,
                json_string(&record.sanitized_parameters)?,
                json_string(&record.sanitized_context)?,
                record.state.as_str(),
                record.decided_by,
                record.decided_at.map(|dt| dt.to_rfc3339()),
                record.webhook_url,
                record.created_at.to_rfc3339(),
                record.expires_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn load(conn: &Connection, approval_id: Uuid) -> Result<Option<ApprovalRecord>, ApprovalError> {
        conn.query_row(
            "SELECT approval_id, request_id, agent_id, action_type, target_resource,
                    risk_score, matched_rules, original_parameters, sanitized_parameters,
                    sanitized_context, state, decided_by, decided_at, webhook_url,
                    created_at, expires_at
             FROM approvals WHERE approval_id = ?1",
            params![approval_id.to_string()],
            row_to_record,
        )
        .optional()
        .map_err(ApprovalError::from)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ApprovalRecord> {
    let approval_id: String = row.get(0)?;
    let request_id: String = row.get(1)?;
    let action_type: String = row.get(3)?;
    let matched_rules: String = row.get(6)?;
    let original_parameters: String = row.get(7)?;
    let sanitized_parameters: String = row.get(8)?;
    let sanitized_context: String = row.get(9)?;
    let state: String = row.get(10)?;
    let decided_at: Option<String> = row.get(12)?;
    let created_at: String = row.get(14)?;
    let expires_at: String = row.get(15)?;

    Ok(ApprovalRecord {
        approval_id: approval_id.parse().unwrap_or_default(),
        request_id: request_id.parse().unwrap_or_default(),
        agent_id: row.get(2)?,
        action_type: serde_json::from_value(Value::String(action_type))
            .unwrap_or(ActionType::ApiCall),
        target_resource: row.get(4)?,
        risk_score: row.get(5)?,
        matched_rules: serde_json::from_str(&matched_rules).unwrap_or_default(),
        original_parameters: serde_json::from_str(&original_parameters).unwrap_or_default(),
        sanitized_parameters: serde_json::from_str(&sanitized_parameters).unwrap_or_default(),
        sanitized_context: serde_json::from_str(&sanitized_context).unwrap_or_default(),
        state: state.parse().unwrap_or(ApprovalState::Pending),
        decided_by: row.get(11)?,
        decided_at: decided_at.and_then(|dt| {
            DateTime::parse_from_rfc3339(&dt)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
        }),
        webhook_url: row.get(13)?,
        created_at: parse_ts(&created_at),
        expires_at: parse_ts(&expires_at),
    })
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn json_string<T: Serialize>(value: &T) -> Result<String, ApprovalError> {
    serde_json::to_string(value).map_err(|e| ApprovalError::Storage(e.to_string()))
}

fn lock(
    conn: &Arc<Mutex<Connection>>,
) -> Result<std::sync::MutexGuard<'_, Connection>, ApprovalError> {
    conn.lock()
        .map_err(|_| ApprovalError::Storage("connection lock poisoned".into()))
}

/// Posts the approval payload with bounded retries.
async fn deliver_webhook(
    http: reqwest::Client,
    url: String,
    payload: WebhookPayload,
    metrics: Arc<GatewayMetrics>,
) {
    let started = tokio::time::Instant::now();
    let mut backoff = WEBHOOK_BACKOFF_START;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match http.post(&url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(
                    approval_id = %payload.approval_id,
                    attempt,
                    "approval webhook delivered"
                );
                return;
            }
            Ok(response) => {
                warn!(
                    approval_id = %payload.approval_id,
                    attempt,
                    status = response.status().as_u16(),
                    "approval webhook rejected"
                );
            }
            Err(err) => {
                warn!(
                    approval_id = %payload.approval_id,
                    attempt,
                    error = %err,
                    "approval webhook attempt failed"
                );
            }
        }

        if started.elapsed() + backoff > WEBHOOK_TOTAL_DEADLINE {
            warn!(
                approval_id = %payload.approval_id,
                attempts = attempt,
                "approval webhook delivery abandoned; record stays PENDING"
            );
            metrics.record_webhook_failure();
            return;
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(WEBHOOK_BACKOFF_CAP);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::RecordingSink;
    use crate::mode::GatewayMode;
    use crate::request::ActionType;

    struct Fixture {
        coordinator: ApprovalCoordinator,
        audit: Arc<AuditWriter>,
        sink: Arc<RecordingSink>,
    }

    fn fixture(webhook_url: Option<String>) -> Fixture {
        let conn = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        let audit = Arc::new(AuditWriter::open(conn.clone()).unwrap());
        let sink = Arc::new(RecordingSink::new());
        let mode = Arc::new(ModeController::new(GatewayMode::Enforce, None));
        let coordinator = ApprovalCoordinator::open(
            conn,
            webhook_url,
            Duration::from_secs(86_400),
            audit.clone(),
            sink.clone() as Arc<dyn ForwardSink>,
            mode,
            GatewayMetrics::unregistered(),
        )
        .unwrap();
        Fixture {
            coordinator,
            audit,
            sink,
        }
    }

    fn payment_request() -> AgentRequest {
        let mut parameters = Map::new();
        parameters.insert("amount".into(), serde_json::json!(15_000));
        parameters.insert("account".into(), serde_json::json!("a@b.com"));
        AgentRequest::new(
            "support-bot",
            ActionType::Payment,
            "payments/transfer",
            parameters,
            Map::new(),
        )
    }

    fn create_pending(fixture: &Fixture) -> ApprovalRecord {
        let request = payment_request();
        let mut sanitized = request.parameters.clone();
        sanitized.insert("account".into(), serde_json::json!("<EMAIL>"));
        fixture
            .coordinator
            .request_approval(
                &request,
                sanitized,
                Map::new(),
                0.85,
                vec!["payment_limit_10000".into()],
            )
            .unwrap()
    }

    #[tokio::test]
    async fn test_request_approval_persists_pending_record() {
        let fixture = fixture(None);
        let record = create_pending(&fixture);

        let loaded = fixture.coordinator.status(record.approval_id).unwrap();
        assert_eq!(loaded.state, ApprovalState::Pending);
        assert_eq!(loaded.request_id, record.request_id);
        assert_eq!(fixture.coordinator.pending_count().unwrap(), 1);
        // The stored sanitized copy is masked; the original is intact.
        assert_eq!(loaded.sanitized_parameters["account"], "<EMAIL>");
        assert_eq!(loaded.original_parameters["account"], "a@b.com");
    }

    #[tokio::test]
    async fn test_status_of_unknown_id_is_not_found() {
        let fixture = fixture(None);
        assert!(matches!(
            fixture.coordinator.status(Uuid::new_v4()),
            Err(ApprovalError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_approve_forwards_original_and_audits() {
        let fixture = fixture(None);
        let record = create_pending(&fixture);

        let (resolved, outcome) = fixture
            .coordinator
            .resolve(
                record.approval_id,
                Transition::Approve {
                    decided_by: "alice".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome, TransitionOutcome::Applied);
        assert_eq!(resolved.state, ApprovalState::Approved);

        // The forward path received the original parameters.
        let forwarded = fixture.sink.forwarded();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].parameters["account"], "a@b.com");

        // The terminal audit entry carries only the masked copy.
        let entries = fixture.audit.query(&crate::audit::AuditQuery::default()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].decision, Decision::Allow);
        assert!(entries[0].forwarded);
        assert_eq!(entries[0].approval_id, Some(record.approval_id));
        assert_eq!(entries[0].sanitized_parameters["account"], "<EMAIL>");
        assert!(entries[0].target_response_digest.is_some());
    }

    #[tokio::test]
    async fn test_reject_audits_without_forwarding() {
        let fixture = fixture(None);
        let record = create_pending(&fixture);

        let (resolved, _) = fixture
            .coordinator
            .resolve(
                record.approval_id,
                Transition::Reject {
                    decided_by: "alice".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(resolved.state, ApprovalState::Rejected);
        assert!(fixture.sink.forwarded().is_empty());

        let entries = fixture.audit.query(&crate::audit::AuditQuery::default()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].decision, Decision::Deny);
        assert!(!entries[0].forwarded);
    }

    #[tokio::test]
    async fn test_duplicate_callback_is_idempotent() {
        let fixture = fixture(None);
        let record = create_pending(&fixture);
        let approve = |by: &str| Transition::Approve {
            decided_by: by.into(),
        };

        fixture
            .coordinator
            .resolve(record.approval_id, approve("alice"))
            .await
            .unwrap();
        let (again, outcome) = fixture
            .coordinator
            .resolve(record.approval_id, approve("bob"))
            .await
            .unwrap();

        assert_eq!(outcome, TransitionOutcome::AlreadyApplied);
        assert_eq!(again.decided_by.as_deref(), Some("alice"));
        // No duplicate side effects.
        assert_eq!(fixture.sink.forwarded().len(), 1);
        assert_eq!(
            fixture
                .audit
                .query(&crate::audit::AuditQuery::default())
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_conflicting_callback_is_an_error() {
        let fixture = fixture(None);
        let record = create_pending(&fixture);

        fixture
            .coordinator
            .resolve(
                record.approval_id,
                Transition::Approve {
                    decided_by: "alice".into(),
                },
            )
            .await
            .unwrap();

        let err = fixture
            .coordinator
            .resolve(
                record.approval_id,
                Transition::Reject {
                    decided_by: "mallory".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_sweeper_expires_stale_pending_records() {
        let conn = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        let audit = Arc::new(AuditWriter::open(conn.clone()).unwrap());
        let sink = Arc::new(RecordingSink::new());
        let mode = Arc::new(ModeController::new(GatewayMode::Enforce, None));
        // Zero-ish expiry so records are stale immediately.
        let coordinator = ApprovalCoordinator::open(
            conn,
            None,
            Duration::from_secs(1),
            audit.clone(),
            sink as Arc<dyn ForwardSink>,
            mode,
            GatewayMetrics::unregistered(),
        )
        .unwrap();

        let request = payment_request();
        let record = coordinator
            .request_approval(&request, Map::new(), Map::new(), 0.85, Vec::new())
            .unwrap();

        let later = Utc::now() + chrono::Duration::seconds(5);
        let expired = coordinator.sweep_expired(later).await.unwrap();
        assert_eq!(expired, 1);

        let resolved = coordinator.status(record.approval_id).unwrap();
        assert_eq!(resolved.state, ApprovalState::Expired);

        // Expired records get the terminal audit entry.
        let entries = audit.query(&crate::audit::AuditQuery::default()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].decision, Decision::Deny);

        // A second sweep finds nothing.
        assert_eq!(coordinator.sweep_expired(later).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_webhook_failure_leaves_record_pending() {
        // Unroutable webhook endpoint: delivery fails, record stays PENDING.
        let fixture = fixture(Some("http://127.0.0.1:1/approval".into()));
        let record = create_pending(&fixture);

        // Give the background delivery task a moment to fail its first
        // attempt; the record must be unaffected either way.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let loaded = fixture.coordinator.status(record.approval_id).unwrap();
        assert_eq!(loaded.state, ApprovalState::Pending);
    }
}
