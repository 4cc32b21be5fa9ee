//! The tamper-evident audit trail.
//!
//! Every evaluated request produces exactly one entry at decision time; a
//! second entry is appended when a pending approval reaches a terminal
//! state, linked by request and approval id. Entries are append-only and
//! immutable once written, and contain only the sanitized parameter copy.
//!
//! # Degradation
//!
//! Writes are best-effort synchronous. When the store is unavailable the
//! entry goes into a bounded in-memory buffer (drop-oldest on overflow, the
//! drop is counted) and is flushed opportunistically on the next successful
//! write. The gateway's availability must not depend on the audit sink, but
//! loss must be observable.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::decision::Decision;
use crate::mode::GatewayMode;
use crate::request::ActionType;

/// Default capacity of the degradation buffer.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;

/// Errors from the audit store.
#[derive(Debug, Error)]
pub enum AuditError {
    /// The underlying store failed.
    #[error("audit storage failed: {0}")]
    Storage(String),
}

impl From<rusqlite::Error> for AuditError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

/// One immutable audit record.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// The evaluated request.
    pub request_id: Uuid,
    /// The acting agent.
    pub agent_id: String,
    /// The attempted action.
    pub action_type: ActionType,
    /// The targeted resource.
    pub target_resource: String,
    /// Masked parameters. Original values never reach this struct.
    pub sanitized_parameters: Map<String, Value>,
    /// The true decision (pre-rewrite in observe mode).
    pub decision: Decision,
    /// Risk score at decision time.
    pub risk_score: f64,
    /// Matched rule ids in reporting order.
    pub matched_rules: Vec<String>,
    /// Mode in effect when the decision was made.
    pub mode_in_effect: GatewayMode,
    /// Linked approval, for pending decisions and their resolutions.
    pub approval_id: Option<Uuid>,
    /// Whether the action was forwarded to the target system.
    pub forwarded: bool,
    /// SHA-256 digest of the target response, when one was received.
    pub target_response_digest: Option<String>,
    /// Entry timestamp.
    pub ts: DateTime<Utc>,
}

/// Where an append landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Durable in the store.
    Written,
    /// Store unavailable; held in the degradation buffer.
    Buffered,
}

/// Filters for the paginated audit query.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    /// Restrict to one agent.
    pub agent_id: Option<String>,
    /// Restrict to one action type.
    pub action_type: Option<ActionType>,
    /// Restrict to one decision.
    pub decision: Option<Decision>,
    /// Page size (default 100, capped at 1000).
    pub limit: u32,
    /// Page offset.
    pub offset: u32,
}

/// Appends and queries audit entries.
pub struct AuditWriter {
    conn: Arc<Mutex<Connection>>,
    buffer: Mutex<VecDeque<AuditEntry>>,
    capacity: usize,
    dropped: AtomicU64,
    metrics: Option<Arc<crate::metrics::GatewayMetrics>>,
}

impl AuditWriter {
    /// Opens the writer over an existing connection, creating the schema.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Storage`] if schema creation fails.
    pub fn open(conn: Arc<Mutex<Connection>>) -> Result<Self, AuditError> {
        {
            let guard = conn
                .lock()
                .map_err(|_| AuditError::Storage("connection lock poisoned".into()))?;
            Self::init_schema(&guard)?;
        }
        Ok(Self {
            conn,
            buffer: Mutex::new(VecDeque::new()),
            capacity: DEFAULT_BUFFER_CAPACITY,
            dropped: AtomicU64::new(0),
            metrics: None,
        })
    }

    /// Attaches a metrics handle so buffer drops surface as a counter.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<crate::metrics::GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS audit (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                request_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                action_type TEXT NOT NULL,
                target_resource TEXT NOT NULL,
                sanitized_parameters TEXT NOT NULL,
                decision TEXT NOT NULL,
                risk_score REAL NOT NULL,
                matched_rules TEXT NOT NULL,
                mode_in_effect TEXT NOT NULL,
                approval_id TEXT,
                forwarded INTEGER NOT NULL,
                target_response_digest TEXT,
                ts TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_audit_request_id ON audit(request_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_audit_agent_ts ON audit(agent_id, ts)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_audit_decision_ts ON audit(decision, ts)",
            [],
        )?;
        Ok(())
    }

    /// Appends an entry, buffering on store failure.
    ///
    /// Durable-or-enqueued before this returns; callers respond to the
    /// agent only after this call.
    pub fn append(&self, entry: AuditEntry) -> AppendOutcome {
        match self.write(&entry) {
            Ok(()) => {
                self.flush_buffered();
                AppendOutcome::Written
            }
            Err(err) => {
                warn!(
                    request_id = %entry.request_id,
                    error = %err,
                    "audit store unavailable; buffering entry"
                );
                self.buffer_entry(entry);
                AppendOutcome::Buffered
            }
        }
    }

    /// Entries dropped from the degradation buffer since startup.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Entries currently held in the degradation buffer.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Cheap store probe for health reporting.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.conn
            .lock()
            .ok()
            .map(|conn| {
                conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                    .is_ok()
            })
            .unwrap_or(false)
    }

    /// Runs the paginated audit query.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Storage`] when the read fails.
    pub fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>, AuditError> {
        let limit = if query.limit == 0 {
            100
        } else {
            query.limit.min(1000)
        };

        let mut sql = String::from(
            "SELECT request_id, agent_id, action_type, target_resource, sanitized_parameters,
                    decision, risk_score, matched_rules, mode_in_effect, approval_id,
                    forwarded, target_response_digest, ts
             FROM audit WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(agent_id) = &query.agent_id {
            sql.push_str(" AND agent_id = ?");
            args.push(Box::new(agent_id.clone()));
        }
        if let Some(action) = query.action_type {
            sql.push_str(" AND action_type = ?");
            args.push(Box::new(action.as_str().to_string()));
        }
        if let Some(decision) = query.decision {
            sql.push_str(" AND decision = ?");
            args.push(Box::new(decision.as_str().to_string()));
        }
        sql.push_str(" ORDER BY id DESC LIMIT ? OFFSET ?");
        args.push(Box::new(i64::from(limit)));
        args.push(Box::new(i64::from(query.offset)));

        let conn = self
            .conn
            .lock()
            .map_err(|_| AuditError::Storage("connection lock poisoned".into()))?;
        let mut stmt = conn.prepare(&sql)?;
        let params = rusqlite::params_from_iter(args.iter().map(|b| b.as_ref()));
        let rows = stmt
            .query_map(params, row_to_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn write(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| AuditError::Storage("connection lock poisoned".into()))?;
        conn.execute(
            "INSERT INTO audit (request_id, agent_id, action_type, target_resource,
                                sanitized_parameters, decision, risk_score, matched_rules,
                                mode_in_effect, approval_id, forwarded, target_response_digest, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                entry.request_id.to_string(),
                entry.agent_id,
                entry.action_type.as_str(),
                entry.target_resource,
                serde_json::to_string(&entry.sanitized_parameters)
                    .map_err(|e| AuditError::Storage(e.to_string()))?,
                entry.decision.as_str(),
                entry.risk_score,
                serde_json::to_string(&entry.matched_rules)
                    .map_err(|e| AuditError::Storage(e.to_string()))?,
                entry.mode_in_effect.as_str(),
                entry.approval_id.map(|id| id.to_string()),
                entry.forwarded,
                entry.target_response_digest,
                entry.ts.to_rfc3339(),
            ],
        )?;
        debug!(request_id = %entry.request_id, decision = %entry.decision, "audit entry written");
        Ok(())
    }

    fn buffer_entry(&self, entry: AuditEntry) {
        let mut buffer = self
            .buffer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if buffer.len() >= self.capacity {
            buffer.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            if let Some(metrics) = &self.metrics {
                metrics.record_audit_drop();
            }
        }
        buffer.push_back(entry);
    }

    /// Drains what it can of the degradation buffer. Stops at the first
    /// failed write and re-queues the entry.
    fn flush_buffered(&self) {
        loop {
            let next = {
                let mut buffer = self
                    .buffer
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                buffer.pop_front()
            };
            let Some(entry) = next else { break };
            if let Err(err) = self.write(&entry) {
                warn!(error = %err, "audit flush failed; re-buffering");
                let mut buffer = self
                    .buffer
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                buffer.push_front(entry);
                break;
            }
        }
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEntry> {
    let request_id: String = row.get(0)?;
    let action_type: String = row.get(2)?;
    let sanitized: String = row.get(4)?;
    let decision: String = row.get(5)?;
    let matched: String = row.get(7)?;
    let mode: String = row.get(8)?;
    let approval_id: Option<String> = row.get(9)?;
    let ts: String = row.get(12)?;

    Ok(AuditEntry {
        request_id: request_id.parse().unwrap_or_default(),
        agent_id: row.get(1)?,
        action_type: serde_json::from_value(Value::String(action_type))
            .unwrap_or(ActionType::ApiCall),
        target_resource: row.get(3)?,
        sanitized_parameters: serde_json::from_str(&sanitized).unwrap_or_default(),
        decision: serde_json::from_value(Value::String(decision)).unwrap_or(Decision::Deny),
        risk_score: row.get(6)?,
        matched_rules: serde_json::from_str(&matched).unwrap_or_default(),
        mode_in_effect: mode.parse().unwrap_or(crate::mode::GatewayMode::Enforce),
        approval_id: approval_id.and_then(|id| id.parse().ok()),
        forwarded: row.get(10)?,
        target_response_digest: row.get(11)?,
        ts: DateTime::parse_from_rfc3339(&ts)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_writer() -> AuditWriter {
        let conn = Connection::open_in_memory().unwrap();
        AuditWriter::open(Arc::new(Mutex::new(conn))).unwrap()
    }

    fn entry(agent_id: &str, decision: Decision) -> AuditEntry {
        AuditEntry {
            request_id: Uuid::new_v4(),
            agent_id: agent_id.into(),
            action_type: ActionType::Refund,
            target_resource: "payments/refund".into(),
            sanitized_parameters: serde_json::json!({"ssn": "<SSN>"})
                .as_object()
                .cloned()
                .unwrap(),
            decision,
            risk_score: 1.0,
            matched_rules: vec!["refund_limit_500".into()],
            mode_in_effect: GatewayMode::Enforce,
            approval_id: None,
            forwarded: false,
            target_response_digest: None,
            ts: Utc::now(),
        }
    }

    #[test]
    fn test_append_and_query_round_trip() {
        let writer = open_writer();
        let original = entry("support-bot", Decision::Deny);
        assert_eq!(writer.append(original.clone()), AppendOutcome::Written);

        let rows = writer.query(&AuditQuery::default()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].request_id, original.request_id);
        assert_eq!(rows[0].decision, Decision::Deny);
        assert_eq!(rows[0].matched_rules, vec!["refund_limit_500"]);
        assert_eq!(
            rows[0].sanitized_parameters.get("ssn").unwrap(),
            &Value::String("<SSN>".into())
        );
    }

    #[test]
    fn test_query_filters() {
        let writer = open_writer();
        writer.append(entry("agent-a", Decision::Allow));
        writer.append(entry("agent-a", Decision::Deny));
        writer.append(entry("agent-b", Decision::Deny));

        let by_agent = writer
            .query(&AuditQuery {
                agent_id: Some("agent-a".into()),
                ..AuditQuery::default()
            })
            .unwrap();
        assert_eq!(by_agent.len(), 2);

        let by_decision = writer
            .query(&AuditQuery {
                decision: Some(Decision::Deny),
                ..AuditQuery::default()
            })
            .unwrap();
        assert_eq!(by_decision.len(), 2);

        let both = writer
            .query(&AuditQuery {
                agent_id: Some("agent-b".into()),
                decision: Some(Decision::Deny),
                ..AuditQuery::default()
            })
            .unwrap();
        assert_eq!(both.len(), 1);
    }

    #[test]
    fn test_query_pagination() {
        let writer = open_writer();
        for _ in 0..5 {
            writer.append(entry("agent-a", Decision::Allow));
        }

        let page = writer
            .query(&AuditQuery {
                limit: 2,
                offset: 0,
                ..AuditQuery::default()
            })
            .unwrap();
        assert_eq!(page.len(), 2);

        let rest = writer
            .query(&AuditQuery {
                limit: 10,
                offset: 4,
                ..AuditQuery::default()
            })
            .unwrap();
        assert_eq!(rest.len(), 1);
    }

    #[test]
    fn test_entries_link_approval_resolution_by_request_id() {
        let writer = open_writer();
        let approval_id = Uuid::new_v4();
        let mut first = entry("agent-a", Decision::Pending);
        first.approval_id = Some(approval_id);
        let request_id = first.request_id;
        writer.append(first);

        let mut second = entry("agent-a", Decision::Allow);
        second.request_id = request_id;
        second.approval_id = Some(approval_id);
        second.forwarded = true;
        writer.append(second);

        let rows = writer.query(&AuditQuery::default()).unwrap();
        let linked: Vec<_> = rows
            .iter()
            .filter(|r| r.request_id == request_id)
            .collect();
        assert_eq!(linked.len(), 2);
        assert!(linked.iter().all(|r| r.approval_id == Some(approval_id)));
    }

    #[test]
    fn test_degraded_store_buffers_and_counts_drops() {
        // A poisoned-path stand-in: drop the table out from under the writer.
        let conn = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        let writer = AuditWriter::open(conn.clone()).unwrap();
        conn.lock().unwrap().execute("DROP TABLE audit", []).unwrap();

        assert_eq!(
            writer.append(entry("agent-a", Decision::Allow)),
            AppendOutcome::Buffered
        );
        assert_eq!(writer.buffered(), 1);
        assert_eq!(writer.dropped(), 0);
        assert!(!writer.is_healthy() || writer.buffered() > 0);
    }

    #[test]
    fn test_buffer_drops_oldest_on_overflow() {
        let conn = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        let mut writer = AuditWriter::open(conn.clone()).unwrap();
        writer.capacity = 2;
        conn.lock().unwrap().execute("DROP TABLE audit", []).unwrap();

        writer.append(entry("a", Decision::Allow));
        writer.append(entry("b", Decision::Allow));
        writer.append(entry("c", Decision::Allow));

        assert_eq!(writer.buffered(), 2);
        assert_eq!(writer.dropped(), 1);
    }

    #[test]
    fn test_buffered_entries_flush_on_recovery() {
        let conn = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        let writer = AuditWriter::open(conn.clone()).unwrap();
        conn.lock().unwrap().execute("DROP TABLE audit", []).unwrap();

        writer.append(entry("a", Decision::Allow));
        assert_eq!(writer.buffered(), 1);

        // Store comes back.
        {
            let guard = conn.lock().unwrap();
            AuditWriter::init_schema(&guard).unwrap();
        }
        writer.append(entry("b", Decision::Allow));

        assert_eq!(writer.buffered(), 0);
        let rows = writer.query(&AuditQuery::default()).unwrap();
        assert_eq!(rows.len(), 2);
    }
}
