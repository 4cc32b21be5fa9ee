//! Durable rule storage with a copy-on-write snapshot cache.
//!
//! Rules live in the relational store (`rules` table). Every read on the
//! evaluation hot path goes through the in-memory snapshot, an
//! `Arc<[Rule]>` replaced wholesale on change and never mutated in place,
//! so readers never block and never observe a half-applied update.
//!
//! Writes persist first, then rebuild the snapshot, then publish a
//! [`PolicyChange`] on a broadcast channel. A periodic refresh re-reads the
//! table as a safety net for changes made by peer instances.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::rule::{ConditionSet, Rule};
use crate::request::ActionType;

/// Capacity of the change broadcast channel. Slow subscribers lag rather
/// than block writers.
const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Errors from policy storage.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// A rule with this id already exists.
    #[error("rule {0:?} already exists")]
    Duplicate(String),

    /// No rule with this id exists.
    #[error("rule {0:?} not found")]
    NotFound(String),

    /// The rule failed validation.
    #[error("invalid rule: {0}")]
    Invalid(String),

    /// The underlying store failed.
    #[error("policy storage failed: {0}")]
    Storage(String),
}

impl From<rusqlite::Error> for PolicyError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

/// A change to the rule set, published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyChange {
    /// A rule was created.
    Created(String),
    /// A rule was deleted.
    Deleted(String),
    /// The snapshot was rebuilt from storage.
    Refreshed,
}

/// CRUD over rules plus the live snapshot the evaluator reads.
pub struct PolicyStore {
    conn: Arc<Mutex<Connection>>,
    snapshot: RwLock<Arc<[Rule]>>,
    changes: broadcast::Sender<PolicyChange>,
    /// False after a failed refresh; used for health reporting and the
    /// fail-closed check when no snapshot exists.
    healthy: AtomicBool,
}

impl PolicyStore {
    /// Opens the store over an existing connection, creating the schema and
    /// building the initial snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Storage`] if schema creation or the initial
    /// read fails.
    pub fn open(conn: Arc<Mutex<Connection>>) -> Result<Self, PolicyError> {
        {
            let conn = lock(&conn)?;
            Self::init_schema(&conn)?;
        }
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let store = Self {
            conn,
            snapshot: RwLock::new(Arc::from(Vec::new())),
            changes,
            healthy: AtomicBool::new(true),
        };
        store.rebuild_snapshot()?;
        Ok(store)
    }

    /// Creates the `rules` table.
    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS rules (
                rule_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                action_types TEXT NOT NULL,
                conditions TEXT NOT NULL,
                risk_score_modifier REAL NOT NULL,
                enabled INTEGER NOT NULL,
                priority INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    /// Seeds the default rule set when the table is empty.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Storage`] on write failure.
    pub fn seed_defaults(&self) -> Result<usize, PolicyError> {
        let existing: i64 = {
            let conn = lock(&self.conn)?;
            conn.query_row("SELECT COUNT(*) FROM rules", [], |row| row.get(0))?
        };
        if existing > 0 {
            return Ok(0);
        }
        let defaults = default_rules();
        let count = defaults.len();
        for rule in defaults {
            self.create(rule)?;
        }
        info!(count, "seeded default policy rules");
        Ok(count)
    }

    /// The current read-only snapshot, sorted by descending priority then
    /// rule id. Cloning the `Arc` is the whole cost of a read.
    #[must_use]
    pub fn snapshot(&self) -> Arc<[Rule]> {
        self.snapshot
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Looks up a single rule by id.
    #[must_use]
    pub fn get(&self, rule_id: &str) -> Option<Rule> {
        self.snapshot()
            .iter()
            .find(|r| r.rule_id == rule_id)
            .cloned()
    }

    /// Persists a new rule and publishes the change.
    ///
    /// # Errors
    ///
    /// [`PolicyError::Invalid`] if validation fails,
    /// [`PolicyError::Duplicate`] if the id is taken, or
    /// [`PolicyError::Storage`] on write failure.
    pub fn create(&self, rule: Rule) -> Result<Rule, PolicyError> {
        rule.validate().map_err(PolicyError::Invalid)?;

        {
            let conn = lock(&self.conn)?;
            let exists: Option<String> = conn
                .query_row(
                    "SELECT rule_id FROM rules WHERE rule_id = ?1",
                    params![rule.rule_id],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_some() {
                return Err(PolicyError::Duplicate(rule.rule_id));
            }

            conn.execute(
                "INSERT INTO rules (rule_id, name, description, action_types, conditions,
                                    risk_score_modifier, enabled, priority, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    rule.rule_id,
                    rule.name,
                    rule.description,
                    serde_json::to_string(&rule.action_types)
                        .map_err(|e| PolicyError::Storage(e.to_string()))?,
                    serde_json::to_string(&rule.conditions)
                        .map_err(|e| PolicyError::Storage(e.to_string()))?,
                    rule.risk_score_modifier,
                    rule.enabled,
                    rule.priority,
                    rule.created_at.to_rfc3339(),
                    rule.updated_at.to_rfc3339(),
                ],
            )?;
        }

        self.rebuild_snapshot()?;
        let _ = self.changes.send(PolicyChange::Created(rule.rule_id.clone()));
        debug!(rule_id = %rule.rule_id, "policy rule created");
        Ok(rule)
    }

    /// Deletes a rule and publishes the change.
    ///
    /// # Errors
    ///
    /// [`PolicyError::NotFound`] if no such rule exists, or
    /// [`PolicyError::Storage`] on write failure.
    pub fn delete(&self, rule_id: &str) -> Result<(), PolicyError> {
        let affected = {
            let conn = lock(&self.conn)?;
            conn.execute("DELETE FROM rules WHERE rule_id = ?1", params![rule_id])?
        };
        if affected == 0 {
            return Err(PolicyError::NotFound(rule_id.to_string()));
        }
        self.rebuild_snapshot()?;
        let _ = self.changes.send(PolicyChange::Deleted(rule_id.to_string()));
        debug!(rule_id, "policy rule deleted");
        Ok(())
    }

    /// Subscribes to rule-set changes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PolicyChange> {
        self.changes.subscribe()
    }

    /// Re-reads the table and swaps the snapshot. Called by the periodic
    /// refresh task and after every local write.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Storage`] and leaves the previous snapshot in
    /// place (marked degraded) when the read fails.
    pub fn refresh(&self) -> Result<(), PolicyError> {
        match self.rebuild_snapshot() {
            Ok(()) => {
                let _ = self.changes.send(PolicyChange::Refreshed);
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "policy refresh failed; keeping last snapshot");
                Err(err)
            }
        }
    }

    /// True when the last storage interaction succeeded.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    fn rebuild_snapshot(&self) -> Result<(), PolicyError> {
        let rules = match self.load_all() {
            Ok(rules) => {
                self.healthy.store(true, Ordering::Relaxed);
                rules
            }
            Err(err) => {
                self.healthy.store(false, Ordering::Relaxed);
                return Err(err);
            }
        };
        let mut snapshot = self
            .snapshot
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *snapshot = Arc::from(rules);
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<Rule>, PolicyError> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT rule_id, name, description, action_types, conditions,
                    risk_score_modifier, enabled, priority, created_at, updated_at
             FROM rules",
        )?;
        let mut rules = stmt
            .query_map([], |row| {
                let action_types: String = row.get(3)?;
                let conditions: String = row.get(4)?;
                let created_at: String = row.get(8)?;
                let updated_at: String = row.get(9)?;
                Ok(RawRule {
                    rule_id: row.get(0)?,
                    name: row.get(1)?,
                    description: row.get(2)?,
                    action_types,
                    conditions,
                    risk_score_modifier: row.get(5)?,
                    enabled: row.get(6)?,
                    priority: row.get(7)?,
                    created_at,
                    updated_at,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter_map(|raw| match raw.into_rule() {
                Ok(rule) => Some(rule),
                Err(err) => {
                    // A single corrupt row must not poison the snapshot.
                    warn!(error = %err, "skipping unparseable rule row");
                    None
                }
            })
            .collect::<Vec<_>>();

        rules.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.rule_id.cmp(&b.rule_id))
        });
        Ok(rules)
    }
}

struct RawRule {
    rule_id: String,
    name: String,
    description: Option<String>,
    action_types: String,
    conditions: String,
    risk_score_modifier: f64,
    enabled: bool,
    priority: i32,
    created_at: String,
    updated_at: String,
}

impl RawRule {
    fn into_rule(self) -> Result<Rule, String> {
        let action_types = serde_json::from_str(&self.action_types)
            .map_err(|e| format!("action_types: {e}"))?;
        let conditions: ConditionSet =
            serde_json::from_str(&self.conditions).map_err(|e| format!("conditions: {e}"))?;
        Ok(Rule {
            rule_id: self.rule_id,
            name: self.name,
            description: self.description,
            action_types,
            conditions,
            risk_score_modifier: self.risk_score_modifier,
            enabled: self.enabled,
            priority: self.priority,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("timestamp: {e}"))
}

fn lock(conn: &Arc<Mutex<Connection>>) -> Result<std::sync::MutexGuard<'_, Connection>, PolicyError>
{
    conn.lock()
        .map_err(|_| PolicyError::Storage("connection lock poisoned".into()))
}

/// The rule set seeded into an empty store.
#[must_use]
pub fn default_rules() -> Vec<Rule> {
    let now = Utc::now();
    let rule = |rule_id: &str,
                name: &str,
                description: &str,
                action_types: &[ActionType],
                conditions: serde_json::Value,
                risk_score_modifier: f64,
                priority: i32| Rule {
        rule_id: rule_id.into(),
        name: name.into(),
        description: Some(description.into()),
        action_types: action_types.iter().copied().collect(),
        conditions: ConditionSet::from_map_lossy(
            conditions.as_object().expect("literal conditions map"),
        ),
        risk_score_modifier,
        enabled: true,
        priority,
        created_at: now,
        updated_at: now,
    };

    vec![
        rule(
            "refund_limit_500",
            "Refund Amount Limit",
            "Block refunds exceeding $500",
            &[ActionType::Refund],
            serde_json::json!({"max_amount": 500.0}),
            1.0,
            10,
        ),
        rule(
            "payment_limit_10000",
            "Payment Amount Limit",
            "Require approval for payments over $10,000",
            &[ActionType::Payment],
            serde_json::json!({"max_amount": 10000.0}),
            0.85,
            20,
        ),
        rule(
            "admin_action_high_risk",
            "Admin Actions High Risk",
            "All admin actions are high risk",
            &[ActionType::AdminAction],
            serde_json::json!({}),
            0.85,
            5,
        ),
        rule(
            "user_data_access",
            "User Data Access Control",
            "User data access requires a written justification",
            &[ActionType::UserDataAccess],
            serde_json::json!({"require_justification": true}),
            0.3,
            30,
        ),
        rule(
            "database_write_protection",
            "Database Write Protection",
            "Deny writes to protected tables",
            &[ActionType::DatabaseWrite],
            serde_json::json!({"protected_tables": ["users", "payments", "credentials"]}),
            1.0,
            15,
        ),
        rule(
            "bulk_operation_limit",
            "Bulk Operation Limit",
            "Limit bulk operations affecting many records",
            &[ActionType::DatabaseWrite, ActionType::DatabaseQuery],
            serde_json::json!({"max_affected_rows": 1000}),
            0.9,
            25,
        ),
    ]
}
