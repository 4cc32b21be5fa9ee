//! The approval record and its state machine.
//!
//! State transitions are monotonic and one-way out of `Pending`:
//!
//! ```text
//!           create
//!    ∅ ─────────────▶ PENDING ──approve──▶ APPROVED (terminal)
//!                        │
//!                        ├──reject───────▶ REJECTED (terminal)
//!                        │
//!                        └──expire───────▶ EXPIRED  (terminal)
//! ```
//!
//! Terminal idempotence lives in the type: re-applying the transition that
//! produced the current terminal state is [`TransitionOutcome::AlreadyApplied`],
//! never an error; applying a *different* one is a conflict.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::request::ActionType;

/// Lifecycle state of an approval record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ApprovalState {
    /// Awaiting a human decision.
    Pending,
    /// Approved by a human; the action was re-forwarded.
    Approved,
    /// Rejected by a human.
    Rejected,
    /// The decision window elapsed without a callback.
    Expired,
}

impl ApprovalState {
    /// True for the three end states.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Stable wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::Expired => "EXPIRED",
        }
    }
}

impl std::fmt::Display for ApprovalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ApprovalState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "APPROVED" => Ok(Self::Approved),
            "REJECTED" => Ok(Self::Rejected),
            "EXPIRED" => Ok(Self::Expired),
            _ => Err(format!("unknown approval state {s:?}")),
        }
    }
}

/// A requested state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// A human approved the action.
    Approve {
        /// Identity of the approver.
        decided_by: String,
    },
    /// A human rejected the action.
    Reject {
        /// Identity of the rejecter.
        decided_by: String,
    },
    /// The record's expiry passed.
    Expire,
}

impl Transition {
    /// The state this transition lands in.
    #[must_use]
    pub const fn target(&self) -> ApprovalState {
        match self {
            Self::Approve { .. } => ApprovalState::Approved,
            Self::Reject { .. } => ApprovalState::Rejected,
            Self::Expire => ApprovalState::Expired,
        }
    }
}

/// Result of applying a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The record moved out of `Pending`.
    Applied,
    /// The record was already in the target state; nothing changed.
    AlreadyApplied,
}

/// A transition that contradicts the record's terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("approval is already {current}")]
pub struct TransitionConflict {
    /// The terminal state the record is in.
    pub current: ApprovalState,
}

/// One pending-approval workflow instance.
///
/// Only the Approval Coordinator mutates records; everyone else sees
/// read-only copies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    /// Unique approval id.
    pub approval_id: Uuid,
    /// The evaluation that raised this approval.
    pub request_id: Uuid,
    /// The agent whose action is being reviewed.
    pub agent_id: String,
    /// The action under review.
    pub action_type: ActionType,
    /// The resource the action targets.
    pub target_resource: String,
    /// Risk score at decision time.
    pub risk_score: f64,
    /// Matched rule ids at decision time.
    pub matched_rules: Vec<String>,
    /// The original parameters, kept for re-forwarding on approval.
    pub original_parameters: Map<String, Value>,
    /// The masked copy, the only one that leaves the process.
    pub sanitized_parameters: Map<String, Value>,
    /// Sanitized caller context.
    pub sanitized_context: Map<String, Value>,
    /// Current lifecycle state.
    pub state: ApprovalState,
    /// Who made the terminal decision, when one was made.
    pub decided_by: Option<String>,
    /// When the terminal decision was made.
    pub decided_at: Option<DateTime<Utc>>,
    /// Webhook the approval request was posted to.
    pub webhook_url: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When a still-pending record expires.
    pub expires_at: DateTime<Utc>,
}

impl ApprovalRecord {
    /// Applies a transition at `now`.
    ///
    /// # Errors
    ///
    /// [`TransitionConflict`] when the record is terminal in a different
    /// state than the transition targets.
    pub fn apply(
        &mut self,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, TransitionConflict> {
        if self.state.is_terminal() {
            if self.state == transition.target() {
                return Ok(TransitionOutcome::AlreadyApplied);
            }
            return Err(TransitionConflict {
                current: self.state,
            });
        }

        self.state = transition.target();
        self.decided_at = Some(now);
        self.decided_by = match transition {
            Transition::Approve { decided_by } | Transition::Reject { decided_by } => {
                Some(decided_by.clone())
            }
            Transition::Expire => None,
        };
        Ok(TransitionOutcome::Applied)
    }

    /// True when a pending record's window has elapsed.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == ApprovalState::Pending && now >= self.expires_at
    }
}
