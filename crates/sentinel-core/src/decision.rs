//! Threshold mapping from risk scores to decisions, and the observe-mode
//! rewrite.

use serde::{Deserialize, Serialize};

use crate::mode::GatewayMode;

/// A governance decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    /// The action may proceed.
    Allow,
    /// The action is blocked.
    Deny,
    /// The action awaits human approval.
    Pending,
}

impl Decision {
    /// Stable wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::Pending => "pending",
        }
    }

    /// The `status` word used in evaluate responses.
    #[must_use]
    pub const fn status_word(self) -> &'static str {
        match self {
            Self::Allow => "allowed",
            Self::Deny => "denied",
            Self::Pending => "pending_approval",
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse risk classification reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Score below 0.3.
    Low,
    /// Score in `[0.3, 0.8)`.
    Medium,
    /// Score at or above 0.8.
    High,
}

impl RiskLevel {
    /// Derives the level from a risk score.
    #[must_use]
    pub fn from_score(score: f64) -> Self {
        if score < 0.3 {
            Self::Low
        } else if score < 0.8 {
            Self::Medium
        } else {
            Self::High
        }
    }
}

/// Decision thresholds. `block` is strictly greater than `approval`.
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    /// Score at or above which a request goes to human approval.
    pub approval: f64,
    /// Score at or above which a request is denied.
    pub block: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            approval: 0.8,
            block: 1.0,
        }
    }
}

impl Thresholds {
    /// Maps a risk score to the raw (mode-independent) decision.
    ///
    /// Boundary semantics: a score exactly at the approval threshold is
    /// `Pending`; exactly at the block threshold is `Deny`.
    #[must_use]
    pub fn decide(&self, risk_score: f64) -> Decision {
        if risk_score >= self.block {
            Decision::Deny
        } else if risk_score >= self.approval {
            Decision::Pending
        } else {
            Decision::Allow
        }
    }
}

/// A decision after the mode rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModedDecision {
    /// The decision returned to the caller.
    pub emitted: Decision,
    /// The true decision, when observe mode rewrote it.
    pub observed: Option<Decision>,
    /// The mode in effect when the decision was made.
    pub mode: GatewayMode,
}

impl ModedDecision {
    /// The decision that belongs in the audit trail: the truth, not the
    /// rewrite.
    #[must_use]
    pub fn audited(&self) -> Decision {
        self.observed.unwrap_or(self.emitted)
    }
}

/// Applies the circuit-breaker mode to a raw decision.
///
/// In `Observe`, any non-allow decision is rewritten to an allow with the
/// truth carried in `observed`; `Enforce` passes decisions through.
#[must_use]
pub fn apply_mode(raw: Decision, mode: GatewayMode) -> ModedDecision {
    match (mode, raw) {
        (GatewayMode::Observe, Decision::Deny | Decision::Pending) => ModedDecision {
            emitted: Decision::Allow,
            observed: Some(raw),
            mode,
        },
        _ => ModedDecision {
            emitted: raw,
            observed: None,
            mode,
        },
    }
}
