//! Approval status and callback endpoints.

use axum::extract::{Path, State};
use axum::Json;
use chrono::{DateTime, Utc};
use sentinel_core::approval::{ApprovalError, ApprovalState, Transition};
use sentinel_core::GatewayError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::ApiError;
use crate::state::AppState;

/// Caller-facing view of an approval record. The original parameters
/// never appear here.
#[derive(Debug, Serialize)]
pub struct ApprovalView {
    /// The approval id.
    pub approval_id: Uuid,
    /// The evaluation that raised it.
    pub request_id: Uuid,
    /// The acting agent.
    pub agent_id: String,
    /// Current state.
    pub state: ApprovalState,
    /// Risk score at decision time.
    pub risk_score: f64,
    /// Matched rule ids.
    pub matched_rules: Vec<String>,
    /// Masked parameters.
    pub sanitized_parameters: serde_json::Map<String, serde_json::Value>,
    /// Who decided, for terminal records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    /// When the decision landed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Expiry.
    pub expires_at: DateTime<Utc>,
}

impl From<sentinel_core::approval::ApprovalRecord> for ApprovalView {
    fn from(record: sentinel_core::approval::ApprovalRecord) -> Self {
        Self {
            approval_id: record.approval_id,
            request_id: record.request_id,
            agent_id: record.agent_id,
            state: record.state,
            risk_score: record.risk_score,
            matched_rules: record.matched_rules,
            sanitized_parameters: record.sanitized_parameters,
            decided_by: record.decided_by,
            decided_at: record.decided_at,
            created_at: record.created_at,
            expires_at: record.expires_at,
        }
    }
}

/// The terminal-decision callback body.
#[derive(Debug, Deserialize)]
pub struct CallbackBody {
    /// True approves, false rejects.
    pub approved: bool,
    /// Identity of the decider.
    pub decided_by: String,
    /// Optional free-text rationale (logged, not stored).
    #[serde(default)]
    pub reason: Option<String>,
}

/// `GET /api/v1/approvals/{approval_id}`
pub async fn status(
    State(state): State<AppState>,
    Path(approval_id): Path<Uuid>,
) -> Result<Json<ApprovalView>, ApiError> {
    state
        .approvals
        .status(approval_id)
        .map(|record| Json(record.into()))
        .map_err(map_approval_error)
}

/// `POST /api/v1/approvals/{approval_id}/callback`
pub async fn callback(
    State(state): State<AppState>,
    Path(approval_id): Path<Uuid>,
    Json(body): Json<CallbackBody>,
) -> Result<Json<ApprovalView>, ApiError> {
    if body.decided_by.trim().is_empty() {
        return Err(ApiError::bad_request("decided_by must not be empty"));
    }

    let transition = if body.approved {
        Transition::Approve {
            decided_by: body.decided_by.clone(),
        }
    } else {
        Transition::Reject {
            decided_by: body.decided_by.clone(),
        }
    };

    let (record, _outcome) = state
        .approvals
        .resolve(approval_id, transition)
        .await
        .map_err(map_approval_error)?;

    tracing::info!(
        approval_id = %approval_id,
        approved = body.approved,
        decided_by = %body.decided_by,
        reason = body.reason.as_deref().unwrap_or("-"),
        "approval decision recorded"
    );

    Ok(Json(record.into()))
}

fn map_approval_error(err: ApprovalError) -> ApiError {
    match err {
        ApprovalError::NotFound(_) => ApiError::not_found("approval"),
        ApprovalError::Conflict(conflict) => GatewayError::CallbackConflict {
            current: conflict.current,
        }
        .into(),
        ApprovalError::Storage(reason) => GatewayError::Internal(reason).into(),
    }
}
