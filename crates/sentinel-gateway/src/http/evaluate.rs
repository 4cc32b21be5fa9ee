//! The evaluate endpoint: one agent action in, one governance decision
//! out.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use sentinel_core::auth::AgentIdentity;
use sentinel_core::decision::{Decision, RiskLevel};
use sentinel_core::gateway::EvaluateOutcome;
use sentinel_core::request::{ActionType, AgentRequest};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::error::ApiError;
use crate::state::AppState;

/// The evaluate request body.
#[derive(Debug, Deserialize)]
pub struct EvaluateBody {
    /// Agent id as declared by the caller. The authenticated identity
    /// wins when the two disagree.
    #[serde(default)]
    pub agent_id: Option<String>,
    /// The action to evaluate.
    pub action_type: ActionType,
    /// The targeted resource.
    pub target_resource: String,
    /// Declared parameters. Missing means empty.
    #[serde(default)]
    pub parameters: Option<Map<String, Value>>,
    /// Caller context. Missing means empty.
    #[serde(default)]
    pub context: Option<Map<String, Value>>,
}

/// The evaluate response body.
#[derive(Debug, Serialize)]
pub struct EvaluateResponse {
    /// Server-assigned request id.
    pub request_id: Uuid,
    /// `allowed`, `denied`, or `pending_approval`.
    pub status: &'static str,
    /// The emitted decision.
    pub decision: Decision,
    /// Human-readable summary.
    pub message: String,
    /// Derived risk level.
    pub risk_level: RiskLevel,
    /// Computed risk score.
    pub risk_score: f64,
    /// Matched rule ids, highest priority first.
    pub matched_policies: Vec<String>,
    /// The approval raised for pending decisions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<Uuid>,
    /// Status URL for the raised approval.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_url: Option<String>,
    /// Whether the action was forwarded.
    pub forwarded: bool,
    /// Target response digest, when the target replied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_response: Option<Value>,
    /// Mode in effect.
    pub mode: String,
    /// The true decision when observe mode rewrote it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_decision: Option<Decision>,
}

impl EvaluateResponse {
    fn from_outcome(outcome: EvaluateOutcome) -> Self {
        Self {
            request_id: outcome.request_id,
            status: outcome.decision.status_word(),
            decision: outcome.decision,
            message: outcome.message,
            risk_level: outcome.risk_level,
            risk_score: outcome.risk_score,
            matched_policies: outcome.matched_policies,
            approval_url: outcome
                .approval_id
                .map(|id| format!("/api/v1/approvals/{id}")),
            approval_id: outcome.approval_id,
            forwarded: outcome.forwarded,
            target_response: outcome
                .target_response_digest
                .map(|digest| serde_json::json!({ "digest": digest })),
            mode: outcome.mode.to_string(),
            observed_decision: outcome.observed_decision,
        }
    }
}

/// `POST /api/v1/gateway/evaluate`
pub async fn evaluate(
    State(state): State<AppState>,
    Extension(identity): Extension<AgentIdentity>,
    Json(raw): Json<Value>,
) -> Result<Response, ApiError> {
    let body: EvaluateBody =
        serde_json::from_value(raw).map_err(|err| ApiError::bad_request(err.to_string()))?;

    if let Some(declared) = &body.agent_id {
        if declared != &identity.agent_id {
            tracing::debug!(
                declared = %declared,
                authenticated = %identity.agent_id,
                "declared agent_id differs from authenticated identity; using identity"
            );
        }
    }

    let request = AgentRequest::new(
        identity.agent_id.clone(),
        body.action_type,
        body.target_resource,
        body.parameters.unwrap_or_default(),
        body.context.unwrap_or_default(),
    );
    let request_id = request.request_id;

    let outcome = state
        .gateway
        .evaluate(request)
        .await
        .map_err(|err| ApiError::from(err).with_request_id(request_id))?;

    let status = match outcome.decision {
        Decision::Allow => StatusCode::OK,
        Decision::Pending => StatusCode::ACCEPTED,
        Decision::Deny => StatusCode::FORBIDDEN,
    };
    Ok((status, Json(EvaluateResponse::from_outcome(outcome))).into_response())
}
