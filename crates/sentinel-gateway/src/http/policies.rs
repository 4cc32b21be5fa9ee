//! Policy CRUD endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use sentinel_core::policy::{PolicyError, Rule};
use serde_json::Value;

use super::error::ApiError;
use crate::state::AppState;

/// `GET /api/v1/policies`
pub async fn list(State(state): State<AppState>) -> Json<Vec<Rule>> {
    let snapshot = state.policies.snapshot();
    state.metrics.set_active_policies(snapshot.len());
    Json(snapshot.to_vec())
}

/// `GET /api/v1/policies/{rule_id}`
pub async fn get(
    State(state): State<AppState>,
    Path(rule_id): Path<String>,
) -> Result<Json<Rule>, ApiError> {
    state
        .policies
        .get(&rule_id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("policy"))
}

/// `POST /api/v1/policies`
pub async fn create(
    State(state): State<AppState>,
    Json(raw): Json<Value>,
) -> Result<Response, ApiError> {
    let rule: Rule =
        serde_json::from_value(raw).map_err(|err| ApiError::bad_request(err.to_string()))?;

    let created = state.policies.create(rule).map_err(map_policy_error)?;
    tracing::info!(rule_id = %created.rule_id, name = %created.name, "policy created");
    state
        .metrics
        .set_active_policies(state.policies.snapshot().len());
    Ok((StatusCode::CREATED, Json(created)).into_response())
}

/// `DELETE /api/v1/policies/{rule_id}`
pub async fn delete(
    State(state): State<AppState>,
    Path(rule_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.policies.delete(&rule_id).map_err(map_policy_error)?;
    tracing::info!(rule_id = %rule_id, "policy deleted");
    state
        .metrics
        .set_active_policies(state.policies.snapshot().len());
    Ok(StatusCode::NO_CONTENT)
}

fn map_policy_error(err: PolicyError) -> ApiError {
    match err {
        PolicyError::Duplicate(rule_id) => ApiError::duplicate_rule(rule_id),
        PolicyError::NotFound(_) => ApiError::not_found("policy"),
        PolicyError::Invalid(reason) => ApiError::bad_request(reason),
        PolicyError::Storage(reason) => sentinel_core::GatewayError::Internal(reason).into(),
    }
}
