//! The paginated audit query endpoint.

use axum::extract::{Query, State};
use axum::Json;
use sentinel_core::audit::AuditQuery;
use sentinel_core::decision::Decision;
use sentinel_core::request::ActionType;
use serde::Deserialize;
use serde_json::{json, Value};

use super::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct AuditLogsQuery {
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub action_type: Option<String>,
    #[serde(default)]
    pub decision: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

/// `GET /api/v1/audit/logs`
pub async fn logs(
    State(state): State<AppState>,
    Query(query): Query<AuditLogsQuery>,
) -> Result<Json<Value>, ApiError> {
    let action_type = query
        .action_type
        .map(|raw| parse_enum::<ActionType>(&raw, "action_type"))
        .transpose()?;
    let decision = query
        .decision
        .map(|raw| parse_enum::<Decision>(&raw, "decision"))
        .transpose()?;

    let limit = query.limit.unwrap_or(100);
    let offset = query.offset.unwrap_or(0);
    let entries = state
        .audit
        .query(&AuditQuery {
            agent_id: query.agent_id,
            action_type,
            decision,
            limit,
            offset,
        })
        .map_err(|err| sentinel_core::GatewayError::internal(err))?;

    let count = entries.len();
    Ok(Json(json!({
        "logs": entries,
        "count": count,
        "limit": limit,
        "offset": offset,
    })))
}

fn parse_enum<T: serde::de::DeserializeOwned>(raw: &str, field: &str) -> Result<T, ApiError> {
    serde_json::from_value(Value::String(raw.to_string()))
        .map_err(|_| ApiError::bad_request(format!("invalid {field}: {raw:?}")))
}
