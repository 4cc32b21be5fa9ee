//! Gateway mode endpoints.

use axum::extract::{Query, State};
use axum::Json;
use sentinel_core::mode::GatewayMode;
use serde::Deserialize;
use serde_json::{json, Value};

use super::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ModeQuery {
    /// Mode passed as `?mode=` instead of a body.
    #[serde(default)]
    pub mode: Option<String>,
}

/// `GET /api/v1/gateway/mode`
pub async fn get_mode(State(state): State<AppState>) -> Json<Value> {
    let mode = state.mode.current();
    Json(json!({
        "mode": mode.as_str(),
        "description": describe(mode),
    }))
}

/// `PUT /api/v1/gateway/mode`
///
/// Accepts the mode either as `?mode=` or as a JSON body
/// (`{"mode": "OBSERVE"}` or a bare string).
pub async fn set_mode(
    State(state): State<AppState>,
    Query(query): Query<ModeQuery>,
    body: axum::body::Bytes,
) -> Result<Json<Value>, ApiError> {
    let from_body = || {
        let value: Value = serde_json::from_slice(&body).ok()?;
        match value {
            Value::String(s) => Some(s),
            Value::Object(map) => map
                .get("mode")
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        }
    };
    let raw = query
        .mode
        .or_else(from_body)
        .ok_or_else(|| ApiError::bad_request("missing mode"))?;

    let mode: GatewayMode = raw
        .parse()
        .map_err(|err: sentinel_core::mode::InvalidMode| ApiError::bad_request(err.to_string()))?;

    let old = state.mode.set(mode).await;
    Ok(Json(json!({
        "status": "updated",
        "old_mode": old.as_str(),
        "new_mode": mode.as_str(),
    })))
}

const fn describe(mode: GatewayMode) -> &'static str {
    match mode {
        GatewayMode::Observe => "Observe mode: unsafe actions are logged but NOT blocked",
        GatewayMode::Enforce => "Enforce mode: unsafe actions are blocked",
    }
}
