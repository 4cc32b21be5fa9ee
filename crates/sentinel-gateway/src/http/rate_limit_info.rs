//! Rate window introspection for the calling agent.

use axum::extract::State;
use axum::{Extension, Json};
use chrono::Utc;
use sentinel_core::auth::AgentIdentity;
use sentinel_core::ratelimit::RateWindowInfo;

use crate::state::AppState;

/// `GET /api/v1/rate-limit`
pub async fn info(
    State(state): State<AppState>,
    Extension(identity): Extension<AgentIdentity>,
) -> Json<RateWindowInfo> {
    Json(state.limiter.info(&identity, Utc::now()).await)
}
