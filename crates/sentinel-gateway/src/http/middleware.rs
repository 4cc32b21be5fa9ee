//! Authentication and rate-limit middleware.
//!
//! Both run only on the protected router; `/health` and `/metrics` are
//! merged outside the layered routes. Authentication runs first and
//! deposits the resolved [`AgentIdentity`] as a request extension; the
//! rate limiter reads it from there.

use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use sentinel_core::auth::AgentIdentity;
use sentinel_core::GatewayError;

use super::error::ApiError;
use crate::state::AppState;

/// Resolves the bearer token to an agent identity.
pub async fn authenticate(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let header = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let Some(raw_key) = header.strip_prefix("Bearer ") else {
        return ApiError::from(GatewayError::Unauthenticated).into_response();
    };

    match state.keys.authenticate(raw_key) {
        Ok(identity) => {
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        Err(_) => ApiError::from(GatewayError::Unauthenticated).into_response(),
    }
}

/// Enforces the caller's window budget and decorates responses with the
/// standard rate headers.
pub async fn rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(identity) = request.extensions().get::<AgentIdentity>().cloned() else {
        // Authentication did not run for this route; nothing to meter.
        return next.run(request).await;
    };

    let decision = state.limiter.check(&identity, Utc::now()).await;
    if decision.degraded {
        state.metrics.record_rate_limit_degraded();
    }

    if !decision.allowed {
        state.metrics.record_rate_limited(&identity.agent_id);
        tracing::warn!(agent_id = %identity.agent_id, "rate limit exceeded");
        return ApiError::from(GatewayError::RateLimited {
            retry_after_secs: state.limiter.window_secs(),
        })
        .into_response();
    }

    let limit = state.limiter.limit_for(&identity);
    let remaining = decision.remaining;
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&limit.to_string()) {
        headers.insert("X-RateLimit-Limit", value);
    }
    if let Ok(value) = HeaderValue::from_str(&remaining.to_string()) {
        headers.insert("X-RateLimit-Remaining", value);
    }
    if let Ok(value) = HeaderValue::from_str(&decision.reset_at.timestamp().to_string()) {
        headers.insert("X-RateLimit-Reset", value);
    }
    response
}
