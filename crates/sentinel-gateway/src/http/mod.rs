//! The HTTP surface: router assembly, middleware, and handlers.
//!
//! Authorization is required everywhere except `/`, `/health`, and
//! `/metrics`; those routes are merged outside the layered (protected)
//! router, so the auth and rate-limit middleware never see them.

pub mod approvals;
pub mod audit;
pub mod error;
pub mod evaluate;
pub mod health;
pub mod middleware;
pub mod mode;
pub mod policies;
pub mod rate_limit_info;

use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::{from_fn_with_state, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

/// Builds the complete application router.
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/v1/gateway/evaluate", post(evaluate::evaluate))
        .route(
            "/api/v1/gateway/mode",
            get(mode::get_mode).put(mode::set_mode),
        )
        .route(
            "/api/v1/policies",
            get(policies::list).post(policies::create),
        )
        .route(
            "/api/v1/policies/{rule_id}",
            get(policies::get).delete(policies::delete),
        )
        .route("/api/v1/approvals/{approval_id}", get(approvals::status))
        .route(
            "/api/v1/approvals/{approval_id}/callback",
            post(approvals::callback),
        )
        .route("/api/v1/audit/logs", get(audit::logs))
        .route("/api/v1/rate-limit", get(rate_limit_info::info))
        .layer(from_fn_with_state(state.clone(), middleware::rate_limit))
        .layer(from_fn_with_state(state.clone(), middleware::authenticate));

    let public = Router::new()
        .route("/", get(health::root))
        .route("/health", get(health::health))
        .route("/metrics", get(health::metrics));

    public
        .merge(protected)
        .layer(axum::middleware::from_fn(request_id))
        .with_state(state)
}

/// Stamps every response with an `X-Request-Id`.
async fn request_id(request: Request, next: Next) -> Response {
    let id = uuid::Uuid::new_v4().to_string();
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response
            .headers_mut()
            .entry("X-Request-Id")
            .or_insert(value);
    }
    response
}
