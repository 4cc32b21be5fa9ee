//! HTTP error mapping.
//!
//! Every pipeline error maps to a stable JSON body and status. Internal
//! errors never expose detail: callers get a fixed message plus the
//! request id when one exists; the cause stays in the server log.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use sentinel_core::GatewayError;
use serde_json::json;
use uuid::Uuid;

#[derive(Debug)]
enum Inner {
    Gateway(GatewayError),
    /// A create collided with an existing rule id. 409.
    DuplicateRule(String),
}

/// An error leaving the HTTP surface.
#[derive(Debug)]
pub struct ApiError {
    inner: Inner,
    request_id: Option<Uuid>,
}

impl ApiError {
    /// Attaches the request id for internal-error bodies.
    #[must_use]
    pub fn with_request_id(mut self, request_id: Uuid) -> Self {
        self.request_id = Some(request_id);
        self
    }

    /// A bad-request error with a caller-visible reason.
    #[must_use]
    pub fn bad_request(reason: impl Into<String>) -> Self {
        GatewayError::BadRequest(reason.into()).into()
    }

    /// A not-found error naming the missing entity.
    #[must_use]
    pub fn not_found(what: impl Into<String>) -> Self {
        GatewayError::NotFound(what.into()).into()
    }

    /// A duplicate-rule conflict.
    #[must_use]
    pub fn duplicate_rule(rule_id: impl Into<String>) -> Self {
        Self {
            inner: Inner::DuplicateRule(rule_id.into()),
            request_id: None,
        }
    }

    fn status_code(&self) -> StatusCode {
        match &self.inner {
            Inner::DuplicateRule(_) => StatusCode::CONFLICT,
            Inner::Gateway(err) => match err {
                GatewayError::Unauthenticated => StatusCode::UNAUTHORIZED,
                GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
                GatewayError::PolicyStoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                GatewayError::CallbackConflict { .. } => StatusCode::CONFLICT,
                GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
                GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
                GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(inner: GatewayError) -> Self {
        Self {
            inner: Inner::Gateway(inner),
            request_id: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match &self.inner {
            Inner::DuplicateRule(rule_id) => json!({
                "error": "duplicate_rule",
                "message": format!("rule {rule_id:?} already exists"),
            }),
            Inner::Gateway(err) => match err {
                GatewayError::Unauthenticated => json!({
                    "error": "unauthorized",
                    "message": "Missing or invalid API key",
                }),
                GatewayError::RateLimited { retry_after_secs } => json!({
                    "error": "rate_limit_exceeded",
                    "message": "Too many requests",
                    "retry_after": retry_after_secs,
                }),
                GatewayError::PolicyStoreUnavailable(_) => json!({
                    "error": "policy_store_unavailable",
                    "message": "Policy store unavailable",
                }),
                GatewayError::CallbackConflict { current } => json!({
                    "error": "callback_conflict",
                    "message": format!("Approval already resolved as {current}"),
                    "current_state": current.as_str(),
                }),
                GatewayError::NotFound(what) => json!({
                    "error": "not_found",
                    "message": format!("{what} not found"),
                }),
                GatewayError::BadRequest(reason) => json!({
                    "error": "bad_request",
                    "message": reason,
                }),
                GatewayError::Internal(cause) => {
                    tracing::error!(
                        error = %cause,
                        request_id = ?self.request_id,
                        "internal error"
                    );
                    json!({
                        "error": "internal_error",
                        "message": "An unexpected error occurred",
                        "request_id": self.request_id.map(|id| id.to_string()),
                    })
                }
            },
        };

        let mut response = (status, Json(body)).into_response();
        if let Inner::Gateway(GatewayError::RateLimited { retry_after_secs }) = &self.inner {
            if let Ok(value) = retry_after_secs.to_string().parse() {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}
