//! Top-level error types for the gateway pipeline.
//!
//! Subsystems define their own error enums (`AuthError`, `PolicyError`,
//! `ApprovalError`, ...); this module defines the [`GatewayError`] that the
//! pipeline and the HTTP layer agree on. Each variant corresponds to one of
//! the externally observable failure kinds:
//!
//! - `Unauthenticated`, `RateLimited`, `BadRequest`, `NotFound`,
//!   `CallbackConflict` are reported to the caller with the matching HTTP
//!   status.
//! - Degradations (sanitizer fallback, webhook failure, audit buffering) are
//!   **not** errors at this level: the pipeline absorbs them, counts them,
//!   and carries on.
//! - `Internal` never exposes underlying detail to the caller; the stable
//!   message plus the request id is all that leaves the process.

use thiserror::Error;

use crate::approval::ApprovalState;

/// Errors surfaced by the gateway pipeline and mapped to HTTP statuses by
/// the serving layer.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The caller could not be resolved to an enabled agent.
    #[error("unauthenticated")]
    Unauthenticated,

    /// The caller exceeded its request budget for the current window.
    #[error("rate limit exceeded")]
    RateLimited {
        /// Seconds until the current window resets.
        retry_after_secs: u64,
    },

    /// The rule store is unreachable and no snapshot exists to fall back to.
    ///
    /// The pipeline fails closed in this state: requests are denied with an
    /// explanatory reason because they cannot be evaluated.
    #[error("policy store unavailable: {0}")]
    PolicyStoreUnavailable(String),

    /// A terminal approval record received a conflicting decision.
    #[error("approval already resolved as {current}")]
    CallbackConflict {
        /// The terminal state the record is already in.
        current: ApprovalState,
    },

    /// The referenced entity does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// The request was structurally invalid.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Unexpected failure. The message shown to callers is stable and
    /// detail-free; the cause string is logged server-side only.
    #[error("internal error")]
    Internal(String),
}

impl GatewayError {
    /// Wraps an arbitrary error as an internal failure, keeping its
    /// rendering for server-side logs only.
    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        Self::Internal(err.to_string())
    }
}
