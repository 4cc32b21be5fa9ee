//! # sentinel-core
//!
//! Core library for Sentinel, a zero-trust policy gateway between
//! autonomous agents and the backend systems they act on.
//!
//! For every agent action the pipeline authenticates the caller, checks
//! its rate budget, masks sensitive fields, scores the action against a
//! live rule set, and emits one of three decisions: allow, deny, or
//! pending human approval. Every evaluation lands in an append-only audit
//! trail.
//!
//! ## Components
//!
//! - **Authentication**: constant-time key gate and agent resolution
//! - **Rate limiting**: fixed-window budgets over a shared counter store
//! - **Policy store**: durable rules with a copy-on-write snapshot cache
//! - **PII sanitization**: detection and masking with a declared fallback
//! - **Risk evaluation**: a pure function over (request, snapshot, time)
//! - **Decision engine**: thresholds plus the observe/enforce breaker
//! - **Approvals**: an explicit state machine with webhook escalation
//! - **Audit**: best-effort durable entries with observable loss
//!
//! ## Example
//!
//! ```rust,no_run
//! use sentinel_core::policy::PolicyStore;
//! use std::sync::{Arc, Mutex};
//!
//! let conn = Arc::new(Mutex::new(rusqlite::Connection::open("sentinel.db")?));
//! let policies = PolicyStore::open(conn)?;
//! policies.seed_defaults()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod approval;
pub mod audit;
pub mod auth;
pub mod config;
pub mod decision;
pub mod error;
pub mod forward;
pub mod gateway;
pub mod metrics;
pub mod mode;
pub mod pii;
pub mod policy;
pub mod ratelimit;
pub mod request;
pub mod risk;
pub mod store;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::auth::{AgentIdentity, KeyStore};
    pub use crate::config::Config;
    pub use crate::decision::{Decision, RiskLevel, Thresholds};
    pub use crate::gateway::{EvaluateOutcome, Gateway};
    pub use crate::mode::{GatewayMode, ModeController};
    pub use crate::policy::{PolicyStore, Rule};
    pub use crate::request::{ActionType, AgentRequest};
}

pub use config::Config;
pub use decision::Decision;
pub use error::GatewayError;
pub use gateway::Gateway;
pub use mode::GatewayMode;
pub use request::AgentRequest;
