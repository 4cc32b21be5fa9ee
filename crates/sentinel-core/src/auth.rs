//! API key resolution for agent callers.
//!
//! # Security Model
//!
//! Authentication is a two-step gate:
//!
//! 1. **Prefix check**: the key must start with [`API_KEY_PREFIX`], compared
//!    in constant time. Anything without the marker is rejected without
//!    consulting the store, so malformed probes never reach the lookup path.
//! 2. **Store lookup**: the key must resolve to a registered, enabled agent.
//!
//! A well-formed key for a disabled agent is indistinguishable from an
//! unknown key to the caller. Raw keys are never logged; log records carry
//! only a short prefix.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, warn};

/// Marker every agent key must carry.
pub const API_KEY_PREFIX: &str = "agent_sk_";

/// Minimum acceptable key length, prefix included.
pub const API_KEY_MIN_LENGTH: usize = 32;

/// How much of a rejected key is safe to log.
const LOGGED_KEY_PREFIX_LEN: usize = 12;

/// Authentication failures.
///
/// Deliberately a single externally visible variant: the caller learns
/// nothing about *why* a key was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// The key is missing, malformed, unknown, or belongs to a disabled
    /// agent.
    #[error("invalid API key")]
    Unauthenticated,
}

/// The resolved identity of an authenticated agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    /// Stable agent identifier.
    pub agent_id: String,
    /// Action scopes granted to this agent. `*` grants everything.
    pub scopes: BTreeSet<String>,
    /// Per-agent request budget overriding the gateway default.
    pub rate_limit_override: Option<u32>,
}

struct KeyRecord {
    identity: AgentIdentity,
    enabled: bool,
}

/// In-memory key → agent mapping.
///
/// Lookup is a read-locked map access; sub-millisecond is the budget here
/// and a `HashMap` behind `RwLock` comfortably holds it. Key material would
/// come from the relational store in a fuller deployment; the map refresh
/// path is [`KeyStore::register`] / [`KeyStore::set_enabled`].
pub struct KeyStore {
    keys: RwLock<HashMap<String, KeyRecord>>,
}

impl Default for KeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a store seeded with the development/demo agents.
    #[must_use]
    pub fn with_seeded_agents() -> Self {
        let store = Self::new();
        store.register(
            "agent_sk_test_key_12345678901234567890",
            AgentIdentity {
                agent_id: "test_agent".into(),
                scopes: BTreeSet::from(["*".to_string()]),
                rate_limit_override: Some(1000),
            },
        );
        store.register(
            "agent_sk_demo_key_abcdefghijklmnopqrst",
            AgentIdentity {
                agent_id: "demo_agent".into(),
                scopes: BTreeSet::from(["database_query".to_string(), "api_call".to_string()]),
                rate_limit_override: Some(500),
            },
        );
        store
    }

    /// Registers a key. Returns `false` (and registers nothing) when the
    /// key lacks the required prefix or minimum length.
    pub fn register(&self, key: &str, identity: AgentIdentity) -> bool {
        if !has_valid_shape(key) {
            return false;
        }
        let mut keys = self
            .keys
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        keys.insert(
            key.to_string(),
            KeyRecord {
                identity,
                enabled: true,
            },
        );
        true
    }

    /// Enables or disables every key belonging to `agent_id`. Returns the
    /// number of keys affected.
    pub fn set_enabled(&self, agent_id: &str, enabled: bool) -> usize {
        let mut keys = self
            .keys
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut affected = 0;
        for record in keys.values_mut() {
            if record.identity.agent_id == agent_id {
                record.enabled = enabled;
                affected += 1;
            }
        }
        affected
    }

    /// Resolves a raw bearer token to an agent identity.
    ///
    /// # Errors
    ///
    /// [`AuthError::Unauthenticated`] for any key that fails the shape gate,
    /// is unknown, or belongs to a disabled agent.
    pub fn authenticate(&self, raw_key: &str) -> Result<AgentIdentity, AuthError> {
        if !has_valid_shape(raw_key) {
            warn!(
                key_prefix = truncated(raw_key),
                "authentication failed: malformed key"
            );
            return Err(AuthError::Unauthenticated);
        }

        let keys = self
            .keys
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match keys.get(raw_key) {
            Some(record) if record.enabled => {
                debug!(agent_id = %record.identity.agent_id, "authentication successful");
                Ok(record.identity.clone())
            }
            Some(record) => {
                warn!(
                    agent_id = %record.identity.agent_id,
                    "authentication failed: agent disabled"
                );
                Err(AuthError::Unauthenticated)
            }
            None => {
                warn!(
                    key_prefix = truncated(raw_key),
                    "authentication failed: unknown key"
                );
                Err(AuthError::Unauthenticated)
            }
        }
    }
}

/// Constant-time prefix and length gate.
fn has_valid_shape(raw_key: &str) -> bool {
    if raw_key.len() < API_KEY_MIN_LENGTH {
        return false;
    }
    let prefix = API_KEY_PREFIX.as_bytes();
    // Length was checked above, so the slice cannot panic.
    bool::from(raw_key.as_bytes()[..prefix.len()].ct_eq(prefix))
}

fn truncated(raw_key: &str) -> &str {
    let mut end = raw_key.len().min(LOGGED_KEY_PREFIX_LEN);
    while !raw_key.is_char_boundary(end) {
        end -= 1;
    }
    &raw_key[..end]
}
