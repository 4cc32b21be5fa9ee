//! The shared counter/cache store seam.
//!
//! Rate counters, the mirrored gateway mode, and transient approval state
//! live in a key/value store shared between gateway instances. This module
//! fixes the contract as a trait; the bundled [`MemoryStore`] is the
//! single-instance implementation. A Redis-backed implementation plugs in
//! behind the same trait without touching any caller.
//!
//! Callers must treat every operation as fallible I/O with its own policy
//! on error: the rate limiter fails open, the mode controller downgrades
//! to a warning. Nothing in this crate treats a store failure as fatal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;

/// How often (in operations) the in-memory store sweeps expired entries.
const CLEANUP_INTERVAL: u64 = 256;

/// Errors from the shared store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or the operation timed out.
    #[error("shared store unavailable: {0}")]
    Unavailable(String),
}

/// Key/value store shared between gateway instances.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Atomically increments `key`, creating it with the given lifetime on
    /// first touch, and returns the post-increment count.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64, StoreError>;

    /// Reads a value.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Writes a value with an optional lifetime.
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Removes a key. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Cheap liveness probe for health reporting.
    async fn ping(&self) -> bool;
}

struct Entry {
    value: String,
    counter: u64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process [`SharedStore`] for single-instance deployments and tests.
///
/// Expired entries are reaped lazily on access plus a periodic sweep every
/// [`CLEANUP_INTERVAL`] operations, so memory stays bounded by the live key
/// set.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<HashMap<String, Entry>>,
    op_count: AtomicU64,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) keys. Useful for tests and monitoring.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let state = self
            .state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.values().filter(|e| !e.expired(now)).count()
    }

    /// True when no live keys exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn maybe_sweep(&self) {
        let count = self.op_count.fetch_add(1, Ordering::Relaxed);
        if count > 0 && count % CLEANUP_INTERVAL == 0 {
            let now = Instant::now();
            let mut state = self
                .state
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            state.retain(|_, entry| !entry.expired(now));
        }
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        self.maybe_sweep();
        let now = Instant::now();
        let mut state = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = state.entry(key.to_string()).or_insert_with(|| Entry {
            value: String::new(),
            counter: 0,
            expires_at: Some(now + ttl),
        });
        if entry.expired(now) {
            entry.counter = 0;
            entry.expires_at = Some(now + ttl);
        }
        entry.counter += 1;
        entry.value = entry.counter.to_string();
        Ok(entry.counter)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.maybe_sweep();
        let now = Instant::now();
        let state = self
            .state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(state
            .get(key)
            .filter(|entry| !entry.expired(now))
            .map(|entry| entry.value.clone()))
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.maybe_sweep();
        let mut state = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                counter: 0,
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut state = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.remove(key);
        Ok(())
    }

    async fn ping(&self) -> bool {
        true
    }
}

/// A store that fails every operation. Exercises fail-open/fail-closed
/// paths in tests.
pub struct UnavailableStore;

#[async_trait]
impl SharedStore for UnavailableStore {
    async fn incr(&self, _key: &str, _ttl: Duration) -> Result<u64, StoreError> {
        Err(StoreError::Unavailable("test store is down".into()))
    }

    async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Err(StoreError::Unavailable("test store is down".into()))
    }

    async fn put(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("test store is down".into()))
    }

    async fn delete(&self, _key: &str) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("test store is down".into()))
    }

    async fn ping(&self) -> bool {
        false
    }
}
