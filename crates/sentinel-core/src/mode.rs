//! Gateway operating mode and its process-wide controller.
//!
//! The mode is a single atomic read on the hot path. Mutation goes through
//! [`ModeController::set`], which also mirrors the value into the shared
//! store under the `mode` key so that peer instances converge, and notifies
//! in-process subscribers over a watch channel.
//!
//! In `Observe` the pipeline still computes and audits the true decision,
//! but the response returned to the caller is allow-shaped with the true
//! decision carried in `observed_decision`. `Enforce` passes decisions
//! through. Observe exists so a new rule set can be rolled out against live
//! traffic without blocking anything.

use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::store::SharedStore;

/// Store key under which the current mode is mirrored for peer instances.
pub const MODE_STORE_KEY: &str = "mode";

/// Operating mode for the decision engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GatewayMode {
    /// Log-only: non-allow decisions are rewritten to observed allows.
    Observe,
    /// Enforcing: decisions are returned as computed.
    Enforce,
}

impl GatewayMode {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Observe => 0,
            Self::Enforce => 1,
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Observe,
            _ => Self::Enforce,
        }
    }

    /// Stable wire name (`OBSERVE` / `ENFORCE`).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Observe => "OBSERVE",
            Self::Enforce => "ENFORCE",
        }
    }
}

impl std::fmt::Display for GatewayMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GatewayMode {
    type Err = InvalidMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "OBSERVE" => Ok(Self::Observe),
            "ENFORCE" => Ok(Self::Enforce),
            _ => Err(InvalidMode(s.to_string())),
        }
    }
}

/// Error returned when a mode string is not recognized.
#[derive(Debug, thiserror::Error)]
#[error("invalid gateway mode: {0:?} (expected OBSERVE or ENFORCE)")]
pub struct InvalidMode(pub String);

/// Process-wide mode holder.
///
/// Readers take a relaxed atomic load; the only writer is [`Self::set`].
pub struct ModeController {
    mode: AtomicU8,
    tx: watch::Sender<GatewayMode>,
    store: Option<Arc<dyn SharedStore>>,
}

impl ModeController {
    /// Creates a controller initialized to `initial`, mirroring changes into
    /// `store` when one is provided.
    #[must_use]
    pub fn new(initial: GatewayMode, store: Option<Arc<dyn SharedStore>>) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self {
            mode: AtomicU8::new(initial.as_u8()),
            tx,
            store,
        }
    }

    /// The current mode.
    ///
    /// Relaxed ordering is sufficient: the mode is an independent flag with
    /// no data published alongside it.
    #[must_use]
    pub fn current(&self) -> GatewayMode {
        GatewayMode::from_u8(self.mode.load(Ordering::Relaxed))
    }

    /// Switches the mode, returning the previous value.
    ///
    /// Takes effect atomically within this instance and is published to the
    /// shared store for peers. A store failure downgrades to a warning: the
    /// local switch still holds.
    pub async fn set(&self, mode: GatewayMode) -> GatewayMode {
        let old = GatewayMode::from_u8(self.mode.swap(mode.as_u8(), Ordering::Relaxed));
        if old != mode {
            info!(old_mode = %old, new_mode = %mode, "gateway mode changed");
        }
        let _ = self.tx.send(mode);
        if let Some(store) = &self.store {
            if let Err(err) = store.put(MODE_STORE_KEY, mode.as_str(), None).await {
                warn!(error = %err, "failed to publish mode to shared store");
            }
        }
        old
    }

    /// Subscribes to mode changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<GatewayMode> {
        self.tx.subscribe()
    }
}
