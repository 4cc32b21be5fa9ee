//! The pluggable target-system sink.
//!
//! Forwarding an allowed action to the backend it targets is a deployment
//! concern; this crate fixes only the contract. The audit trail records a
//! SHA-256 digest of whatever the target returned, never the body.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::request::AgentRequest;

/// Errors from a forward sink.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The target system rejected or failed the action.
    #[error("forwarding failed: {0}")]
    Failed(String),
}

/// What came back from the target system.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardReceipt {
    /// SHA-256 hex digest of the target response, when one was received.
    pub response_digest: Option<String>,
}

/// Delivers allowed actions to their target systems.
#[async_trait]
pub trait ForwardSink: Send + Sync {
    /// Forwards one allowed request. Implementations receive the
    /// **original** (unmasked) parameters; the sanitized copy never takes
    /// this path.
    async fn forward(&self, request: &AgentRequest) -> Result<ForwardReceipt, ForwardError>;
}

/// Hex SHA-256 of a response body, for the audit digest.
#[must_use]
pub fn response_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    let digest = hasher.finalize();
    digest.iter().fold(String::with_capacity(64), |mut acc, b| {
        use std::fmt::Write;
        let _ = write!(acc, "{b:02x}");
        acc
    })
}

/// A sink that acknowledges without delivering anywhere. The default when
/// no target transport is configured.
pub struct NullSink;

#[async_trait]
impl ForwardSink for NullSink {
    async fn forward(&self, _request: &AgentRequest) -> Result<ForwardReceipt, ForwardError> {
        Ok(ForwardReceipt::default())
    }
}

/// A sink that records everything it forwards. For tests.
#[derive(Default)]
pub struct RecordingSink {
    forwarded: std::sync::Mutex<Vec<AgentRequest>>,
}

impl RecordingSink {
    /// Creates an empty recording sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests forwarded so far.
    #[must_use]
    pub fn forwarded(&self) -> Vec<AgentRequest> {
        self.forwarded
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ForwardSink for RecordingSink {
    async fn forward(&self, request: &AgentRequest) -> Result<ForwardReceipt, ForwardError> {
        let body = serde_json::to_vec(&request.parameters).unwrap_or_default();
        self.forwarded
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(request.clone());
        Ok(ForwardReceipt {
            response_digest: Some(response_digest(&body)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ActionType;

    #[test]
    fn test_digest_is_stable_hex() {
        let a = response_digest(b"hello");
        let b = response_digest(b"hello");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, response_digest(b"world"));
    }

    #[tokio::test]
    async fn test_recording_sink_sees_original_parameters() {
        let sink = RecordingSink::new();
        let mut parameters = serde_json::Map::new();
        parameters.insert("ssn".into(), serde_json::json!("123-45-6789"));
        let request = AgentRequest::new(
            "support-bot",
            ActionType::Refund,
            "payments/refund",
            parameters,
            serde_json::Map::new(),
        );

        let receipt = sink.forward(&request).await.unwrap();
        assert!(receipt.response_digest.is_some());

        let seen = sink.forwarded();
        assert_eq!(seen.len(), 1);
        // The forward path carries the original, not the masked copy.
        assert_eq!(
            seen[0].parameters.get("ssn").unwrap().as_str().unwrap(),
            "123-45-6789"
        );
    }
}
