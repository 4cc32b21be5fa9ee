//! The inbound action description evaluated by the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// The operation an agent is asking to perform on a target resource.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Read-only database access.
    DatabaseQuery,
    /// Mutating database access.
    DatabaseWrite,
    /// Outbound call to a third-party API.
    ApiCall,
    /// Filesystem or object-store access.
    FileAccess,
    /// Moving money out.
    Payment,
    /// Returning money to a customer.
    Refund,
    /// Access to end-user records.
    UserDataAccess,
    /// Privileged administrative operation.
    AdminAction,
}

impl ActionType {
    /// Stable wire name, matching the serde representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DatabaseQuery => "database_query",
            Self::DatabaseWrite => "database_write",
            Self::ApiCall => "api_call",
            Self::FileAccess => "file_access",
            Self::Payment => "payment",
            Self::Refund => "refund",
            Self::UserDataAccess => "user_data_access",
            Self::AdminAction => "admin_action",
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single agent action awaiting a governance decision.
///
/// `request_id` is server-assigned; callers never choose it. `parameters`
/// and `context` are free-form JSON mappings; a missing mapping is treated
/// as empty, never as an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    /// Server-assigned unique id for this evaluation.
    pub request_id: Uuid,
    /// The authenticated agent performing the action.
    pub agent_id: String,
    /// What kind of operation is being attempted.
    pub action_type: ActionType,
    /// The resource the action targets, e.g. `payments/refund`.
    pub target_resource: String,
    /// Declared action parameters.
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Caller-supplied context (justifications, trace ids, ...).
    #[serde(default)]
    pub context: Map<String, Value>,
    /// When the gateway accepted the request.
    pub received_at: DateTime<Utc>,
}

impl AgentRequest {
    /// Builds a request with a fresh server-assigned id, stamped now.
    #[must_use]
    pub fn new(
        agent_id: impl Into<String>,
        action_type: ActionType,
        target_resource: impl Into<String>,
        parameters: Map<String, Value>,
        context: Map<String, Value>,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            agent_id: agent_id.into(),
            action_type,
            target_resource: target_resource.into(),
            parameters,
            context,
            received_at: Utc::now(),
        }
    }

    /// Numeric `amount` parameter, if present and numeric.
    #[must_use]
    pub fn amount(&self) -> Option<f64> {
        self.parameters.get("amount").and_then(Value::as_f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_type_wire_names_round_trip() {
        for action in [
            ActionType::DatabaseQuery,
            ActionType::DatabaseWrite,
            ActionType::ApiCall,
            ActionType::FileAccess,
            ActionType::Payment,
            ActionType::Refund,
            ActionType::UserDataAccess,
            ActionType::AdminAction,
        ] {
            let json = serde_json::to_string(&action).unwrap();
            assert_eq!(json, format!("\"{}\"", action.as_str()));
            let back: ActionType = serde_json::from_str(&json).unwrap();
            assert_eq!(back, action);
        }
    }

    #[test]
    fn test_missing_parameters_deserialize_as_empty() {
        let json = serde_json::json!({
            "request_id": Uuid::new_v4(),
            "agent_id": "support-bot",
            "action_type": "refund",
            "target_resource": "payments/refund",
            "received_at": Utc::now(),
        });
        let request: AgentRequest = serde_json::from_value(json).unwrap();
        assert!(request.parameters.is_empty());
        assert!(request.context.is_empty());
    }

    #[test]
    fn test_amount_extraction() {
        let mut parameters = Map::new();
        parameters.insert("amount".into(), serde_json::json!(750));
        let request = AgentRequest::new(
            "support-bot",
            ActionType::Refund,
            "payments/refund",
            parameters,
            Map::new(),
        );
        assert_eq!(request.amount(), Some(750.0));
    }
}
