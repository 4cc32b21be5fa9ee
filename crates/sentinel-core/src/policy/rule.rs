//! Policy rules and their condition vocabulary.
//!
//! Conditions are a tagged enum rather than a free-form mapping: parsing
//! happens once at the edge, and the evaluation hot path is a branch table.
//! Unknown keys are captured explicitly as [`Condition::Unknown`]: a rule
//! carrying one never matches (fail-safe) and the evaluator records a
//! warning. The create API rejects unknown keys up front via
//! [`ConditionSet::unknown_keys`].

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::request::{ActionType, AgentRequest};

/// A named predicate over request shape contributing a risk modifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Unique, immutable identifier.
    pub rule_id: String,
    /// Human-readable name, used in decision reasons.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Action types this rule applies to. Empty matches any action.
    #[serde(default)]
    pub action_types: BTreeSet<ActionType>,
    /// The conditions that must all hold for the rule to match.
    #[serde(default)]
    pub conditions: ConditionSet,
    /// Risk contributed when the rule matches. Non-negative, at most 1.
    pub risk_score_modifier: f64,
    /// Disabled rules never match.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Higher priorities are reported first and win the reason string.
    #[serde(default)]
    pub priority: i32,
    /// Creation time.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Last update time.
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

const fn default_enabled() -> bool {
    true
}

impl Rule {
    /// Validates field invariants for rules arriving over the API.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason when the rule id is empty, the
    /// modifier is outside `[0, 1]`, or a condition key is unknown.
    pub fn validate(&self) -> Result<(), String> {
        if self.rule_id.trim().is_empty() {
            return Err("rule_id must not be empty".into());
        }
        if !(0.0..=1.0).contains(&self.risk_score_modifier) {
            return Err(format!(
                "risk_score_modifier {} is outside [0, 1]",
                self.risk_score_modifier
            ));
        }
        let unknown = self.conditions.unknown_keys();
        if !unknown.is_empty() {
            return Err(format!("unknown condition keys: {}", unknown.join(", ")));
        }
        Ok(())
    }

    /// True when this rule applies to the request's action type.
    #[must_use]
    pub fn applies_to(&self, action: ActionType) -> bool {
        self.action_types.is_empty() || self.action_types.contains(&action)
    }
}

/// One recognized condition. Every variant evaluates to "matches" or
/// "does not match" against a request at a given instant.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Matches when `parameters.amount` exists and exceeds the value.
    MaxAmount(f64),
    /// Matches when `parameters.amount` exists and is below the value.
    MinAmount(f64),
    /// Matches when `target_resource` contains any listed name as a path
    /// segment.
    ProtectedResources(Vec<String>),
    /// Matches when `parameters.table` is one of the listed tables.
    ProtectedTables(Vec<String>),
    /// Matches when `parameters.affected_rows` exceeds the value.
    MaxAffectedRows(u64),
    /// Matches when any listed field is absent from `parameters`.
    RequiresFields(Vec<String>),
    /// Matches when the current UTC weekday is in the set.
    BlockedDays(Vec<Weekday>),
    /// Matches when the current UTC hour is inside `[start, end)`.
    /// A start after the end wraps past midnight.
    BlockedHours {
        /// First blocked hour (inclusive).
        start: u32,
        /// First unblocked hour (exclusive).
        end: u32,
    },
    /// Matches when `context.justification` is absent or shorter than ten
    /// characters.
    RequireJustification,
    /// A key this gateway version does not recognize. Never matches; the
    /// evaluator records a warning when it encounters one.
    Unknown {
        /// The unrecognized condition key.
        key: String,
        /// Its raw value, preserved for round-tripping.
        value: Value,
    },
}

impl Condition {
    /// The wire key for this condition.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::MaxAmount(_) => "max_amount",
            Self::MinAmount(_) => "min_amount",
            Self::ProtectedResources(_) => "protected_resources",
            Self::ProtectedTables(_) => "protected_tables",
            Self::MaxAffectedRows(_) => "max_affected_rows",
            Self::RequiresFields(_) => "requires_fields",
            Self::BlockedDays(_) => "blocked_days",
            Self::BlockedHours { .. } => "blocked_hours",
            Self::RequireJustification => "require_justification",
            Self::Unknown { key, .. } => key,
        }
    }

    /// Parses one `(key, value)` entry from a conditions mapping.
    fn from_entry(key: &str, value: &Value) -> Result<Self, String> {
        match key {
            "max_amount" => number(value)
                .map(Self::MaxAmount)
                .ok_or_else(|| format!("max_amount expects a number, got {value}")),
            "min_amount" => number(value)
                .map(Self::MinAmount)
                .ok_or_else(|| format!("min_amount expects a number, got {value}")),
            "protected_resources" => string_list(value)
                .map(Self::ProtectedResources)
                .ok_or_else(|| "protected_resources expects a list of strings".into()),
            "protected_tables" => string_list(value)
                .map(Self::ProtectedTables)
                .ok_or_else(|| "protected_tables expects a list of strings".into()),
            "max_affected_rows" => value
                .as_u64()
                .map(Self::MaxAffectedRows)
                .ok_or_else(|| format!("max_affected_rows expects an integer, got {value}")),
            "requires_fields" => string_list(value)
                .map(Self::RequiresFields)
                .ok_or_else(|| "requires_fields expects a list of strings".into()),
            "blocked_days" => {
                let names = string_list(value)
                    .ok_or_else(|| "blocked_days expects a list of weekday names".to_string())?;
                names
                    .iter()
                    .map(|name| parse_weekday(name))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Self::BlockedDays)
            }
            "blocked_hours" => {
                let pair = value
                    .as_array()
                    .filter(|a| a.len() == 2)
                    .ok_or_else(|| "blocked_hours expects a [start, end) pair".to_string())?;
                let start = hour(&pair[0])?;
                let end = hour(&pair[1])?;
                Ok(Self::BlockedHours { start, end })
            }
            "require_justification" => match value {
                Value::Bool(true) => Ok(Self::RequireJustification),
                _ => Err("require_justification expects true".into()),
            },
            _ => Err(format!("unknown condition key {key:?}")),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Self::MaxAmount(n) | Self::MinAmount(n) => serde_json::json!(n),
            Self::ProtectedResources(list)
            | Self::ProtectedTables(list)
            | Self::RequiresFields(list) => serde_json::json!(list),
            Self::MaxAffectedRows(n) => serde_json::json!(n),
            Self::BlockedDays(days) => {
                Value::Array(days.iter().map(|d| weekday_name(*d).into()).collect())
            }
            Self::BlockedHours { start, end } => serde_json::json!([start, end]),
            Self::RequireJustification => Value::Bool(true),
            Self::Unknown { value, .. } => value.clone(),
        }
    }

    /// Evaluates this condition against a request at `now`.
    ///
    /// Returns `Some(reason)` when the condition matches, `None` otherwise.
    /// [`Condition::Unknown`] never matches.
    #[must_use]
    pub fn matches(&self, request: &AgentRequest, now: DateTime<Utc>) -> Option<String> {
        match self {
            Self::MaxAmount(limit) => {
                let amount = request.amount()?;
                (amount > *limit)
                    .then(|| format!("amount {amount} exceeds limit of {limit}"))
            }
            Self::MinAmount(floor) => {
                let amount = request.amount()?;
                (amount < *floor).then(|| format!("amount {amount} is below floor of {floor}"))
            }
            Self::ProtectedResources(names) => {
                let segments: Vec<&str> = request
                    .target_resource
                    .split('/')
                    .filter(|s| !s.is_empty())
                    .collect();
                names
                    .iter()
                    .find(|name| segments.iter().any(|s| s.eq_ignore_ascii_case(name)))
                    .map(|name| format!("target touches protected resource '{name}'"))
            }
            Self::ProtectedTables(tables) => {
                let table = request.parameters.get("table")?.as_str()?;
                tables
                    .iter()
                    .find(|t| t.eq_ignore_ascii_case(table))
                    .map(|t| format!("write to protected table '{t}'"))
            }
            Self::MaxAffectedRows(limit) => {
                let affected = request.parameters.get("affected_rows")?.as_u64()?;
                (affected > *limit)
                    .then(|| format!("operation affects {affected} rows, limit is {limit}"))
            }
            Self::RequiresFields(fields) => fields
                .iter()
                .find(|f| !request.parameters.contains_key(*f))
                .map(|f| format!("required field '{f}' is missing")),
            Self::BlockedDays(days) => {
                let today = now.weekday();
                days.contains(&today)
                    .then(|| format!("action is blocked on {}", weekday_name(today)))
            }
            Self::BlockedHours { start, end } => {
                let hour = now.hour();
                let inside = if start <= end {
                    hour >= *start && hour < *end
                } else {
                    hour >= *start || hour < *end
                };
                inside.then(|| format!("action is blocked between {start}:00 and {end}:00 UTC"))
            }
            Self::RequireJustification => {
                let justification = request
                    .context
                    .get("justification")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                (justification.trim().len() < 10)
                    .then(|| "justification required for this action".to_string())
            }
            Self::Unknown { .. } => None,
        }
    }
}

fn number(value: &Value) -> Option<f64> {
    value.as_f64()
}

fn string_list(value: &Value) -> Option<Vec<String>> {
    value
        .as_array()?
        .iter()
        .map(|v| v.as_str().map(str::to_string))
        .collect()
}

fn hour(value: &Value) -> Result<u32, String> {
    let hour = value
        .as_u64()
        .ok_or_else(|| format!("hour must be an integer, got {value}"))?;
    if hour > 24 {
        return Err(format!("hour {hour} is outside 0..=24"));
    }
    Ok(u32::try_from(hour).unwrap_or(0))
}

fn parse_weekday(name: &str) -> Result<Weekday, String> {
    match name.to_ascii_lowercase().as_str() {
        "monday" | "mon" => Ok(Weekday::Mon),
        "tuesday" | "tue" => Ok(Weekday::Tue),
        "wednesday" | "wed" => Ok(Weekday::Wed),
        "thursday" | "thu" => Ok(Weekday::Thu),
        "friday" | "fri" => Ok(Weekday::Fri),
        "saturday" | "sat" => Ok(Weekday::Sat),
        "sunday" | "sun" => Ok(Weekday::Sun),
        _ => Err(format!("unknown weekday {name:?}")),
    }
}

fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

/// An ordered set of conditions, serialized as the wire-format mapping
/// (`{"max_amount": 500}`).
///
/// Deserialization is lossy by design: entries that fail to parse become
/// [`Condition::Unknown`] so that rules written by a newer gateway version
/// load (and safely never match) instead of poisoning the whole snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConditionSet(Vec<Condition>);

impl ConditionSet {
    /// Builds a set from parsed conditions.
    #[must_use]
    pub fn new(conditions: Vec<Condition>) -> Self {
        Self(conditions)
    }

    /// Parses a conditions mapping, capturing unparseable entries as
    /// [`Condition::Unknown`].
    #[must_use]
    pub fn from_map_lossy(map: &Map<String, Value>) -> Self {
        Self(
            map.iter()
                .map(|(key, value)| {
                    Condition::from_entry(key, value).unwrap_or_else(|_| Condition::Unknown {
                        key: key.clone(),
                        value: value.clone(),
                    })
                })
                .collect(),
        )
    }

    /// The conditions in declaration order.
    pub fn iter(&self) -> std::slice::Iter<'_, Condition> {
        self.0.iter()
    }

    /// True when no conditions are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of conditions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Keys of conditions this gateway version does not recognize.
    #[must_use]
    pub fn unknown_keys(&self) -> Vec<&str> {
        self.0
            .iter()
            .filter_map(|c| match c {
                Condition::Unknown { key, .. } => Some(key.as_str()),
                _ => None,
            })
            .collect()
    }

    fn to_map(&self) -> Map<String, Value> {
        self.0
            .iter()
            .map(|c| (c.key().to_string(), c.to_value()))
            .collect()
    }
}

impl<'a> IntoIterator for &'a ConditionSet {
    type Item = &'a Condition;
    type IntoIter = std::slice::Iter<'a, Condition>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl Serialize for ConditionSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_map().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ConditionSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let map = value
            .as_object()
            .ok_or_else(|| D::Error::custom("conditions must be a mapping"))?;
        Ok(Self::from_map_lossy(map))
    }
}
