//! Risk evaluation: applying the rule snapshot to one request.
//!
//! The evaluator is a **pure function** of `(request, rule snapshot, now)`.
//! No clocks, no I/O, no global state: the same inputs always produce the
//! same assessment, which is what makes decisions replayable against the
//! audit trail.
//!
//! A rule matches a request iff it is enabled, its action set is empty or
//! contains the request's action, and **every** condition it carries
//! evaluates true. Rules carrying an unrecognized condition never match
//! and are reported as warnings (fail-safe, not fail-open).

use chrono::{DateTime, Utc};

use crate::policy::{Condition, Rule};
use crate::request::AgentRequest;

/// One matched rule, in reporting form.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleMatch {
    /// The matched rule's id.
    pub rule_id: String,
    /// The matched rule's display name.
    pub rule_name: String,
    /// The rule's priority at match time.
    pub priority: i32,
    /// The risk this match contributed.
    pub risk_score_modifier: f64,
    /// Why the rule matched, phrased from its first satisfied condition.
    pub reason: String,
}

/// The evaluator's output for one request.
#[derive(Debug, Clone, Default)]
pub struct Assessment {
    /// Sum of modifiers over all matches, clamped at zero below.
    pub risk_score: f64,
    /// Matches ordered by descending priority then rule id (snapshot
    /// order).
    pub matched: Vec<RuleMatch>,
    /// Rule ids that were skipped because they carry unknown conditions.
    pub skipped_unknown: Vec<String>,
}

impl Assessment {
    /// The reason string, taken from the highest-priority match.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        self.matched.first().map(|m| m.reason.as_str())
    }

    /// Matched rule ids in reporting order.
    #[must_use]
    pub fn matched_rule_ids(&self) -> Vec<String> {
        self.matched.iter().map(|m| m.rule_id.clone()).collect()
    }
}

/// Evaluates `request` against `rules` (which must already be in
/// descending-priority order, as the policy snapshot guarantees) at the
/// instant `now`.
#[must_use]
pub fn assess(request: &AgentRequest, rules: &[Rule], now: DateTime<Utc>) -> Assessment {
    let mut assessment = Assessment::default();

    for rule in rules {
        if !rule.enabled || !rule.applies_to(request.action_type) {
            continue;
        }
        match rule_match_reason(rule, request, now) {
            MatchOutcome::Matched(reason) => {
                assessment.risk_score += rule.risk_score_modifier;
                assessment.matched.push(RuleMatch {
                    rule_id: rule.rule_id.clone(),
                    rule_name: rule.name.clone(),
                    priority: rule.priority,
                    risk_score_modifier: rule.risk_score_modifier,
                    reason,
                });
            }
            MatchOutcome::NoMatch => {}
            MatchOutcome::UnknownCondition => {
                tracing::warn!(
                    rule_id = %rule.rule_id,
                    keys = ?rule.conditions.unknown_keys(),
                    "rule carries unknown condition keys; treating as non-matching"
                );
                assessment.skipped_unknown.push(rule.rule_id.clone());
            }
        }
    }

    assessment.risk_score = assessment.risk_score.max(0.0);
    assessment
}

enum MatchOutcome {
    Matched(String),
    NoMatch,
    UnknownCondition,
}

/// Applies a rule's condition set.
///
/// A rule with no conditions matches on action type alone. Otherwise every
/// condition must hold; the reason comes from the first condition in
/// declaration order.
fn rule_match_reason(rule: &Rule, request: &AgentRequest, now: DateTime<Utc>) -> MatchOutcome {
    if rule
        .conditions
        .iter()
        .any(|c| matches!(c, Condition::Unknown { .. }))
    {
        return MatchOutcome::UnknownCondition;
    }

    if rule.conditions.is_empty() {
        return MatchOutcome::Matched(format!("action type flagged by policy ({})", rule.name));
    }

    let mut first_reason = None;
    for condition in &rule.conditions {
        match condition.matches(request, now) {
            Some(reason) => {
                first_reason.get_or_insert(reason);
            }
            None => return MatchOutcome::NoMatch,
        }
    }
    match first_reason {
        Some(reason) => MatchOutcome::Matched(format!("{reason} ({})", rule.name)),
        None => MatchOutcome::NoMatch,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use serde_json::json;

    use super::*;
    use crate::policy::{default_rules, ConditionSet};
    use crate::request::ActionType;

    fn request(action: ActionType, parameters: serde_json::Value) -> AgentRequest {
        AgentRequest::new(
            "support-bot",
            action,
            "payments/refund",
            parameters.as_object().cloned().unwrap_or_default(),
            serde_json::Map::new(),
        )
    }

    fn ordered_defaults() -> Vec<Rule> {
        let mut rules = default_rules();
        rules.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.rule_id.cmp(&b.rule_id))
        });
        rules
    }

    // ========================================================================
    // Matching
    // ========================================================================

    #[test]
    fn test_small_refund_matches_nothing() {
        let assessment = assess(
            &request(ActionType::Refund, json!({"amount": 100})),
            &ordered_defaults(),
            Utc::now(),
        );
        assert!(assessment.matched.is_empty());
        assert!(assessment.risk_score.abs() < f64::EPSILON);
    }

    #[test]
    fn test_large_refund_matches_limit_rule() {
        let assessment = assess(
            &request(ActionType::Refund, json!({"amount": 750})),
            &ordered_defaults(),
            Utc::now(),
        );
        assert_eq!(assessment.matched_rule_ids(), vec!["refund_limit_500"]);
        assert!(assessment.risk_score >= 1.0);
        assert!(assessment.reason().unwrap().contains("Refund Amount Limit"));
    }

    #[test]
    fn test_protected_table_write_matches() {
        let mut req = request(ActionType::DatabaseWrite, json!({"table": "users"}));
        req.target_resource = "db/main".into();
        let assessment = assess(&req, &ordered_defaults(), Utc::now());
        assert!(assessment
            .matched_rule_ids()
            .contains(&"database_write_protection".to_string()));
        assert!(assessment.risk_score >= 1.0);
    }

    #[test]
    fn test_disabled_rule_never_matches() {
        let mut rules = ordered_defaults();
        for rule in &mut rules {
            if rule.rule_id == "refund_limit_500" {
                rule.enabled = false;
            }
        }
        let assessment = assess(
            &request(ActionType::Refund, json!({"amount": 750})),
            &rules,
            Utc::now(),
        );
        assert!(assessment.matched.is_empty());
    }

    #[test]
    fn test_action_type_gate() {
        // A payment below its own limit matches nothing even though the
        // refund limit would fire at this amount.
        let assessment = assess(
            &request(ActionType::Payment, json!({"amount": 750})),
            &ordered_defaults(),
            Utc::now(),
        );
        assert!(assessment.matched.is_empty());
    }

    #[test]
    fn test_all_conditions_must_hold() {
        let rule = Rule {
            rule_id: "combined".into(),
            name: "Combined".into(),
            description: None,
            action_types: BTreeSet::new(),
            conditions: ConditionSet::from_map_lossy(
                json!({"max_amount": 100.0, "protected_tables": ["users"]})
                    .as_object()
                    .unwrap(),
            ),
            risk_score_modifier: 0.5,
            enabled: true,
            priority: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        // Amount over limit but table not protected: no match.
        let partial = request(
            ActionType::DatabaseWrite,
            json!({"amount": 500, "table": "orders"}),
        );
        assert!(assess(&partial, &[rule.clone()], Utc::now()).matched.is_empty());

        // Both conditions hold: match.
        let full = request(
            ActionType::DatabaseWrite,
            json!({"amount": 500, "table": "users"}),
        );
        assert_eq!(assess(&full, &[rule], Utc::now()).matched.len(), 1);
    }

    #[test]
    fn test_unknown_condition_is_fail_safe() {
        let rule = Rule {
            rule_id: "future".into(),
            name: "Future Rule".into(),
            description: None,
            action_types: BTreeSet::new(),
            conditions: ConditionSet::from_map_lossy(
                json!({"max_velocity": 9000}).as_object().unwrap(),
            ),
            risk_score_modifier: 1.0,
            enabled: true,
            priority: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let assessment = assess(
            &request(ActionType::Refund, json!({"max_velocity": 10_000})),
            &[rule],
            Utc::now(),
        );
        assert!(assessment.matched.is_empty());
        assert_eq!(assessment.skipped_unknown, vec!["future"]);
    }

    // ========================================================================
    // Scoring and Ordering
    // ========================================================================

    #[test]
    fn test_risk_is_sum_of_matched_modifiers() {
        let mut req = request(
            ActionType::DatabaseWrite,
            json!({"table": "users", "affected_rows": 5000}),
        );
        req.target_resource = "db/main".into();
        let assessment = assess(&req, &ordered_defaults(), Utc::now());

        let expected: f64 = assessment
            .matched
            .iter()
            .map(|m| m.risk_score_modifier)
            .sum();
        assert!((assessment.risk_score - expected).abs() < 1e-9);
        // bulk_operation_limit (0.9) + database_write_protection (1.0).
        assert!((assessment.risk_score - 1.9).abs() < 1e-9);
    }

    #[test]
    fn test_matches_ordered_by_priority_then_id() {
        let mut req = request(
            ActionType::DatabaseWrite,
            json!({"table": "users", "affected_rows": 5000}),
        );
        req.target_resource = "db/main".into();
        let assessment = assess(&req, &ordered_defaults(), Utc::now());

        // bulk_operation_limit has priority 25, database_write_protection 15.
        assert_eq!(
            assessment.matched_rule_ids(),
            vec!["bulk_operation_limit", "database_write_protection"]
        );
        assert!(assessment.reason().unwrap().contains("Bulk Operation Limit"));
    }

    #[test]
    fn test_missing_parameters_behave_as_empty() {
        // requires_fields fires when the field set is empty.
        let rule = Rule {
            rule_id: "needs_ticket".into(),
            name: "Needs Ticket".into(),
            description: None,
            action_types: BTreeSet::new(),
            conditions: ConditionSet::from_map_lossy(
                json!({"requires_fields": ["ticket"]}).as_object().unwrap(),
            ),
            risk_score_modifier: 0.4,
            enabled: true,
            priority: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let assessment = assess(
            &request(ActionType::ApiCall, json!({})),
            &[rule],
            Utc::now(),
        );
        assert_eq!(assessment.matched.len(), 1);
    }

    // ========================================================================
    // Purity
    // ========================================================================

    #[test]
    fn test_same_inputs_same_assessment() {
        let req = request(ActionType::Refund, json!({"amount": 750}));
        let rules = ordered_defaults();
        let now = Utc::now();

        let a = assess(&req, &rules, now);
        let b = assess(&req, &rules, now);
        assert_eq!(a.matched, b.matched);
        assert!((a.risk_score - b.risk_score).abs() < f64::EPSILON);
    }

    mod fuzz {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(128))]

            /// Property: the risk score always equals the sum of the
            /// returned matches' modifiers.
            #[test]
            fn prop_score_is_sum_of_matches(amount in 0.0f64..100_000.0) {
                let req = request(ActionType::Refund, json!({"amount": amount}));
                let assessment = assess(&req, &ordered_defaults(), Utc::now());
                let expected: f64 = assessment
                    .matched
                    .iter()
                    .map(|m| m.risk_score_modifier)
                    .sum();
                prop_assert!((assessment.risk_score - expected).abs() < 1e-9);
            }

            /// Property: the score is never negative.
            #[test]
            fn prop_score_non_negative(amount in -1000.0f64..1000.0) {
                let req = request(ActionType::Payment, json!({"amount": amount}));
                let assessment = assess(&req, &ordered_defaults(), Utc::now());
                prop_assert!(assessment.risk_score >= 0.0);
            }
        }
    }
}
