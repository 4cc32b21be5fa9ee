//! Detection and masking over structured parameters.
//!
//! The sanitizer walks every string leaf of a JSON mapping (nested maps and
//! arrays included), runs the detector, and replaces each detected span
//! with its mask token (`<SSN>`, `<EMAIL>`, ...). Numeric and boolean
//! leaves pass through untouched.
//!
//! The sanitized copy is what enters the audit log and response payload;
//! original values never leave the evaluation path.
//!
//! # Degradation
//!
//! Scans are CPU-bound and run on the blocking pool under a deadline. If
//! the configured detector overruns or panics, the scan reruns inline with
//! the built-in regex detector, confidences are halved, and the finding set
//! is flagged `low_confidence`.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

use super::detector::{Detector, RegexDetector, Span};

/// One detected-and-masked span, located by a dotted path into the scanned
/// mapping (`customer.contact.email`, `recipients.0`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PiiFinding {
    /// Entity label, e.g. `SSN`.
    pub entity_type: String,
    /// Dotted field locator into the scanned mapping.
    pub path: String,
    /// Byte offset of the span start in the original leaf value.
    pub start: usize,
    /// Byte offset one past the span end.
    pub end: usize,
    /// Detector confidence in `[0, 1]`.
    pub confidence: f64,
}

/// Result of sanitizing one mapping.
#[derive(Debug, Clone, Default)]
pub struct Sanitized {
    /// The mapping with every detected span masked.
    pub value: Map<String, Value>,
    /// All findings, in walk order.
    pub findings: Vec<PiiFinding>,
    /// True when the scan ran on the degraded fallback path.
    pub low_confidence: bool,
}

/// The sanitization stage.
pub struct Sanitizer {
    detector: Arc<dyn Detector>,
    timeout: Duration,
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self::new(Arc::new(RegexDetector::new()), Duration::from_millis(500))
    }
}

impl Sanitizer {
    /// Creates a sanitizer over the given detector with a scan deadline.
    #[must_use]
    pub fn new(detector: Arc<dyn Detector>, timeout: Duration) -> Self {
        Self { detector, timeout }
    }

    /// Scans and masks a mapping under the configured deadline.
    pub async fn sanitize(&self, params: &Map<String, Value>) -> Sanitized {
        if params.is_empty() {
            return Sanitized::default();
        }

        let detector = Arc::clone(&self.detector);
        let owned = params.clone();
        let scan = tokio::task::spawn_blocking(move || sanitize_map(detector.as_ref(), &owned));

        match tokio::time::timeout(self.timeout, scan).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => {
                warn!(error = %join_err, detector = self.detector.name(), "PII scan failed; degrading to regex fallback");
                degraded_scan(params)
            }
            Err(_elapsed) => {
                warn!(
                    timeout_ms = self.timeout.as_millis() as u64,
                    detector = self.detector.name(),
                    "PII scan exceeded deadline; degrading to regex fallback"
                );
                degraded_scan(params)
            }
        }
    }
}

/// Inline fallback scan with halved confidence.
fn degraded_scan(params: &Map<String, Value>) -> Sanitized {
    let fallback = RegexDetector::new();
    let mut result = sanitize_map(&fallback, params);
    for finding in &mut result.findings {
        finding.confidence /= 2.0;
    }
    result.low_confidence = true;
    result
}

fn sanitize_map(detector: &dyn Detector, params: &Map<String, Value>) -> Sanitized {
    let mut findings = Vec::new();
    let value = params
        .iter()
        .map(|(key, value)| {
            (
                key.clone(),
                sanitize_value(detector, value, key, &mut findings),
            )
        })
        .collect();
    Sanitized {
        value,
        findings,
        low_confidence: false,
    }
}

fn sanitize_value(
    detector: &dyn Detector,
    value: &Value,
    path: &str,
    findings: &mut Vec<PiiFinding>,
) -> Value {
    match value {
        Value::String(text) => {
            let spans = detector.detect(text);
            if spans.is_empty() {
                return value.clone();
            }
            let masked = mask_spans(text, &spans, path, findings);
            Value::String(masked)
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, inner)| {
                    let child = format!("{path}.{key}");
                    (key.clone(), sanitize_value(detector, inner, &child, findings))
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .enumerate()
                .map(|(i, inner)| {
                    let child = format!("{path}.{i}");
                    sanitize_value(detector, inner, &child, findings)
                })
                .collect(),
        ),
        // Numbers, booleans, nulls pass through.
        other => other.clone(),
    }
}

/// Replaces detected spans with mask tokens.
///
/// Spans are applied in start order; a span overlapping an already-masked
/// region is trimmed to its uncovered tail, and invalid offsets are
/// skipped. Offsets recorded in findings refer to the original value.
fn mask_spans(
    text: &str,
    spans: &[Span],
    path: &str,
    findings: &mut Vec<PiiFinding>,
) -> String {
    let mut sorted: Vec<&Span> = spans.iter().collect();
    sorted.sort_by(|a, b| a.start.cmp(&b.start).then(b.end.cmp(&a.end)));

    let mut output = String::with_capacity(text.len());
    let mut last_pos = 0usize;

    for span in sorted {
        let invalid = span.start >= span.end
            || span.end > text.len()
            || !text.is_char_boundary(span.start)
            || !text.is_char_boundary(span.end);
        if invalid || span.end <= last_pos {
            continue;
        }
        let effective_start = span.start.max(last_pos);
        output.push_str(&text[last_pos..effective_start]);
        output.push_str(&span.entity.mask_token());
        last_pos = span.end;

        findings.push(PiiFinding {
            entity_type: span.entity.label().to_string(),
            path: path.to_string(),
            start: span.start,
            end: span.end,
            confidence: span.confidence,
        });
    }
    output.push_str(&text[last_pos..]);
    output
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::super::detector::EntityType;
    use super::*;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    async fn scan(value: Value) -> Sanitized {
        Sanitizer::default().sanitize(&map(value)).await
    }

    #[tokio::test]
    async fn test_masks_ssn_and_email() {
        let result = scan(json!({
            "ssn": "123-45-6789",
            "email": "a@b.com",
        }))
        .await;

        assert_eq!(result.value["ssn"], json!("<SSN>"));
        assert_eq!(result.value["email"], json!("<EMAIL>"));
        assert_eq!(result.findings.len(), 2);
        assert!(!result.low_confidence);
    }

    #[tokio::test]
    async fn test_original_values_never_survive_masking() {
        let result = scan(json!({
            "note": "reach me at jane.doe@corp.example or 555-867-5309",
        }))
        .await;

        let masked = result.value["note"].as_str().unwrap();
        assert!(!masked.contains("jane.doe@corp.example"));
        assert!(!masked.contains("555-867-5309"));
        assert!(masked.contains("<EMAIL>"));
        assert!(masked.contains("<PHONE>"));
    }

    #[tokio::test]
    async fn test_nested_paths_are_dotted() {
        let result = scan(json!({
            "customer": {"contact": {"email": "a@b.com"}},
            "recipients": ["b@c.com"],
        }))
        .await;

        let paths: Vec<&str> = result.findings.iter().map(|f| f.path.as_str()).collect();
        assert!(paths.contains(&"customer.contact.email"));
        assert!(paths.contains(&"recipients.0"));
    }

    #[tokio::test]
    async fn test_numeric_and_bool_leaves_pass_through() {
        let result = scan(json!({
            "amount": 750.5,
            "urgent": true,
            "rows": 1000,
        }))
        .await;

        assert_eq!(result.value["amount"], json!(750.5));
        assert_eq!(result.value["urgent"], json!(true));
        assert!(result.findings.is_empty());
    }

    #[tokio::test]
    async fn test_clean_input_is_unchanged() {
        let input = json!({"memo": "refund for order 1234"});
        let result = scan(input.clone()).await;
        assert_eq!(Value::Object(result.value), input);
    }

    #[tokio::test]
    async fn test_empty_map_short_circuits() {
        let result = Sanitizer::default().sanitize(&Map::new()).await;
        assert!(result.value.is_empty());
        assert!(result.findings.is_empty());
    }

    #[tokio::test]
    async fn test_finding_offsets_locate_original_span() {
        let text = "ssn 123-45-6789 on file";
        let result = scan(json!({"note": text})).await;
        let finding = &result.findings[0];
        assert_eq!(&text[finding.start..finding.end], "123-45-6789");
    }

    #[tokio::test]
    async fn test_timeout_degrades_to_fallback() {
        struct StallingDetector;
        impl Detector for StallingDetector {
            fn detect(&self, _text: &str) -> Vec<Span> {
                std::thread::sleep(Duration::from_millis(200));
                Vec::new()
            }
            fn name(&self) -> &'static str {
                "stalling"
            }
        }

        let sanitizer = Sanitizer::new(Arc::new(StallingDetector), Duration::from_millis(20));
        let result = sanitizer
            .sanitize(&map(json!({"ssn": "123-45-6789"})))
            .await;

        // The fallback still masks, but the set is flagged.
        assert!(result.low_confidence);
        assert_eq!(result.value["ssn"], json!("<SSN>"));
        assert!(result.findings[0].confidence <= 0.5);
    }

    #[test]
    fn test_overlapping_spans_mask_the_union() {
        let text = "abcdef";
        let spans = vec![
            Span {
                start: 0,
                end: 4,
                entity: EntityType::Email,
                confidence: 1.0,
            },
            Span {
                start: 2,
                end: 6,
                entity: EntityType::Phone,
                confidence: 1.0,
            },
        ];
        let mut findings = Vec::new();
        let masked = mask_spans(text, &spans, "p", &mut findings);
        assert_eq!(masked, "<EMAIL><PHONE>");
        assert!(!masked.contains("ab"));
    }

    mod fuzz {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(128))]

            /// Property: masking never leaks a detected span back into the
            /// output.
            #[test]
            fn prop_detected_spans_never_survive(
                prefix in "[a-z ]{0,12}",
                suffix in "[a-z ]{0,12}",
            ) {
                let secret = "123-45-6789";
                let text = format!("{prefix}{secret}{suffix}");
                let detector = RegexDetector::new();
                let spans = detector.detect(&text);
                prop_assume!(!spans.is_empty());

                let mut findings = Vec::new();
                let masked = mask_spans(&text, &spans, "p", &mut findings);
                prop_assert!(!masked.contains(secret));
                prop_assert!(masked.contains("<SSN>"));
            }

            /// Property: sanitization is deterministic.
            #[test]
            fn prop_sanitize_is_deterministic(text in "[a-z0-9@. -]{0,40}") {
                let detector = RegexDetector::new();
                let mut findings_a = Vec::new();
                let mut findings_b = Vec::new();
                let a = mask_spans(&text, &detector.detect(&text), "p", &mut findings_a);
                let b = mask_spans(&text, &detector.detect(&text), "p", &mut findings_b);
                prop_assert_eq!(a, b);
                prop_assert_eq!(findings_a, findings_b);
            }
        }
    }
}
