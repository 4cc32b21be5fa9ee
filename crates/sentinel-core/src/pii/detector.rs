//! Built-in regex PII detectors.
//!
//! The detector contract is deliberately small: given a string, return
//! spans (possibly overlapping) tagged with an entity type and a
//! confidence. Detection must be deterministic for a given input: findings
//! feed the audit trail and replay must reproduce them.
//!
//! Confidence policy: structural matches backed by a checksum or range
//! check (Luhn-valid card numbers, in-range IPv4 octets) score 1.0; bare
//! pattern matches score 0.7.

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Confidence assigned to checksum- or range-validated matches.
pub const CONFIDENCE_VALIDATED: f64 = 1.0;

/// Confidence assigned to bare pattern matches.
pub const CONFIDENCE_PATTERN: f64 = 0.7;

/// The kinds of sensitive data the built-in detector recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    /// US Social Security number.
    Ssn,
    /// Payment card number (Luhn-validated).
    CreditCard,
    /// Email address.
    Email,
    /// Phone number.
    Phone,
    /// IPv4 address.
    IpAddress,
}

impl EntityType {
    /// Stable label used in mask tokens (`<SSN>`) and metrics.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Ssn => "SSN",
            Self::CreditCard => "CREDIT_CARD",
            Self::Email => "EMAIL",
            Self::Phone => "PHONE",
            Self::IpAddress => "IP_ADDRESS",
        }
    }

    /// The mask token substituted for a detected span.
    #[must_use]
    pub fn mask_token(self) -> String {
        format!("<{}>", self.label())
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A detected sensitive span within one string value.
#[derive(Debug, Clone, PartialEq)]
pub struct Span {
    /// Byte offset of the span start.
    pub start: usize,
    /// Byte offset one past the span end.
    pub end: usize,
    /// What was detected.
    pub entity: EntityType,
    /// Detector confidence in `[0, 1]`.
    pub confidence: f64,
}

/// A PII detector. Implementations must be deterministic.
pub trait Detector: Send + Sync {
    /// Finds sensitive spans in `text`.
    fn detect(&self, text: &str) -> Vec<Span>;

    /// Short name for logs and health output.
    fn name(&self) -> &'static str;
}

/// The bundled regex detector.
///
/// Patterns follow the original regex vocabulary: SSN, payment card
/// (Luhn-checked), email, phone, IPv4. Richer detectors (names, addresses,
/// IBAN) plug in behind the [`Detector`] trait.
pub struct RegexDetector {
    email: Regex,
    ssn: Regex,
    phone: Regex,
    credit_card: Regex,
    ip_address: Regex,
}

impl Default for RegexDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl RegexDetector {
    /// Compiles the pattern set.
    ///
    /// # Panics
    ///
    /// Only on a malformed built-in pattern, which is a programming error
    /// covered by tests.
    #[must_use]
    pub fn new() -> Self {
        Self {
            email: Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b")
                .expect("email pattern"),
            ssn: Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("ssn pattern"),
            phone: Regex::new(r"\b(?:\+1[-.]?)?\(?\d{3}\)?[-.\s]?\d{3}[-.\s]?\d{4}\b")
                .expect("phone pattern"),
            credit_card: Regex::new(r"\b(?:\d{4}[-\s]?){3}\d{4}\b").expect("card pattern"),
            ip_address: Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").expect("ip pattern"),
        }
    }
}

impl Detector for RegexDetector {
    fn detect(&self, text: &str) -> Vec<Span> {
        let mut spans = Vec::new();

        for m in self.email.find_iter(text) {
            spans.push(Span {
                start: m.start(),
                end: m.end(),
                entity: EntityType::Email,
                confidence: CONFIDENCE_PATTERN,
            });
        }
        for m in self.ssn.find_iter(text) {
            spans.push(Span {
                start: m.start(),
                end: m.end(),
                entity: EntityType::Ssn,
                confidence: CONFIDENCE_VALIDATED,
            });
        }
        for m in self.credit_card.find_iter(text) {
            // Luhn separates card numbers from arbitrary 16-digit runs.
            if luhn_valid(m.as_str()) {
                spans.push(Span {
                    start: m.start(),
                    end: m.end(),
                    entity: EntityType::CreditCard,
                    confidence: CONFIDENCE_VALIDATED,
                });
            }
        }
        for m in self.phone.find_iter(text) {
            spans.push(Span {
                start: m.start(),
                end: m.end(),
                entity: EntityType::Phone,
                confidence: CONFIDENCE_PATTERN,
            });
        }
        for m in self.ip_address.find_iter(text) {
            let confidence = if octets_in_range(m.as_str()) {
                CONFIDENCE_VALIDATED
            } else {
                continue;
            };
            spans.push(Span {
                start: m.start(),
                end: m.end(),
                entity: EntityType::IpAddress,
                confidence,
            });
        }

        spans
    }

    fn name(&self) -> &'static str {
        "regex"
    }
}

/// Luhn checksum over the digits of a candidate card number.
fn luhn_valid(candidate: &str) -> bool {
    let digits: Vec<u32> = candidate.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() < 13 || digits.len() > 19 {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}

/// True when every dotted octet fits in a byte.
fn octets_in_range(candidate: &str) -> bool {
    candidate
        .split('.')
        .all(|octet| octet.parse::<u16>().is_ok_and(|v| v <= 255))
}
