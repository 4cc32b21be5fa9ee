//! PII detection and masking.
//!
//! An explicit pipeline stage with its own deadline and declared fallback,
//! not a logging hook: everything that reaches the audit trail or a
//! response body passes through here first.

mod detector;
mod sanitizer;

pub use detector::{Detector, EntityType, RegexDetector, Span};
pub use sanitizer::{PiiFinding, Sanitized, Sanitizer};
