// Span validation
//
// Hard limits applied per span at the ingress. A violation rejects the
// individual span, never the batch it arrived in.

use serde_json::Value;

use crate::span::Span;

/// Maximum length of `span_id` and `trace_id`.
pub const MAX_ID_LEN: usize = 128;
/// Maximum number of attribute entries per span.
pub const MAX_ATTRIBUTES: usize = 256;
/// Maximum size of a single attribute value.
pub const MAX_ATTRIBUTE_VALUE_BYTES: usize = 8 * 1024;
/// Maximum number of events per span.
pub const MAX_EVENTS: usize = 128;
/// How far a client-declared `duration_ms` may diverge from the value
/// implied by the timestamps. Generous enough for SDKs that round to
/// whole milliseconds, tight enough that a misreported duration cannot
/// skew downstream analysis.
pub const MAX_DURATION_SKEW_MS: f64 = 1.0;

/// Why a span was rejected.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SpanViolation {
    #[error("{0} must be a non-empty printable string")]
    BadId(&'static str),
    #[error("{0} exceeds {MAX_ID_LEN} characters")]
    IdTooLong(&'static str),
    #[error("name must be non-empty")]
    EmptyName,
    #[error("start_time is after end_time")]
    TimeOrder,
    #[error("too many attributes: {0} (max {MAX_ATTRIBUTES})")]
    TooManyAttributes(usize),
    #[error("attribute {key:?} value is {len} bytes (max {MAX_ATTRIBUTE_VALUE_BYTES})")]
    AttributeValueTooLarge { key: String, len: usize },
    #[error("too many events: {0} (max {MAX_EVENTS})")]
    TooManyEvents(usize),
    #[error("duration_ms {declared} disagrees with timestamps ({computed})")]
    DurationMismatch { declared: f64, computed: f64 },
}

fn check_id(field: &'static str, value: &str) -> Result<(), SpanViolation> {
    if value.is_empty() || !value.chars().all(|c| c.is_ascii_graphic()) {
        return Err(SpanViolation::BadId(field));
    }
    if value.len() > MAX_ID_LEN {
        return Err(SpanViolation::IdTooLong(field));
    }
    Ok(())
}

/// Validate a span against the intake invariants.
///
/// A span whose `duration_ms` was omitted on the wire must already carry
/// the value recomputed from its timestamps (the ingress does this when
/// decoding); here the equality invariant is enforced for every span, so
/// an explicitly declared duration that disagrees with the timestamps by
/// more than [`MAX_DURATION_SKEW_MS`] rejects the span rather than
/// feeding a fabricated value to the anomaly detector and the columnar
/// record.
pub fn validate_span(span: &Span) -> Result<(), SpanViolation> {
    check_id("span_id", &span.span_id)?;
    check_id("trace_id", &span.trace_id)?;
    if span.name.is_empty() {
        return Err(SpanViolation::EmptyName);
    }
    if span.start_time > span.end_time {
        return Err(SpanViolation::TimeOrder);
    }
    if span.attributes.len() > MAX_ATTRIBUTES {
        return Err(SpanViolation::TooManyAttributes(span.attributes.len()));
    }
    for (key, value) in &span.attributes {
        if value.len() > MAX_ATTRIBUTE_VALUE_BYTES {
            return Err(SpanViolation::AttributeValueTooLarge {
                key: key.clone(),
                len: value.len(),
            });
        }
    }
    if span.events.len() > MAX_EVENTS {
        return Err(SpanViolation::TooManyEvents(span.events.len()));
    }
    let computed = span.computed_duration_ms();
    if (span.duration_ms - computed).abs() > MAX_DURATION_SKEW_MS {
        return Err(SpanViolation::DurationMismatch {
            declared: span.duration_ms,
            computed,
        });
    }
    Ok(())
}

/// Coerce a client-supplied attribute value to its canonical string form.
///
/// Scalars render as their natural text; nested objects and arrays are
/// JSON-encoded into the value string.
pub fn coerce_attr_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::span::{SpanEvent, SpanStatus};
    use serde_json::json;

    fn valid_span() -> Span {
        Span {
            span_id: "s1".to_string(),
            trace_id: "t1".to_string(),
            parent_span_id: None,
            project_id: String::new(),
            name: "llm.chat".to_string(),
            service_name: "default".to_string(),
            status: SpanStatus::Ok,
            start_time: 1_000_000_000,
            end_time: 1_500_000_000,
            duration_ms: 500.0,
            attributes: HashMap::new(),
            events: vec![],
        }
    }

    #[test]
    fn test_valid_span_passes() {
        assert!(validate_span(&valid_span()).is_ok());
    }

    #[test]
    fn test_duration_within_skew_accepted() {
        // An SDK that rounds to whole milliseconds stays inside the skew.
        let mut span = valid_span();
        span.duration_ms = 500.4;
        assert!(validate_span(&span).is_ok());
    }

    #[test]
    fn test_duration_disagreeing_with_timestamps_rejected() {
        let mut span = valid_span();
        span.duration_ms = 123.0;
        assert!(matches!(
            validate_span(&span),
            Err(SpanViolation::DurationMismatch { .. })
        ));

        // Declaring zero while the timestamps span 500ms is just as wrong.
        span.duration_ms = 0.0;
        assert!(matches!(
            validate_span(&span),
            Err(SpanViolation::DurationMismatch { .. })
        ));
    }

    #[test]
    fn test_instant_span_zero_duration_accepted() {
        let mut span = valid_span();
        span.end_time = span.start_time;
        span.duration_ms = 0.0;
        assert!(validate_span(&span).is_ok());
    }

    #[test]
    fn test_empty_and_oversized_ids() {
        let mut span = valid_span();
        span.span_id = String::new();
        assert_eq!(validate_span(&span), Err(SpanViolation::BadId("span_id")));

        let mut span = valid_span();
        span.trace_id = "x".repeat(MAX_ID_LEN);
        assert!(validate_span(&span).is_ok());

        let mut span = valid_span();
        span.trace_id = "x".repeat(MAX_ID_LEN + 1);
        assert_eq!(
            validate_span(&span),
            Err(SpanViolation::IdTooLong("trace_id"))
        );
    }

    #[test]
    fn test_non_printable_id() {
        let mut span = valid_span();
        span.span_id = "s\u{1}".to_string();
        assert_eq!(validate_span(&span), Err(SpanViolation::BadId("span_id")));
    }

    #[test]
    fn test_time_order() {
        let mut span = valid_span();
        span.start_time = 2;
        span.end_time = 1;
        assert_eq!(validate_span(&span), Err(SpanViolation::TimeOrder));
    }

    #[test]
    fn test_attribute_limits() {
        let mut span = valid_span();
        for i in 0..=MAX_ATTRIBUTES {
            span.attributes.insert(format!("k{i}"), "v".to_string());
        }
        assert!(matches!(
            validate_span(&span),
            Err(SpanViolation::TooManyAttributes(_))
        ));

        let mut span = valid_span();
        span.attributes
            .insert("big".to_string(), "x".repeat(MAX_ATTRIBUTE_VALUE_BYTES + 1));
        assert!(matches!(
            validate_span(&span),
            Err(SpanViolation::AttributeValueTooLarge { .. })
        ));
    }

    #[test]
    fn test_event_limit() {
        let mut span = valid_span();
        span.events = (0..=MAX_EVENTS).map(|_| SpanEvent::default()).collect();
        assert!(matches!(
            validate_span(&span),
            Err(SpanViolation::TooManyEvents(_))
        ));
    }

    #[test]
    fn test_coerce_attr_value() {
        assert_eq!(coerce_attr_value(&json!("text")), "text");
        assert_eq!(coerce_attr_value(&json!(42)), "42");
        assert_eq!(coerce_attr_value(&json!(1.5)), "1.5");
        assert_eq!(coerce_attr_value(&json!(true)), "true");
        assert_eq!(coerce_attr_value(&json!(null)), "");
        assert_eq!(coerce_attr_value(&json!({"a": 1})), "{\"a\":1}");
        assert_eq!(coerce_attr_value(&json!([1, 2])), "[1,2]");
    }
}
