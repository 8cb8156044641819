// Wire encoding for bus payloads
//
// Spans travel as MessagePack with named fields (compact, self-describing
// across SDK languages). Alerts travel as JSON for human inspectability.

use agentsight_contracts::{Alert, Span};

#[derive(Debug, thiserror::Error)]
pub enum EncodingError {
    #[error("span encode failed: {0}")]
    SpanEncode(#[from] rmp_serde::encode::Error),
    #[error("span decode failed: {0}")]
    SpanDecode(#[from] rmp_serde::decode::Error),
    #[error("alert codec failed: {0}")]
    AlertCodec(#[from] serde_json::Error),
}

pub fn encode_span(span: &Span) -> Result<Vec<u8>, EncodingError> {
    Ok(rmp_serde::to_vec_named(span)?)
}

pub fn decode_span(bytes: &[u8]) -> Result<Span, EncodingError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

pub fn encode_alert(alert: &Alert) -> Result<Vec<u8>, EncodingError> {
    Ok(serde_json::to_vec(alert)?)
}

pub fn decode_alert(bytes: &[u8]) -> Result<Alert, EncodingError> {
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use agentsight_contracts::{SpanStatus, Severity};

    use super::*;

    #[test]
    fn test_span_wire_format_is_self_describing() {
        let span = Span {
            span_id: "s1".to_string(),
            trace_id: "t1".to_string(),
            parent_span_id: None,
            project_id: "p1".to_string(),
            name: "llm.chat".to_string(),
            service_name: "default".to_string(),
            status: SpanStatus::Ok,
            start_time: 1_000_000_000,
            end_time: 1_500_000_000,
            duration_ms: 500.0,
            attributes: HashMap::from([("llm.model".to_string(), "gpt-4".to_string())]),
            events: vec![],
        };

        let bytes = encode_span(&span).unwrap();
        // Named encoding keeps field names on the wire.
        assert!(bytes.windows(7).any(|w| w == b"span_id"));

        let decoded = decode_span(&bytes).unwrap();
        assert_eq!(decoded.span_id, "s1");
        assert_eq!(decoded.project_id, "p1");
        assert_eq!(decoded.attributes["llm.model"], "gpt-4");
    }

    #[test]
    fn test_alert_wire_format_is_json() {
        let alert = Alert::new(
            "p1",
            "t1",
            "s1",
            "prompt_injection",
            Severity::High,
            80.0,
            "desc",
            "evidence",
        );
        let bytes = encode_alert(&alert).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["rule_name"], "prompt_injection");
        assert_eq!(value["severity"], "HIGH");

        let decoded = decode_alert(&bytes).unwrap();
        assert_eq!(decoded.id, alert.id);
    }
}
