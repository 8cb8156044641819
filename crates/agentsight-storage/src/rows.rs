// Insert-shaped row types
//
// Domain types carry nanosecond timestamps; the `spans` table stores
// microseconds and `cost_metrics` whole seconds, so the conversions live
// here, next to the table layouts.

use std::collections::HashMap;

use agentsight_contracts::{Alert, CostMetric, Span};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Row for the `spans` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanRow {
    pub span_id: String,
    pub trace_id: String,
    pub parent_span_id: String,
    pub project_id: String,
    pub name: String,
    pub service_name: String,
    pub status: String,
    /// Microseconds since epoch.
    pub start_time: i64,
    /// Microseconds since epoch.
    pub end_time: i64,
    pub duration_ms: f64,
    pub attributes: HashMap<String, String>,
    /// Events serialized as a JSON string column.
    pub events: String,
    /// Seconds since epoch.
    pub ingested_at: i64,
}

impl SpanRow {
    pub fn from_span(span: &Span) -> Self {
        Self {
            span_id: span.span_id.clone(),
            trace_id: span.trace_id.clone(),
            parent_span_id: span.parent_span_id.clone().unwrap_or_default(),
            project_id: span.project_id.clone(),
            name: span.name.clone(),
            service_name: span.service_name.clone(),
            status: span.status.as_str().to_string(),
            start_time: span.start_time / 1_000,
            end_time: span.end_time / 1_000,
            duration_ms: span.duration_ms,
            attributes: span.attributes.clone(),
            events: serde_json::to_string(&span.events).unwrap_or_else(|_| "[]".to_string()),
            ingested_at: Utc::now().timestamp(),
        }
    }
}

/// Row for the `security_alerts` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRow {
    pub id: String,
    pub project_id: String,
    pub trace_id: String,
    pub span_id: String,
    pub rule_name: String,
    pub severity: String,
    pub score: f64,
    pub description: String,
    pub evidence: String,
    /// Seconds since epoch.
    pub created_at: i64,
}

impl AlertRow {
    pub fn from_alert(alert: &Alert) -> Self {
        Self {
            id: alert.id.clone(),
            project_id: alert.project_id.clone(),
            trace_id: alert.trace_id.clone(),
            span_id: alert.span_id.clone(),
            rule_name: alert.rule_name.clone(),
            severity: alert.severity.as_str().to_string(),
            score: alert.score,
            description: alert.description.clone(),
            evidence: alert.evidence.clone(),
            created_at: alert.created_at.timestamp(),
        }
    }
}

/// Row for the `cost_metrics` table. The store sums the numeric fields of
/// rows sharing (project_id, model, timestamp).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostMetricRow {
    pub project_id: String,
    pub model: String,
    pub span_kind: String,
    /// Seconds since epoch.
    pub timestamp: i64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
}

impl CostMetricRow {
    pub fn from_metric(metric: &CostMetric) -> Self {
        Self {
            project_id: metric.project_id.clone(),
            model: metric.model.clone(),
            span_kind: metric.span_kind.clone(),
            timestamp: metric.timestamp,
            prompt_tokens: metric.prompt_tokens,
            completion_tokens: metric.completion_tokens,
            total_tokens: metric.total_tokens,
            cost_usd: metric.cost_usd,
        }
    }
}

#[cfg(test)]
mod tests {
    use agentsight_contracts::{Severity, SpanEvent, SpanStatus};

    use super::*;

    #[test]
    fn test_span_row_converts_ns_to_us() {
        let span = Span {
            span_id: "s1".to_string(),
            trace_id: "t1".to_string(),
            parent_span_id: None,
            project_id: "p1".to_string(),
            name: "llm.chat".to_string(),
            service_name: "default".to_string(),
            status: SpanStatus::Error,
            start_time: 1_000_000_000,
            end_time: 1_500_000_000,
            duration_ms: 500.0,
            attributes: HashMap::new(),
            events: vec![SpanEvent {
                name: "retry".to_string(),
                timestamp_ns: 1_200_000_000,
                attributes: HashMap::new(),
            }],
        };

        let row = SpanRow::from_span(&span);
        assert_eq!(row.start_time, 1_000_000);
        assert_eq!(row.end_time, 1_500_000);
        assert_eq!(row.status, "ERROR");
        assert_eq!(row.parent_span_id, "");
        let events: serde_json::Value = serde_json::from_str(&row.events).unwrap();
        assert_eq!(events[0]["name"], "retry");
    }

    #[test]
    fn test_alert_row_severity_string() {
        let alert = Alert::new(
            "p1",
            "t1",
            "s1",
            "pii_ssn",
            Severity::Critical,
            95.0,
            "desc",
            "***-**-6789",
        );
        let row = AlertRow::from_alert(&alert);
        assert_eq!(row.severity, "CRITICAL");
        assert_eq!(row.id, alert.id);
        assert_eq!(row.created_at, alert.created_at.timestamp());
    }
}
