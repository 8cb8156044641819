// Canonical span model
//
// A span is immutable once it passes the ingress: project_id is assigned
// from the authenticated API key (never trusted from the client) and
// attributes are already coerced to string values.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Status of a completed span.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum SpanStatus {
    #[default]
    Ok,
    Error,
    Unset,
}

impl SpanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanStatus::Ok => "OK",
            SpanStatus::Error => "ERROR",
            SpanStatus::Unset => "UNSET",
        }
    }
}

/// An event recorded during a span's lifetime (a log line, a streaming
/// chunk arrival, an exception).
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct SpanEvent {
    pub name: String,
    /// Wall-clock time in nanoseconds since epoch.
    #[serde(alias = "timestamp")]
    pub timestamp_ns: i64,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

/// One unit of agent work.
///
/// Spans within one agent execution share a `trace_id`; `parent_span_id`
/// links them into a forest. Timestamps are nanoseconds since epoch and
/// are not required to be monotonic within a trace.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Span {
    pub span_id: String,
    pub trace_id: String,
    #[serde(default)]
    pub parent_span_id: Option<String>,
    /// Assigned at ingress from the resolved API key.
    #[serde(default)]
    pub project_id: String,
    /// Operation label, e.g. `llm.chat`, `tool.call`.
    pub name: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default)]
    pub status: SpanStatus,
    /// Nanoseconds since epoch.
    pub start_time: i64,
    /// Nanoseconds since epoch.
    pub end_time: i64,
    /// Milliseconds; recomputed from the timestamps when the client omits it.
    #[serde(default)]
    pub duration_ms: f64,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default)]
    pub events: Vec<SpanEvent>,
}

fn default_service_name() -> String {
    "default".to_string()
}

impl Span {
    /// Duration implied by the span's timestamps, in milliseconds.
    pub fn computed_duration_ms(&self) -> f64 {
        (self.end_time - self.start_time) as f64 / 1e6
    }

    /// Attribute value parsed as an integer, accepting plain digits in
    /// string form. Missing or unparseable values yield `None`.
    pub fn attr_i64(&self, key: &str) -> Option<i64> {
        self.attributes.get(key)?.trim().parse().ok()
    }
}
