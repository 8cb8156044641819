// Security alert model
//
// Alerts are produced exclusively by the security analyzer and never
// mutated. They travel as JSON on the `alerts.live` stream so operators
// can inspect them with stream tooling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Alert severity, ordered LOW < MEDIUM < HIGH < CRITICAL.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Map a rule score (0-100) to a severity. Scores below 30 are
    /// suppressed and produce no alert.
    pub fn from_score(score: f64) -> Option<Severity> {
        if score < 30.0 {
            None
        } else if score < 50.0 {
            Some(Severity::Low)
        } else if score < 75.0 {
            Some(Severity::Medium)
        } else if score < 90.0 {
            Some(Severity::High)
        } else {
            Some(Severity::Critical)
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

/// A rule-derived assessment that a span exhibits a threat condition.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Alert {
    pub id: String,
    pub project_id: String,
    pub trace_id: String,
    pub span_id: String,
    /// Rule family that fired, e.g. `prompt_injection`, `pii_ssn`.
    pub rule_name: String,
    pub severity: Severity,
    /// Aggregate rule score, 0-100.
    pub score: f64,
    pub description: String,
    /// Excerpt of the offending value, detected PII masked, at most 512 chars.
    pub evidence: String,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        project_id: impl Into<String>,
        trace_id: impl Into<String>,
        span_id: impl Into<String>,
        rule_name: impl Into<String>,
        severity: Severity,
        score: f64,
        description: impl Into<String>,
        evidence: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            trace_id: trace_id.into(),
            span_id: span_id.into(),
            rule_name: rule_name.into(),
            severity,
            score,
            description: description.into(),
            evidence: evidence.into(),
            created_at: Utc::now(),
        }
    }
}
