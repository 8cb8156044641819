// Cost metric model
//
// One row per LLM span, produced by the cost aggregator. The columnar
// store sums rows sharing (project_id, model, timestamp), so timestamps
// are truncated to second precision here.

use serde::{Deserialize, Serialize};

/// A usage/price record derived from an LLM span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostMetric {
    pub project_id: String,
    pub model: String,
    /// `llm`, `embedding`, ...
    pub span_kind: String,
    /// Seconds since epoch.
    pub timestamp: i64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
}
