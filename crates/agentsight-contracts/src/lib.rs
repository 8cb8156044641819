// Shared data model for the AgentSight telemetry pipeline
//
// This crate defines the canonical shapes that cross process boundaries:
// - Span: one unit of agent work, as accepted by the ingress
// - Alert: a rule-derived security assessment produced by the analyzer
// - CostMetric: a usage/price record produced by the cost aggregator
// plus the span validation limits and the tracing initialization helper
// shared by all binaries.

pub mod alert;
pub mod cost;
pub mod span;
pub mod telemetry;
pub mod validate;

pub use alert::{Alert, Severity};
pub use cost::CostMetric;
pub use span::{Span, SpanEvent, SpanStatus};
pub use validate::{coerce_attr_value, validate_span, SpanViolation};
