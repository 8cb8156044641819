// Security rule pipeline
//
// Each rule family inspects one span and produces at most one aggregated
// hit; the analyzer turns hits into alerts. Rules may keep state across
// spans (the duration outlier tracks per-operation history), hence the
// &mut receiver.

use agentsight_contracts::Span;

pub mod anomaly;
pub mod injection;
pub mod pii;
pub mod tokens;

pub use anomaly::DurationOutlierRule;
pub use injection::InjectionRule;
pub use pii::PiiRule;
pub use tokens::TokenExplosionRule;

/// Cap on the evidence excerpt carried in an alert.
pub const MAX_EVIDENCE_CHARS: usize = 512;

/// One rule family's finding for a span.
#[derive(Debug, Clone)]
pub struct RuleHit {
    pub rule_name: String,
    /// 0-100; the severity mapping decides whether an alert is emitted.
    pub score: f64,
    pub description: String,
    pub evidence: String,
}

/// A detection rule applied to every span.
pub trait SecurityRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&mut self, span: &Span) -> Vec<RuleHit>;
}

/// The standard pipeline, in evaluation order.
pub fn default_rules() -> Vec<Box<dyn SecurityRule>> {
    vec![
        Box::new(InjectionRule::new()),
        Box::new(PiiRule::new()),
        Box::new(DurationOutlierRule::new()),
        Box::new(TokenExplosionRule),
    ]
}

/// First `max` characters of a value, cut on a char boundary.
pub(crate) fn excerpt(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        text.chars().take(max).collect()
    }
}

/// Scan surface of a span: its name, then attribute values in key order
/// so evidence selection is deterministic.
pub(crate) fn scan_values(span: &Span) -> Vec<&str> {
    let mut keys: Vec<&String> = span.attributes.keys().collect();
    keys.sort();
    let mut values = vec![span.name.as_str()];
    values.extend(keys.into_iter().map(|k| span.attributes[k].as_str()));
    values
}
