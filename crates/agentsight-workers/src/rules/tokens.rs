// Token explosion heuristic

use agentsight_contracts::Span;

use super::{RuleHit, SecurityRule};

const TOKEN_THRESHOLD: i64 = 50_000;
const EXPLOSION_SCORE: f64 = 70.0;

/// Flags spans whose combined token usage is implausibly large for a
/// single call (runaway loops, context stuffing).
pub struct TokenExplosionRule;

impl SecurityRule for TokenExplosionRule {
    fn name(&self) -> &'static str {
        "token_explosion"
    }

    fn apply(&mut self, span: &Span) -> Vec<RuleHit> {
        let tokens_in = span.attr_i64("llm.tokens.in").unwrap_or(0);
        let tokens_out = span.attr_i64("llm.tokens.out").unwrap_or(0);
        let total = tokens_in + tokens_out;
        if total <= TOKEN_THRESHOLD {
            return Vec::new();
        }
        vec![RuleHit {
            rule_name: "token_explosion".to_string(),
            score: EXPLOSION_SCORE,
            description: format!(
                "token usage {total} ({tokens_in} in + {tokens_out} out) exceeds {TOKEN_THRESHOLD}"
            ),
            evidence: format!("{total} tokens"),
        }]
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use agentsight_contracts::SpanStatus;

    use super::*;

    fn span_with_tokens(tokens_in: &str, tokens_out: &str) -> Span {
        Span {
            span_id: "s".to_string(),
            trace_id: "t".to_string(),
            parent_span_id: None,
            project_id: "p".to_string(),
            name: "llm.chat".to_string(),
            service_name: "default".to_string(),
            status: SpanStatus::Ok,
            start_time: 0,
            end_time: 1,
            duration_ms: 0.0,
            attributes: HashMap::from([
                ("llm.tokens.in".to_string(), tokens_in.to_string()),
                ("llm.tokens.out".to_string(), tokens_out.to_string()),
            ]),
            events: vec![],
        }
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let mut rule = TokenExplosionRule;
        assert!(rule.apply(&span_with_tokens("25000", "25000")).is_empty());
        let hits = rule.apply(&span_with_tokens("25000", "25001"));
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - 70.0).abs() < 1e-9);
    }

    #[test]
    fn test_unparseable_counts_treated_as_zero() {
        let mut rule = TokenExplosionRule;
        assert_eq!(rule.apply(&span_with_tokens("lots", "99999999")).len(), 1);
        assert!(rule.apply(&span_with_tokens("lots", "none")).is_empty());
    }
}
