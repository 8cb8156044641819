// Prompt-injection detection
//
// A single compiled RegexSet over the curated phrase list, evaluated once
// per scalar value. Score is additive per distinct phrase so "ignore
// previous instructions" plus "DAN mode" lands at HIGH.

use std::collections::BTreeSet;

use agentsight_contracts::Span;
use regex::RegexSet;

use super::{excerpt, scan_values, RuleHit, SecurityRule, MAX_EVIDENCE_CHARS};

pub const INJECTION_PHRASES: &[&str] = &[
    "ignore previous instructions",
    "disregard the above",
    "DAN mode",
    "developer mode",
    "you are now",
    "system prompt",
    "roleplay as",
];

const SCORE_PER_PHRASE: f64 = 40.0;

pub struct InjectionRule {
    set: RegexSet,
}

impl InjectionRule {
    pub fn new() -> Self {
        let patterns: Vec<String> = INJECTION_PHRASES
            .iter()
            .map(|phrase| format!("(?i){}", regex::escape(phrase)))
            .collect();
        Self {
            // The phrase list is fixed, so compilation cannot fail.
            set: RegexSet::new(&patterns).expect("injection phrase list must compile"),
        }
    }
}

impl Default for InjectionRule {
    fn default() -> Self {
        Self::new()
    }
}

impl SecurityRule for InjectionRule {
    fn name(&self) -> &'static str {
        "prompt_injection"
    }

    fn apply(&mut self, span: &Span) -> Vec<RuleHit> {
        let mut matched: BTreeSet<usize> = BTreeSet::new();
        let mut evidence: Option<&str> = None;

        for value in scan_values(span) {
            let hits = self.set.matches(value);
            if hits.matched_any() {
                evidence.get_or_insert(value);
                matched.extend(hits.iter());
            }
        }

        if matched.is_empty() {
            return Vec::new();
        }

        let score = (SCORE_PER_PHRASE * matched.len() as f64).min(100.0);
        let phrases: Vec<&str> = matched.iter().map(|i| INJECTION_PHRASES[*i]).collect();
        vec![RuleHit {
            rule_name: "prompt_injection".to_string(),
            score,
            description: format!(
                "Potential prompt injection: matched {} phrase(s): {}",
                phrases.len(),
                phrases.join(", ")
            ),
            evidence: excerpt(evidence.unwrap_or_default(), MAX_EVIDENCE_CHARS),
        }]
    }
}
