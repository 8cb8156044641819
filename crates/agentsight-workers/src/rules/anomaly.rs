// Duration outlier detection
//
// Per operation name, a rolling window of the last 512 durations with
// mean and variance maintained by Welford's algorithm (an inverse update
// removes the evicted sample, so no sum-of-squares accumulator that
// cancels catastrophically when slow and fast operations share a window).
// A span is flagged when its duration exceeds mean + 3σ and the window
// holds at least 32 samples; the current span joins the window after the
// check so a burst of outliers cannot immediately normalize itself.

use std::collections::{HashMap, VecDeque};

use agentsight_contracts::Span;

use super::{RuleHit, SecurityRule};

const WINDOW: usize = 512;
const MIN_SAMPLES: usize = 32;
const OUTLIER_SCORE: f64 = 50.0;

#[derive(Default)]
struct WindowStats {
    values: VecDeque<f64>,
    mean: f64,
    /// Sum of squared deviations from the running mean.
    m2: f64,
}

impl WindowStats {
    fn push(&mut self, value: f64) {
        if self.values.len() == WINDOW {
            if let Some(old) = self.values.pop_front() {
                self.remove(old);
            }
        }
        self.values.push_back(value);

        let n = self.values.len() as f64;
        let delta = value - self.mean;
        self.mean += delta / n;
        self.m2 += delta * (value - self.mean);
    }

    fn remove(&mut self, value: f64) {
        let remaining = self.values.len() as f64;
        if remaining < 1.0 {
            self.mean = 0.0;
            self.m2 = 0.0;
            return;
        }
        let delta = value - self.mean;
        let new_mean = self.mean - delta / remaining;
        self.m2 -= delta * (value - new_mean);
        self.m2 = self.m2.max(0.0);
        self.mean = new_mean;
    }

    fn len(&self) -> usize {
        self.values.len()
    }

    fn mean(&self) -> f64 {
        if self.values.is_empty() {
            0.0
        } else {
            self.mean
        }
    }

    fn stddev(&self) -> f64 {
        let n = self.values.len() as f64;
        if n < 2.0 {
            return 0.0;
        }
        (self.m2 / n).max(0.0).sqrt()
    }
}

pub struct DurationOutlierRule {
    per_name: HashMap<String, WindowStats>,
}

impl DurationOutlierRule {
    pub fn new() -> Self {
        Self {
            per_name: HashMap::new(),
        }
    }
}

impl Default for DurationOutlierRule {
    fn default() -> Self {
        Self::new()
    }
}

impl SecurityRule for DurationOutlierRule {
    fn name(&self) -> &'static str {
        "duration_outlier"
    }

    fn apply(&mut self, span: &Span) -> Vec<RuleHit> {
        let stats = self.per_name.entry(span.name.clone()).or_default();
        let duration = span.duration_ms;

        let flagged = stats.len() >= MIN_SAMPLES && {
            let threshold = stats.mean() + 3.0 * stats.stddev();
            duration > threshold
        };
        let (mean, stddev) = (stats.mean(), stats.stddev());
        stats.push(duration);

        if !flagged {
            return Vec::new();
        }
        vec![RuleHit {
            rule_name: "duration_outlier".to_string(),
            score: OUTLIER_SCORE,
            description: format!(
                "duration {duration:.1}ms exceeds mean {mean:.1}ms + 3 stddev ({stddev:.1}ms) for {}",
                span.name
            ),
            evidence: format!("{duration:.1}ms"),
        }]
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use agentsight_contracts::SpanStatus;

    use super::*;

    fn span(name: &str, duration_ms: f64) -> Span {
        Span {
            span_id: "s".to_string(),
            trace_id: "t".to_string(),
            parent_span_id: None,
            project_id: "p".to_string(),
            name: name.to_string(),
            service_name: "default".to_string(),
            status: SpanStatus::Ok,
            start_time: 0,
            end_time: 1,
            duration_ms,
            attributes: HashMap::new(),
            events: vec![],
        }
    }

    #[test]
    fn test_needs_minimum_samples() {
        let mut rule = DurationOutlierRule::new();
        for _ in 0..(MIN_SAMPLES - 1) {
            assert!(rule.apply(&span("llm.chat", 100.0)).is_empty());
        }
        // 31 samples so far: even an extreme value passes unflagged.
        assert!(rule.apply(&span("llm.chat", 100_000.0)).is_empty());
    }

    #[test]
    fn test_flags_outlier_after_warmup() {
        let mut rule = DurationOutlierRule::new();
        for i in 0..64 {
            // Mild variation around 100ms.
            rule.apply(&span("llm.chat", 100.0 + (i % 5) as f64));
        }
        let hits = rule.apply(&span("llm.chat", 5_000.0));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].rule_name, "duration_outlier");
        assert!((hits[0].score - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_names_tracked_independently() {
        let mut rule = DurationOutlierRule::new();
        for i in 0..64 {
            rule.apply(&span("llm.chat", 100.0 + (i % 5) as f64));
        }
        // Same duration under a fresh name: too few samples to flag.
        assert!(rule.apply(&span("tool.call", 5_000.0)).is_empty());
    }

    #[test]
    fn test_window_stats_bounded() {
        let mut stats = WindowStats::default();
        for i in 0..(WINDOW + 100) {
            stats.push(i as f64);
        }
        assert_eq!(stats.len(), WINDOW);
        // Window holds the last 512 values: 100..612, mean 355.5.
        assert!((stats.mean() - 355.5).abs() < 1e-6);
    }

    #[test]
    fn test_window_stats_stable_at_large_offsets() {
        // Small variance on top of a huge mean: a sum-of-squares
        // accumulator cancels here, the Welford update does not.
        let mut stats = WindowStats::default();
        for i in 0..(WINDOW + 100) {
            stats.push(1e9 + (i % 2) as f64);
        }
        assert!((stats.mean() - (1e9 + 0.5)).abs() < 1e-3);
        assert!((stats.stddev() - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_window_stats_constant_values_zero_stddev() {
        let mut stats = WindowStats::default();
        for _ in 0..64 {
            stats.push(250.0);
        }
        assert!((stats.mean() - 250.0).abs() < 1e-9);
        assert!(stats.stddev() < 1e-9);
    }
}
