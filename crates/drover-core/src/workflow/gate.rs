//! Quality gate scoring.
//!
//! A gate inspects the metrics reported by a step's most recent attempt.
//! Each metric passes when its value meets its threshold; the gate score
//! is the weight fraction of passing metrics. The gate passes when the
//! score meets `pass_threshold` and no metric breached its hard floor.
//!
//! Missing metrics fail: a step that reports nothing cannot pass its
//! gate, which keeps a silent collaborator from slipping past review.

use std::collections::BTreeMap;

use drover_types::workflow::GateSpec;

// ---------------------------------------------------------------------------
// GateDecision
// ---------------------------------------------------------------------------

/// The outcome of evaluating a gate against reported metrics.
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Pass {
        score: f64,
    },
    Fail {
        score: f64,
        /// One entry per failing metric, in spec order.
        reasons: Vec<String>,
    },
}

impl GateDecision {
    pub fn passed(&self) -> bool {
        matches!(self, Self::Pass { .. })
    }

    pub fn score(&self) -> f64 {
        match self {
            Self::Pass { score } | Self::Fail { score, .. } => *score,
        }
    }

    /// Human-readable summary for events and history.
    pub fn summary(&self) -> String {
        match self {
            Self::Pass { score } => format!("passed with score {score:.2}"),
            Self::Fail { score, reasons } => {
                format!("failed with score {score:.2}: {}", reasons.join("; "))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// GateEvaluator
// ---------------------------------------------------------------------------

/// Stateless gate evaluation. The scheduler owns loopback bookkeeping;
/// this only scores.
pub struct GateEvaluator;

impl GateEvaluator {
    pub fn evaluate(gate: &GateSpec, metrics: &BTreeMap<String, f64>) -> GateDecision {
        let mut passing_weight = 0.0;
        let mut total_weight = 0.0;
        let mut reasons = Vec::new();
        let mut floor_breached = false;

        for spec in &gate.metrics {
            total_weight += spec.weight;
            match metrics.get(&spec.name) {
                None => {
                    reasons.push(format!("missing metric '{}'", spec.name));
                }
                Some(&value) => {
                    if let Some(floor) = spec.hard_floor
                        && value < floor
                    {
                        floor_breached = true;
                        reasons.push(format!(
                            "metric '{}' value {value:.2} breached hard floor {floor:.2}",
                            spec.name
                        ));
                        continue;
                    }
                    if value >= spec.threshold {
                        passing_weight += spec.weight;
                    } else {
                        reasons.push(format!(
                            "metric '{}' value {value:.2} below threshold {:.2}",
                            spec.name, spec.threshold
                        ));
                    }
                }
            }
        }

        let score = if total_weight > 0.0 {
            passing_weight / total_weight
        } else {
            0.0
        };

        if !floor_breached && score >= gate.pass_threshold {
            GateDecision::Pass { score }
        } else {
            GateDecision::Fail { score, reasons }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use drover_types::workflow::MetricSpec;

    fn metric(name: &str, threshold: f64, weight: f64, hard_floor: Option<f64>) -> MetricSpec {
        MetricSpec {
            name: name.to_string(),
            threshold,
            weight,
            hard_floor,
        }
    }

    fn gate(metrics: Vec<MetricSpec>, pass_threshold: f64) -> GateSpec {
        GateSpec {
            name: None,
            metrics,
            pass_threshold,
            loopback_to: "earlier".to_string(),
            max_retries: 2,
        }
    }

    fn reported(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_all_metrics_passing() {
        let g = gate(
            vec![
                metric("precision", 0.9, 1.0, None),
                metric("coverage", 0.8, 1.0, None),
            ],
            1.0,
        );
        let decision =
            GateEvaluator::evaluate(&g, &reported(&[("precision", 0.95), ("coverage", 0.85)]));

        assert!(decision.passed());
        assert_eq!(decision.score(), 1.0);
    }

    #[test]
    fn test_metric_below_threshold_fails() {
        let g = gate(vec![metric("precision", 0.9, 1.0, None)], 1.0);
        let decision = GateEvaluator::evaluate(&g, &reported(&[("precision", 0.5)]));

        assert!(!decision.passed());
        match decision {
            GateDecision::Fail { reasons, .. } => {
                assert_eq!(reasons.len(), 1);
                assert!(reasons[0].contains("below threshold"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn test_exact_threshold_counts_as_pass() {
        let g = gate(vec![metric("precision", 0.9, 1.0, None)], 1.0);
        let decision = GateEvaluator::evaluate(&g, &reported(&[("precision", 0.9)]));
        assert!(decision.passed());
    }

    #[test]
    fn test_missing_metric_fails_with_reason() {
        let g = gate(vec![metric("precision", 0.9, 1.0, None)], 1.0);
        let decision = GateEvaluator::evaluate(&g, &BTreeMap::new());

        assert!(!decision.passed());
        assert!(decision.summary().contains("missing metric 'precision'"));
    }

    #[test]
    fn test_weighted_partial_pass() {
        // Heavy metric passes, light one fails: score 3/4 meets a 0.7 bar.
        let g = gate(
            vec![
                metric("substance", 0.5, 3.0, None),
                metric("style", 0.9, 1.0, None),
            ],
            0.7,
        );
        let decision =
            GateEvaluator::evaluate(&g, &reported(&[("substance", 0.8), ("style", 0.1)]));

        assert!(decision.passed());
        assert_eq!(decision.score(), 0.75);
    }

    #[test]
    fn test_hard_floor_overrides_weighted_score() {
        // Weighted score would pass, but the floor breach vetoes it.
        let g = gate(
            vec![
                metric("substance", 0.5, 9.0, None),
                metric("safety", 0.9, 1.0, Some(0.5)),
            ],
            0.5,
        );
        let decision =
            GateEvaluator::evaluate(&g, &reported(&[("substance", 0.9), ("safety", 0.2)]));

        assert!(!decision.passed());
        assert!(decision.summary().contains("hard floor"));
    }
}
