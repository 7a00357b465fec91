//! Promotion decision: candidate vs. baseline predictor, gated by quality.
//!
//! The comparison runs on the `observed_and_predictor_nonempty` slice under
//! the primary truth policy. An unmatched predictor pair yields
//! `eligible = false`, never an error.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::domain::{PerPrRecord, TruthStatus};
use crate::quality_gates::QualityGates;

/// Baseline/candidate precedence; the first pair fully present wins.
pub const PROMOTION_PAIRS: [(&str, &str); 3] = [
    ("popularity", "hybrid_ranker"),
    ("popularity", "union"),
    ("hybrid_ranker", "llm_rerank"),
];

pub const MISSING_PAIR_REASON: &str = "missing comparable predictor pair";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionCriteria {
    pub min_n: usize,
    pub min_delta_mrr: f64,
    /// Largest tolerated hit@1 regression.
    pub hit1_tolerance: f64,
    pub bootstrap_samples: usize,
    pub bootstrap_seed: u64,
}

impl Default for PromotionCriteria {
    fn default() -> Self {
        Self {
            min_n: 120,
            min_delta_mrr: 0.015,
            hit1_tolerance: 0.01,
            bootstrap_samples: 500,
            bootstrap_seed: 42,
        }
    }
}

impl PromotionCriteria {
    /// The promotion rule on already-measured quantities.
    pub fn decide(&self, n: usize, delta_mrr: f64, ci_low: f64, delta_hit1: f64, gates_pass: bool) -> bool {
        n >= self.min_n
            && delta_mrr > 0.0
            && delta_mrr >= self.min_delta_mrr
            && ci_low > 0.0
            && delta_hit1 >= -self.hit1_tolerance
            && gates_pass
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromotionEvaluation {
    pub eligible: bool,
    pub primary_policy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_observed_and_predictor_nonempty: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_mrr: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_mrr_bootstrap_ci95: Option<[f64; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_hit_at_1: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gates_pass: Option<bool>,
    #[serde(default)]
    pub promote: bool,
}

/// Pick the baseline/candidate pair for the configured predictors.
pub fn select_pair<S: AsRef<str>>(predictor_ids: &[S]) -> Option<(&'static str, &'static str)> {
    let has = |id: &str| predictor_ids.iter().any(|p| p.as_ref() == id);
    PROMOTION_PAIRS
        .iter()
        .copied()
        .find(|&(baseline, candidate)| has(baseline) && has(candidate))
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Percentile bootstrap of the mean. Empty input gives `(0, 0)`.
pub fn bootstrap_ci95(values: &[f64], samples: usize, seed: u64) -> (f64, f64) {
    if values.is_empty() || samples == 0 {
        return (0.0, 0.0);
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let n = values.len();
    let mut means: Vec<f64> = (0..samples)
        .map(|_| (0..n).map(|_| values[rng.gen_range(0..n)]).sum::<f64>() / n as f64)
        .collect();
    means.sort_by(|a, b| a.total_cmp(b));
    let last = (means.len() - 1) as f64;
    let lo = (0.025 * last) as usize;
    let hi = (0.975 * last) as usize;
    (means[lo], means[hi])
}

/// Paired per-item deltas `(mrr, hit@1)` on the promotion slice.
pub fn paired_deltas(records: &[PerPrRecord], baseline: &str, candidate: &str, primary_policy: &str) -> Vec<(f64, f64)> {
    records
        .iter()
        .filter(|r| r.policy_status(primary_policy) == Some(TruthStatus::Observed))
        .filter_map(|r| {
            let base = r.predictors.get(baseline)?;
            let cand = r.predictors.get(candidate)?;
            if !base.is_nonempty() || !cand.is_nonempty() {
                return None;
            }
            let bm = base.routing_agreement_by_policy.get(primary_policy)?;
            let cm = cand.routing_agreement_by_policy.get(primary_policy)?;
            Some((cm.mrr? - bm.mrr?, cm.hit_at(1)? - bm.hit_at(1)?))
        })
        .collect()
}

pub fn evaluate_promotion<S: AsRef<str>>(
    records: &[PerPrRecord],
    predictor_ids: &[S],
    primary_policy: &str,
    gates: &QualityGates,
    criteria: &PromotionCriteria,
) -> PromotionEvaluation {
    let Some((baseline, candidate)) = select_pair(predictor_ids) else {
        return PromotionEvaluation {
            eligible: false,
            primary_policy: primary_policy.to_string(),
            reason: Some(MISSING_PAIR_REASON.to_string()),
            ..PromotionEvaluation::default()
        };
    };

    let deltas = paired_deltas(records, baseline, candidate, primary_policy);
    let mrr: Vec<f64> = deltas.iter().map(|d| d.0).collect();
    let hit1: Vec<f64> = deltas.iter().map(|d| d.1).collect();
    let n = mrr.len();
    let delta_mrr = mean(&mrr);
    let delta_hit1 = mean(&hit1);
    let (ci_lo, ci_hi) = bootstrap_ci95(&mrr, criteria.bootstrap_samples, criteria.bootstrap_seed);
    let promote = criteria.decide(n, delta_mrr, ci_lo, delta_hit1, gates.all_pass);

    PromotionEvaluation {
        eligible: true,
        primary_policy: primary_policy.to_string(),
        reason: None,
        baseline: Some(baseline.to_string()),
        candidate: Some(candidate.to_string()),
        n_observed_and_predictor_nonempty: Some(n),
        delta_mrr: Some(delta_mrr),
        delta_mrr_bootstrap_ci95: Some([ci_lo, ci_hi]),
        delta_hit_at_1: Some(delta_hit1),
        gates_pass: Some(gates.all_pass),
        promote,
    }
}

// ---------------------------------------------------------------------------
// Gate enforcement
// ---------------------------------------------------------------------------

/// Outcome of enforcing gates for automation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateOutcome {
    Pass,
    GateFailure,
    Undetermined,
}

impl GateOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Pass => 0,
            Self::GateFailure => 1,
            Self::Undetermined => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionDecision {
    Promote,
    DoNotPromote,
    Ineligible,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateEnforcement {
    pub outcome: GateOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<PromotionDecision>,
    /// Sorted, case-insensitive, de-duplicated.
    pub reasons: Vec<String>,
}

fn sorted_reasons(mut reasons: Vec<String>) -> Vec<String> {
    reasons.retain(|r| !r.trim().is_empty());
    reasons.sort_by(|a, b| a.to_lowercase().cmp(&b.to_lowercase()).then_with(|| a.cmp(b)));
    reasons.dedup();
    reasons
}

/// Enforce quality gates alone.
pub fn enforce_gates(gates: Option<&QualityGates>) -> GateEnforcement {
    match gates {
        None => GateEnforcement {
            outcome: GateOutcome::Undetermined,
            decision: None,
            reasons: vec!["quality_gates missing".to_string()],
        },
        Some(g) if g.all_pass => GateEnforcement {
            outcome: GateOutcome::Pass,
            decision: None,
            reasons: Vec::new(),
        },
        Some(g) => GateEnforcement {
            outcome: GateOutcome::GateFailure,
            decision: None,
            reasons: sorted_reasons(g.failed_ids().into_iter().map(|id| format!("{id} failed")).collect()),
        },
    }
}

/// Enforce a promotion decision; quality failures veto promotion.
pub fn enforce_promotion(gates: Option<&QualityGates>, promotion: Option<&PromotionEvaluation>) -> GateEnforcement {
    let mut reasons = Vec::new();
    if gates.is_some_and(|g| !g.all_pass) {
        reasons.push("quality_gates_all_pass is false".to_string());
    }

    let decision = match promotion {
        None => {
            reasons.push("promotion_evaluation missing".to_string());
            PromotionDecision::Unknown
        }
        Some(p) if !p.eligible => {
            if let Some(reason) = &p.reason {
                reasons.push(reason.trim().to_string());
            }
            PromotionDecision::Ineligible
        }
        Some(p) if p.promote && reasons.is_empty() => PromotionDecision::Promote,
        Some(_) => PromotionDecision::DoNotPromote,
    };

    let outcome = match decision {
        PromotionDecision::Promote => GateOutcome::Pass,
        PromotionDecision::DoNotPromote => GateOutcome::GateFailure,
        PromotionDecision::Ineligible | PromotionDecision::Unknown => GateOutcome::Undetermined,
    };
    GateEnforcement {
        outcome,
        decision: Some(decision),
        reasons: sorted_reasons(reasons),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality_gates::GateThresholds;
    use std::collections::BTreeMap;

    fn gates(all_pass: bool) -> QualityGates {
        QualityGates {
            thresholds: GateThresholds::standard(),
            gates: BTreeMap::new(),
            all_pass,
        }
    }

    #[test]
    fn pair_precedence() {
        assert_eq!(select_pair(&["popularity", "union", "hybrid_ranker"]), Some(("popularity", "hybrid_ranker")));
        assert_eq!(select_pair(&["union", "popularity"]), Some(("popularity", "union")));
        assert_eq!(select_pair(&["llm_rerank", "hybrid_ranker"]), Some(("hybrid_ranker", "llm_rerank")));
        assert_eq!(select_pair(&["popularity"]), None);
    }

    #[test]
    fn missing_pair_is_ineligible_not_error() {
        let eval = evaluate_promotion(&[], &["popularity"], "first_approval_v1", &gates(true), &PromotionCriteria::default());
        assert!(!eval.eligible);
        assert!(!eval.promote);
        assert_eq!(eval.reason.as_deref(), Some(MISSING_PAIR_REASON));
        let v = serde_json::to_value(&eval).unwrap();
        assert!(v.get("delta_mrr").is_none());
    }

    #[test]
    fn decision_rule_scenarios() {
        let c = PromotionCriteria::default();
        assert!(c.decide(150, 0.05, 0.01, 0.0, true));
        assert!(!c.decide(150, 0.05, -0.01, 0.0, true));
        assert!(!c.decide(150, 0.05, 0.01, 0.0, false));
        assert!(!c.decide(119, 0.05, 0.01, 0.0, true));
        assert!(!c.decide(150, 0.01, 0.005, 0.0, true));
        assert!(!c.decide(150, 0.05, 0.01, -0.02, true));
    }

    #[test]
    fn bootstrap_is_seeded_and_bounded() {
        assert_eq!(bootstrap_ci95(&[], 500, 42), (0.0, 0.0));
        let values: Vec<f64> = (0..50).map(|i| if i % 5 == 0 { 0.5 } else { 0.0 }).collect();
        let a = bootstrap_ci95(&values, 500, 42);
        let b = bootstrap_ci95(&values, 500, 42);
        assert_eq!(a, b);
        assert!(a.0 <= 0.1 && 0.1 <= a.1);
        assert_eq!(bootstrap_ci95(&[0.25; 10], 500, 42), (0.25, 0.25));
    }

    #[test]
    fn enforcement_exit_codes() {
        let promoted = PromotionEvaluation {
            eligible: true,
            promote: true,
            ..PromotionEvaluation::default()
        };
        let e = enforce_promotion(Some(&gates(true)), Some(&promoted));
        assert_eq!(e.decision, Some(PromotionDecision::Promote));
        assert_eq!(e.outcome.exit_code(), 0);

        let e = enforce_promotion(Some(&gates(false)), Some(&promoted));
        assert_eq!(e.decision, Some(PromotionDecision::DoNotPromote));
        assert_eq!(e.outcome.exit_code(), 1);
        assert_eq!(e.reasons, vec!["quality_gates_all_pass is false"]);

        let ineligible = PromotionEvaluation {
            reason: Some(MISSING_PAIR_REASON.to_string()),
            ..PromotionEvaluation::default()
        };
        let e = enforce_promotion(Some(&gates(true)), Some(&ineligible));
        assert_eq!(e.outcome, GateOutcome::Undetermined);
        assert_eq!(e.reasons, vec![MISSING_PAIR_REASON]);

        assert_eq!(enforce_promotion(None, None).outcome.exit_code(), 2);
        assert_eq!(enforce_gates(None).outcome.exit_code(), 2);
        assert_eq!(enforce_gates(Some(&gates(false))).outcome.exit_code(), 1);
        assert_eq!(enforce_gates(Some(&gates(true))).outcome.exit_code(), 0);
    }
}
