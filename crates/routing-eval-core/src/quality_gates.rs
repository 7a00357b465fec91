//! Quality gates G1-G6 over the per-item record log.
//!
//! Gates never fail with an error: missing data produces a measured value of
//! zero (or a vacuous pass) and the verdict says so. The threshold profile is
//! `strict` when any higher-tier predictor takes part in the run.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::domain::{PerPrRecord, TruthStatus};

pub const G1_TRUTH_WINDOW_CONSISTENCY: &str = "G1_truth_window_consistency";
pub const G2_TRUTH_POLICY_SCHEMA: &str = "G2_truth_policy_schema";
pub const G3_UNKNOWN_INGESTION_GAP_RATE: &str = "G3_unknown_ingestion_gap_rate";
pub const G4_OWNERSHIP_AVAILABILITY: &str = "G4_ownership_availability";
pub const G5_PREDICTOR_UNAVAILABLE_RATE: &str = "G5_predictor_unavailable_rate";
pub const G6_DETERMINISTIC_REPRODUCIBILITY: &str = "G6_deterministic_reproducibility";

/// Predictors whose presence selects the strict profile.
pub const HIGHER_TIER_PREDICTORS: [&str; 3] = ["union", "hybrid_ranker", "llm_rerank"];

/// Predictor whose notes carry the reproducibility signature.
pub const SIGNATURE_PREDICTOR: &str = "hybrid_ranker";
const SIGNATURE_NOTE_PREFIX: &str = "weights_hash=";

/// Failure taxonomy for gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateCategory {
    DataIntegrity,
    CutoffSafety,
    TruthCoverage,
    Performance,
    Stability,
}

impl GateCategory {
    pub const ALL: [GateCategory; 5] = [
        GateCategory::DataIntegrity,
        GateCategory::CutoffSafety,
        GateCategory::TruthCoverage,
        GateCategory::Performance,
        GateCategory::Stability,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DataIntegrity => "data_integrity",
            Self::CutoffSafety => "cutoff_safety",
            Self::TruthCoverage => "truth_coverage",
            Self::Performance => "performance",
            Self::Stability => "stability",
        }
    }

    /// Category of a gate id; unknown ids are data-integrity problems.
    pub fn of_gate(gate_id: &str) -> Self {
        match gate_id {
            G1_TRUTH_WINDOW_CONSISTENCY => Self::CutoffSafety,
            G3_UNKNOWN_INGESTION_GAP_RATE => Self::TruthCoverage,
            G5_PREDICTOR_UNAVAILABLE_RATE => Self::Performance,
            G6_DETERMINISTIC_REPRODUCIBILITY => Self::Stability,
            _ => Self::DataIntegrity,
        }
    }
}

/// Threshold profile (`standard` or `strict`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateThresholds {
    pub profile: String,
    pub unknown_max: f64,
    pub availability_min: f64,
    pub unavailable_max: f64,
}

impl GateThresholds {
    pub fn standard() -> Self {
        Self {
            profile: "standard".to_string(),
            unknown_max: 0.03,
            availability_min: 0.90,
            unavailable_max: 0.02,
        }
    }

    pub fn strict() -> Self {
        Self {
            profile: "strict".to_string(),
            unknown_max: 0.02,
            availability_min: 0.95,
            unavailable_max: 0.01,
        }
    }

    pub fn for_predictors<S: AsRef<str>>(predictor_ids: &[S]) -> Self {
        let higher_tier = predictor_ids
            .iter()
            .any(|id| HIGHER_TIER_PREDICTORS.contains(&id.as_ref()));
        if higher_tier {
            Self::strict()
        } else {
            Self::standard()
        }
    }
}

/// One gate's verdict. Exactly one of `target`, `max`, `min` is set for
/// measured gates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub category: GateCategory,
    pub pass: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hybrid_weights_hashes: Option<Vec<String>>,
}

impl GateResult {
    fn flag(category: GateCategory, pass: bool) -> Self {
        Self {
            category,
            pass,
            value: None,
            target: None,
            max: None,
            min: None,
            hybrid_weights_hashes: None,
        }
    }

    pub fn threshold(&self) -> Option<f64> {
        self.target.or(self.max).or(self.min)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityGates {
    pub thresholds: GateThresholds,
    pub gates: BTreeMap<String, GateResult>,
    pub all_pass: bool,
}

impl QualityGates {
    pub fn failed_ids(&self) -> Vec<String> {
        self.gates
            .iter()
            .filter(|(_, g)| !g.pass)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

pub fn safe_ratio(numer: usize, denom: usize) -> f64 {
    if denom == 0 {
        0.0
    } else {
        numer as f64 / denom as f64
    }
}

/// Primary-status counts, every status present (zero when unseen).
pub fn truth_status_counts(statuses: impl IntoIterator<Item = TruthStatus>) -> BTreeMap<String, usize> {
    let mut counts: BTreeMap<String, usize> = TruthStatus::ALL
        .iter()
        .map(|s| (s.as_str().to_string(), 0))
        .collect();
    for status in statuses {
        *counts.entry(status.as_str().to_string()).or_default() += 1;
    }
    counts
}

fn window_consistency(records: &[PerPrRecord]) -> f64 {
    let consistent = records
        .iter()
        .filter(|r| r.truth_diagnostics.window_end > r.cutoff)
        .count();
    safe_ratio(consistent, records.len())
}

fn policy_schema_ok(records: &[PerPrRecord]) -> bool {
    records.iter().all(|r| {
        r.truth.policies.contains_key(&r.truth.primary_policy)
            && r.truth.policies.iter().all(|(id, p)| {
                p.diagnostics.policy_id == *id && p.diagnostics.status == p.status
            })
    })
}

fn unknown_rate(records: &[PerPrRecord]) -> f64 {
    let counts = truth_status_counts(records.iter().map(|r| r.truth_status));
    let total: usize = counts.values().sum();
    let unknown = counts
        .get(TruthStatus::UnknownDueToIngestionGap.as_str())
        .copied()
        .unwrap_or(0);
    safe_ratio(unknown, if total > 0 { total } else { records.len() })
}

fn ownership_availability(records: &[PerPrRecord]) -> f64 {
    let with_coverage: Vec<_> = records.iter().filter_map(|r| r.ownership.as_ref()).collect();
    let present = with_coverage.iter().filter(|c| c.codeowners_present).count();
    safe_ratio(present, with_coverage.len())
}

fn unavailable_rate<S: AsRef<str>>(records: &[PerPrRecord], predictor_ids: &[S]) -> f64 {
    let mut total = 0;
    let mut unavailable = 0;
    for record in records {
        for id in predictor_ids {
            if let Some(outcome) = record.predictors.get(id.as_ref()) {
                total += 1;
                if !outcome.is_nonempty() {
                    unavailable += 1;
                }
            }
        }
    }
    safe_ratio(unavailable, total)
}

fn signature_hashes(records: &[PerPrRecord]) -> Vec<String> {
    let hashes: BTreeSet<String> = records
        .iter()
        .filter_map(|r| r.predictors.get(SIGNATURE_PREDICTOR))
        .filter_map(|o| o.route_result.as_ref())
        .flat_map(|rr| rr.notes.iter())
        .filter_map(|n| n.strip_prefix(SIGNATURE_NOTE_PREFIX))
        .map(str::to_string)
        .collect();
    hashes.into_iter().collect()
}

/// Evaluate all six gates.
pub fn evaluate_quality_gates<S: AsRef<str>>(records: &[PerPrRecord], predictor_ids: &[S]) -> QualityGates {
    let thresholds = GateThresholds::for_predictors(predictor_ids);
    let mut gates = BTreeMap::new();

    let g1 = window_consistency(records);
    gates.insert(
        G1_TRUTH_WINDOW_CONSISTENCY.to_string(),
        GateResult {
            value: Some(g1),
            target: Some(1.0),
            ..GateResult::flag(GateCategory::CutoffSafety, g1 >= 1.0)
        },
    );

    gates.insert(
        G2_TRUTH_POLICY_SCHEMA.to_string(),
        GateResult::flag(GateCategory::DataIntegrity, policy_schema_ok(records)),
    );

    let g3 = unknown_rate(records);
    gates.insert(
        G3_UNKNOWN_INGESTION_GAP_RATE.to_string(),
        GateResult {
            value: Some(g3),
            max: Some(thresholds.unknown_max),
            ..GateResult::flag(GateCategory::TruthCoverage, g3 <= thresholds.unknown_max)
        },
    );

    let g4 = ownership_availability(records);
    gates.insert(
        G4_OWNERSHIP_AVAILABILITY.to_string(),
        GateResult {
            value: Some(g4),
            min: Some(thresholds.availability_min),
            ..GateResult::flag(GateCategory::DataIntegrity, g4 >= thresholds.availability_min)
        },
    );

    let g5 = unavailable_rate(records, predictor_ids);
    gates.insert(
        G5_PREDICTOR_UNAVAILABLE_RATE.to_string(),
        GateResult {
            value: Some(g5),
            max: Some(thresholds.unavailable_max),
            ..GateResult::flag(GateCategory::Performance, g5 <= thresholds.unavailable_max)
        },
    );

    let hashes = signature_hashes(records);
    gates.insert(
        G6_DETERMINISTIC_REPRODUCIBILITY.to_string(),
        GateResult {
            hybrid_weights_hashes: Some(hashes.clone()),
            ..GateResult::flag(GateCategory::Stability, hashes.len() <= 1)
        },
    );

    let all_pass = gates.values().all(|g| g.pass);
    QualityGates {
        thresholds,
        gates,
        all_pass,
    }
}
