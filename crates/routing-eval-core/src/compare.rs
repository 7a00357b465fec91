//! Two-run comparison derived purely from run summaries, reports and logs.
//!
//! Metric deltas are always `candidate - baseline`. Compatibility warnings are
//! reported before any delta so a reader can tell whether the two runs were
//! measured on the same items and cutoffs.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use routing_history::PrNumber;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::agreement::{AgreementSummary, ItemMetrics};
use crate::artifacts::{
    compare_dir, read_json, read_json_object, read_records, write_json, RunDir,
    COMPARE_SUMMARY_JSON, INPUTS_TEMPLATE, MANIFEST_JSON, PER_PR_JSONL, REPORT_JSON,
    ROUTE_TEMPLATE, RUN_SUMMARY_JSON,
};
use crate::domain::digest::{canonical_json, compute_digest, sha256_hex};
use crate::domain::{EvalError, PerPrRecord, Result, TruthStatus};
use crate::report::EvalReport;
use crate::run_summary::{load_or_build_run_summary, RunSummary, SummaryWatermark};

pub const COMPARE_KIND: &str = "compare_summary";
pub const COMPARE_SCHEMA_VERSION: u32 = 1;
const REGRESSION_LIMIT: usize = 20;

/// Metric name → `candidate - baseline`, null when either side is missing.
pub type MetricDeltas = BTreeMap<String, Option<f64>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSide {
    pub run_id: String,
    pub run_dir: String,
    pub cohort_hash: Option<String>,
    pub pr_cutoffs_hash: Option<String>,
    pub watermark: SummaryWatermark,
    pub artifacts: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compatibility {
    pub warnings: Vec<String>,
    pub cohort_hash_match: Option<bool>,
    pub pr_cutoffs_match: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictorDelta {
    pub predictor_id: String,
    pub baseline: AgreementSummary,
    pub candidate: AgreementSummary,
    pub delta: MetricDeltas,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceDelta {
    pub policy_id: String,
    pub predictor_id: String,
    pub slice: String,
    pub baseline: AgreementSummary,
    pub candidate: AgreementSummary,
    pub delta: MetricDeltas,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemArtifacts {
    pub run_id: String,
    pub inputs_json: String,
    pub route_json: String,
}

impl ItemArtifacts {
    fn new(run_id: &str, pr_number: PrNumber, predictor_id: &str) -> Self {
        let pr = pr_number.to_string();
        Self {
            run_id: run_id.to_string(),
            inputs_json: INPUTS_TEMPLATE.replace("{pr_number}", &pr),
            route_json: ROUTE_TEMPLATE
                .replace("{pr_number}", &pr)
                .replace("{predictor_id}", predictor_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRegression {
    pub pr_number: PrNumber,
    pub predictor_id: String,
    pub policy_id: Option<String>,
    pub baseline: ItemMetrics,
    pub candidate: ItemMetrics,
    pub delta: MetricDeltas,
    pub baseline_artifacts: ItemArtifacts,
    pub candidate_artifacts: ItemArtifacts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountDelta {
    pub baseline: usize,
    pub candidate: usize,
    pub delta: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateRow {
    pub gate_id: String,
    pub baseline_pass: Option<bool>,
    pub candidate_pass: Option<bool>,
    pub baseline_value: Option<f64>,
    pub candidate_value: Option<f64>,
    pub delta_value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityGateDeltas {
    pub baseline_all_pass: Option<bool>,
    pub candidate_all_pass: Option<bool>,
    pub gate_rows: Vec<GateRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionDeltas {
    pub baseline_promote: Option<bool>,
    pub candidate_promote: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GateDeltas {
    pub truth_coverage_counts: BTreeMap<String, CountDelta>,
    pub quality_gates: Option<QualityGateDeltas>,
    pub promotion: Option<PromotionDeltas>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompareDrill {
    pub baseline_run_dir: String,
    pub candidate_run_dir: String,
    pub baseline_run_summary: String,
    pub candidate_run_summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompareSummary {
    pub schema_version: u32,
    pub kind: String,
    pub generated_at: DateTime<Utc>,
    pub compare_id: String,
    pub repo: String,
    pub baseline: RunSide,
    pub candidate: RunSide,
    pub compatibility: Compatibility,
    pub ranked_deltas: Vec<PredictorDelta>,
    pub top_regressed_slices: Vec<SliceDelta>,
    pub top_regressed_examples: Vec<ItemRegression>,
    pub gate_deltas: GateDeltas,
    pub drill: CompareDrill,
}

// ---------------------------------------------------------------------------
// Deltas
// ---------------------------------------------------------------------------

fn delta(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    Some(b? - a?)
}

fn ci_cmp(a: &str, b: &str) -> std::cmp::Ordering {
    a.to_lowercase().cmp(&b.to_lowercase()).then_with(|| a.cmp(b))
}

fn common_keys<'a, V>(a: &'a BTreeMap<String, V>, b: &'a BTreeMap<String, V>) -> Vec<&'a String> {
    let mut keys: Vec<&String> = a.keys().filter(|k| b.contains_key(*k)).collect();
    keys.sort_by(|x, y| ci_cmp(x, y));
    keys
}

fn summary_deltas(b: &AgreementSummary, c: &AgreementSummary, ks: impl IntoIterator<Item = usize>) -> MetricDeltas {
    let mut out = MetricDeltas::new();
    out.insert("mrr".to_string(), delta(b.mrr, c.mrr));
    for k in ks {
        out.insert(format!("hit_at_{k}"), delta(b.hit_at(k), c.hit_at(k)));
    }
    out
}

fn item_deltas(b: &ItemMetrics, c: &ItemMetrics) -> MetricDeltas {
    MetricDeltas::from([
        ("mrr".to_string(), delta(b.mrr, c.mrr)),
        ("hit_at_1".to_string(), delta(b.hit_at(1), c.hit_at(1))),
    ])
}

fn delta_mrr(deltas: &MetricDeltas) -> Option<f64> {
    deltas.get("mrr").copied().flatten()
}

/// Per-predictor headline deltas, ascending by Δmrr.
pub fn ranked_predictor_deltas(
    baseline: &BTreeMap<String, AgreementSummary>,
    candidate: &BTreeMap<String, AgreementSummary>,
) -> Vec<PredictorDelta> {
    let mut rows: Vec<PredictorDelta> = common_keys(baseline, candidate)
        .into_iter()
        .map(|id| {
            let b = &baseline[id];
            let c = &candidate[id];
            let ks: BTreeSet<usize> = b.hits.keys().chain(c.hits.keys()).copied().collect();
            PredictorDelta {
                predictor_id: id.clone(),
                baseline: b.clone(),
                candidate: c.clone(),
                delta: summary_deltas(b, c, ks),
            }
        })
        .collect();
    rows.sort_by(|a, b| {
        delta_mrr(&a.delta)
            .unwrap_or(0.0)
            .total_cmp(&delta_mrr(&b.delta).unwrap_or(0.0))
            .then_with(|| ci_cmp(&a.predictor_id, &b.predictor_id))
    });
    rows
}

/// Slices whose mean reciprocal rank regressed, worst first.
pub fn regressed_slices(baseline: &EvalReport, candidate: &EvalReport, limit: usize) -> Vec<SliceDelta> {
    let b_slices = &baseline.extra.routing_agreement_slices_by_policy;
    let c_slices = &candidate.extra.routing_agreement_slices_by_policy;
    let mut rows = Vec::new();
    for policy in common_keys(b_slices, c_slices) {
        let (b_by_predictor, c_by_predictor) = (&b_slices[policy], &c_slices[policy]);
        for predictor in common_keys(b_by_predictor, c_by_predictor) {
            let (b_by_slice, c_by_slice) = (&b_by_predictor[predictor], &c_by_predictor[predictor]);
            for slice in common_keys(b_by_slice, c_by_slice) {
                let (b, c) = (&b_by_slice[slice], &c_by_slice[slice]);
                let deltas = summary_deltas(b, c, [1]);
                if !delta_mrr(&deltas).is_some_and(|d| d < 0.0) {
                    continue;
                }
                rows.push(SliceDelta {
                    policy_id: policy.clone(),
                    predictor_id: predictor.clone(),
                    slice: slice.clone(),
                    baseline: b.clone(),
                    candidate: c.clone(),
                    delta: deltas,
                });
            }
        }
    }
    rows.sort_by(|a, b| {
        delta_mrr(&a.delta)
            .unwrap_or(0.0)
            .total_cmp(&delta_mrr(&b.delta).unwrap_or(0.0))
            .then_with(|| ci_cmp(&a.policy_id, &b.policy_id))
            .then_with(|| ci_cmp(&a.predictor_id, &b.predictor_id))
            .then_with(|| ci_cmp(&a.slice, &b.slice))
    });
    rows.truncate(limit);
    rows
}

fn item_metrics_for<'a>(record: &'a PerPrRecord, predictor: &str, policy_id: Option<&str>) -> Option<&'a ItemMetrics> {
    let outcome = record.predictors.get(predictor)?;
    policy_id
        .and_then(|p| outcome.routing_agreement_by_policy.get(p))
        .or(Some(&outcome.routing_agreement))
}

/// Individual items whose reciprocal rank regressed, worst first.
///
/// With a policy, only items observed under it in both runs are considered.
pub fn regressed_items(
    baseline_run_id: &str,
    candidate_run_id: &str,
    baseline: &[PerPrRecord],
    candidate: &[PerPrRecord],
    policy_id: Option<&str>,
    limit: usize,
) -> Vec<ItemRegression> {
    let b_by_pr: BTreeMap<PrNumber, &PerPrRecord> = baseline.iter().map(|r| (r.pr_number, r)).collect();
    let c_by_pr: BTreeMap<PrNumber, &PerPrRecord> = candidate.iter().map(|r| (r.pr_number, r)).collect();

    let mut rows = Vec::new();
    for (pr_number, br) in &b_by_pr {
        let Some(cr) = c_by_pr.get(pr_number) else {
            continue;
        };
        if let Some(policy) = policy_id {
            let observed = |r: &PerPrRecord| r.policy_status(policy) == Some(TruthStatus::Observed);
            if !observed(br) || !observed(cr) {
                continue;
            }
        }
        let mut predictors: Vec<&String> = br.predictors.keys().filter(|k| cr.predictors.contains_key(*k)).collect();
        predictors.sort_by(|a, b| ci_cmp(a, b));
        for predictor in predictors {
            let (Some(bm), Some(cm)) = (
                item_metrics_for(br, predictor, policy_id),
                item_metrics_for(cr, predictor, policy_id),
            ) else {
                continue;
            };
            let deltas = item_deltas(bm, cm);
            if !delta_mrr(&deltas).is_some_and(|d| d < 0.0) {
                continue;
            }
            rows.push(ItemRegression {
                pr_number: *pr_number,
                predictor_id: predictor.clone(),
                policy_id: policy_id.map(str::to_string),
                baseline: bm.clone(),
                candidate: cm.clone(),
                delta: deltas,
                baseline_artifacts: ItemArtifacts::new(baseline_run_id, *pr_number, predictor),
                candidate_artifacts: ItemArtifacts::new(candidate_run_id, *pr_number, predictor),
            });
        }
    }
    rows.sort_by(|a, b| {
        delta_mrr(&a.delta)
            .unwrap_or(0.0)
            .total_cmp(&delta_mrr(&b.delta).unwrap_or(0.0))
            .then_with(|| a.pr_number.cmp(&b.pr_number))
            .then_with(|| ci_cmp(&a.predictor_id, &b.predictor_id))
    });
    rows.truncate(limit);
    rows
}

/// Truth coverage, gate and promotion changes between two summaries.
pub fn gate_deltas(baseline: &RunSummary, candidate: &RunSummary) -> GateDeltas {
    let (b_counts, c_counts) = (&baseline.gates.truth_coverage_counts, &candidate.gates.truth_coverage_counts);
    let keys: BTreeSet<&String> = b_counts.keys().chain(c_counts.keys()).collect();
    let truth_coverage_counts = keys
        .into_iter()
        .map(|k| {
            let b = b_counts.get(k).copied().unwrap_or(0);
            let c = c_counts.get(k).copied().unwrap_or(0);
            (
                k.clone(),
                CountDelta {
                    baseline: b,
                    candidate: c,
                    delta: c as i64 - b as i64,
                },
            )
        })
        .collect();

    let (bq, cq) = (baseline.gates.quality_gates.as_ref(), candidate.gates.quality_gates.as_ref());
    let gate_ids: BTreeSet<&String> = bq
        .into_iter()
        .flat_map(|q| q.gates.keys())
        .chain(cq.into_iter().flat_map(|q| q.gates.keys()))
        .collect();
    let mut gate_rows: Vec<GateRow> = gate_ids
        .into_iter()
        .map(|id| {
            let bg = bq.and_then(|q| q.gates.get(id));
            let cg = cq.and_then(|q| q.gates.get(id));
            let bv = bg.and_then(|g| g.value);
            let cv = cg.and_then(|g| g.value);
            GateRow {
                gate_id: id.clone(),
                baseline_pass: bg.map(|g| g.pass),
                candidate_pass: cg.map(|g| g.pass),
                baseline_value: bv,
                candidate_value: cv,
                delta_value: delta(bv, cv),
            }
        })
        .collect();
    gate_rows.sort_by(|a, b| ci_cmp(&a.gate_id, &b.gate_id));
    let quality_gates = (bq.is_some() || cq.is_some()).then(|| QualityGateDeltas {
        baseline_all_pass: bq.map(|q| q.all_pass),
        candidate_all_pass: cq.map(|q| q.all_pass),
        gate_rows,
    });

    let bp = baseline.gates.promotion_evaluation.as_ref().map(|p| p.promote);
    let cp = candidate.gates.promotion_evaluation.as_ref().map(|p| p.promote);
    let promotion = (bp.is_some() || cp.is_some()).then_some(PromotionDeltas {
        baseline_promote: bp,
        candidate_promote: cp,
    });

    GateDeltas {
        truth_coverage_counts,
        quality_gates,
        promotion,
    }
}

// ---------------------------------------------------------------------------
// Assembly
// ---------------------------------------------------------------------------

fn pr_cutoffs_hash(run_dir: &RunDir) -> Result<Option<String>> {
    match read_json_object(&run_dir.manifest()).and_then(|m| m.get("pr_cutoffs").cloned()) {
        Some(cutoffs) if cutoffs.is_object() => Ok(Some(compute_digest(&cutoffs)?)),
        _ => Ok(None),
    }
}

fn relative(path: &Path, data_dir: &Path) -> String {
    path.strip_prefix(data_dir)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

fn side_artifacts() -> BTreeMap<String, String> {
    [
        ("run_summary_json", RUN_SUMMARY_JSON),
        ("manifest_json", MANIFEST_JSON),
        ("report_json", REPORT_JSON),
        ("per_pr_jsonl", PER_PR_JSONL),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn compatibility(b_cohort: Option<&str>, c_cohort: Option<&str>, b_cut: Option<&str>, c_cut: Option<&str>) -> Compatibility {
    let mut out = Compatibility::default();
    match (b_cohort, c_cohort) {
        (Some(b), Some(c)) => {
            out.cohort_hash_match = Some(b == c);
            if b != c {
                out.warnings.push(format!("cohort_hash_mismatch {b} != {c}"));
            }
        }
        (None, None) => {}
        _ => out.warnings.push("cohort_hash_missing_in_one_run".to_string()),
    }
    if let (Some(b), Some(c)) = (b_cut, c_cut) {
        out.pr_cutoffs_match = Some(b == c);
        if b != c {
            out.warnings.push("pr_cutoffs_hash_mismatch".to_string());
        }
    }
    out.warnings.sort_by(|a, b| ci_cmp(a, b));
    out.warnings.dedup();
    out
}

fn records_or_empty(run_dir: &RunDir) -> Result<Vec<PerPrRecord>> {
    if run_dir.per_pr().is_file() {
        read_records(&run_dir.per_pr())
    } else {
        Ok(Vec::new())
    }
}

/// Compare two runs of the same repository.
///
/// Both run directories must exist. Missing run summaries are rebuilt and
/// written first. A missing report in either run is an error.
pub fn build_compare_summary(
    data_dir: &Path,
    repo: &str,
    baseline_run_id: &str,
    candidate_run_id: &str,
    now: DateTime<Utc>,
) -> Result<CompareSummary> {
    let b_dir = RunDir::new(data_dir, repo, baseline_run_id);
    let c_dir = RunDir::new(data_dir, repo, candidate_run_id);
    for (run_id, dir) in [(baseline_run_id, &b_dir), (candidate_run_id, &c_dir)] {
        if !dir.exists() {
            return Err(EvalError::NotFound(format!("run {run_id} under {}", dir.path().display())));
        }
    }
    let b_summary = load_or_build_run_summary(repo, baseline_run_id, &b_dir)?;
    let c_summary = load_or_build_run_summary(repo, candidate_run_id, &c_dir)?;

    let b_cohort = b_summary.inputs.cohort_hash.clone();
    let c_cohort = c_summary.inputs.cohort_hash.clone();
    let b_cutoffs = pr_cutoffs_hash(&b_dir)?;
    let c_cutoffs = pr_cutoffs_hash(&c_dir)?;
    let compatibility = compatibility(
        b_cohort.as_deref(),
        c_cohort.as_deref(),
        b_cutoffs.as_deref(),
        c_cutoffs.as_deref(),
    );

    let (b_report, c_report) = match (
        read_json::<EvalReport>(&b_dir.report_json()),
        read_json::<EvalReport>(&c_dir.report_json()),
    ) {
        (Ok(b), Ok(c)) => (b, c),
        _ => {
            return Err(EvalError::MissingArtifact(
                "report.json in baseline or candidate".to_string(),
            ))
        }
    };

    let policy_id = c_summary
        .inputs
        .truth_primary_policy
        .clone()
        .or_else(|| b_summary.inputs.truth_primary_policy.clone())
        .filter(|p| !p.trim().is_empty());
    let top_regressed_examples = regressed_items(
        baseline_run_id,
        candidate_run_id,
        &records_or_empty(&b_dir)?,
        &records_or_empty(&c_dir)?,
        policy_id.as_deref(),
        REGRESSION_LIMIT,
    );

    let compare_id = sha256_hex(
        canonical_json(&json!({
            "repo": repo,
            "baseline": {
                "run_id": baseline_run_id,
                "report_sha256": b_summary.hashes.report_json_sha256,
                "per_pr_sha256": b_summary.hashes.per_pr_jsonl_sha256,
            },
            "candidate": {
                "run_id": candidate_run_id,
                "report_sha256": c_summary.hashes.report_json_sha256,
                "per_pr_sha256": c_summary.hashes.per_pr_jsonl_sha256,
            },
        }))?
        .as_bytes(),
    );

    let b_rel = relative(b_dir.path(), data_dir);
    let c_rel = relative(c_dir.path(), data_dir);
    Ok(CompareSummary {
        schema_version: COMPARE_SCHEMA_VERSION,
        kind: COMPARE_KIND.to_string(),
        generated_at: now,
        compare_id,
        repo: repo.to_string(),
        ranked_deltas: ranked_predictor_deltas(
            &b_summary.headline_metrics.routing_agreement,
            &c_summary.headline_metrics.routing_agreement,
        ),
        top_regressed_slices: regressed_slices(&b_report, &c_report, REGRESSION_LIMIT),
        top_regressed_examples,
        gate_deltas: gate_deltas(&b_summary, &c_summary),
        drill: CompareDrill {
            baseline_run_summary: format!("{b_rel}/{RUN_SUMMARY_JSON}"),
            candidate_run_summary: format!("{c_rel}/{RUN_SUMMARY_JSON}"),
            baseline_run_dir: b_rel.clone(),
            candidate_run_dir: c_rel.clone(),
        },
        baseline: RunSide {
            run_id: baseline_run_id.to_string(),
            run_dir: b_rel,
            cohort_hash: b_cohort,
            pr_cutoffs_hash: b_cutoffs,
            watermark: b_summary.watermark.clone(),
            artifacts: side_artifacts(),
        },
        candidate: RunSide {
            run_id: candidate_run_id.to_string(),
            run_dir: c_rel,
            cohort_hash: c_cohort,
            pr_cutoffs_hash: c_cutoffs,
            watermark: c_summary.watermark.clone(),
            artifacts: side_artifacts(),
        },
        compatibility,
    })
}

/// Build and write `compare_summary.json`; returns its path.
pub fn write_compare_summary(
    data_dir: &Path,
    repo: &str,
    baseline_run_id: &str,
    candidate_run_id: &str,
    now: DateTime<Utc>,
) -> Result<(PathBuf, CompareSummary)> {
    let summary = build_compare_summary(data_dir, repo, baseline_run_id, candidate_run_id, now)?;
    let path = compare_dir(data_dir, repo, baseline_run_id, candidate_run_id).join(COMPARE_SUMMARY_JSON);
    write_json(&path, &summary)?;
    info!(
        event = "compare.written",
        repo,
        compare_id = %summary.compare_id,
        warnings = summary.compatibility.warnings.len(),
        "compare summary written"
    );
    Ok((path, summary))
}
