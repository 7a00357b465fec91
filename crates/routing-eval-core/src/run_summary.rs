//! Run summary: a self-contained digest of one run directory.
//!
//! Built only from the files on disk, and leniently: a missing or unreadable
//! artifact leaves its section empty instead of failing. That makes the
//! summary rebuildable at any time from whatever a run left behind.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::agreement::{AgreementSummary, DenominatorSlice};
use crate::artifacts::{
    count_jsonl_rows, file_sha256, read_json, read_json_object, write_json, RunDir, COHORT_JSON,
    INPUTS_TEMPLATE, MANIFEST_JSON, PER_PR_JSONL, PRS_DIR, REPORT_JSON, REPORT_MD, ROUTE_TEMPLATE,
};
use crate::cutoff::CutoffOrigin;
use crate::domain::Result;
use crate::manifest::RunManifest;
use crate::promotion::PromotionEvaluation;
use crate::quality_gates::{
    GateCategory, QualityGates, G1_TRUTH_WINDOW_CONSISTENCY, G2_TRUTH_POLICY_SCHEMA,
    G3_UNKNOWN_INGESTION_GAP_RATE, G4_OWNERSHIP_AVAILABILITY, G5_PREDICTOR_UNAVAILABLE_RATE,
    G6_DETERMINISTIC_REPRODUCIBILITY,
};
use crate::report::EvalReport;

pub const RUN_SUMMARY_KIND: &str = "run_summary";
pub const RUN_SUMMARY_SCHEMA_VERSION: u32 = 1;
pub const STALE_CUTOFF_GATE: &str = "EVAL_stale_cutoff_horizon";
pub const TAXONOMY_VERSION: &str = "v1";
const WORST_SLICE_LIMIT: usize = 20;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryWatermark {
    pub db_max_event_occurred_at: Option<DateTime<Utc>>,
    pub db_max_watermark_updated_at: Option<DateTime<Utc>>,
    pub cutoff_source: Option<CutoffOrigin>,
    pub cutoff_policy: Option<String>,
    pub min_pr_cutoff: Option<DateTime<Utc>>,
    pub max_pr_cutoff: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryInputs {
    pub cohort_hash: Option<String>,
    pub predictors: Vec<String>,
    pub truth_primary_policy: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryCounts {
    pub pr_count: usize,
    pub per_pr_row_count: usize,
}

/// File names of the artifacts that exist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryArtifacts {
    pub manifest_json: Option<String>,
    pub report_json: Option<String>,
    pub report_md: Option<String>,
    pub per_pr_jsonl: Option<String>,
    pub cohort_json: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryHashes {
    pub manifest_json_sha256: Option<String>,
    pub report_json_sha256: Option<String>,
    pub per_pr_jsonl_sha256: Option<String>,
    pub cohort_json_sha256: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorstSlice {
    pub policy_id: String,
    pub predictor_id: String,
    pub slice: String,
    pub n: usize,
    pub mrr: f64,
    pub hit_at_1: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeadlineMetrics {
    pub routing_agreement: BTreeMap<String, AgreementSummary>,
    pub worst_slices: Vec<WorstSlice>,
}

/// One actionable failure with pointers to where to look.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateFailure {
    pub gate_id: String,
    pub category: GateCategory,
    pub pass: bool,
    pub reason: String,
    pub inspect: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureTaxonomy {
    pub version: String,
    pub categories: Vec<GateCategory>,
}

impl Default for FailureTaxonomy {
    fn default() -> Self {
        Self {
            version: TAXONOMY_VERSION.to_string(),
            categories: GateCategory::ALL.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryGates {
    pub truth_coverage_counts: BTreeMap<String, usize>,
    pub quality_gates: Option<QualityGates>,
    pub promotion_evaluation: Option<PromotionEvaluation>,
    pub warnings: Vec<String>,
    pub taxonomy: FailureTaxonomy,
    pub failures: Vec<GateFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrillTemplates {
    pub prs_dir: String,
    pub pr_dir_template: String,
    pub inputs_template: String,
    pub route_template: String,
    pub per_pr_jsonl: String,
    pub report_json: String,
}

impl Default for DrillTemplates {
    fn default() -> Self {
        Self {
            prs_dir: PRS_DIR.to_string(),
            pr_dir_template: format!("{PRS_DIR}/{{pr_number}}"),
            inputs_template: INPUTS_TEMPLATE.to_string(),
            route_template: ROUTE_TEMPLATE.to_string(),
            per_pr_jsonl: PER_PR_JSONL.to_string(),
            report_json: REPORT_JSON.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub schema_version: u32,
    pub kind: String,
    pub repo: String,
    pub run_id: String,
    pub generated_at: Option<DateTime<Utc>>,
    pub watermark: SummaryWatermark,
    pub inputs: SummaryInputs,
    pub counts: SummaryCounts,
    pub artifacts: SummaryArtifacts,
    pub hashes: SummaryHashes,
    pub headline_metrics: HeadlineMetrics,
    pub gates: SummaryGates,
    pub drill: DrillTemplates,
}

fn sort_ci(values: &mut Vec<String>) {
    values.sort_by(|a, b| a.to_lowercase().cmp(&b.to_lowercase()).then_with(|| a.cmp(b)));
    values.dedup();
}

fn gate_reason(gate_id: &str) -> String {
    match gate_id {
        G4_OWNERSHIP_AVAILABILITY => "repo_profile coverage missing CODEOWNERS for some PRs".to_string(),
        G5_PREDICTOR_UNAVAILABLE_RATE => "predictor output missing or invalid for some PRs".to_string(),
        G3_UNKNOWN_INGESTION_GAP_RATE => "truth unknown due to ingestion gaps for some PRs".to_string(),
        G6_DETERMINISTIC_REPRODUCIBILITY => "determinism check failed (multiple hashes observed)".to_string(),
        G1_TRUTH_WINDOW_CONSISTENCY => "truth window does not align with cutoff for some PRs".to_string(),
        G2_TRUTH_POLICY_SCHEMA => "truth policy payload schema is missing required fields".to_string(),
        other => format!("{other} failed"),
    }
}

fn gate_inspect(gate_id: &str) -> BTreeMap<String, String> {
    let mut inspect = BTreeMap::from([
        ("report_json".to_string(), REPORT_JSON.to_string()),
        ("per_pr_jsonl".to_string(), PER_PR_JSONL.to_string()),
    ]);
    match gate_id {
        G4_OWNERSHIP_AVAILABILITY => {
            inspect.insert("inputs_template".to_string(), INPUTS_TEMPLATE.to_string());
        }
        G5_PREDICTOR_UNAVAILABLE_RATE | G6_DETERMINISTIC_REPRODUCIBILITY => {
            inspect.insert("route_template".to_string(), ROUTE_TEMPLATE.to_string());
        }
        G1_TRUTH_WINDOW_CONSISTENCY | G3_UNKNOWN_INGESTION_GAP_RATE => {
            inspect.insert("truth_diagnostics_field".to_string(), "truth_diagnostics".to_string());
        }
        _ => {}
    }
    inspect
}

/// Whether a report note records cutoffs past the ingestion horizon.
pub fn is_stale_cutoff_note(note: &str) -> bool {
    note.starts_with("db_max_event_occurred_at=") && note.contains("is before cutoffs")
}

fn failures(gates: Option<&QualityGates>, warnings: &[String]) -> Vec<GateFailure> {
    let mut out = Vec::new();
    if let Some(gates) = gates {
        for (gate_id, gate) in &gates.gates {
            if gate.pass {
                continue;
            }
            out.push(GateFailure {
                gate_id: gate_id.clone(),
                category: gate.category,
                pass: false,
                reason: gate_reason(gate_id),
                inspect: gate_inspect(gate_id),
            });
        }
    }
    for note in warnings.iter().filter(|n| is_stale_cutoff_note(n)) {
        out.push(GateFailure {
            gate_id: STALE_CUTOFF_GATE.to_string(),
            category: GateCategory::CutoffSafety,
            pass: false,
            reason: note.clone(),
            inspect: BTreeMap::from([
                ("manifest_json".to_string(), MANIFEST_JSON.to_string()),
                ("report_json".to_string(), REPORT_JSON.to_string()),
            ]),
        });
    }
    out.sort_by(|a, b| {
        (a.category.as_str(), a.gate_id.to_lowercase()).cmp(&(b.category.as_str(), b.gate_id.to_lowercase()))
    });
    out
}

/// Lowest-scoring non-empty slices under one policy.
pub fn worst_slices(report: &EvalReport, policy_id: &str, limit: usize) -> Vec<WorstSlice> {
    let Some(by_predictor) = report.extra.routing_agreement_slices_by_policy.get(policy_id) else {
        return Vec::new();
    };
    let mut rows: Vec<WorstSlice> = by_predictor
        .iter()
        .flat_map(|(predictor_id, by_slice)| {
            by_slice.iter().filter_map(move |(slice, summary)| {
                let mrr = summary.mrr?;
                (summary.n > 0).then(|| WorstSlice {
                    policy_id: policy_id.to_string(),
                    predictor_id: predictor_id.clone(),
                    slice: slice.clone(),
                    n: summary.n,
                    mrr,
                    hit_at_1: summary.hit_at(1),
                })
            })
        })
        .collect();
    rows.sort_by(|a, b| {
        a.mrr
            .total_cmp(&b.mrr)
            .then_with(|| b.n.cmp(&a.n))
            .then_with(|| a.predictor_id.to_lowercase().cmp(&b.predictor_id.to_lowercase()))
            .then_with(|| a.slice.to_lowercase().cmp(&b.slice.to_lowercase()))
    });
    rows.truncate(limit);
    rows
}

fn present(run_dir: &RunDir, name: &str) -> Option<String> {
    run_dir.file(name).is_file().then(|| name.to_string())
}

/// Build the summary of `run_dir` from its artifacts.
pub fn build_run_summary(repo: &str, run_id: &str, run_dir: &RunDir) -> Result<RunSummary> {
    let manifest: Option<RunManifest> = read_json(&run_dir.manifest()).ok();
    let report: Option<EvalReport> = read_json(&run_dir.report_json()).ok();

    let cutoffs: Vec<DateTime<Utc>> = manifest
        .as_ref()
        .map(|m| {
            let mut c: Vec<_> = m.pr_cutoffs.values().copied().collect();
            c.sort();
            c
        })
        .unwrap_or_default();
    let watermark = SummaryWatermark {
        db_max_event_occurred_at: manifest
            .as_ref()
            .and_then(|m| m.db_max_event_occurred_at)
            .or_else(|| report.as_ref().and_then(|r| r.db_max_event_occurred_at)),
        db_max_watermark_updated_at: manifest
            .as_ref()
            .and_then(|m| m.db_max_watermark_updated_at)
            .or_else(|| report.as_ref().and_then(|r| r.db_max_watermark_updated_at)),
        cutoff_source: manifest.as_ref().map(|m| m.cutoff_source),
        cutoff_policy: manifest.as_ref().map(|m| m.cutoff_policy.clone()),
        min_pr_cutoff: cutoffs.first().copied(),
        max_pr_cutoff: cutoffs.last().copied(),
    };

    let mut predictors = match (&report, &manifest) {
        (Some(r), _) => r.predictors.clone(),
        (None, Some(m)) => m.predictor_ids(),
        (None, None) => Vec::new(),
    };
    predictors.retain(|p| !p.trim().is_empty());
    sort_ci(&mut predictors);

    let truth_primary_policy = report
        .as_ref()
        .map(|r| r.extra.truth_primary_policy.clone())
        .or_else(|| manifest.as_ref().map(|m| m.truth.primary.clone()))
        .filter(|p| !p.trim().is_empty());

    let cohort_hash = manifest
        .as_ref()
        .map(|m| m.cohort_hash.clone())
        .filter(|h| !h.trim().is_empty())
        .or_else(|| {
            read_json_object(&run_dir.cohort())
                .and_then(|c| c.get("hash").and_then(|h| h.as_str()).map(str::to_string))
        });

    let per_pr_row_count = if run_dir.per_pr().is_file() {
        count_jsonl_rows(&run_dir.per_pr())?
    } else {
        0
    };
    let pr_count = manifest
        .as_ref()
        .map(|m| m.pr_numbers.len())
        .filter(|n| *n > 0)
        .unwrap_or(per_pr_row_count);

    let mut warnings: Vec<String> = report
        .as_ref()
        .map(|r| r.notes.iter().map(|n| n.trim().to_string()).filter(|n| !n.is_empty()).collect())
        .unwrap_or_default();
    sort_ci(&mut warnings);

    let quality_gates = report.as_ref().map(|r| r.extra.quality_gates.clone());
    let headline_metrics = match (&report, &truth_primary_policy) {
        (Some(r), Some(policy)) => HeadlineMetrics {
            routing_agreement: r.routing_agreement.clone(),
            worst_slices: worst_slices(r, policy, WORST_SLICE_LIMIT),
        },
        (Some(r), None) => HeadlineMetrics {
            routing_agreement: r.routing_agreement.clone(),
            worst_slices: Vec::new(),
        },
        (None, _) => HeadlineMetrics::default(),
    };

    let summary = RunSummary {
        schema_version: RUN_SUMMARY_SCHEMA_VERSION,
        kind: RUN_SUMMARY_KIND.to_string(),
        repo: repo.to_string(),
        run_id: run_id.to_string(),
        generated_at: manifest
            .as_ref()
            .map(|m| m.generated_at)
            .or_else(|| report.as_ref().map(|r| r.generated_at)),
        watermark,
        inputs: SummaryInputs {
            cohort_hash,
            predictors,
            truth_primary_policy,
        },
        counts: SummaryCounts {
            pr_count,
            per_pr_row_count,
        },
        artifacts: SummaryArtifacts {
            manifest_json: present(run_dir, MANIFEST_JSON),
            report_json: present(run_dir, REPORT_JSON),
            report_md: present(run_dir, REPORT_MD),
            per_pr_jsonl: present(run_dir, PER_PR_JSONL),
            cohort_json: present(run_dir, COHORT_JSON),
        },
        hashes: SummaryHashes {
            manifest_json_sha256: file_sha256(&run_dir.manifest())?,
            report_json_sha256: file_sha256(&run_dir.report_json())?,
            per_pr_jsonl_sha256: file_sha256(&run_dir.per_pr())?,
            cohort_json_sha256: file_sha256(&run_dir.cohort())?,
        },
        headline_metrics,
        gates: SummaryGates {
            truth_coverage_counts: report
                .as_ref()
                .map(|r| r.extra.truth_coverage_counts.clone())
                .unwrap_or_default(),
            failures: failures(quality_gates.as_ref(), &warnings),
            quality_gates,
            promotion_evaluation: report.as_ref().map(|r| r.extra.promotion_evaluation.clone()),
            warnings,
            taxonomy: FailureTaxonomy::default(),
        },
        drill: DrillTemplates::default(),
    };
    debug!(repo, run_id, failures = summary.gates.failures.len(), "run summary built");
    Ok(summary)
}

/// Write `run_summary.json`; returns the content hash.
pub fn write_run_summary(run_dir: &RunDir, summary: &RunSummary) -> Result<String> {
    write_json(&run_dir.run_summary(), summary)
}

/// The run's summary, rebuilt and written first if it does not exist yet.
pub fn load_or_build_run_summary(repo: &str, run_id: &str, run_dir: &RunDir) -> Result<RunSummary> {
    if let Ok(summary) = read_json::<RunSummary>(&run_dir.run_summary()) {
        return Ok(summary);
    }
    let summary = build_run_summary(repo, run_id, run_dir)?;
    write_run_summary(run_dir, &summary)?;
    Ok(summary)
}

/// Canonical promotion slice under the primary policy, per predictor.
pub fn canonical_slice_summaries(report: &EvalReport) -> BTreeMap<String, AgreementSummary> {
    let canonical = DenominatorSlice::ObservedAndPredictorNonempty.as_str();
    report
        .extra
        .routing_agreement_slices_by_policy
        .get(&report.extra.truth_primary_policy)
        .map(|by_predictor| {
            by_predictor
                .iter()
                .filter_map(|(id, slices)| slices.get(canonical).map(|s| (id.clone(), s.clone())))
                .collect()
        })
        .unwrap_or_default()
}
