//! Aggregation of the record log into the run report.
//!
//! [`aggregate_records`] is a pure reduction: it reads nothing but the rows it
//! is given, and every mean is computed order-independently, so re-running it
//! over the same log (in any order) yields identical output.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use routing_history::IngestionWatermark;
use serde::{Deserialize, Serialize};

use crate::agreement::{aggregate, AgreementSummary, DenominatorSlice, ItemMetrics};
use crate::domain::{PerPrRecord, TruthStatus};
use crate::promotion::{evaluate_promotion, PromotionCriteria, PromotionEvaluation};
use crate::quality_gates::{evaluate_quality_gates, truth_status_counts, QualityGates};
use crate::queue::{aggregate_queue, QueueSummary};

pub const REPORT_KIND: &str = "eval_report";
pub const REPORT_SCHEMA_VERSION: u32 = 1;

/// Summaries keyed by predictor id.
pub type PredictorSummaries = BTreeMap<String, AgreementSummary>;
/// policy → predictor → slice → summary.
pub type SliceSummaries = BTreeMap<String, BTreeMap<String, BTreeMap<String, AgreementSummary>>>;
/// policy → predictor → slice → row count.
pub type SliceDenominators = BTreeMap<String, BTreeMap<String, BTreeMap<String, usize>>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Aggregates {
    /// Primary policy, all items.
    pub routing_agreement: PredictorSummaries,
    /// Primary policy, known truth only.
    pub routing_agreement_known_truth: PredictorSummaries,
    pub routing_agreement_by_policy: BTreeMap<String, PredictorSummaries>,
    pub routing_agreement_slices_by_policy: SliceSummaries,
    pub routing_denominators_by_policy: SliceDenominators,
    pub truth_coverage_counts: BTreeMap<String, usize>,
    pub truth_coverage_counts_by_policy: BTreeMap<String, BTreeMap<String, usize>>,
    /// Queue latency per predictor, bucketed by risk.
    pub queue: BTreeMap<String, QueueSummary>,
}

/// Reduce the record log to per-predictor, per-policy and per-slice summaries.
pub fn aggregate_records(
    records: &[PerPrRecord],
    predictor_ids: &[String],
    policy_ids: &[String],
    hit_ks: &[usize],
) -> Aggregates {
    let mut out = Aggregates {
        truth_coverage_counts: truth_status_counts(records.iter().map(|r| r.truth_status)),
        queue: aggregate_queue(records, predictor_ids),
        ..Aggregates::default()
    };

    for predictor in predictor_ids {
        let outcomes: Vec<_> = records
            .iter()
            .filter_map(|r| r.predictors.get(predictor).map(|o| (r, o)))
            .collect();
        out.routing_agreement.insert(
            predictor.clone(),
            aggregate(outcomes.iter().map(|(_, o)| &o.routing_agreement), hit_ks),
        );
        out.routing_agreement_known_truth.insert(
            predictor.clone(),
            aggregate(
                outcomes
                    .iter()
                    .filter(|(r, _)| r.truth_status.is_known())
                    .map(|(_, o)| &o.routing_agreement),
                hit_ks,
            ),
        );
    }

    for policy in policy_ids {
        out.truth_coverage_counts_by_policy.insert(
            policy.clone(),
            truth_status_counts(records.iter().filter_map(|r| r.policy_status(policy))),
        );

        let mut by_predictor = PredictorSummaries::new();
        let mut slices = BTreeMap::new();
        let mut denominators = BTreeMap::new();
        for predictor in predictor_ids {
            let rows: Vec<(&ItemMetrics, TruthStatus, bool)> = records
                .iter()
                .filter_map(|r| {
                    let outcome = r.predictors.get(predictor)?;
                    let metrics = outcome.routing_agreement_by_policy.get(policy)?;
                    let status = r.policy_status(policy)?;
                    Some((metrics, status, outcome.is_nonempty()))
                })
                .collect();

            by_predictor.insert(predictor.clone(), aggregate(rows.iter().map(|r| r.0), hit_ks));

            let mut per_slice = BTreeMap::new();
            let mut per_slice_n = BTreeMap::new();
            for slice in DenominatorSlice::ALL {
                let admitted: Vec<&ItemMetrics> = rows
                    .iter()
                    .filter(|(_, status, nonempty)| slice.admits(*status, *nonempty))
                    .map(|r| r.0)
                    .collect();
                per_slice_n.insert(slice.as_str().to_string(), admitted.len());
                per_slice.insert(slice.as_str().to_string(), aggregate(admitted, hit_ks));
            }
            slices.insert(predictor.clone(), per_slice);
            denominators.insert(predictor.clone(), per_slice_n);
        }
        out.routing_agreement_by_policy.insert(policy.clone(), by_predictor);
        out.routing_agreement_slices_by_policy.insert(policy.clone(), slices);
        out.routing_denominators_by_policy.insert(policy.clone(), denominators);
    }

    out
}

// ---------------------------------------------------------------------------
// Report document
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportExtra {
    pub truth_primary_policy: String,
    pub truth_policies: Vec<String>,
    pub truth_coverage_counts: BTreeMap<String, usize>,
    pub truth_coverage_counts_by_policy: BTreeMap<String, BTreeMap<String, usize>>,
    pub routing_agreement_known_truth: PredictorSummaries,
    pub routing_agreement_by_policy: BTreeMap<String, PredictorSummaries>,
    pub routing_agreement_slices_by_policy: SliceSummaries,
    pub routing_denominators_by_policy: SliceDenominators,
    #[serde(default)]
    pub queue: BTreeMap<String, QueueSummary>,
    pub quality_gates: QualityGates,
    pub promotion_evaluation: PromotionEvaluation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalReport {
    pub schema_version: u32,
    pub kind: String,
    pub repo: String,
    pub run_id: String,
    pub generated_at: DateTime<Utc>,
    pub db_max_event_occurred_at: Option<DateTime<Utc>>,
    pub db_max_watermark_updated_at: Option<DateTime<Utc>>,
    pub predictors: Vec<String>,
    pub hit_ks: Vec<usize>,
    pub pr_count: usize,
    pub routing_agreement: PredictorSummaries,
    pub extra: ReportExtra,
    #[serde(default)]
    pub notes: Vec<String>,
}

/// Run-level context the report carries alongside the aggregates.
#[derive(Debug, Clone)]
pub struct ReportContext {
    pub repo: String,
    pub run_id: String,
    pub generated_at: DateTime<Utc>,
    pub watermark: IngestionWatermark,
    pub predictor_ids: Vec<String>,
    pub policy_ids: Vec<String>,
    pub primary_policy: String,
    pub hit_ks: Vec<usize>,
    pub notes: Vec<String>,
    pub criteria: PromotionCriteria,
}

/// Aggregate, gate and score promotion over a complete record log.
pub fn build_report(ctx: &ReportContext, records: &[PerPrRecord]) -> EvalReport {
    let aggregates = aggregate_records(records, &ctx.predictor_ids, &ctx.policy_ids, &ctx.hit_ks);
    let quality_gates = evaluate_quality_gates(records, &ctx.predictor_ids);
    let promotion_evaluation = evaluate_promotion(
        records,
        &ctx.predictor_ids,
        &ctx.primary_policy,
        &quality_gates,
        &ctx.criteria,
    );

    EvalReport {
        schema_version: REPORT_SCHEMA_VERSION,
        kind: REPORT_KIND.to_string(),
        repo: ctx.repo.clone(),
        run_id: ctx.run_id.clone(),
        generated_at: ctx.generated_at,
        db_max_event_occurred_at: ctx.watermark.max_event_occurred_at,
        db_max_watermark_updated_at: ctx.watermark.watermark_updated_at,
        predictors: ctx.predictor_ids.clone(),
        hit_ks: ctx.hit_ks.clone(),
        pr_count: records.len(),
        routing_agreement: aggregates.routing_agreement,
        extra: ReportExtra {
            truth_primary_policy: ctx.primary_policy.clone(),
            truth_policies: ctx.policy_ids.clone(),
            truth_coverage_counts: aggregates.truth_coverage_counts,
            truth_coverage_counts_by_policy: aggregates.truth_coverage_counts_by_policy,
            routing_agreement_known_truth: aggregates.routing_agreement_known_truth,
            routing_agreement_by_policy: aggregates.routing_agreement_by_policy,
            routing_agreement_slices_by_policy: aggregates.routing_agreement_slices_by_policy,
            routing_denominators_by_policy: aggregates.routing_denominators_by_policy,
            queue: aggregates.queue,
            quality_gates,
            promotion_evaluation,
        },
        notes: ctx.notes.clone(),
    }
}
