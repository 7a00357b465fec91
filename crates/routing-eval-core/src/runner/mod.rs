//! Evaluation run orchestration.
//!
//! A run is four stages, each consuming only what the previous one produced:
//!
//! 1. prepare: config, truth policies, predictors, cohort, cutoffs, leakage check
//! 2. per-item: inputs, truth, predictor fan-out, append to `per_pr.jsonl`
//! 3. aggregate: report, quality gates, promotion (pure over the record log)
//! 4. emit: report, manifest, cohort, run summary
//!
//! Aggregation can also be replayed from an existing run directory.

pub mod emit;
pub mod per_pr;
pub mod prepare;

use std::time::Instant;

use chrono::{DateTime, Utc};
use routing_history::IngestionWatermark;
use tracing::Instrument;

use crate::artifacts::{read_json, read_records, RunDir};
use crate::config::RunConfig;
use crate::cutoff::ResolvedCutoffs;
use crate::domain::Result;
use crate::manifest::RunManifest;
use crate::metrics::METRICS;
use crate::obs;
use crate::promotion::PromotionCriteria;
use crate::report::{build_report, EvalReport, ReportContext};
use crate::run_summary::RunSummary;

pub use emit::{emit_artifacts, write_report};
pub use per_pr::{evaluate_item, run_items};
pub use prepare::{prepare_run, resolve_run_id, stale_cutoff_note, EvalContext, PreparedRun};

/// What a completed run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub run_dir: RunDir,
    pub report: EvalReport,
    pub summary: RunSummary,
}

fn report_context(prepared: &PreparedRun, criteria: &PromotionCriteria) -> ReportContext {
    ReportContext {
        repo: prepared.repo.clone(),
        run_id: prepared.run_id.clone(),
        generated_at: prepared.generated_at,
        watermark: prepared.watermark.clone(),
        predictor_ids: prepared.predictor_ids.clone(),
        policy_ids: prepared.policies.ids(),
        primary_policy: prepared.primary_policy().to_string(),
        hit_ks: prepared.defaults.hit_ks.clone(),
        notes: prepared.notes.clone(),
        criteria: criteria.clone(),
    }
}

async fn execute(ctx: &EvalContext, config: &RunConfig, run_id: &str, now: DateTime<Utc>) -> Result<RunOutcome> {
    let prepared = prepare_run(ctx, config, run_id, now).await?;
    let records = run_items(&prepared, ctx.store.as_ref()).await?;

    let report = build_report(&report_context(&prepared, &ctx.criteria), &records);
    let gates = &report.extra.quality_gates;
    obs::emit_gates_evaluated(run_id, gates.all_pass, &gates.failed_ids());

    let summary = emit_artifacts(&prepared, &report)?;
    Ok(RunOutcome {
        run_id: prepared.run_id.clone(),
        run_dir: prepared.run_dir.clone(),
        report,
        summary,
    })
}

/// Run a full evaluation at the current time.
pub async fn run_evaluation(ctx: &EvalContext, config: &RunConfig) -> Result<RunOutcome> {
    run_evaluation_at(ctx, config, Utc::now()).await
}

/// Run a full evaluation with an explicit clock reading.
pub async fn run_evaluation_at(ctx: &EvalContext, config: &RunConfig, now: DateTime<Utc>) -> Result<RunOutcome> {
    let run_id = resolve_run_id(config, now)?;
    let started = Instant::now();
    let result = execute(ctx, config, &run_id, now)
        .instrument(obs::run_span(&run_id))
        .await;

    let items = result.as_ref().map_or(0, |o| o.report.pr_count);
    obs::emit_run_finished(
        &run_id,
        started.elapsed().as_millis() as u64,
        items,
        result.is_ok(),
    );
    METRICS.flush();
    result
}

/// Re-aggregate a finished run from its manifest and record log.
///
/// The stored `generated_at` is reused, so replaying an untouched run yields
/// the same report document.
pub fn replay_report(run_dir: &RunDir, criteria: &PromotionCriteria) -> Result<EvalReport> {
    let manifest: RunManifest = read_json(&run_dir.manifest())?;
    let records = read_records(&run_dir.per_pr())?;
    let cutoffs = ResolvedCutoffs {
        cutoffs: manifest
            .pr_numbers
            .iter()
            .filter_map(|n| manifest.pr_cutoffs.get(&n.to_string()).map(|c| (*n, *c)))
            .collect(),
        origin: manifest.cutoff_source,
    };
    let notes = stale_cutoff_note(manifest.db_max_event_occurred_at, &cutoffs)
        .into_iter()
        .collect();
    let ctx = ReportContext {
        repo: manifest.repo.clone(),
        run_id: manifest.run_id.clone(),
        generated_at: manifest.generated_at,
        watermark: IngestionWatermark {
            max_event_occurred_at: manifest.db_max_event_occurred_at,
            watermark_updated_at: manifest.db_max_watermark_updated_at,
        },
        predictor_ids: manifest.predictor_ids(),
        policy_ids: manifest.truth.policies.clone(),
        primary_policy: manifest.truth.primary.clone(),
        hit_ks: manifest.hit_ks.clone(),
        notes,
        criteria: criteria.clone(),
    };
    Ok(build_report(&ctx, &records))
}
