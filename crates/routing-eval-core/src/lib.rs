//! Routing-Eval Core: leakage-safe backtesting for reviewer-routing predictors
//!
//! A run replays history item by item. For each pull request it builds the
//! inputs visible at a cutoff, asks every predictor for a ranked reviewer
//! list, scores the lists against post-cutoff truth under one or more truth
//! policies, and appends one immutable record. Reports, quality gates,
//! promotion decisions, run summaries and run-to-run comparisons are all pure
//! functions of that record log.
//!
//! ## Key Components
//!
//! - `cutoff` / `cohort`: which items are evaluated and as of when
//! - `truth_policy` / `truth`: how post-cutoff activity becomes truth
//! - `predictor`: the predictor seam and the offline replay predictor
//! - `runner`: prepare, per-item fan-out, aggregate, emit
//! - `report` / `quality_gates` / `promotion`: aggregation and decisions
//! - `run_summary` / `compare` / `service`: read side over finished runs

pub mod agreement;
pub mod artifacts;
pub mod cohort;
pub mod compare;
pub mod config;
pub mod cutoff;
pub mod domain;
pub mod manifest;
pub mod metrics;
pub mod obs;
pub mod predictor;
pub mod promotion;
pub mod quality_gates;
pub mod queue;
pub mod report;
pub mod reporting;
pub mod run_id;
pub mod run_summary;
pub mod runner;
pub mod service;
pub mod telemetry;
pub mod truth;
pub mod truth_policy;

pub use domain::{
    Candidate, EvalError, Evidence, PerPrRecord, PolicySource, PolicyTruth, PredictorOutcome,
    Result, RouteResult, Target, TargetKind, TruthBlock, TruthDiagnostics, TruthOutcome,
    TruthStatus,
};

pub use agreement::{aggregate, item_metrics, AgreementSummary, DenominatorSlice, ItemMetrics};
pub use artifacts::{RecordLog, RunDir};
pub use cohort::{create_cohort, read_cohort, write_cohort, Cohort, CohortFilters};
pub use compare::{build_compare_summary, write_compare_summary, CompareSummary};
pub use config::{CohortSource, EvalDefaults, ExecutionMode, PredictorSpec, RunConfig};
pub use cutoff::{resolve_cutoffs, CutoffOrigin, CutoffPolicy, ResolvedCutoffs};
pub use manifest::RunManifest;
pub use predictor::{InputBundle, Predictor, PredictorRegistry, ReplayPredictor, RouteRequest};
pub use promotion::{
    enforce_gates, enforce_promotion, GateEnforcement, GateOutcome, PromotionCriteria,
    PromotionDecision, PromotionEvaluation,
};
pub use queue::{aggregate_queue, measure_queue, QueueMetrics, QueueSummary};
pub use quality_gates::{evaluate_quality_gates, GateCategory, GateResult, QualityGates};
pub use report::{aggregate_records, build_report, EvalReport, ReportContext};
pub use reporting::render_report_md;
pub use run_id::compute_run_id;
pub use run_summary::{build_run_summary, load_or_build_run_summary, RunSummary};
pub use runner::{
    replay_report, run_evaluation, run_evaluation_at, EvalContext, PreparedRun, RunOutcome,
};
pub use service::{diff_runs, explain, list_runs, reaggregate, show, ExplainSelection, RunDiff};
pub use telemetry::init_tracing;
pub use truth_policy::{
    builtin_truth_policy_specs, PluginRegistry, ResolvedPolicies, ResolvedTruthPolicy,
    TruthPolicySpec,
};
