//! End-to-end evaluation runs over an in-memory history.

mod common;

use common::*;
use routing_eval_core::artifacts::{count_jsonl_rows, read_records};
use routing_eval_core::cohort::{create_cohort, write_cohort, CohortFilters};
use routing_eval_core::config::CohortSource;
use routing_eval_core::cutoff::{CutoffOrigin, CutoffPolicy};
use routing_eval_core::quality_gates::G5_PREDICTOR_UNAVAILABLE_RATE;
use routing_eval_core::{
    replay_report, run_evaluation_at, EvalError, PromotionCriteria, RunDir, RunManifest,
    TruthStatus,
};
use tempfile::TempDir;

const PRIMARY: &str = "first_approval_v1";

#[tokio::test]
async fn run_writes_every_artifact() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(tmp.path(), 3, baseline_scripts());
    let cfg = config("run-a", vec![3, 1, 2], &["union", "popularity"]);

    let outcome = run_evaluation_at(&ctx, &cfg, now()).await.unwrap();
    assert_eq!(outcome.run_id, "run-a");
    assert_eq!(outcome.report.pr_count, 3);
    assert_eq!(outcome.report.predictors, vec!["popularity", "union"]);

    let run = &outcome.run_dir;
    for path in [
        run.per_pr(),
        run.report_json(),
        run.report_md(),
        run.manifest(),
        run.cohort(),
        run.run_summary(),
        run.inputs(1),
        run.route(2, "union"),
    ] {
        assert!(path.is_file(), "missing artifact {}", path.display());
    }
    assert_eq!(count_jsonl_rows(&run.per_pr()).unwrap(), 3);

    let records = read_records(&run.per_pr()).unwrap();
    let order: Vec<u64> = records.iter().map(|r| r.pr_number).collect();
    assert_eq!(order, vec![1, 2, 3], "records follow cutoff order");
    assert!(records.iter().all(|r| r.truth_status == TruthStatus::Observed));
    assert_eq!(records[1].truth_behavior, vec!["bob"]);
    assert_eq!(records[0].truth.version, "v1");
    assert_eq!(records[0].truth.primary_policy, PRIMARY);

    let popularity = &outcome.report.routing_agreement["popularity"];
    assert_eq!(popularity.n, 3);
    assert!(approx(popularity.mrr, 0.5));
    assert!(approx(popularity.hit_at(1), 1.0 / 3.0));
    assert!(approx(popularity.hit_at(3), 2.0 / 3.0));

    let manifest: RunManifest = routing_eval_core::artifacts::read_json(&run.manifest()).unwrap();
    assert_eq!(manifest.pr_numbers, vec![1, 2, 3]);
    assert_eq!(manifest.cutoff_source, CutoffOrigin::Policy);
    assert_eq!(manifest.truth.primary, PRIMARY);
    assert_eq!(manifest.predictor_ids(), vec!["popularity", "union"]);

    assert_eq!(outcome.summary.counts.per_pr_row_count, 3);
    assert_eq!(outcome.summary.inputs.cohort_hash.as_deref(), Some(manifest.cohort_hash.as_str()));
}

#[tokio::test]
async fn empty_predictor_output_only_leaves_its_own_slice() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(tmp.path(), 3, baseline_scripts());
    let cfg = config("run-slices", vec![1, 2, 3], &["popularity", "union"]);
    let report = run_evaluation_at(&ctx, &cfg, now()).await.unwrap().report;

    let den = &report.extra.routing_denominators_by_policy[PRIMARY];
    assert_eq!(den["union"]["all"], 3);
    assert_eq!(den["union"]["predictor_nonempty"], 2);
    assert_eq!(den["union"]["observed_and_predictor_nonempty"], 2);
    assert_eq!(den["popularity"]["predictor_nonempty"], 3);
    assert_eq!(den["popularity"]["observed_and_predictor_nonempty"], 3);

    let union_slices = &report.extra.routing_agreement_slices_by_policy[PRIMARY]["union"];
    assert!(approx(union_slices["observed_and_predictor_nonempty"].mrr, 1.0));
    assert!(approx(union_slices["all"].mrr, 2.0 / 3.0));

    // One empty answer out of six breaches the unavailable-rate ceiling.
    let gates = &report.extra.quality_gates;
    assert!(!gates.all_pass);
    assert!(!gates.gates[G5_PREDICTOR_UNAVAILABLE_RATE].pass);
    assert_eq!(gates.failed_ids(), vec![G5_PREDICTOR_UNAVAILABLE_RATE.to_string()]);

    let promo = &report.extra.promotion_evaluation;
    assert!(promo.eligible);
    assert_eq!(promo.baseline.as_deref(), Some("popularity"));
    assert_eq!(promo.candidate.as_deref(), Some("union"));
    assert_eq!(promo.n_observed_and_predictor_nonempty, Some(2));
    assert!(!promo.promote, "below min_n and gates failing");
}

#[tokio::test]
async fn strict_mode_aborts_before_any_item() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(tmp.path(), 3, baseline_scripts());
    let mut cfg = config("run-stale", vec![1, 2, 3], &["popularity"]);
    cfg.defaults.cutoff_policy = "created_at+90d".to_string();

    let err = run_evaluation_at(&ctx, &cfg, now()).await.unwrap_err();
    match &err {
        EvalError::LeakageViolation { note } => {
            assert!(note.starts_with("db_max_event_occurred_at="));
            assert!(note.ends_with("is before cutoffs for PRs: [1, 2, 3]"));
        }
        other => panic!("expected leakage violation, got {other}"),
    }
    let run = RunDir::new(tmp.path(), REPO, "run-stale");
    assert!(!run.per_pr().exists(), "no record may be written");
}

#[tokio::test]
async fn non_strict_mode_records_the_stale_note() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(tmp.path(), 3, baseline_scripts());
    let mut cfg = config("run-lenient", vec![1, 2, 3], &["popularity"]);
    cfg.defaults.cutoff_policy = "created_at+90d".to_string();
    cfg.defaults.strict_streaming_eval = false;

    let outcome = run_evaluation_at(&ctx, &cfg, now()).await.unwrap();
    assert_eq!(outcome.report.notes.len(), 1);
    assert!(outcome.report.notes[0].starts_with("db_max_event_occurred_at="));
    assert!(outcome
        .summary
        .gates
        .warnings
        .iter()
        .any(|w| w.starts_with("db_max_event_occurred_at=")));
}

#[tokio::test]
async fn replayed_report_matches_the_written_one() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(tmp.path(), 3, baseline_scripts());
    let cfg = config("run-replay", vec![1, 2, 3], &["popularity", "union"]);
    let outcome = run_evaluation_at(&ctx, &cfg, now()).await.unwrap();

    let replayed = replay_report(&outcome.run_dir, &PromotionCriteria::default()).unwrap();
    assert_eq!(replayed, outcome.report);
}

#[tokio::test]
async fn same_inputs_in_separate_data_dirs_are_byte_identical() {
    let cfg = config("run-twice", vec![1, 2, 3], &["popularity", "union"]);
    let mut outputs = Vec::new();
    for _ in 0..2 {
        let tmp = TempDir::new().unwrap();
        let ctx = context(tmp.path(), 3, baseline_scripts());
        run_evaluation_at(&ctx, &cfg, now()).await.unwrap();
        let run = RunDir::new(tmp.path(), REPO, "run-twice");
        outputs.push((
            std::fs::read(run.per_pr()).unwrap(),
            std::fs::read(run.report_json()).unwrap(),
            std::fs::read(run.manifest()).unwrap(),
        ));
    }
    assert_eq!(outputs[0], outputs[1]);
}

#[tokio::test]
async fn reusing_a_run_id_never_rewrites_the_log() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(tmp.path(), 3, baseline_scripts());
    run_evaluation_at(&ctx, &config("run-once", vec![1, 2, 3], &["popularity"]), now())
        .await
        .unwrap();
    let run = RunDir::new(tmp.path(), REPO, "run-once");
    let log = std::fs::read(run.per_pr()).unwrap();
    let report = std::fs::read(run.report_json()).unwrap();

    let err = run_evaluation_at(&ctx, &config("run-once", vec![1], &["popularity"]), now())
        .await
        .unwrap_err();
    assert!(matches!(err, EvalError::RunExists(_)), "got {err}");
    assert_eq!(std::fs::read(run.per_pr()).unwrap(), log);
    assert_eq!(std::fs::read(run.report_json()).unwrap(), report);
    assert_eq!(count_jsonl_rows(&run.per_pr()).unwrap(), 3);
}

#[tokio::test]
async fn leftover_run_directory_is_refused() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(tmp.path(), 3, baseline_scripts());
    let run = RunDir::new(tmp.path(), REPO, "run-leftover");
    run.create().unwrap();
    std::fs::write(run.per_pr(), "{}\n").unwrap();

    let err = run_evaluation_at(&ctx, &config("run-leftover", vec![1], &["popularity"]), now())
        .await
        .unwrap_err();
    assert!(matches!(err, EvalError::RunExists(_)));
    assert_eq!(std::fs::read_to_string(run.per_pr()).unwrap(), "{}\n");
}

#[tokio::test]
async fn unrepresentable_offsets_fail_before_any_item() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(tmp.path(), 3, baseline_scripts());

    let mut cfg = config("run-far-cutoff", vec![1, 2], &["popularity"]);
    cfg.defaults.cutoff_policy = "created_at+100000000d".to_string();
    let err = run_evaluation_at(&ctx, &cfg, now()).await.unwrap_err();
    assert!(matches!(err, EvalError::InvalidCutoffPolicy(_)), "got {err}");
    assert!(!RunDir::new(tmp.path(), REPO, "run-far-cutoff").exists());

    let mut cfg = config("run-far-window", vec![1, 2], &["popularity"]);
    cfg.defaults.truth_window_seconds = 9_000_000_000_000_000;
    let err = run_evaluation_at(&ctx, &cfg, now()).await.unwrap_err();
    assert!(matches!(err, EvalError::InvalidTruthPolicy(_)), "got {err}");
    assert!(!RunDir::new(tmp.path(), REPO, "run-far-window").exists());
}

#[tokio::test]
async fn cohort_file_pins_items_and_cutoffs() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(tmp.path(), 3, baseline_scripts());
    let cohort = create_cohort(
        ctx.store.as_ref(),
        REPO,
        &[2, 3],
        CohortFilters::default(),
        &CutoffPolicy::CreatedAt,
    )
    .await
    .unwrap();
    let path = tmp.path().join("cohort.json");
    write_cohort(&path, &cohort).unwrap();

    let mut cfg = config("run-cohort", vec![], &["popularity"]);
    cfg.cohort = CohortSource::File { path: path.clone() };
    let outcome = run_evaluation_at(&ctx, &cfg, now()).await.unwrap();
    assert_eq!(outcome.report.pr_count, 2);

    let manifest: RunManifest =
        routing_eval_core::artifacts::read_json(&outcome.run_dir.manifest()).unwrap();
    assert_eq!(manifest.cutoff_source, CutoffOrigin::Provided);
    assert_eq!(manifest.cohort_hash, cohort.hash);
    assert_eq!(manifest.pr_numbers, vec![2, 3]);

    // An edited cohort no longer matches its hash.
    let mut value: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    value["pr_numbers"] = serde_json::json!([2]);
    std::fs::write(&path, serde_json::to_vec_pretty(&value).unwrap()).unwrap();
    cfg.run_id = "run-cohort-edited".to_string();
    let err = run_evaluation_at(&ctx, &cfg, now()).await.unwrap_err();
    assert!(matches!(err, EvalError::InvalidCohort(_)), "got {err}");
}

#[tokio::test]
async fn inactive_primary_policy_fails_fast() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(tmp.path(), 3, baseline_scripts());
    let mut cfg = config("run-primary", vec![1], &["popularity"]);
    cfg.defaults.truth_policies = vec!["first_response_v1".to_string()];
    cfg.defaults.truth_primary_policy = PRIMARY.to_string();

    let err = run_evaluation_at(&ctx, &cfg, now()).await.unwrap_err();
    assert!(matches!(err, EvalError::InactivePrimaryPolicy { .. }));
    assert!(!RunDir::new(tmp.path(), REPO, "run-primary").exists());
}

#[tokio::test]
async fn queue_latency_is_recorded_and_aggregated() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(tmp.path(), 4, baseline_scripts());
    let cfg = config("run-queue", vec![1, 2, 4], &["popularity"]);
    let outcome = run_evaluation_at(&ctx, &cfg, now()).await.unwrap();

    let records = read_records(&outcome.run_dir.per_pr()).unwrap();
    let ttfr: Vec<Option<f64>> = records
        .iter()
        .map(|r| r.predictors["popularity"].queue.as_ref().unwrap().ttfr_seconds)
        .collect();
    assert_eq!(ttfr, vec![Some(600.0), Some(600.0), None]);

    let queue = &outcome.report.extra.queue["popularity"];
    assert_eq!(queue.n, 3);
    let bucket = &queue.by_risk["unknown"];
    assert_eq!(bucket.n, 3);
    assert_eq!(bucket.ttfr_seconds_mean, Some(600.0));
    assert_eq!(bucket.ttfc_seconds_mean, None);

    let md = std::fs::read_to_string(outcome.run_dir.report_md()).unwrap();
    assert!(md.contains("- popularity.unknown.ttfr_seconds_mean: 600.00"));
}
