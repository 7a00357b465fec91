//! Read-side services over two finished runs of the same cohort.

mod common;

use std::path::Path;

use common::*;
use routing_eval_core::artifacts::compare_dir;
use routing_eval_core::service::ExplainSelection;
use routing_eval_core::{
    build_compare_summary, diff_runs, explain, list_runs, load_or_build_run_summary, reaggregate,
    run_evaluation_at, show, write_compare_summary, EvalError, PromotionCriteria, RunDir,
};
use tempfile::TempDir;

async fn two_runs(data_dir: &Path) {
    let cfg = config("base", vec![1, 2, 3], &["popularity", "union"]);
    run_evaluation_at(&context(data_dir, 3, baseline_scripts()), &cfg, now())
        .await
        .unwrap();
    let cfg = config("cand", vec![1, 2, 3], &["popularity", "union"]);
    run_evaluation_at(&context(data_dir, 3, improved_scripts()), &cfg, now())
        .await
        .unwrap();
}

#[tokio::test]
async fn compare_ranks_deltas_and_writes_summary() {
    let tmp = TempDir::new().unwrap();
    two_runs(tmp.path()).await;

    let summary = build_compare_summary(tmp.path(), REPO, "base", "cand", now()).unwrap();
    assert_eq!(summary.compatibility.cohort_hash_match, Some(true));
    assert_eq!(summary.compatibility.pr_cutoffs_match, Some(true));
    assert!(summary.compatibility.warnings.is_empty());

    let ids: Vec<&str> = summary
        .ranked_deltas
        .iter()
        .map(|d| d.predictor_id.as_str())
        .collect();
    assert_eq!(ids, vec!["popularity", "union"], "worst delta first");
    let union = &summary.ranked_deltas[1];
    assert!(approx(union.delta["mrr"], 1.0 / 3.0));

    // Nothing got worse, so there is nothing to drill into.
    assert!(summary.top_regressed_examples.is_empty());

    let (path, written) = write_compare_summary(tmp.path(), REPO, "base", "cand", now()).unwrap();
    assert!(path.starts_with(compare_dir(tmp.path(), REPO, "base", "cand")));
    assert!(path.is_file());
    assert_eq!(written.compare_id, summary.compare_id);
}

#[tokio::test]
async fn compare_surfaces_item_regressions_in_reverse() {
    let tmp = TempDir::new().unwrap();
    two_runs(tmp.path()).await;

    let summary = build_compare_summary(tmp.path(), REPO, "cand", "base", now()).unwrap();
    let regression = summary
        .top_regressed_examples
        .iter()
        .find(|r| r.predictor_id == "union")
        .expect("union regressed on item 2");
    assert_eq!(regression.pr_number, 2);
    assert!(approx(regression.delta["mrr"], -1.0));
    assert_eq!(regression.candidate_artifacts.route_json, "prs/2/routes/union.json");
}

#[tokio::test]
async fn list_show_and_summary() {
    let tmp = TempDir::new().unwrap();
    two_runs(tmp.path()).await;
    write_compare_summary(tmp.path(), REPO, "base", "cand", now()).unwrap();

    assert_eq!(list_runs(tmp.path(), REPO).unwrap(), vec!["base", "cand"]);

    let md = show(tmp.path(), REPO, "base").unwrap();
    assert!(md.starts_with("# Evaluation Report"));
    assert!(!md.ends_with('\n'));

    let run = RunDir::new(tmp.path(), REPO, "base");
    std::fs::remove_file(run.run_summary()).unwrap();
    let summary = load_or_build_run_summary(REPO, "base", &run).unwrap();
    assert_eq!(summary.counts.pr_count, 3);
    assert_eq!(summary.inputs.predictors, vec!["popularity", "union"]);
}

#[tokio::test]
async fn explain_one_item() {
    let tmp = TempDir::new().unwrap();
    two_runs(tmp.path()).await;

    let text = explain(
        tmp.path(),
        REPO,
        "base",
        3,
        &ExplainSelection {
            predictor: Some("union".to_string()),
            policy: None,
        },
    )
    .unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], "repo acme/widgets");
    assert_eq!(lines[2], "pr 3");
    assert_eq!(lines[4], "predictor union");
    assert_eq!(lines[5], "truth_policy first_approval_v1");
    assert!(lines.contains(&"- carol"));
    assert!(lines.contains(&"- status: observed"));
    assert!(lines.contains(&"- carol (score=1)"));
    assert!(text.contains("\"mrr\": 1"));
    assert!(lines.contains(&"queue"));
    assert!(text.contains("\"ttfr_seconds\": 600"));

    // Default predictor is the first id in case-insensitive order.
    let text = explain(tmp.path(), REPO, "base", 3, &ExplainSelection::default()).unwrap();
    assert!(text.contains("predictor popularity"));

    let err = explain(tmp.path(), REPO, "base", 42, &ExplainSelection::default()).unwrap_err();
    assert!(matches!(err, EvalError::NotFound(_)));
}

#[tokio::test]
async fn diff_reports_shared_items_and_deltas() {
    let tmp = TempDir::new().unwrap();
    two_runs(tmp.path()).await;

    let diff = diff_runs(tmp.path(), REPO, "base", "cand", false).unwrap();
    assert_eq!(diff.shared_items, vec![1, 2, 3]);
    assert_eq!(diff.left_cohort_hash, diff.right_cohort_hash);

    let rendered = diff.render();
    assert!(rendered.contains("shared_prs 3"));
    assert!(rendered.contains("predictor union"));
    assert!(rendered.contains("(+0.3333)"));
    assert!(rendered.contains("(+0.0000)"));
}

#[tokio::test]
async fn diff_refuses_different_cohorts_unless_forced() {
    let tmp = TempDir::new().unwrap();
    two_runs(tmp.path()).await;
    let cfg = config("narrow", vec![1, 2], &["popularity", "union"]);
    run_evaluation_at(&context(tmp.path(), 3, baseline_scripts()), &cfg, now())
        .await
        .unwrap();

    let err = diff_runs(tmp.path(), REPO, "base", "narrow", false).unwrap_err();
    assert!(err.to_string().contains("cohort hash mismatch"));

    let diff = diff_runs(tmp.path(), REPO, "base", "narrow", true).unwrap();
    assert_eq!(diff.shared_items, vec![1, 2]);
}

#[tokio::test]
async fn reaggregate_rewrites_an_identical_report() {
    let tmp = TempDir::new().unwrap();
    two_runs(tmp.path()).await;
    let run = RunDir::new(tmp.path(), REPO, "base");
    let before = std::fs::read(run.report_json()).unwrap();

    let report = reaggregate(tmp.path(), REPO, "base", &PromotionCriteria::default()).unwrap();
    assert_eq!(report.pr_count, 3);
    assert_eq!(std::fs::read(run.report_json()).unwrap(), before);
}
