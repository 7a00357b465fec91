//! Read-side services over finished runs: listing, display, per-item
//! explanation, run-to-run diff and re-aggregation.
//!
//! Every service reads run artifacts only; none of them touch the history
//! store.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::Path;

use routing_history::PrNumber;
use tracing::{debug, info};

use crate::artifacts::{eval_root, read_json, read_records, RunDir, MANIFEST_JSON};
use crate::domain::digest::canonical_json_pretty;
use crate::domain::{EvalError, PerPrRecord, Result};
use crate::manifest::RunManifest;
use crate::promotion::PromotionCriteria;
use crate::report::EvalReport;
use crate::run_summary::{build_run_summary, write_run_summary};
use crate::runner::{replay_report, write_report};

fn ci_sorted(mut ids: Vec<String>) -> Vec<String> {
    ids.sort_by(|a, b| a.to_lowercase().cmp(&b.to_lowercase()).then_with(|| a.cmp(b)));
    ids
}

fn existing_run(data_dir: &Path, repo: &str, run_id: &str) -> Result<RunDir> {
    let run_dir = RunDir::new(data_dir, repo, run_id);
    if !run_dir.exists() {
        return Err(EvalError::NotFound(format!(
            "run {run_id} under {}",
            run_dir.path().display()
        )));
    }
    Ok(run_dir)
}

// ---------------------------------------------------------------------------
// list / show
// ---------------------------------------------------------------------------

/// Completed run ids under a repo's eval directory, case-insensitively sorted.
///
/// Directories starting with `_` (compare output) are not runs. A run
/// directory without `manifest.json` was interrupted or is still being
/// written, so it is skipped.
pub fn list_runs(data_dir: &Path, repo: &str) -> Result<Vec<String>> {
    let root = eval_root(data_dir, repo);
    if !root.is_dir() {
        return Err(EvalError::NotFound(root.display().to_string()));
    }
    let mut runs = Vec::new();
    for entry in std::fs::read_dir(&root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('_') {
            continue;
        }
        if !entry.path().join(MANIFEST_JSON).is_file() {
            debug!(run_id = %name, "skipping incomplete run without manifest");
            continue;
        }
        runs.push(name);
    }
    Ok(ci_sorted(runs))
}

/// The rendered report of a run: `report.md`, falling back to `report.json`.
pub fn show(data_dir: &Path, repo: &str, run_id: &str) -> Result<String> {
    let run_dir = RunDir::new(data_dir, repo, run_id);
    for path in [run_dir.report_md(), run_dir.report_json()] {
        if path.is_file() {
            let text = std::fs::read_to_string(&path)?;
            return Ok(text.trim_end_matches('\n').to_string());
        }
    }
    Err(EvalError::MissingArtifact(format!(
        "{} / {}",
        run_dir.report_md().display(),
        run_dir.report_json().display()
    )))
}

// ---------------------------------------------------------------------------
// explain
// ---------------------------------------------------------------------------

/// Which predictor and truth policy to explain; `None` picks a default.
#[derive(Debug, Clone, Default)]
pub struct ExplainSelection {
    pub predictor: Option<String>,
    pub policy: Option<String>,
}

fn find_record(records: Vec<PerPrRecord>, pr_number: PrNumber) -> Result<PerPrRecord> {
    records
        .into_iter()
        .find(|r| r.pr_number == pr_number)
        .ok_or_else(|| EvalError::NotFound(format!("pr {pr_number} in per_pr.jsonl")))
}

fn pretty<T: serde::Serialize>(doc: &T) -> Result<String> {
    canonical_json_pretty(&serde_json::to_value(doc)?)
}

/// Plain-text account of one item: cutoff, truth, candidates and metrics.
///
/// Defaults: the first predictor in case-insensitive order, the record's
/// primary truth policy.
pub fn explain(
    data_dir: &Path,
    repo: &str,
    run_id: &str,
    pr_number: PrNumber,
    selection: &ExplainSelection,
) -> Result<String> {
    let run_dir = RunDir::new(data_dir, repo, run_id);
    let record = find_record(read_records(&run_dir.per_pr())?, pr_number)?;

    let predictor = match &selection.predictor {
        Some(id) => id.clone(),
        None => ci_sorted(record.predictors.keys().cloned().collect())
            .into_iter()
            .next()
            .ok_or_else(|| EvalError::NotFound(format!("predictors for pr {pr_number}")))?,
    };
    let outcome = record
        .predictors
        .get(&predictor)
        .ok_or_else(|| EvalError::NotFound(format!("predictor {predictor}")))?;

    let policy = selection
        .policy
        .clone()
        .unwrap_or_else(|| record.truth.primary_policy.clone());
    let truth = record
        .policy(&policy)
        .ok_or_else(|| EvalError::NotFound(format!("truth policy {policy}")))?;

    let mut out = String::new();
    let _ = writeln!(out, "repo {repo}");
    let _ = writeln!(out, "run_id {run_id}");
    let _ = writeln!(out, "pr {pr_number}");
    let _ = writeln!(out, "cutoff {}", crate::runner::prepare::iso(record.cutoff));
    let _ = writeln!(out, "predictor {predictor}");
    let _ = writeln!(out, "truth_policy {policy}");
    out.push('\n');

    out.push_str("truth_behavior\n");
    for target in &truth.targets {
        let _ = writeln!(out, "- {target}");
    }
    let _ = writeln!(out, "- status: {}", truth.status.as_str());
    out.push('\n');

    out.push_str("candidates\n");
    match (&outcome.route_result, &outcome.error) {
        (Some(result), _) => {
            for c in &result.candidates {
                let _ = writeln!(out, "- {} (score={})", c.target.name, c.score);
                for ev in &c.evidence {
                    let _ = writeln!(out, "  {}: {}", ev.kind, ev.data);
                }
            }
        }
        (None, Some(err)) => {
            let _ = writeln!(out, "- unavailable: {err}");
        }
        (None, None) => out.push_str("- unavailable\n"),
    }
    out.push('\n');

    out.push_str("routing_agreement\n");
    let metrics = outcome
        .routing_agreement_by_policy
        .get(&policy)
        .unwrap_or(&outcome.routing_agreement);
    out.push_str(&pretty(metrics)?);

    if let Some(queue) = &outcome.queue {
        out.push_str("\nqueue\n");
        out.push_str(&pretty(queue)?);
    }

    Ok(out)
}

// ---------------------------------------------------------------------------
// diff
// ---------------------------------------------------------------------------

/// One metric, left to right.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricChange {
    pub name: String,
    pub left: Option<f64>,
    pub right: Option<f64>,
}

impl MetricChange {
    pub fn delta(&self) -> Option<f64> {
        Some(self.right? - self.left?)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PredictorDiff {
    pub predictor_id: String,
    pub metrics: Vec<MetricChange>,
}

/// Side-by-side primary-policy metrics of two runs.
#[derive(Debug, Clone, PartialEq)]
pub struct RunDiff {
    pub repo: String,
    pub left_run_id: String,
    pub right_run_id: String,
    pub left_cohort_hash: Option<String>,
    pub right_cohort_hash: Option<String>,
    pub shared_items: Vec<PrNumber>,
    pub predictors: Vec<PredictorDiff>,
}

fn fmt_opt(v: Option<f64>) -> String {
    v.map_or_else(|| "None".to_string(), |x| x.to_string())
}

impl RunDiff {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "repo {}", self.repo);
        let _ = writeln!(out, "run_a {}", self.left_run_id);
        let _ = writeln!(out, "run_b {}", self.right_run_id);
        let _ = writeln!(out, "cohort_hash_a {}", self.left_cohort_hash.as_deref().unwrap_or("None"));
        let _ = writeln!(out, "cohort_hash_b {}", self.right_cohort_hash.as_deref().unwrap_or("None"));
        let _ = writeln!(out, "shared_prs {}", self.shared_items.len());
        if self.predictors.is_empty() {
            out.push_str("no overlapping predictors\n");
        }
        for p in &self.predictors {
            let _ = writeln!(out, "predictor {}", p.predictor_id);
            for m in &p.metrics {
                let delta = m.delta().map_or_else(|| "n/a".to_string(), |d| format!("{d:+.4}"));
                let _ = writeln!(
                    out,
                    "  {} {} -> {} ({delta})",
                    m.name,
                    fmt_opt(m.left),
                    fmt_opt(m.right)
                );
            }
        }
        out.trim_end_matches('\n').to_string()
    }
}

fn cohort_hash(run_dir: &RunDir) -> Option<String> {
    read_json::<RunManifest>(&run_dir.manifest())
        .ok()
        .map(|m| m.cohort_hash)
        .filter(|h| !h.is_empty())
}

/// Diff two runs of the same repo.
///
/// Unless `force` is set both runs must carry the same cohort hash.
pub fn diff_runs(data_dir: &Path, repo: &str, left: &str, right: &str, force: bool) -> Result<RunDiff> {
    let left_dir = existing_run(data_dir, repo, left)?;
    let right_dir = existing_run(data_dir, repo, right)?;
    let left_hash = cohort_hash(&left_dir);
    let right_hash = cohort_hash(&right_dir);

    if !force {
        match (&left_hash, &right_hash) {
            (Some(a), Some(b)) if a == b => {}
            (Some(a), Some(b)) => {
                return Err(EvalError::InvalidCohort(format!(
                    "cohort hash mismatch: {a} != {b}; use --force to override"
                )))
            }
            _ => {
                return Err(EvalError::InvalidCohort(
                    "missing cohort hash in one or both runs; re-run with --force".to_string(),
                ))
            }
        }
    }

    let left_report: EvalReport = read_json(&left_dir.report_json())?;
    let right_report: EvalReport = read_json(&right_dir.report_json())?;

    let items = |dir: &RunDir| -> Result<BTreeSet<PrNumber>> {
        if !dir.per_pr().is_file() {
            return Ok(BTreeSet::new());
        }
        Ok(read_records(&dir.per_pr())?.iter().map(|r| r.pr_number).collect())
    };
    let shared_items = items(&left_dir)?.intersection(&items(&right_dir)?).copied().collect();

    let common = ci_sorted(
        left_report
            .routing_agreement
            .keys()
            .filter(|id| right_report.routing_agreement.contains_key(*id))
            .cloned()
            .collect(),
    );
    let ks: BTreeSet<usize> = left_report
        .hit_ks
        .iter()
        .chain(right_report.hit_ks.iter())
        .copied()
        .collect();

    let predictors = common
        .into_iter()
        .filter_map(|id| {
            let a = left_report.routing_agreement.get(&id)?;
            let b = right_report.routing_agreement.get(&id)?;
            let mut metrics: Vec<MetricChange> = ks
                .iter()
                .map(|k| MetricChange {
                    name: format!("hit_at_{k}"),
                    left: a.hit_at(*k),
                    right: b.hit_at(*k),
                })
                .collect();
            metrics.push(MetricChange {
                name: "mrr".to_string(),
                left: a.mrr,
                right: b.mrr,
            });
            Some(PredictorDiff {
                predictor_id: id,
                metrics,
            })
        })
        .collect();

    Ok(RunDiff {
        repo: repo.to_string(),
        left_run_id: left.to_string(),
        right_run_id: right.to_string(),
        left_cohort_hash: left_hash,
        right_cohort_hash: right_hash,
        shared_items,
        predictors,
    })
}

// ---------------------------------------------------------------------------
// re-aggregation
// ---------------------------------------------------------------------------

/// Rebuild a run's report and summary from its manifest and record log.
pub fn reaggregate(data_dir: &Path, repo: &str, run_id: &str, criteria: &PromotionCriteria) -> Result<EvalReport> {
    let run_dir = existing_run(data_dir, repo, run_id)?;
    let report = replay_report(&run_dir, criteria)?;
    let sha = write_report(&run_dir, &report)?;
    let summary = build_run_summary(repo, run_id, &run_dir)?;
    write_run_summary(&run_dir, &summary)?;
    info!(event = "run.reaggregated", run_id = %run_id, report_sha = %sha, items = report.pr_count);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn list_runs_sorts_and_skips_compare_dir() {
        let tmp = TempDir::new().unwrap();
        let root = eval_root(tmp.path(), "acme/widgets");
        for name in ["b-run", "A-run", "_compare", "c-run"] {
            std::fs::create_dir_all(root.join(name)).unwrap();
            std::fs::write(root.join(name).join(MANIFEST_JSON), "{}\n").unwrap();
        }
        std::fs::write(root.join("stray.txt"), "x").unwrap();

        let runs = list_runs(tmp.path(), "acme/widgets").unwrap();
        assert_eq!(runs, vec!["A-run", "b-run", "c-run"]);
    }

    #[test]
    fn list_runs_skips_runs_without_manifest() {
        let tmp = TempDir::new().unwrap();
        let done = RunDir::new(tmp.path(), "acme/widgets", "done");
        done.create().unwrap();
        std::fs::write(done.manifest(), "{}\n").unwrap();
        let partial = RunDir::new(tmp.path(), "acme/widgets", "partial");
        partial.create().unwrap();
        std::fs::write(partial.per_pr(), "{\"pr_number\":1}\n").unwrap();

        assert_eq!(list_runs(tmp.path(), "acme/widgets").unwrap(), vec!["done"]);
    }

    #[test]
    fn list_runs_without_eval_dir_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let err = list_runs(tmp.path(), "acme/widgets").unwrap_err();
        assert!(matches!(err, EvalError::NotFound(_)));
    }

    #[test]
    fn show_prefers_markdown_then_json() {
        let tmp = TempDir::new().unwrap();
        let run = RunDir::new(tmp.path(), "acme/widgets", "r1");
        run.create().unwrap();

        assert!(matches!(
            show(tmp.path(), "acme/widgets", "r1").unwrap_err(),
            EvalError::MissingArtifact(_)
        ));

        std::fs::write(run.report_json(), "{\"kind\":\"eval_report\"}\n").unwrap();
        assert_eq!(show(tmp.path(), "acme/widgets", "r1").unwrap(), "{\"kind\":\"eval_report\"}");

        std::fs::write(run.report_md(), "# Eval\n\n").unwrap();
        assert_eq!(show(tmp.path(), "acme/widgets", "r1").unwrap(), "# Eval");
    }

    #[test]
    fn metric_change_delta_needs_both_sides() {
        let m = MetricChange {
            name: "mrr".to_string(),
            left: Some(0.25),
            right: Some(0.5),
        };
        assert_eq!(m.delta(), Some(0.25));
        let missing = MetricChange {
            right: None,
            ..m
        };
        assert_eq!(missing.delta(), None);
    }

    #[test]
    fn diff_requires_existing_runs() {
        let tmp = TempDir::new().unwrap();
        let err = diff_runs(tmp.path(), "acme/widgets", "a", "b", true).unwrap_err();
        assert!(matches!(err, EvalError::NotFound(_)));
    }

    #[test]
    fn diff_without_cohort_hash_needs_force() {
        let tmp = TempDir::new().unwrap();
        for id in ["a", "b"] {
            RunDir::new(tmp.path(), "acme/widgets", id).create().unwrap();
        }
        let err = diff_runs(tmp.path(), "acme/widgets", "a", "b", false).unwrap_err();
        assert!(err.to_string().contains("--force"));

        // Forced past the guard, the missing report is what fails.
        let err = diff_runs(tmp.path(), "acme/widgets", "a", "b", true).unwrap_err();
        assert!(matches!(err, EvalError::MissingArtifact(_)));
    }
}
