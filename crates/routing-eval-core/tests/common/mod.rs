//! Shared fixtures: a small repository history and scripted predictors.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use routing_eval_core::config::CohortSource;
use routing_eval_core::{
    Candidate, EvalContext, Predictor, PredictorRegistry, PredictorSpec, RouteRequest, RouteResult,
    RunConfig, Target,
};
use routing_history::{
    Actor, IssueEvent, MemoryHistoryStore, OwnershipCoverage, PrNumber, PullRequestRecord,
    RepoHistory, Review,
};

pub const REPO: &str = "acme/widgets";
pub const SCRIPTED: &str = "scripted";
const APPROVERS: [&str; 3] = ["alice", "bob", "carol"];

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap()
}

/// Approver of PR `n`; every fourth PR gets no review at all.
pub fn approver(n: PrNumber) -> Option<&'static str> {
    if n % 4 == 0 {
        None
    } else {
        Some(APPROVERS[((n - 1) % 3) as usize])
    }
}

fn pull(n: PrNumber) -> PullRequestRecord {
    let created_at = t0() + Duration::hours(n as i64 - 1);
    PullRequestRecord {
        number: n,
        author: Actor::user("author"),
        created_at,
        title: format!("PR {n}"),
        base_sha: None,
        changed_files: vec!["src/lib.rs".to_string()],
        opened_as_draft: false,
        draft_transitions: vec![],
        review_requests: vec![],
        reviews: approver(n)
            .map(|login| Review {
                id: n * 10,
                reviewer: Actor::user(login),
                state: "APPROVED".to_string(),
                submitted_at: Some(created_at + Duration::minutes(10)),
            })
            .into_iter()
            .collect(),
        review_comments: vec![],
        events: vec![],
        ownership: Some(OwnershipCoverage {
            codeowners_present: true,
            artifact_count: 1,
        }),
    }
}

/// PRs `1..=n`, one hour apart, with coverage extending thirty days out.
pub fn history(n: PrNumber) -> RepoHistory {
    let mut history = RepoHistory::new(REPO);
    history.pulls = (1..=n).map(pull).collect();
    if let Some(last) = history.pulls.last_mut() {
        last.events.push(IssueEvent {
            id: 9_999,
            kind: "pull_request.merged".to_string(),
            actor: Some(Actor::user("maintainer")),
            occurred_at: t0() + Duration::days(30),
        });
    }
    history
}

pub fn store(n: PrNumber) -> Arc<MemoryHistoryStore> {
    Arc::new(MemoryHistoryStore::new().with_history(history(n)).unwrap())
}

// ---------------------------------------------------------------------------
// Scripted predictors
// ---------------------------------------------------------------------------

/// predictor id → PR → ranked logins. Unlisted PRs get an empty list.
pub type Scripts = BTreeMap<String, BTreeMap<PrNumber, Vec<String>>>;

pub struct ScriptedPredictor {
    id: String,
    routes: BTreeMap<PrNumber, Vec<String>>,
}

#[async_trait]
impl Predictor for ScriptedPredictor {
    fn id(&self) -> &str {
        &self.id
    }

    async fn route(&self, request: &RouteRequest) -> anyhow::Result<RouteResult> {
        let mut result = RouteResult::empty(&request.repo, request.pr_number, request.cutoff, request.top_k);
        if let Some(logins) = self.routes.get(&request.pr_number) {
            result.candidates = logins
                .iter()
                .enumerate()
                .map(|(i, login)| Candidate {
                    target: Target::user(login.as_str()),
                    score: 1.0 - i as f64 * 0.25,
                    evidence: vec![],
                })
                .collect();
        }
        Ok(result)
    }
}

/// Build a script from `(pr, "login,login")` pairs.
pub fn script(routes: &[(PrNumber, &str)]) -> BTreeMap<PrNumber, Vec<String>> {
    routes
        .iter()
        .map(|(n, logins)| {
            let logins = logins
                .split(',')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            (*n, logins)
        })
        .collect()
}

pub fn registry(scripts: Scripts) -> PredictorRegistry {
    let scripts = Arc::new(scripts);
    let mut registry = PredictorRegistry::empty();
    registry.register(SCRIPTED, move |spec: &PredictorSpec| {
        let routes = scripts.get(&spec.id).cloned().unwrap_or_default();
        Ok(Arc::new(ScriptedPredictor {
            id: spec.id.clone(),
            routes,
        }) as Arc<dyn Predictor>)
    });
    registry
}

pub fn context(data_dir: &Path, n: PrNumber, scripts: Scripts) -> EvalContext {
    EvalContext::new(store(n), data_dir).with_predictors(registry(scripts))
}

pub fn config(run_id: &str, pr_numbers: Vec<PrNumber>, predictor_ids: &[&str]) -> RunConfig {
    let mut cfg = RunConfig::new(REPO);
    cfg.run_id = run_id.to_string();
    cfg.cohort = CohortSource::Explicit { pr_numbers };
    cfg.predictors = predictor_ids
        .iter()
        .map(|id| PredictorSpec {
            id: id.to_string(),
            kind: SCRIPTED.to_string(),
            config_path: None,
        })
        .collect();
    cfg
}

/// `popularity` always answers alice then bob; `union` is exact on 1 and 3
/// and empty on 2.
pub fn baseline_scripts() -> Scripts {
    BTreeMap::from([
        (
            "popularity".to_string(),
            script(&[(1, "alice,bob"), (2, "alice,bob"), (3, "alice,bob")]),
        ),
        ("union".to_string(), script(&[(1, "alice"), (3, "carol,alice")])),
    ])
}

/// Same as [`baseline_scripts`] but `union` also answers item 2 correctly.
pub fn improved_scripts() -> Scripts {
    let mut scripts = baseline_scripts();
    scripts.insert(
        "union".to_string(),
        script(&[(1, "alice"), (2, "bob"), (3, "carol,alice")]),
    );
    scripts
}

pub fn approx(a: Option<f64>, b: f64) -> bool {
    a.is_some_and(|a| (a - b).abs() < 1e-9)
}
