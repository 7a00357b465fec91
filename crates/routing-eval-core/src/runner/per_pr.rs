//! Per-item stage: inputs, truth, predictor fan-out, one record per item.
//!
//! Items run strictly one after another in `(cutoff, pr_number)` order. Inside
//! an item, predictors may run on a bounded pool; every invocation is joined
//! before the record is appended, so the log never holds a partial item.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use routing_history::{HistoryStore, PrNumber};
use tokio::sync::Semaphore;
use tracing::debug;

use crate::agreement::item_metrics;
use crate::artifacts::{write_json, RecordLog};
use crate::config::ExecutionMode;
use crate::domain::{
    EvalError, PerPrRecord, PolicyTruth, PredictorOutcome, Result, RouteResult, TruthBlock,
    TruthOutcome,
};
use crate::metrics::METRICS;
use crate::obs;
use crate::predictor::{InputBundle, Predictor, RouteRequest};
use crate::queue::{measure_queue, QueueMetrics, QueueTimes};
use crate::runner::prepare::PreparedRun;
use crate::truth::TruthContext;
use crate::truth_policy::ResolvedTruthPolicy;

pub const TRUTH_BLOCK_VERSION: &str = "v1";

/// Result of one predictor invocation.
#[derive(Debug, Clone)]
pub(crate) struct Invocation {
    pub result: Option<RouteResult>,
    pub error: Option<String>,
    pub timed_out: bool,
}

impl Invocation {
    fn failed(error: String, timed_out: bool) -> Self {
        Self {
            result: None,
            error: Some(error),
            timed_out,
        }
    }
}

async fn invoke(predictor: Arc<dyn Predictor>, request: RouteRequest, timeout: Duration) -> Invocation {
    METRICS.inc_predictor_invocations();
    match tokio::time::timeout(timeout, predictor.route(&request)).await {
        Ok(Ok(mut result)) => {
            result.candidates.truncate(request.top_k);
            Invocation {
                result: Some(result),
                error: None,
                timed_out: false,
            }
        }
        Ok(Err(err)) => Invocation::failed(format!("{err:#}"), false),
        Err(_) => Invocation::failed(format!("timed out after {}s", timeout.as_secs_f64()), true),
    }
}

/// Invoke every predictor for one item, in predictor order.
pub(crate) async fn invoke_predictors(
    predictors: &[Arc<dyn Predictor>],
    request: &RouteRequest,
    mode: ExecutionMode,
    max_workers: Option<usize>,
    timeout: Duration,
) -> Vec<(String, Invocation)> {
    let mut out = Vec::with_capacity(predictors.len());
    match mode {
        ExecutionMode::Sequential => {
            for predictor in predictors {
                let id = predictor.id().to_string();
                out.push((id, invoke(predictor.clone(), request.clone(), timeout).await));
            }
        }
        ExecutionMode::Parallel => {
            let workers = max_workers.unwrap_or(predictors.len()).max(1);
            let sem = Arc::new(Semaphore::new(workers));
            let tasks = predictors.iter().map(|predictor| {
                let sem = sem.clone();
                let predictor = predictor.clone();
                let request = request.clone();
                tokio::spawn(async move {
                    let _permit = sem.acquire_owned().await.ok();
                    invoke(predictor, request, timeout).await
                })
            });
            // Join barrier: join_all keeps predictor order.
            let joined = join_all(tasks).await;
            for (predictor, result) in predictors.iter().zip(joined) {
                let invocation = match result {
                    Ok(invocation) => invocation,
                    Err(err) => Invocation::failed(format!("predictor task failed: {err}"), false),
                };
                out.push((predictor.id().to_string(), invocation));
            }
        }
    }
    out
}

fn policy_truth(outcome: &TruthOutcome, policy: &ResolvedTruthPolicy) -> PolicyTruth {
    PolicyTruth {
        targets: outcome.targets.clone(),
        status: outcome.status(),
        diagnostics: outcome.diagnostics.clone(),
        policy_hash: policy.policy_hash.clone(),
        policy_source: policy.source,
        policy_source_ref: policy.source_ref.clone(),
    }
}

fn predictor_outcome(
    invocation: Invocation,
    policies: &BTreeMap<String, PolicyTruth>,
    primary_targets: &[String],
    hit_ks: &[usize],
    queue: QueueTimes,
) -> PredictorOutcome {
    let result = invocation.result.as_ref();
    let routing_agreement = item_metrics(result, primary_targets, hit_ks);
    let routing_agreement_by_policy = policies
        .iter()
        .map(|(id, truth)| (id.clone(), item_metrics(result, &truth.targets, hit_ks)))
        .collect();
    let queue = result.map(|r| QueueMetrics::new(queue, r));
    PredictorOutcome {
        route_result: invocation.result,
        error: invocation.error,
        timed_out: invocation.timed_out,
        routing_agreement,
        routing_agreement_by_policy,
        queue,
    }
}

/// Evaluate one item and build its record. Writes the drill artifacts.
pub async fn evaluate_item(
    prepared: &PreparedRun,
    store: &dyn HistoryStore,
    pr_number: PrNumber,
    cutoff: DateTime<Utc>,
) -> Result<PerPrRecord> {
    let repo = prepared.repo.as_str();
    let defaults = &prepared.defaults;
    let run_dir = &prepared.run_dir;

    let snapshot = store.snapshot(repo, pr_number, cutoff).await?;
    let ownership = snapshot.ownership.clone();
    let inputs = Arc::new(InputBundle {
        repo: repo.to_string(),
        pr_number,
        cutoff,
        snapshot,
    });
    write_json(&run_dir.inputs(pr_number), inputs.as_ref())?;

    let truth_ctx = TruthContext {
        store,
        repo,
        exclude_bots: defaults.exclude_bots,
        exclude_author: defaults.exclude_author,
        include_review_comments: defaults.truth_include_review_comments,
        catalog: &prepared.policies.catalog,
    };
    let mut policies = BTreeMap::new();
    for policy in &prepared.policies.active {
        let outcome = truth_ctx
            .evaluate(pr_number, cutoff, policy, &prepared.coverage)
            .await?;
        policies.insert(policy.id().to_string(), policy_truth(&outcome, policy));
    }
    let primary_id = prepared.primary_policy();
    let primary = policies
        .get(primary_id)
        .cloned()
        .ok_or_else(|| EvalError::InactivePrimaryPolicy {
            primary: primary_id.to_string(),
            active: prepared.policies.ids(),
        })?;
    let queue = measure_queue(store, repo, pr_number, cutoff, defaults.queue_include_ttfc).await?;

    let request = RouteRequest {
        repo: repo.to_string(),
        pr_number,
        cutoff,
        top_k: defaults.top_k,
        inputs,
    };
    let invocations = invoke_predictors(
        &prepared.predictors,
        &request,
        defaults.execution_mode,
        defaults.max_workers,
        defaults.predictor_timeout,
    )
    .await;

    let mut predictors = BTreeMap::new();
    for (id, invocation) in invocations {
        match (&invocation.result, &invocation.error) {
            (Some(result), _) => {
                write_json(&run_dir.route(pr_number, &id), result)?;
            }
            (None, error) => {
                METRICS.inc_predictor_failures();
                if invocation.timed_out {
                    METRICS.inc_predictor_timeouts();
                }
                obs::emit_predictor_failed(
                    &prepared.run_id,
                    pr_number,
                    &id,
                    error.as_deref().unwrap_or("unknown error"),
                    invocation.timed_out,
                );
            }
        }
        let outcome = predictor_outcome(invocation, &policies, &primary.targets, &defaults.hit_ks, queue);
        predictors.insert(id, outcome);
    }

    Ok(PerPrRecord {
        repo: repo.to_string(),
        run_id: prepared.run_id.clone(),
        pr_number,
        cutoff,
        truth_behavior: primary.targets.clone(),
        truth_status: primary.status,
        truth_diagnostics: primary.diagnostics.clone(),
        truth: TruthBlock {
            version: TRUTH_BLOCK_VERSION.to_string(),
            primary_policy: primary_id.to_string(),
            policies,
        },
        ownership,
        predictors,
    })
}

/// Evaluate every item in cutoff order, appending one record each.
pub async fn run_items(prepared: &PreparedRun, store: &dyn HistoryStore) -> Result<Vec<PerPrRecord>> {
    prepared.run_dir.create_new()?;
    let mut log = RecordLog::create(prepared.run_dir.per_pr())?;
    let mut records = Vec::with_capacity(prepared.cutoffs.cutoffs.len());

    for (pr_number, cutoff) in prepared.cutoffs.ordered() {
        let record = evaluate_item(prepared, store, pr_number, cutoff).await?;
        log.append(&record)?;
        METRICS.inc_records_appended();
        METRICS.inc_items_evaluated();

        let ok = record.predictors.values().filter(|o| o.route_result.is_some()).count();
        obs::emit_item_evaluated(&prepared.run_id, pr_number, record.truth_status.as_str(), ok);
        records.push(record);
    }
    debug!(run_id = %prepared.run_id, appended = log.appended(), "record log complete");
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use routing_history::{Actor, PrSnapshot};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        id: String,
        delay: Duration,
        fail: bool,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Predictor for Scripted {
        fn id(&self) -> &str {
            &self.id
        }

        async fn route(&self, request: &RouteRequest) -> anyhow::Result<RouteResult> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("scripted failure");
            }
            Ok(RouteResult::empty(&request.repo, request.pr_number, request.cutoff, request.top_k))
        }
    }

    fn request() -> RouteRequest {
        let cutoff = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        RouteRequest {
            repo: "acme/widgets".to_string(),
            pr_number: 1,
            cutoff,
            top_k: 3,
            inputs: Arc::new(InputBundle {
                repo: "acme/widgets".to_string(),
                pr_number: 1,
                cutoff,
                snapshot: PrSnapshot {
                    repo: "acme/widgets".to_string(),
                    pr_number: 1,
                    as_of: cutoff,
                    author: Actor::user("author"),
                    created_at: cutoff,
                    title: String::new(),
                    base_sha: None,
                    changed_files: vec![],
                    requested_reviewers: vec![],
                    is_draft: false,
                    ownership: None,
                },
            }),
        }
    }

    fn scripted(
        specs: &[(&str, u64, bool)],
    ) -> (Vec<Arc<dyn Predictor>>, Arc<AtomicUsize>) {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let predictors = specs
            .iter()
            .map(|(id, ms, fail)| {
                Arc::new(Scripted {
                    id: id.to_string(),
                    delay: Duration::from_millis(*ms),
                    fail: *fail,
                    active: active.clone(),
                    peak: peak.clone(),
                }) as Arc<dyn Predictor>
            })
            .collect();
        (predictors, peak)
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_and_failure_are_recorded_not_raised() {
        let (predictors, _) = scripted(&[("a", 10, false), ("b", 10, true), ("c", 5_000, false)]);
        let out = invoke_predictors(
            &predictors,
            &request(),
            ExecutionMode::Sequential,
            None,
            Duration::from_secs(1),
        )
        .await;
        let ids: Vec<&str> = out.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(out[0].1.result.is_some());
        assert!(out[1].1.error.as_deref().unwrap().contains("scripted failure"));
        assert!(!out[1].1.timed_out);
        assert!(out[2].1.timed_out);
        assert!(out[2].1.result.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn parallel_mode_respects_worker_bound_and_order() {
        let (predictors, peak) = scripted(&[("a", 50, false), ("b", 10, false), ("c", 30, false)]);
        let out = invoke_predictors(
            &predictors,
            &request(),
            ExecutionMode::Parallel,
            Some(2),
            Duration::from_secs(5),
        )
        .await;
        let ids: Vec<&str> = out.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(out.iter().all(|(_, inv)| inv.result.is_some()));
    }
}
