//! Ground-truth engine: evaluates one item under one resolved policy.
//!
//! Candidates are scanned strictly inside `(cutoff, cutoff + window]`, in
//! `(timestamp, event id, source kind)` order. Absence of a candidate is only
//! reported as `no_post_cutoff_response` when the coverage horizon reaches the
//! window end and no truth-relevant ingestion gap is recorded; otherwise the
//! item is `unknown_due_to_ingestion_gap`.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::{DateTime, Duration, Utc};
use routing_history::{
    ActivityQuery, ActivityRow, ActivityScan, ActivitySource, HistoryStore,
    PrNumber, TimeWindow, TruthCoverage,
};
use tracing::debug;

use crate::domain::{EvalError, Result, TruthDiagnostics, TruthOutcome, TruthStatus};
use crate::truth_policy::{
    ResolvedTruthPolicy, RuleCondition, TruthPolicySpec, TruthSelector,
};

/// Sources the engine can currently scan.
const READY_SOURCES: [ActivitySource; 2] = [ActivitySource::Reviews, ActivitySource::ReviewComments];

const NOTE_NOT_READY: &str = "policy readiness gate is closed";
const NOTE_NO_HORIZON: &str = "truth coverage horizon unavailable";
const NOTE_BEYOND_HORIZON: &str = "truth window extends beyond ingested horizon";
const NOTE_GAPS: &str = "ingestion gaps present for truth-related resources";

/// Run-level inputs shared by every truth evaluation.
#[derive(Clone, Copy)]
pub struct TruthContext<'a> {
    pub store: &'a dyn HistoryStore,
    pub repo: &'a str,
    pub exclude_bots: bool,
    pub exclude_author: bool,
    pub include_review_comments: bool,
    /// Every resolvable policy, for priority-chain members.
    pub catalog: &'a BTreeMap<String, ResolvedTruthPolicy>,
}

pub fn is_ready(spec: &TruthPolicySpec) -> bool {
    spec.sources.iter().all(|s| READY_SOURCES.contains(s))
}

struct Selection {
    targets: Vec<String>,
    selected: Option<ActivityRow>,
    eligible: usize,
    branch: Option<String>,
}

fn select(rows: &[ActivityRow], selector: TruthSelector) -> Selection {
    let selected = match selector {
        TruthSelector::Last => rows.last(),
        _ => rows.first(),
    }
    .cloned();
    let targets = match selector {
        TruthSelector::Union => {
            let mut seen = BTreeSet::new();
            rows.iter()
                .filter(|r| seen.insert(r.actor.login.clone()))
                .map(|r| r.actor.login.clone())
                .collect()
        }
        _ => selected.iter().map(|r| r.actor.login.clone()).collect(),
    };
    Selection {
        targets,
        selected,
        eligible: rows.len(),
        branch: None,
    }
}

fn apply_rules(
    spec: &TruthPolicySpec,
    selection: &Selection,
    coverage_complete: bool,
) -> TruthStatus {
    let matched = spec.status_rules.iter().find(|rule| match &rule.condition {
        RuleCondition::TargetFound => !selection.targets.is_empty(),
        RuleCondition::CoverageComplete => coverage_complete,
        // Unready policies never reach rule evaluation.
        RuleCondition::PolicyNotReady => false,
        RuleCondition::Branch(label) => selection.branch.as_deref() == Some(label.as_str()),
        RuleCondition::Default => true,
    });
    let status = matched.map_or(TruthStatus::UnknownDueToIngestionGap, |r| r.status);
    if status == TruthStatus::NoPostCutoffResponse && !coverage_complete {
        TruthStatus::UnknownDueToIngestionGap
    } else {
        status
    }
}

fn unavailable(
    repo: &str,
    pr_number: PrNumber,
    cutoff: DateTime<Utc>,
    window_end: DateTime<Utc>,
    spec: &TruthPolicySpec,
) -> TruthOutcome {
    TruthOutcome {
        targets: Vec::new(),
        diagnostics: TruthDiagnostics {
            repo: repo.to_string(),
            pr_number,
            cutoff,
            window_end,
            status: TruthStatus::PolicyUnavailable,
            policy_id: spec.id.clone(),
            policy_version: spec.version.clone(),
            selected_login: None,
            selected_source: None,
            selected_event_id: None,
            include_review_comments: false,
            scanned_review_rows: 0,
            scanned_review_comment_rows: 0,
            eligible_candidates: 0,
            coverage_complete: false,
            coverage_horizon_max: None,
            gap_resources: Vec::new(),
            notes: vec![NOTE_NOT_READY.to_string()],
        },
    }
}

pub(crate) fn window_for(spec: &TruthPolicySpec, cutoff: DateTime<Utc>) -> Result<TimeWindow> {
    let window = Duration::try_seconds(spec.window_seconds)
        .ok_or_else(|| EvalError::InvalidTruthPolicy(format!("{}: window out of range", spec.id)))?;
    let end = cutoff.checked_add_signed(window).ok_or_else(|| {
        EvalError::InvalidTruthPolicy(format!("{}: window end out of range", spec.id))
    })?;
    Ok(TimeWindow { start: cutoff, end })
}

impl<'a> TruthContext<'a> {
    fn query_for(&self, spec: &TruthPolicySpec, window: TimeWindow) -> (ActivityQuery, bool) {
        let include_comments = self.include_review_comments
            && spec.sources.contains(&ActivitySource::ReviewComments);
        let sources = spec
            .sources
            .iter()
            .copied()
            .filter(|s| *s != ActivitySource::ReviewComments || include_comments);

        let mut query = ActivityQuery::new(window).with_sources(sources);
        query.exclude_bots = spec.filters.exclude_bots.unwrap_or(self.exclude_bots);
        query.exclude_author = spec.filters.exclude_author.unwrap_or(self.exclude_author);
        if let Some(states) = &spec.filters.review_states {
            query = query.with_review_states(states);
        }
        if let Some(types) = &spec.filters.event_types {
            query.event_types = Some(types.iter().cloned().collect());
        }
        (query, include_comments)
    }

    async fn scan(&self, pr_number: PrNumber, query: &ActivityQuery) -> Result<ActivityScan> {
        Ok(self.store.scan_activity(self.repo, pr_number, query).await?)
    }

    /// Evaluate `policy` for one item.
    pub async fn evaluate(
        &self,
        pr_number: PrNumber,
        cutoff: DateTime<Utc>,
        policy: &ResolvedTruthPolicy,
        coverage: &TruthCoverage,
    ) -> Result<TruthOutcome> {
        let spec = &policy.spec;
        let window = window_for(spec, cutoff)?;
        if !is_ready(spec) {
            debug!(policy = %spec.id, pr_number, "truth policy not ready");
            return Ok(unavailable(self.repo, pr_number, cutoff, window.end, spec));
        }

        let (query, include_comments) = self.query_for(spec, window);
        let (selection, scan) = match spec.selector {
            TruthSelector::PriorityChain => self.evaluate_chain(pr_number, cutoff, spec, coverage).await?,
            selector => {
                let scan = self.scan(pr_number, &query).await?;
                (select(&scan.rows, selector), scan)
            }
        };

        let horizon = coverage.horizon_max;
        let horizon_complete = horizon.is_some_and(|h| h >= window.end);
        let coverage_complete = horizon_complete && coverage.gap_resources.is_empty();

        let mut notes = Vec::new();
        match horizon {
            None => notes.push(NOTE_NO_HORIZON.to_string()),
            Some(_) if !horizon_complete => notes.push(NOTE_BEYOND_HORIZON.to_string()),
            Some(_) => {}
        }
        if !coverage.gap_resources.is_empty() {
            notes.push(NOTE_GAPS.to_string());
        }
        if let Some(states) = query.review_states.as_ref().filter(|s| !s.is_empty()) {
            let mut states: Vec<&String> = states.iter().collect();
            states.sort_by_key(|s| s.to_lowercase());
            notes.push(format!(
                "review-state filter={}",
                states.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(",")
            ));
        }
        notes.push(if include_comments {
            "truth scans review_submitted + review_comment".to_string()
        } else {
            "truth scans review_submitted only".to_string()
        });

        let status = apply_rules(spec, &selection, coverage_complete);
        let selected = selection.selected.as_ref();
        let diagnostics = TruthDiagnostics {
            repo: self.repo.to_string(),
            pr_number,
            cutoff,
            window_end: window.end,
            status,
            policy_id: spec.id.clone(),
            policy_version: spec.version.clone(),
            selected_login: selected.map(|r| r.actor.login.clone()),
            selected_source: selected.map(|r| r.kind.as_str().to_string()),
            selected_event_id: selected.map(|r| r.event_id),
            include_review_comments: include_comments,
            scanned_review_rows: scan.scanned_for(ActivitySource::Reviews),
            scanned_review_comment_rows: scan.scanned_for(ActivitySource::ReviewComments),
            eligible_candidates: selection.eligible,
            coverage_complete,
            coverage_horizon_max: horizon,
            gap_resources: coverage.gap_resources.clone(),
            notes,
        };
        debug!(policy = %spec.id, pr_number, %status, "truth evaluated");

        // Targets only count as truth for observed items.
        let targets = if status == TruthStatus::Observed {
            selection.targets
        } else {
            Vec::new()
        };
        Ok(TruthOutcome { targets, diagnostics })
    }

    /// Walk `fallback_chain` in order; the first member with an observed
    /// selection wins. Nested chains are expanded in place and each policy is
    /// visited at most once.
    async fn evaluate_chain(
        &self,
        pr_number: PrNumber,
        cutoff: DateTime<Utc>,
        spec: &TruthPolicySpec,
        coverage: &TruthCoverage,
    ) -> Result<(Selection, ActivityScan)> {
        let mut queue: VecDeque<String> = spec.fallback_chain.iter().cloned().collect();
        let mut visited: BTreeSet<String> = BTreeSet::from([spec.id.clone()]);
        let mut merged = ActivityScan::default();
        let mut eligible = 0;

        while let Some(member_id) = queue.pop_front() {
            if !visited.insert(member_id.clone()) {
                continue;
            }
            let Some(member) = self.catalog.get(&member_id) else {
                continue;
            };
            let mut member_spec = member.spec.clone();
            if member_spec.selector == TruthSelector::PriorityChain {
                for nested in member_spec.fallback_chain.iter().rev() {
                    queue.push_front(nested.clone());
                }
                continue;
            }
            if !is_ready(&member_spec) {
                continue;
            }
            member_spec.window_seconds = spec.window_seconds;
            let window = window_for(&member_spec, cutoff)?;
            let (query, _) = self.query_for(&member_spec, window);
            let scan = self.scan(pr_number, &query).await?;
            for (source, n) in &scan.scanned {
                *merged.scanned.entry(*source).or_default() += n;
            }
            eligible += scan.rows.len();

            let mut selection = select(&scan.rows, member_spec.selector);
            let member_coverage_complete = coverage.horizon_max.is_some_and(|h| h >= window.end)
                && coverage.gap_resources.is_empty();
            let member_status = apply_rules(&member_spec, &selection, member_coverage_complete);
            if member_status == TruthStatus::Observed && !selection.targets.is_empty() {
                selection.branch = Some(spec.branch_label(&member_id));
                selection.eligible = eligible;
                merged.rows = scan.rows;
                return Ok((selection, merged));
            }
        }

        Ok((
            Selection {
                targets: Vec::new(),
                selected: None,
                eligible,
                branch: None,
            },
            merged,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PolicySource;
    use crate::truth_policy::{builtin_truth_policy_specs, StatusRule, TruthFilters};
    use chrono::TimeZone;
    use routing_history::{
        Actor, IngestionGap, MemoryHistoryStore, PullRequestRecord, Review, ReviewComment,
    };

    const REPO: &str = "acme/widgets";

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn review(id: u64, who: &str, state: &str, minutes: i64) -> Review {
        Review {
            id,
            reviewer: Actor::user(who),
            state: state.to_string(),
            submitted_at: Some(t0() + Duration::minutes(minutes)),
        }
    }

    fn pull(number: u64, reviews: Vec<Review>, comments: Vec<ReviewComment>) -> PullRequestRecord {
        PullRequestRecord {
            number,
            author: Actor::user("author"),
            created_at: t0(),
            title: format!("pr {number}"),
            base_sha: None,
            changed_files: vec!["src/lib.rs".to_string()],
            opened_as_draft: false,
            draft_transitions: vec![],
            review_requests: vec![],
            reviews,
            review_comments: comments,
            events: vec![],
            ownership: None,
        }
    }

    fn store() -> MemoryHistoryStore {
        let store = MemoryHistoryStore::new();
        store
            .add_pull(
                REPO,
                pull(
                    1,
                    vec![
                        review(10, "author", "COMMENTED", 5),
                        review(11, "dependabot[bot]", "APPROVED", 6),
                        review(12, "alice", "COMMENTED", 10),
                        review(13, "bob", "APPROVED", 20),
                    ],
                    vec![ReviewComment {
                        id: 5,
                        author: Actor::user("carol"),
                        created_at: t0() + Duration::minutes(8),
                    }],
                ),
            )
            .unwrap();
        store.add_pull(REPO, pull(2, vec![], vec![])).unwrap();
        // Horizon far beyond every window.
        store
            .add_pull(REPO, pull(3, vec![review(99, "zed", "COMMENTED", 60 * 24 * 7)], vec![]))
            .unwrap();
        store
    }

    fn catalog() -> BTreeMap<String, ResolvedTruthPolicy> {
        builtin_truth_policy_specs()
            .into_iter()
            .map(|(id, spec)| {
                let r = ResolvedTruthPolicy::new(spec, PolicySource::Builtin, id.clone()).unwrap();
                (id, r)
            })
            .collect()
    }

    fn ctx<'a>(store: &'a MemoryHistoryStore, catalog: &'a BTreeMap<String, ResolvedTruthPolicy>) -> TruthContext<'a> {
        TruthContext {
            store,
            repo: REPO,
            exclude_bots: true,
            exclude_author: true,
            include_review_comments: true,
            catalog,
        }
    }

    #[tokio::test]
    async fn first_response_picks_earliest_eligible() {
        let store = store();
        let catalog = catalog();
        let coverage = store.truth_coverage(REPO).await.unwrap();
        let out = ctx(&store, &catalog)
            .evaluate(1, t0(), &catalog["first_response_v1"], &coverage)
            .await
            .unwrap();
        assert_eq!(out.targets, vec!["carol"]);
        let d = &out.diagnostics;
        assert_eq!(d.status, TruthStatus::Observed);
        assert_eq!(d.selected_source.as_deref(), Some("review_comment"));
        assert_eq!(d.selected_event_id, Some(5));
        assert_eq!(d.scanned_review_rows, 4);
        assert_eq!(d.scanned_review_comment_rows, 1);
        assert_eq!(d.eligible_candidates, 3);
        assert!(d.coverage_complete);
        assert_eq!(
            d.notes.last().map(String::as_str),
            Some("truth scans review_submitted + review_comment")
        );
    }

    #[tokio::test]
    async fn first_approval_applies_state_filter() {
        let store = store();
        let catalog = catalog();
        let coverage = store.truth_coverage(REPO).await.unwrap();
        let out = ctx(&store, &catalog)
            .evaluate(1, t0(), &catalog["first_approval_v1"], &coverage)
            .await
            .unwrap();
        assert_eq!(out.targets, vec!["bob"]);
        assert!(!out.diagnostics.include_review_comments);
        assert!(out
            .diagnostics
            .notes
            .contains(&"review-state filter=APPROVED".to_string()));
    }

    #[tokio::test]
    async fn verified_absence_needs_full_coverage() {
        let store = store();
        let catalog = catalog();
        let coverage = store.truth_coverage(REPO).await.unwrap();
        let c = ctx(&store, &catalog);
        let out = c.evaluate(2, t0(), &catalog["first_response_v1"], &coverage).await.unwrap();
        assert_eq!(out.status(), TruthStatus::NoPostCutoffResponse);

        store.add_gap(
            REPO,
            IngestionGap {
                resource: "reviews".to_string(),
                detail: None,
            },
        );
        let coverage = store.truth_coverage(REPO).await.unwrap();
        let out = c.evaluate(2, t0(), &catalog["first_response_v1"], &coverage).await.unwrap();
        assert_eq!(out.status(), TruthStatus::UnknownDueToIngestionGap);
        assert!(!out.diagnostics.coverage_complete);
        assert!(out.diagnostics.notes.contains(&NOTE_GAPS.to_string()));
    }

    #[tokio::test]
    async fn window_past_horizon_is_unknown() {
        let store = store();
        let catalog = catalog();
        let coverage = store.truth_coverage(REPO).await.unwrap();
        let late = t0() + Duration::days(30);
        let out = ctx(&store, &catalog)
            .evaluate(2, late, &catalog["first_response_v1"], &coverage)
            .await
            .unwrap();
        assert_eq!(out.status(), TruthStatus::UnknownDueToIngestionGap);
        assert_eq!(out.diagnostics.notes[0], NOTE_BEYOND_HORIZON);
    }

    #[tokio::test]
    async fn oversized_window_is_a_policy_error() {
        let store = store();
        let catalog = catalog();
        let coverage = store.truth_coverage(REPO).await.unwrap();
        for seconds in [9_000_000_000_000_000, i64::MAX] {
            let policy = catalog["first_response_v1"].with_window(seconds).unwrap();
            let err = ctx(&store, &catalog)
                .evaluate(1, t0(), &policy, &coverage)
                .await
                .unwrap_err();
            assert!(matches!(err, EvalError::InvalidTruthPolicy(_)), "got {err}");
        }
    }

    #[tokio::test]
    async fn readiness_gate_closes_event_policies() {
        let store = store();
        let catalog = catalog();
        let coverage = store.truth_coverage(REPO).await.unwrap();
        for id in ["merger_v1", "hybrid_owner_v1"] {
            let out = ctx(&store, &catalog)
                .evaluate(1, t0(), &catalog[id], &coverage)
                .await
                .unwrap();
            assert_eq!(out.status(), TruthStatus::PolicyUnavailable);
            assert_eq!(out.diagnostics.notes, vec![NOTE_NOT_READY]);
            assert_eq!(out.diagnostics.window_end, t0() + Duration::hours(48));
        }
    }

    #[tokio::test]
    async fn no_post_cutoff_rule_is_downgraded_without_coverage() {
        let store = store();
        let mut catalog = catalog();
        let spec = TruthPolicySpec {
            sources: vec![ActivitySource::Reviews],
            status_rules: vec![StatusRule::new(RuleCondition::Default, TruthStatus::NoPostCutoffResponse)],
            ..TruthPolicySpec::new("optimistic_v1")
        };
        let policy = ResolvedTruthPolicy::new(spec, PolicySource::Plugin, "t").unwrap();
        catalog.insert("optimistic_v1".to_string(), policy.clone());
        let coverage = TruthCoverage {
            horizon_max: None,
            gap_resources: vec![],
        };
        let out = ctx(&store, &catalog).evaluate(2, t0(), &policy, &coverage).await.unwrap();
        assert_eq!(out.status(), TruthStatus::UnknownDueToIngestionGap);
    }

    #[tokio::test]
    async fn union_and_last_selectors() {
        let store = store();
        let catalog = catalog();
        let coverage = store.truth_coverage(REPO).await.unwrap();
        let mk = |id: &str, selector| {
            let spec = TruthPolicySpec {
                sources: vec![ActivitySource::Reviews],
                selector,
                filters: TruthFilters::default(),
                status_rules: vec![StatusRule::new(RuleCondition::TargetFound, TruthStatus::Observed)],
                ..TruthPolicySpec::new(id)
            };
            ResolvedTruthPolicy::new(spec, PolicySource::Plugin, id).unwrap()
        };
        let c = ctx(&store, &catalog);
        let out = c.evaluate(1, t0(), &mk("u_v1", TruthSelector::Union), &coverage).await.unwrap();
        assert_eq!(out.targets, vec!["alice", "bob"]);
        let out = c.evaluate(1, t0(), &mk("l_v1", TruthSelector::Last), &coverage).await.unwrap();
        assert_eq!(out.targets, vec!["bob"]);
        assert_eq!(out.diagnostics.selected_event_id, Some(13));
    }

    #[tokio::test]
    async fn priority_chain_labels_winning_branch() {
        let store = store();
        let mut catalog = catalog();
        let mut params = serde_json::Map::new();
        params.insert(
            "branches".to_string(),
            serde_json::json!({"first_approval_v1": "approval", "first_response_v1": "request"}),
        );
        let spec = TruthPolicySpec {
            sources: vec![ActivitySource::Reviews],
            selector: TruthSelector::PriorityChain,
            fallback_chain: vec![
                "first_approval_v1".to_string(),
                "chain_v1".to_string(),
                "first_response_v1".to_string(),
            ],
            status_rules: vec![
                StatusRule::new(RuleCondition::Branch("approval".to_string()), TruthStatus::Observed),
                StatusRule::new(RuleCondition::Branch("request".to_string()), TruthStatus::Observed),
                StatusRule::new(RuleCondition::CoverageComplete, TruthStatus::NoPostCutoffResponse),
                StatusRule::new(RuleCondition::Default, TruthStatus::UnknownDueToIngestionGap),
            ],
            params,
            ..TruthPolicySpec::new("chain_v1")
        };
        let policy = ResolvedTruthPolicy::new(spec, PolicySource::Plugin, "t").unwrap();
        catalog.insert("chain_v1".to_string(), policy.clone());
        let coverage = store.truth_coverage(REPO).await.unwrap();
        let out = ctx(&store, &catalog).evaluate(1, t0(), &policy, &coverage).await.unwrap();
        assert_eq!(out.status(), TruthStatus::Observed);
        assert_eq!(out.targets, vec!["bob"]);

        let out = ctx(&store, &catalog).evaluate(2, t0(), &policy, &coverage).await.unwrap();
        assert_eq!(out.status(), TruthStatus::NoPostCutoffResponse);
    }
}
