//! Repository activity records and point-in-time query types.
//!
//! A [`RepoHistory`] is the ingested activity of one repository: pull
//! requests with their reviews, review comments, issue events, draft
//! transitions and review requests, plus the ingestion gaps recorded while
//! fetching them. Every read that the evaluation pipeline performs goes
//! through an instant (`as_of` or a half-open window), so nothing dated after
//! a cutoff can leak into predictor inputs or truth labels.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{HistoryError, HistoryResult};

/// Pull request number within a repository.
pub type PrNumber = u64;

/// Resource categories whose ingestion gaps make truth untrustworthy.
pub const TRUTH_GAP_RESOURCES: [&str; 6] = [
    "issue_comments",
    "issue_events",
    "issues",
    "pulls",
    "review_comments",
    "reviews",
];

// ---------------------------------------------------------------------------
// Actors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    #[default]
    User,
    Bot,
    Team,
}

/// A GitHub-style account or team.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    pub login: String,
    #[serde(default)]
    pub kind: ActorKind,
}

impl Actor {
    pub fn user(login: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            kind: ActorKind::User,
        }
    }

    pub fn bot(login: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            kind: ActorKind::Bot,
        }
    }

    /// Automated accounts are flagged by kind or by the `[bot]` login suffix.
    pub fn is_bot(&self) -> bool {
        self.kind == ActorKind::Bot || self.login.to_ascii_lowercase().ends_with("[bot]")
    }
}

// ---------------------------------------------------------------------------
// Ingested records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftTransition {
    pub occurred_at: DateTime<Utc>,
    pub is_draft: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub id: u64,
    pub reviewer: Actor,
    pub requested_at: DateTime<Utc>,
    #[serde(default)]
    pub removed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub id: u64,
    pub reviewer: Actor,
    pub state: String,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewComment {
    pub id: u64,
    pub author: Actor,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueEvent {
    pub id: u64,
    /// Event type such as `pull_request.merged`.
    pub kind: String,
    #[serde(default)]
    pub actor: Option<Actor>,
    pub occurred_at: DateTime<Utc>,
}

/// Ownership-signal coverage as seen by the ownership subsystem.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipCoverage {
    pub codeowners_present: bool,
    #[serde(default)]
    pub artifact_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestRecord {
    pub number: PrNumber,
    pub author: Actor,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub base_sha: Option<String>,
    #[serde(default)]
    pub changed_files: Vec<String>,
    /// Draft state at creation; later changes are in `draft_transitions`.
    #[serde(default)]
    pub opened_as_draft: bool,
    #[serde(default)]
    pub draft_transitions: Vec<DraftTransition>,
    #[serde(default)]
    pub review_requests: Vec<ReviewRequest>,
    #[serde(default)]
    pub reviews: Vec<Review>,
    #[serde(default)]
    pub review_comments: Vec<ReviewComment>,
    #[serde(default)]
    pub events: Vec<IssueEvent>,
    #[serde(default)]
    pub ownership: Option<OwnershipCoverage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionGap {
    pub resource: String,
    #[serde(default)]
    pub detail: Option<String>,
}

/// All ingested activity for one repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoHistory {
    /// `owner/name`
    pub repo: String,
    #[serde(default)]
    pub pulls: Vec<PullRequestRecord>,
    #[serde(default)]
    pub gaps: Vec<IngestionGap>,
    #[serde(default)]
    pub watermark_updated_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Point-in-time views
// ---------------------------------------------------------------------------

/// State of a pull request as of an instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrSnapshot {
    pub repo: String,
    pub pr_number: PrNumber,
    pub as_of: DateTime<Utc>,
    pub author: Actor,
    pub created_at: DateTime<Utc>,
    pub title: String,
    pub base_sha: Option<String>,
    pub changed_files: Vec<String>,
    pub requested_reviewers: Vec<Actor>,
    pub is_draft: bool,
    pub ownership: Option<OwnershipCoverage>,
}

/// Created-at filter used for cohort sampling: `[start_at, end_at)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedWindow {
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
}

impl CreatedWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start_at.map_or(true, |s| at >= s) && self.end_at.map_or(true, |e| at < e)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionWatermark {
    pub max_event_occurred_at: Option<DateTime<Utc>>,
    pub watermark_updated_at: Option<DateTime<Utc>>,
}

/// Latest activity instant for truth sources plus the relevant gap resources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruthCoverage {
    pub horizon_max: Option<DateTime<Utc>>,
    pub gap_resources: Vec<String>,
}

// ---------------------------------------------------------------------------
// Activity scans
// ---------------------------------------------------------------------------

/// Source categories a truth policy may draw candidates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivitySource {
    Reviews,
    ReviewComments,
    Events,
    ReviewRequests,
}

impl ActivitySource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reviews => "reviews",
            Self::ReviewComments => "review_comments",
            Self::Events => "events",
            Self::ReviewRequests => "review_requests",
        }
    }
}

impl fmt::Display for ActivitySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    ReviewSubmitted,
    ReviewComment,
    Event,
    ReviewRequested,
}

impl ActivityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReviewSubmitted => "review_submitted",
            Self::ReviewComment => "review_comment",
            Self::Event => "event",
            Self::ReviewRequested => "review_requested",
        }
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One candidate activity row inside a truth window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityRow {
    pub event_id: u64,
    pub kind: ActivityKind,
    pub actor: Actor,
    pub occurred_at: DateTime<Utc>,
    pub review_state: Option<String>,
    pub event_type: Option<String>,
}

impl ActivityRow {
    /// Stable ordering key: timestamp, then sequence id, then source kind.
    pub fn sort_key(&self) -> (DateTime<Utc>, u64, &'static str) {
        (self.occurred_at, self.event_id, self.kind.as_str())
    }
}

/// Half-open window `(start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at > self.start && at <= self.end
    }
}

/// Parameters of a post-cutoff activity scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityQuery {
    pub window: TimeWindow,
    pub sources: BTreeSet<ActivitySource>,
    pub exclude_bots: bool,
    pub exclude_author: bool,
    /// Upper-cased review states a submitted review must carry.
    pub review_states: Option<BTreeSet<String>>,
    pub event_types: Option<BTreeSet<String>>,
}

impl ActivityQuery {
    pub fn new(window: TimeWindow) -> Self {
        Self {
            window,
            sources: BTreeSet::new(),
            exclude_bots: true,
            exclude_author: true,
            review_states: None,
            event_types: None,
        }
    }

    pub fn with_sources(mut self, sources: impl IntoIterator<Item = ActivitySource>) -> Self {
        self.sources.extend(sources);
        self
    }

    pub fn with_review_states<S: AsRef<str>>(mut self, states: impl IntoIterator<Item = S>) -> Self {
        self.review_states = Some(
            states
                .into_iter()
                .map(|s| s.as_ref().to_ascii_uppercase())
                .collect(),
        );
        self
    }

    /// Whether `row` survives the exclusion and state filters.
    pub fn admits(&self, row: &ActivityRow, author: &Actor) -> bool {
        if self.exclude_bots && row.actor.is_bot() {
            return false;
        }
        if self.exclude_author && row.actor.login == author.login {
            return false;
        }
        if row.kind == ActivityKind::ReviewSubmitted {
            if let Some(states) = &self.review_states {
                let state = row.review_state.as_deref().unwrap_or("").to_ascii_uppercase();
                if !states.contains(&state) {
                    return false;
                }
            }
        }
        if row.kind == ActivityKind::Event {
            if let Some(types) = &self.event_types {
                if !row.event_type.as_ref().is_some_and(|t| types.contains(t)) {
                    return false;
                }
            }
        }
        true
    }
}

/// Result of a scan: admitted rows in stable order plus raw per-source counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityScan {
    pub rows: Vec<ActivityRow>,
    pub scanned: BTreeMap<ActivitySource, usize>,
}

impl ActivityScan {
    pub fn scanned_for(&self, source: ActivitySource) -> usize {
        self.scanned.get(&source).copied().unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// RepoHistory queries
// ---------------------------------------------------------------------------

impl RepoHistory {
    pub fn new(repo: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            pulls: Vec::new(),
            gaps: Vec::new(),
            watermark_updated_at: None,
        }
    }

    /// Reject fixtures with duplicate PR numbers.
    pub fn validate(&self) -> HistoryResult<()> {
        let mut seen = BTreeSet::new();
        for pr in &self.pulls {
            if !seen.insert(pr.number) {
                return Err(HistoryError::Fixture(format!(
                    "duplicate pr number {} in {}",
                    pr.number, self.repo
                )));
            }
        }
        Ok(())
    }

    pub fn pull(&self, pr_number: PrNumber) -> HistoryResult<&PullRequestRecord> {
        self.pulls
            .iter()
            .find(|p| p.number == pr_number)
            .ok_or_else(|| HistoryError::PrNotFound {
                repo: self.repo.clone(),
                pr_number,
            })
    }

    pub fn ready_for_review_at(&self, pr_number: PrNumber) -> HistoryResult<Option<DateTime<Utc>>> {
        let pr = self.pull(pr_number)?;
        Ok(pr
            .draft_transitions
            .iter()
            .filter(|t| !t.is_draft)
            .map(|t| t.occurred_at)
            .min())
    }

    pub fn snapshot(&self, pr_number: PrNumber, as_of: DateTime<Utc>) -> HistoryResult<PrSnapshot> {
        let pr = self.pull(pr_number)?;
        if pr.created_at > as_of {
            return Err(HistoryError::NotVisible {
                repo: self.repo.clone(),
                pr_number,
                as_of,
            });
        }

        let mut transitions: Vec<&DraftTransition> = pr
            .draft_transitions
            .iter()
            .filter(|t| t.occurred_at <= as_of)
            .collect();
        transitions.sort_by_key(|t| t.occurred_at);
        let is_draft = transitions
            .last()
            .map_or(pr.opened_as_draft, |t| t.is_draft);

        let mut requested: Vec<&ReviewRequest> = pr
            .review_requests
            .iter()
            .filter(|r| r.requested_at <= as_of && r.removed_at.map_or(true, |e| as_of < e))
            .collect();
        requested.sort_by(|a, b| (a.requested_at, a.id).cmp(&(b.requested_at, b.id)));
        let mut requested_reviewers: Vec<Actor> = Vec::new();
        for r in requested {
            if !requested_reviewers.contains(&r.reviewer) {
                requested_reviewers.push(r.reviewer.clone());
            }
        }

        Ok(PrSnapshot {
            repo: self.repo.clone(),
            pr_number,
            as_of,
            author: pr.author.clone(),
            created_at: pr.created_at,
            title: pr.title.clone(),
            base_sha: pr.base_sha.clone(),
            changed_files: pr.changed_files.clone(),
            requested_reviewers,
            is_draft,
            ownership: pr.ownership.clone(),
        })
    }

    pub fn list_pr_numbers(&self, window: &CreatedWindow) -> Vec<PrNumber> {
        let mut out: Vec<PrNumber> = self
            .pulls
            .iter()
            .filter(|p| window.contains(p.created_at))
            .map(|p| p.number)
            .collect();
        out.sort_unstable();
        out
    }

    /// Latest instant of any ingested activity.
    pub fn watermark(&self) -> IngestionWatermark {
        let mut max: Option<DateTime<Utc>> = None;
        let mut bump = |at: DateTime<Utc>| {
            if max.map_or(true, |m| at > m) {
                max = Some(at);
            }
        };
        for pr in &self.pulls {
            bump(pr.created_at);
            pr.draft_transitions.iter().for_each(|t| bump(t.occurred_at));
            pr.review_requests.iter().for_each(|r| {
                bump(r.requested_at);
                if let Some(at) = r.removed_at {
                    bump(at);
                }
            });
            pr.reviews.iter().filter_map(|r| r.submitted_at).for_each(&mut bump);
            pr.review_comments.iter().for_each(|c| bump(c.created_at));
            pr.events.iter().for_each(|e| bump(e.occurred_at));
        }
        IngestionWatermark {
            max_event_occurred_at: max,
            watermark_updated_at: self.watermark_updated_at,
        }
    }

    /// Coverage horizon over reviews, review comments and events.
    pub fn truth_coverage(&self) -> TruthCoverage {
        let horizon_max = self
            .pulls
            .iter()
            .flat_map(|pr| {
                pr.reviews
                    .iter()
                    .filter_map(|r| r.submitted_at)
                    .chain(pr.review_comments.iter().map(|c| c.created_at))
                    .chain(pr.events.iter().map(|e| e.occurred_at))
            })
            .max();

        let gap_resources: BTreeSet<String> = self
            .gaps
            .iter()
            .map(|g| g.resource.clone())
            .filter(|r| TRUTH_GAP_RESOURCES.contains(&r.as_str()))
            .collect();

        TruthCoverage {
            horizon_max,
            gap_resources: gap_resources.into_iter().collect(),
        }
    }

    pub fn scan_activity(&self, pr_number: PrNumber, query: &ActivityQuery) -> HistoryResult<ActivityScan> {
        let pr = self.pull(pr_number)?;
        let mut scanned: BTreeMap<ActivitySource, usize> = BTreeMap::new();
        let mut rows: Vec<ActivityRow> = Vec::new();

        for source in &query.sources {
            let window_rows = window_rows(pr, *source, &query.window);
            scanned.insert(*source, window_rows.len());
            rows.extend(window_rows);
        }

        rows.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        rows.retain(|row| query.admits(row, &pr.author));

        tracing::trace!(
            repo = %self.repo,
            pr_number,
            admitted = rows.len(),
            "activity scan complete"
        );
        Ok(ActivityScan { rows, scanned })
    }
}

fn window_rows(pr: &PullRequestRecord, source: ActivitySource, window: &TimeWindow) -> Vec<ActivityRow> {
    match source {
        ActivitySource::Reviews => pr
            .reviews
            .iter()
            .filter_map(|r| {
                let at = r.submitted_at?;
                window.contains(at).then(|| ActivityRow {
                    event_id: r.id,
                    kind: ActivityKind::ReviewSubmitted,
                    actor: r.reviewer.clone(),
                    occurred_at: at,
                    review_state: Some(r.state.clone()),
                    event_type: None,
                })
            })
            .collect(),
        ActivitySource::ReviewComments => pr
            .review_comments
            .iter()
            .filter(|c| window.contains(c.created_at))
            .map(|c| ActivityRow {
                event_id: c.id,
                kind: ActivityKind::ReviewComment,
                actor: c.author.clone(),
                occurred_at: c.created_at,
                review_state: None,
                event_type: None,
            })
            .collect(),
        ActivitySource::Events => pr
            .events
            .iter()
            .filter(|e| window.contains(e.occurred_at))
            .filter_map(|e| {
                let actor = e.actor.clone()?;
                Some(ActivityRow {
                    event_id: e.id,
                    kind: ActivityKind::Event,
                    actor,
                    occurred_at: e.occurred_at,
                    review_state: None,
                    event_type: Some(e.kind.clone()),
                })
            })
            .collect(),
        ActivitySource::ReviewRequests => pr
            .review_requests
            .iter()
            .filter(|r| window.contains(r.requested_at))
            .map(|r| ActivityRow {
                event_id: r.id,
                kind: ActivityKind::ReviewRequested,
                actor: r.reviewer.clone(),
                occurred_at: r.requested_at,
                review_state: None,
                event_type: None,
            })
            .collect(),
    }
}
