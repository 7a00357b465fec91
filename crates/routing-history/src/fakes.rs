//! In-memory history store
//!
//! `MemoryHistoryStore` holds one [`RepoHistory`] per repository and
//! satisfies the [`HistoryStore`] contract without touching disk. Tests build
//! it directly; the fixture loader wraps it.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{HistoryError, HistoryResult};
use crate::model::*;
use crate::storage_traits::HistoryStore;

// ---------------------------------------------------------------------------
// MemoryHistoryStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    repos: RwLock<HashMap<String, RepoHistory>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the history for `history.repo`.
    pub fn insert(&self, history: RepoHistory) -> HistoryResult<()> {
        history.validate()?;
        let mut repos = self.repos.write().unwrap_or_else(PoisonError::into_inner);
        repos.insert(history.repo.clone(), history);
        Ok(())
    }

    pub fn with_history(self, history: RepoHistory) -> HistoryResult<Self> {
        self.insert(history)?;
        Ok(self)
    }

    /// Append a pull request to `repo`, creating the repo entry if needed.
    pub fn add_pull(&self, repo: &str, pull: PullRequestRecord) -> HistoryResult<()> {
        let mut repos = self.repos.write().unwrap_or_else(PoisonError::into_inner);
        let entry = repos
            .entry(repo.to_string())
            .or_insert_with(|| RepoHistory::new(repo));
        if entry.pulls.iter().any(|p| p.number == pull.number) {
            return Err(HistoryError::Fixture(format!(
                "duplicate pr number {} in {repo}",
                pull.number
            )));
        }
        entry.pulls.push(pull);
        Ok(())
    }

    pub fn add_gap(&self, repo: &str, gap: IngestionGap) {
        let mut repos = self.repos.write().unwrap_or_else(PoisonError::into_inner);
        repos
            .entry(repo.to_string())
            .or_insert_with(|| RepoHistory::new(repo))
            .gaps
            .push(gap);
    }

    fn read<T>(&self, repo: &str, f: impl FnOnce(&RepoHistory) -> HistoryResult<T>) -> HistoryResult<T> {
        let repos = self.repos.read().unwrap_or_else(PoisonError::into_inner);
        let history = repos.get(repo).ok_or_else(|| HistoryError::RepoNotFound {
            repo: repo.to_string(),
        })?;
        f(history)
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn pr_created_at(&self, repo: &str, pr_number: PrNumber) -> HistoryResult<DateTime<Utc>> {
        self.read(repo, |h| Ok(h.pull(pr_number)?.created_at))
    }

    async fn ready_for_review_at(
        &self,
        repo: &str,
        pr_number: PrNumber,
    ) -> HistoryResult<Option<DateTime<Utc>>> {
        self.read(repo, |h| h.ready_for_review_at(pr_number))
    }

    async fn snapshot(
        &self,
        repo: &str,
        pr_number: PrNumber,
        as_of: DateTime<Utc>,
    ) -> HistoryResult<PrSnapshot> {
        self.read(repo, |h| h.snapshot(pr_number, as_of))
    }

    async fn list_pr_numbers(&self, repo: &str, window: &CreatedWindow) -> HistoryResult<Vec<PrNumber>> {
        self.read(repo, |h| Ok(h.list_pr_numbers(window)))
    }

    async fn ingestion_watermark(&self, repo: &str) -> HistoryResult<IngestionWatermark> {
        self.read(repo, |h| Ok(h.watermark()))
    }

    async fn truth_coverage(&self, repo: &str) -> HistoryResult<TruthCoverage> {
        self.read(repo, |h| Ok(h.truth_coverage()))
    }

    async fn scan_activity(
        &self,
        repo: &str,
        pr_number: PrNumber,
        query: &ActivityQuery,
    ) -> HistoryResult<ActivityScan> {
        self.read(repo, |h| h.scan_activity(pr_number, query))
    }
}
