//! Storage trait for point-in-time repository history
//!
//! `HistoryStore` is the only read path the evaluation pipeline uses:
//! - predictor inputs come from `snapshot` at the cutoff
//! - truth labels come from `scan_activity` over `(cutoff, cutoff + window]`
//! - leakage and coverage checks use `ingestion_watermark` / `truth_coverage`
//!
//! The trait is async and backend-agnostic. An in-memory fake lives in
//! `fakes`, and a JSON fixture loader in `fixture`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::HistoryResult;
use crate::model::{
    ActivityQuery, ActivityScan, CreatedWindow, IngestionWatermark, PrNumber, PrSnapshot,
    TruthCoverage,
};

// ---------------------------------------------------------------------------
// HistoryStore
// ---------------------------------------------------------------------------

/// Read-only, as-of aware view over ingested repository activity.
///
/// Guarantees:
/// - `snapshot(pr, t)` reflects only state recorded at or before `t`.
/// - `scan_activity` returns rows inside the query window only, ordered by
///   `(occurred_at, event_id, kind)`.
/// - `list_pr_numbers` is sorted ascending.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Creation instant of a pull request.
    async fn pr_created_at(&self, repo: &str, pr_number: PrNumber) -> HistoryResult<DateTime<Utc>>;

    /// First transition out of draft, if any.
    async fn ready_for_review_at(
        &self,
        repo: &str,
        pr_number: PrNumber,
    ) -> HistoryResult<Option<DateTime<Utc>>>;

    /// Pull request state as of `as_of`.
    async fn snapshot(
        &self,
        repo: &str,
        pr_number: PrNumber,
        as_of: DateTime<Utc>,
    ) -> HistoryResult<PrSnapshot>;

    /// Pull request numbers created inside `window`.
    async fn list_pr_numbers(&self, repo: &str, window: &CreatedWindow) -> HistoryResult<Vec<PrNumber>>;

    /// Latest ingested activity instant for the repository.
    async fn ingestion_watermark(&self, repo: &str) -> HistoryResult<IngestionWatermark>;

    /// Truth coverage horizon and relevant ingestion gaps.
    async fn truth_coverage(&self, repo: &str) -> HistoryResult<TruthCoverage>;

    /// Scan post-cutoff activity for a single pull request.
    async fn scan_activity(
        &self,
        repo: &str,
        pr_number: PrNumber,
        query: &ActivityQuery,
    ) -> HistoryResult<ActivityScan>;
}
