//! Self-hashing cohort documents.
//!
//! A cohort pins the exact items of an evaluation and their cutoffs. Its
//! `hash` is the digest of the canonical document with `hash` removed, so any
//! consumer can re-derive it and reject edited files.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use routing_history::{CreatedWindow, HistoryStore, PrNumber};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::artifacts;
use crate::cutoff::{resolve_cutoffs, CutoffPolicy};
use crate::domain::digest::digest_without_field;
use crate::domain::{EvalError, Result};

pub const COHORT_KIND: &str = "cohort";
pub const COHORT_VERSION: &str = "v1";
const HASH_FIELD: &str = "hash";

/// Provenance of a sampled cohort.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CohortFilters {
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub seed: Option<u64>,
}

impl CohortFilters {
    pub fn window(&self) -> CreatedWindow {
        CreatedWindow {
            start_at: self.start_at,
            end_at: self.end_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cohort {
    pub kind: String,
    pub version: String,
    pub repo: String,
    pub cutoff_policy: String,
    pub filters: CohortFilters,
    pub pr_numbers: Vec<PrNumber>,
    /// Keyed by the decimal PR number.
    pub pr_cutoffs: BTreeMap<String, DateTime<Utc>>,
    #[serde(default)]
    pub hash: String,
}

impl Cohort {
    /// Build and seal a cohort from already-resolved cutoffs.
    pub fn new(
        repo: impl Into<String>,
        cutoff_policy: &CutoffPolicy,
        filters: CohortFilters,
        cutoffs: &BTreeMap<PrNumber, DateTime<Utc>>,
    ) -> Result<Self> {
        let mut pr_numbers: Vec<PrNumber> = cutoffs.keys().copied().collect();
        pr_numbers.sort_unstable();
        let cohort = Self {
            kind: COHORT_KIND.to_string(),
            version: COHORT_VERSION.to_string(),
            repo: repo.into(),
            cutoff_policy: cutoff_policy.to_string(),
            filters,
            pr_numbers,
            pr_cutoffs: cutoffs.iter().map(|(n, c)| (n.to_string(), *c)).collect(),
            hash: String::new(),
        };
        cohort.sealed()
    }

    /// Recompute the content hash over everything but `hash`.
    pub fn compute_hash(&self) -> Result<String> {
        digest_without_field(&serde_json::to_value(self)?, HASH_FIELD)
    }

    pub fn sealed(mut self) -> Result<Self> {
        self.hash = self.compute_hash()?;
        Ok(self)
    }

    /// Validate a raw document, then decode it.
    pub fn from_value(value: Value) -> Result<Self> {
        validate_hashed(&value, COHORT_KIND)?;
        Ok(serde_json::from_value(value)?)
    }

    /// The explicit cutoff map carried by this cohort.
    pub fn cutoff_map(&self) -> Result<BTreeMap<PrNumber, DateTime<Utc>>> {
        let mut out = BTreeMap::new();
        for (key, cutoff) in &self.pr_cutoffs {
            let n: PrNumber = key
                .trim()
                .parse()
                .map_err(|_| EvalError::InvalidCohort(format!("pr_cutoffs key is not a PR number: {key:?}")))?;
            out.insert(n, *cutoff);
        }
        Ok(out)
    }
}

/// Check kind, hash presence, then the recomputed hash, in that order.
pub fn validate_hashed(value: &Value, kind: &str) -> Result<()> {
    if value.get("kind").and_then(Value::as_str) != Some(kind) {
        return Err(EvalError::InvalidCohort(format!("expected kind={kind:?}")));
    }
    let expected = match value.get(HASH_FIELD).and_then(Value::as_str) {
        Some(h) if !h.is_empty() => h,
        _ => return Err(EvalError::InvalidCohort("missing hash".to_string())),
    };
    let actual = digest_without_field(value, HASH_FIELD)?;
    if actual != expected {
        return Err(EvalError::InvalidCohort(format!(
            "hash mismatch: expected {expected}, recomputed {actual}"
        )));
    }
    Ok(())
}

pub fn read_cohort(path: &Path) -> Result<Cohort> {
    let value: Value = artifacts::read_json(path)?;
    Cohort::from_value(value).map_err(|e| match e {
        EvalError::InvalidCohort(msg) => EvalError::InvalidCohort(format!("{}: {msg}", path.display())),
        other => other,
    })
}

pub fn write_cohort(path: &Path, cohort: &Cohort) -> Result<String> {
    artifacts::write_json(path, cohort)
}

// ---------------------------------------------------------------------------
// Sampling
// ---------------------------------------------------------------------------

/// Select cohort items.
///
/// Explicit numbers win: sorted, de-duplicated, truncated to `limit`.
/// Otherwise the created-at window pool is used; with both `seed` and `limit`
/// the pool is shuffled deterministically before truncation. The result is
/// always sorted.
pub async fn sample_pr_numbers(
    store: &dyn HistoryStore,
    repo: &str,
    explicit: &[PrNumber],
    filters: &CohortFilters,
) -> Result<Vec<PrNumber>> {
    if !explicit.is_empty() {
        let mut prs = explicit.to_vec();
        prs.sort_unstable();
        prs.dedup();
        if let Some(limit) = filters.limit {
            prs.truncate(limit);
        }
        return Ok(prs);
    }

    let mut pool = store.list_pr_numbers(repo, &filters.window()).await?;
    match (filters.seed, filters.limit) {
        (Some(seed), Some(limit)) if pool.len() > limit => {
            let mut rng = StdRng::seed_from_u64(seed);
            pool.shuffle(&mut rng);
            pool.truncate(limit);
        }
        (_, Some(limit)) => pool.truncate(limit),
        _ => {}
    }
    pool.sort_unstable();
    pool.dedup();
    debug!(repo, selected = pool.len(), "sampled cohort pool");
    Ok(pool)
}

/// Sample items, resolve their cutoffs under `policy` and seal a cohort.
pub async fn create_cohort(
    store: &dyn HistoryStore,
    repo: &str,
    explicit: &[PrNumber],
    filters: CohortFilters,
    policy: &CutoffPolicy,
) -> Result<Cohort> {
    let selected = sample_pr_numbers(store, repo, explicit, &filters).await?;
    if selected.is_empty() {
        return Err(EvalError::InvalidCohort("no PRs selected for cohort".to_string()));
    }
    let resolved = resolve_cutoffs(store, repo, &selected, policy, None).await?;
    let cohort = Cohort::new(repo, policy, filters, &resolved.cutoffs)?;
    info!(
        event = "cohort.created",
        repo,
        pr_count = cohort.pr_numbers.len(),
        hash = %cohort.hash,
        "cohort created"
    );
    Ok(cohort)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use routing_history::{Actor, MemoryHistoryStore, PullRequestRecord};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn store(n: u64) -> MemoryHistoryStore {
        let store = MemoryHistoryStore::new();
        for number in 1..=n {
            store
                .add_pull(
                    "acme/widgets",
                    PullRequestRecord {
                        number,
                        author: Actor::user("author"),
                        created_at: t0() + Duration::hours(number as i64),
                        title: format!("pr {number}"),
                        base_sha: None,
                        changed_files: vec![],
                        opened_as_draft: false,
                        draft_transitions: vec![],
                        review_requests: vec![],
                        reviews: vec![],
                        review_comments: vec![],
                        events: vec![],
                        ownership: None,
                    },
                )
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn explicit_numbers_are_sorted_deduped_and_limited() {
        let store = store(3);
        let filters = CohortFilters {
            limit: Some(2),
            ..CohortFilters::default()
        };
        let prs = sample_pr_numbers(&store, "acme/widgets", &[9, 3, 3, 5], &filters)
            .await
            .unwrap();
        assert_eq!(prs, vec![3, 5]);
    }

    #[tokio::test]
    async fn seeded_sampling_is_reproducible_and_sorted() {
        let store = store(40);
        let filters = CohortFilters {
            limit: Some(10),
            seed: Some(7),
            ..CohortFilters::default()
        };
        let a = sample_pr_numbers(&store, "acme/widgets", &[], &filters).await.unwrap();
        let b = sample_pr_numbers(&store, "acme/widgets", &[], &filters).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 10);
        assert!(a.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn unseeded_limit_takes_the_head_of_the_pool() {
        let store = store(5);
        let filters = CohortFilters {
            start_at: Some(t0() + Duration::hours(2)),
            limit: Some(2),
            ..CohortFilters::default()
        };
        let prs = sample_pr_numbers(&store, "acme/widgets", &[], &filters).await.unwrap();
        assert_eq!(prs, vec![2, 3]);
    }

    #[tokio::test]
    async fn created_cohort_validates_and_rejects_edits() {
        let store = store(3);
        let cohort = create_cohort(
            &store,
            "acme/widgets",
            &[],
            CohortFilters::default(),
            &CutoffPolicy::CreatedAt,
        )
        .await
        .unwrap();
        assert_eq!(cohort.pr_numbers, vec![1, 2, 3]);
        assert_eq!(cohort.hash, cohort.compute_hash().unwrap());

        let mut value = serde_json::to_value(&cohort).unwrap();
        assert!(Cohort::from_value(value.clone()).is_ok());

        value["pr_numbers"] = serde_json::json!([1, 2]);
        let err = Cohort::from_value(value).unwrap_err().to_string();
        assert!(err.contains("hash mismatch: expected"), "{err}");
    }

    #[test]
    fn validation_checks_kind_before_hash() {
        let err = validate_hashed(&serde_json::json!({ "kind": "spec" }), COHORT_KIND)
            .unwrap_err()
            .to_string();
        assert!(err.contains("expected kind=\"cohort\""));
        let err = validate_hashed(&serde_json::json!({ "kind": "cohort", "hash": "" }), COHORT_KIND)
            .unwrap_err()
            .to_string();
        assert!(err.contains("missing hash"));
    }

    #[tokio::test]
    async fn empty_selection_is_rejected() {
        let store = store(2);
        let filters = CohortFilters {
            start_at: Some(t0() + Duration::days(30)),
            ..CohortFilters::default()
        };
        let err = create_cohort(&store, "acme/widgets", &[], filters, &CutoffPolicy::CreatedAt)
            .await
            .unwrap_err();
        assert!(matches!(err, EvalError::InvalidCohort(_)));
    }
}
