//! JSON fixture loader
//!
//! Ingested history is exported per repository as
//! `<data_dir>/<owner>/<name>/history.json`, a serialized [`RepoHistory`].

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::{HistoryError, HistoryResult};
use crate::fakes::MemoryHistoryStore;
use crate::model::*;
use crate::storage_traits::HistoryStore;

/// Fixture file name inside a repository directory.
pub const HISTORY_FILE: &str = "history.json";

/// Path of the history fixture for `repo` under `data_dir`.
pub fn history_path(data_dir: &Path, repo: &str) -> HistoryResult<PathBuf> {
    let (owner, name) = repo
        .split_once('/')
        .filter(|(o, n)| !o.is_empty() && !n.is_empty() && !n.contains('/'))
        .ok_or_else(|| HistoryError::Fixture(format!("repo must be owner/name, got {repo:?}")))?;
    Ok(data_dir.join(owner).join(name).join(HISTORY_FILE))
}

/// History store loaded once from a fixture file.
#[derive(Debug)]
pub struct FileHistoryStore {
    path: PathBuf,
    inner: MemoryHistoryStore,
}

impl FileHistoryStore {
    pub fn open(data_dir: &Path, repo: &str) -> HistoryResult<Self> {
        let path = history_path(data_dir, repo)?;
        let raw = std::fs::read(&path)?;
        let history: RepoHistory = serde_json::from_slice(&raw)?;
        if history.repo != repo {
            return Err(HistoryError::Fixture(format!(
                "{} declares repo {:?}, expected {:?}",
                path.display(),
                history.repo,
                repo
            )));
        }
        debug!(path = %path.display(), pulls = history.pulls.len(), "loaded history fixture");
        let inner = MemoryHistoryStore::new().with_history(history)?;
        Ok(Self { path, inner })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl HistoryStore for FileHistoryStore {
    async fn pr_created_at(&self, repo: &str, pr_number: PrNumber) -> HistoryResult<DateTime<Utc>> {
        self.inner.pr_created_at(repo, pr_number).await
    }

    async fn ready_for_review_at(
        &self,
        repo: &str,
        pr_number: PrNumber,
    ) -> HistoryResult<Option<DateTime<Utc>>> {
        self.inner.ready_for_review_at(repo, pr_number).await
    }

    async fn snapshot(
        &self,
        repo: &str,
        pr_number: PrNumber,
        as_of: DateTime<Utc>,
    ) -> HistoryResult<PrSnapshot> {
        self.inner.snapshot(repo, pr_number, as_of).await
    }

    async fn list_pr_numbers(&self, repo: &str, window: &CreatedWindow) -> HistoryResult<Vec<PrNumber>> {
        self.inner.list_pr_numbers(repo, window).await
    }

    async fn ingestion_watermark(&self, repo: &str) -> HistoryResult<IngestionWatermark> {
        self.inner.ingestion_watermark(repo).await
    }

    async fn truth_coverage(&self, repo: &str) -> HistoryResult<TruthCoverage> {
        self.inner.truth_coverage(repo).await
    }

    async fn scan_activity(
        &self,
        repo: &str,
        pr_number: PrNumber,
        query: &ActivityQuery,
    ) -> HistoryResult<ActivityScan> {
        self.inner.scan_activity(repo, pr_number, query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_path_requires_owner_and_name() {
        let dir = Path::new("/data");
        assert_eq!(
            history_path(dir, "acme/widgets").unwrap(),
            PathBuf::from("/data/acme/widgets/history.json")
        );
        assert!(history_path(dir, "widgets").is_err());
        assert!(history_path(dir, "acme/").is_err());
        assert!(history_path(dir, "a/b/c").is_err());
    }

    #[test]
    fn open_rejects_mismatched_repo() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = history_path(dir.path(), "acme/widgets").unwrap();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let other = RepoHistory::new("acme/gadgets");
        std::fs::write(&path, serde_json::to_vec(&other).unwrap()).unwrap();

        let err = FileHistoryStore::open(dir.path(), "acme/widgets").unwrap_err();
        assert!(matches!(err, HistoryError::Fixture(_)));
    }
}
