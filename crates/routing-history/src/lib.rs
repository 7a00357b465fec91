//! Routing-History: point-in-time repository activity for routing evaluation
//!
//! This crate is the read side of ingested pull request activity. Every query
//! is anchored to an instant, so callers can reconstruct what was known at a
//! routing cutoff and what happened afterwards without mixing the two.
//!
//! ## Key Components
//!
//! - `HistoryStore`: async, as-of aware read contract
//! - `MemoryHistoryStore`: in-memory implementation for tests and fixtures
//! - `FileHistoryStore`: loads `<data_dir>/<owner>/<name>/history.json`
//! - `ActivityQuery` / `ActivityScan`: post-cutoff truth window scans

mod error;
pub mod fakes;
pub mod fixture;
pub mod model;
pub mod storage_traits;

pub use error::{HistoryError, HistoryResult};
pub use fakes::MemoryHistoryStore;
pub use fixture::{history_path, FileHistoryStore, HISTORY_FILE};
pub use model::{
    ActivityKind, ActivityQuery, ActivityRow, ActivityScan, ActivitySource, Actor, ActorKind,
    CreatedWindow, DraftTransition, IngestionGap, IngestionWatermark, IssueEvent,
    OwnershipCoverage, PrNumber, PrSnapshot, PullRequestRecord, RepoHistory, Review,
    ReviewComment, ReviewRequest, TimeWindow, TruthCoverage, TRUTH_GAP_RESOURCES,
};
pub use storage_traits::HistoryStore;
