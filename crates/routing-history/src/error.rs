//! Error types for routing-history

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::PrNumber;

/// Errors raised by repository history stores.
#[derive(Error, Debug)]
pub enum HistoryError {
    /// Repository has no ingested history
    #[error("repo not found in history store: {repo}")]
    RepoNotFound { repo: String },

    /// Pull request is unknown to the store
    #[error("pr not found: {repo}#{pr_number}")]
    PrNotFound { repo: String, pr_number: PrNumber },

    /// Pull request did not exist yet at the requested instant
    #[error("pr {repo}#{pr_number} is not visible as of {as_of}")]
    NotVisible {
        repo: String,
        pr_number: PrNumber,
        as_of: DateTime<Utc>,
    },

    /// Fixture content is structurally invalid
    #[error("invalid history fixture: {0}")]
    Fixture(String),

    /// Serialization error
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for history store operations
pub type HistoryResult<T> = std::result::Result<T, HistoryError>;
