//! Ground-truth outcome types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use routing_history::PrNumber;
use serde::{Deserialize, Serialize};

use crate::domain::error::EvalError;

/// Classification of one item under one truth policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruthStatus {
    Observed,
    NoPostCutoffResponse,
    UnknownDueToIngestionGap,
    PolicyUnavailable,
}

impl TruthStatus {
    pub const ALL: [TruthStatus; 4] = [
        TruthStatus::Observed,
        TruthStatus::NoPostCutoffResponse,
        TruthStatus::UnknownDueToIngestionGap,
        TruthStatus::PolicyUnavailable,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Observed => "observed",
            Self::NoPostCutoffResponse => "no_post_cutoff_response",
            Self::UnknownDueToIngestionGap => "unknown_due_to_ingestion_gap",
            Self::PolicyUnavailable => "policy_unavailable",
        }
    }

    /// Statuses whose truth can be trusted either way.
    pub fn is_known(self) -> bool {
        matches!(self, Self::Observed | Self::NoPostCutoffResponse)
    }
}

impl fmt::Display for TruthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TruthStatus {
    type Err = EvalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| EvalError::InvalidTruthPolicy(format!("unknown truth status: {s}")))
    }
}

/// Per item, per policy truth diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruthDiagnostics {
    pub repo: String,
    pub pr_number: PrNumber,
    pub cutoff: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub status: TruthStatus,
    pub policy_id: String,
    pub policy_version: String,
    pub selected_login: Option<String>,
    pub selected_source: Option<String>,
    pub selected_event_id: Option<u64>,
    pub include_review_comments: bool,
    pub scanned_review_rows: usize,
    pub scanned_review_comment_rows: usize,
    pub eligible_candidates: usize,
    pub coverage_complete: bool,
    pub coverage_horizon_max: Option<DateTime<Utc>>,
    pub gap_resources: Vec<String>,
    pub notes: Vec<String>,
}

/// Truth targets plus the diagnostics that produced them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruthOutcome {
    pub targets: Vec<String>,
    pub diagnostics: TruthDiagnostics,
}

impl TruthOutcome {
    pub fn status(&self) -> TruthStatus {
        self.diagnostics.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for st in TruthStatus::ALL {
            assert_eq!(st.as_str().parse::<TruthStatus>().unwrap(), st);
            assert_eq!(
                serde_json::to_value(st).unwrap(),
                serde_json::Value::String(st.as_str().to_string())
            );
        }
    }

    #[test]
    fn known_excludes_unknown_and_unavailable() {
        assert!(TruthStatus::Observed.is_known());
        assert!(TruthStatus::NoPostCutoffResponse.is_known());
        assert!(!TruthStatus::UnknownDueToIngestionGap.is_known());
        assert!(!TruthStatus::PolicyUnavailable.is_known());
    }
}
