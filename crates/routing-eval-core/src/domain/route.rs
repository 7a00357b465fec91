//! Predictor output: a ranked list of reviewer candidates.

use chrono::{DateTime, Utc};
use routing_history::PrNumber;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    User,
    Team,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub kind: TargetKind,
    pub name: String,
}

impl Target {
    pub fn user(name: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::User,
            name: name.into(),
        }
    }

    pub fn team(name: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::Team,
            name: name.into(),
        }
    }
}

/// Supporting signal attached to a candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub target: Target,
    pub score: f64,
    #[serde(default)]
    pub evidence: Vec<Evidence>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteResult {
    pub repo: String,
    pub pr_number: PrNumber,
    pub as_of: DateTime<Utc>,
    pub top_k: usize,
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub risk: Option<String>,
    #[serde(default)]
    pub confidence: Option<String>,
    #[serde(default)]
    pub notes: Vec<String>,
}

impl RouteResult {
    pub fn empty(repo: impl Into<String>, pr_number: PrNumber, as_of: DateTime<Utc>, top_k: usize) -> Self {
        Self {
            repo: repo.into(),
            pr_number,
            as_of,
            top_k,
            candidates: Vec::new(),
            risk: None,
            confidence: None,
            notes: Vec::new(),
        }
    }

    /// 1-based rank of the best-ranked candidate named in `targets`.
    pub fn rank_of(&self, targets: &[String]) -> Option<usize> {
        self.candidates
            .iter()
            .position(|c| targets.iter().any(|t| t == &c.target.name))
            .map(|i| i + 1)
    }
}
