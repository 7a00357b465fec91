//! Per-item record: one line of the append-only `per_pr.jsonl` log.
//!
//! Every downstream summary (report, gates, promotion, run summary, compare)
//! is derived from these rows and nothing else.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use routing_history::{OwnershipCoverage, PrNumber};
use serde::{Deserialize, Serialize};

use crate::agreement::ItemMetrics;
use crate::domain::route::RouteResult;
use crate::domain::truth::{TruthDiagnostics, TruthStatus};
use crate::queue::QueueMetrics;

/// Where a truth policy came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicySource {
    Builtin,
    Plugin,
}

/// Truth for one policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyTruth {
    pub targets: Vec<String>,
    pub status: TruthStatus,
    pub diagnostics: TruthDiagnostics,
    pub policy_hash: String,
    pub policy_source: PolicySource,
    pub policy_source_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruthBlock {
    pub version: String,
    pub primary_policy: String,
    pub policies: BTreeMap<String, PolicyTruth>,
}

/// One predictor's outcome for one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictorOutcome {
    pub route_result: Option<RouteResult>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub timed_out: bool,
    pub routing_agreement: ItemMetrics,
    pub routing_agreement_by_policy: BTreeMap<String, ItemMetrics>,
    /// Present only when a route result was produced.
    #[serde(default)]
    pub queue: Option<QueueMetrics>,
}

impl PredictorOutcome {
    /// A usable, non-empty candidate list was produced.
    pub fn is_nonempty(&self) -> bool {
        self.route_result
            .as_ref()
            .is_some_and(|r| !r.candidates.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerPrRecord {
    pub repo: String,
    pub run_id: String,
    pub pr_number: PrNumber,
    pub cutoff: DateTime<Utc>,
    /// Primary-policy targets.
    pub truth_behavior: Vec<String>,
    pub truth_status: TruthStatus,
    pub truth_diagnostics: TruthDiagnostics,
    pub truth: TruthBlock,
    #[serde(default)]
    pub ownership: Option<OwnershipCoverage>,
    pub predictors: BTreeMap<String, PredictorOutcome>,
}

impl PerPrRecord {
    pub fn policy(&self, policy_id: &str) -> Option<&PolicyTruth> {
        self.truth.policies.get(policy_id)
    }

    pub fn policy_status(&self, policy_id: &str) -> Option<TruthStatus> {
        self.policy(policy_id).map(|p| p.status)
    }

    /// Metrics for `predictor_id` under `policy_id`.
    pub fn metrics(&self, predictor_id: &str, policy_id: &str) -> Option<&ItemMetrics> {
        self.predictors
            .get(predictor_id)?
            .routing_agreement_by_policy
            .get(policy_id)
    }
}
