//! Run manifest: what a run was configured with and what it resolved to.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use routing_history::{IngestionWatermark, PrNumber};
use serde::{Deserialize, Serialize};

use crate::config::{ExecutionMode, PredictorSpec, RunConfig};
use crate::cutoff::{CutoffOrigin, ResolvedCutoffs};
use crate::domain::{PolicySource, Result};
use crate::predictor::predictor_config_hash;
use crate::truth_policy::ResolvedPolicies;

pub const MANIFEST_KIND: &str = "run_manifest";
pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictorEntry {
    pub id: String,
    pub kind: String,
    pub config_path: Option<String>,
    pub config_hash: Option<String>,
}

impl PredictorEntry {
    pub fn from_spec(spec: &PredictorSpec) -> Result<Self> {
        Ok(Self {
            id: spec.id.clone(),
            kind: spec.kind.clone(),
            config_path: spec.config_path.as_ref().map(|p| p.display().to_string()),
            config_hash: predictor_config_hash(spec)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyOrigin {
    pub source: PolicySource,
    pub source_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruthManifest {
    pub policies: Vec<String>,
    pub primary: String,
    pub effective_window_seconds: i64,
    pub include_review_comments: bool,
    pub policy_hashes: BTreeMap<String, String>,
    pub policy_origins: BTreeMap<String, PolicyOrigin>,
}

impl TruthManifest {
    pub fn new(policies: &ResolvedPolicies, primary: &str, window_seconds: i64, include_review_comments: bool) -> Self {
        Self {
            policies: policies.ids(),
            primary: primary.to_string(),
            effective_window_seconds: window_seconds,
            include_review_comments,
            policy_hashes: policies.policy_hashes(),
            policy_origins: policies
                .active
                .iter()
                .map(|p| {
                    (
                        p.id().to_string(),
                        PolicyOrigin {
                            source: p.source,
                            source_ref: p.source_ref.clone(),
                        },
                    )
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    pub schema_version: u32,
    pub kind: String,
    pub repo: String,
    pub run_id: String,
    pub generated_at: DateTime<Utc>,
    pub config: RunConfig,
    pub config_hash: String,
    pub db_max_event_occurred_at: Option<DateTime<Utc>>,
    pub db_max_watermark_updated_at: Option<DateTime<Utc>>,
    pub cutoff_policy: String,
    pub cutoff_source: CutoffOrigin,
    /// Evaluation order: ascending `(cutoff, pr_number)`.
    pub pr_numbers: Vec<PrNumber>,
    pub pr_cutoffs: BTreeMap<String, DateTime<Utc>>,
    pub cohort_hash: String,
    pub predictors: Vec<PredictorEntry>,
    pub truth: TruthManifest,
    pub top_k: usize,
    pub hit_ks: Vec<usize>,
    pub strict_streaming_eval: bool,
    pub execution_mode: ExecutionMode,
}

/// Everything the manifest needs from the prepare stage.
pub struct ManifestParts<'a> {
    pub config: &'a RunConfig,
    pub config_hash: String,
    pub run_id: &'a str,
    pub generated_at: DateTime<Utc>,
    pub watermark: &'a IngestionWatermark,
    pub cutoff_policy: String,
    pub cutoffs: &'a ResolvedCutoffs,
    pub cohort_hash: &'a str,
    pub predictors: Vec<PredictorEntry>,
    pub truth: TruthManifest,
    pub top_k: usize,
    pub hit_ks: &'a [usize],
    pub strict_streaming_eval: bool,
    pub execution_mode: ExecutionMode,
}

impl RunManifest {
    pub fn build(parts: ManifestParts<'_>) -> Self {
        let ordered = parts.cutoffs.ordered();
        let mut config = parts.config.clone();
        config.run_id = parts.run_id.to_string();
        Self {
            schema_version: MANIFEST_SCHEMA_VERSION,
            kind: MANIFEST_KIND.to_string(),
            repo: parts.config.repo.clone(),
            run_id: parts.run_id.to_string(),
            generated_at: parts.generated_at,
            config,
            config_hash: parts.config_hash,
            db_max_event_occurred_at: parts.watermark.max_event_occurred_at,
            db_max_watermark_updated_at: parts.watermark.watermark_updated_at,
            cutoff_policy: parts.cutoff_policy,
            cutoff_source: parts.cutoffs.origin,
            pr_numbers: ordered.iter().map(|(n, _)| *n).collect(),
            pr_cutoffs: ordered.iter().map(|(n, c)| (n.to_string(), *c)).collect(),
            cohort_hash: parts.cohort_hash.to_string(),
            predictors: parts.predictors,
            truth: parts.truth,
            top_k: parts.top_k,
            hit_ks: parts.hit_ks.to_vec(),
            strict_streaming_eval: parts.strict_streaming_eval,
            execution_mode: parts.execution_mode,
        }
    }

    pub fn predictor_ids(&self) -> Vec<String> {
        self.predictors.iter().map(|p| p.id.clone()).collect()
    }
}
