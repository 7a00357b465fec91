//! Run configuration and its one-time normalisation.
//!
//! `RunConfig` is what gets hashed into the run id. `EvalDefaults::resolve`
//! folds legacy fields and defaults into a `ResolvedDefaults` once, and every
//! later stage reads only the resolved form.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use routing_history::PrNumber;
use serde::{Deserialize, Serialize};

use crate::cutoff::CutoffPolicy;
use crate::domain::{EvalError, Result};

pub const FIRST_RESPONSE_V1: &str = "first_response_v1";
pub const FIRST_APPROVAL_V1: &str = "first_approval_v1";
const BEHAVIOR_FIRST_NON_AUTHOR: &str = "first_non_author_non_bot_review";

/// Default plugin namespace allow-list.
pub const DEFAULT_PLUGIN_ALLOWLIST: &str = "routing_eval.truth_plugins.";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Parallel,
}

/// Evaluation knobs. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalDefaults {
    pub strict_streaming_eval: bool,
    pub cutoff_policy: String,
    pub truth_window_seconds: i64,
    pub truth_include_review_comments: bool,
    pub truth_policies: Vec<String>,
    pub truth_primary_policy: String,
    pub truth_policy_plugins: Vec<String>,
    pub truth_policy_plugin_allowlist: Vec<String>,
    pub intent_truth_window_seconds: i64,
    pub behavior_truth_policy: String,
    pub intent_truth_from_review_requests: bool,
    pub exclude_bots: bool,
    pub exclude_author: bool,
    pub top_k: usize,
    pub hit_ks: Vec<usize>,
    pub execution_mode: ExecutionMode,
    pub max_workers: Option<usize>,
    pub predictor_timeout_seconds: u64,
    /// Also measure time to first review comment.
    pub queue_include_ttfc: bool,
}

impl Default for EvalDefaults {
    fn default() -> Self {
        Self {
            strict_streaming_eval: true,
            cutoff_policy: "created_at".to_string(),
            truth_window_seconds: 3600,
            truth_include_review_comments: true,
            truth_policies: vec![FIRST_RESPONSE_V1.to_string(), FIRST_APPROVAL_V1.to_string()],
            truth_primary_policy: FIRST_APPROVAL_V1.to_string(),
            truth_policy_plugins: Vec::new(),
            truth_policy_plugin_allowlist: vec![DEFAULT_PLUGIN_ALLOWLIST.to_string()],
            intent_truth_window_seconds: 3600,
            behavior_truth_policy: BEHAVIOR_FIRST_NON_AUTHOR.to_string(),
            intent_truth_from_review_requests: false,
            exclude_bots: true,
            exclude_author: true,
            top_k: 5,
            hit_ks: vec![1, 3, 5],
            execution_mode: ExecutionMode::Sequential,
            max_workers: None,
            predictor_timeout_seconds: 60,
            queue_include_ttfc: false,
        }
    }
}

/// Normalised defaults, computed once per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDefaults {
    pub strict_streaming_eval: bool,
    pub cutoff_policy: CutoffPolicy,
    pub truth_window: Duration,
    pub truth_include_review_comments: bool,
    pub truth_policy_ids: Vec<String>,
    pub truth_primary_policy: String,
    pub truth_policy_plugins: Vec<String>,
    pub truth_policy_plugin_allowlist: Vec<String>,
    pub exclude_bots: bool,
    pub exclude_author: bool,
    pub top_k: usize,
    pub hit_ks: Vec<usize>,
    pub execution_mode: ExecutionMode,
    pub max_workers: Option<usize>,
    pub predictor_timeout: std::time::Duration,
    pub queue_include_ttfc: bool,
}

impl ResolvedDefaults {
    pub fn truth_window_seconds(&self) -> i64 {
        self.truth_window.num_seconds()
    }
}

fn trimmed_unique(values: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for v in values {
        let v = v.trim();
        if !v.is_empty() && !out.iter().any(|o| o == v) {
            out.push(v.to_string());
        }
    }
    out
}

impl EvalDefaults {
    pub fn resolve(&self) -> Result<ResolvedDefaults> {
        let cutoff_policy: CutoffPolicy = self.cutoff_policy.parse()?;

        let window_seconds = if self.truth_window_seconds > 0 {
            self.truth_window_seconds
        } else {
            self.intent_truth_window_seconds
        };
        if window_seconds <= 0 {
            return Err(EvalError::InvalidConfig(
                "truth window must be > 0 seconds".to_string(),
            ));
        }
        let truth_window = Duration::try_seconds(window_seconds)
            .ok_or_else(|| EvalError::InvalidConfig("truth window out of range".to_string()))?;

        let mut truth_policy_ids = trimmed_unique(&self.truth_policies);
        if truth_policy_ids.is_empty() {
            let fallback = if self.behavior_truth_policy.trim() == BEHAVIOR_FIRST_NON_AUTHOR {
                FIRST_RESPONSE_V1
            } else {
                FIRST_APPROVAL_V1
            };
            truth_policy_ids.push(fallback.to_string());
        }
        if self.intent_truth_from_review_requests
            && !truth_policy_ids.iter().any(|p| p == FIRST_APPROVAL_V1)
        {
            truth_policy_ids.push(FIRST_APPROVAL_V1.to_string());
        }

        let primary = self.truth_primary_policy.trim();
        let truth_primary_policy = if primary.is_empty() {
            truth_policy_ids[0].clone()
        } else {
            primary.to_string()
        };

        if self.top_k == 0 {
            return Err(EvalError::InvalidConfig("top_k must be >= 1".to_string()));
        }
        let mut hit_ks = self.hit_ks.clone();
        hit_ks.sort_unstable();
        hit_ks.dedup();
        if hit_ks.is_empty() || hit_ks[0] == 0 {
            return Err(EvalError::InvalidConfig(
                "hit_ks must be a non-empty set of positive integers".to_string(),
            ));
        }
        if self.max_workers == Some(0) {
            return Err(EvalError::InvalidConfig("max_workers must be >= 1".to_string()));
        }
        if self.predictor_timeout_seconds == 0 {
            return Err(EvalError::InvalidConfig(
                "predictor_timeout_seconds must be >= 1".to_string(),
            ));
        }

        Ok(ResolvedDefaults {
            strict_streaming_eval: self.strict_streaming_eval,
            cutoff_policy,
            truth_window,
            truth_include_review_comments: self.truth_include_review_comments,
            truth_policy_ids,
            truth_primary_policy,
            truth_policy_plugins: trimmed_unique(&self.truth_policy_plugins),
            truth_policy_plugin_allowlist: self
                .truth_policy_plugin_allowlist
                .iter()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
            exclude_bots: self.exclude_bots,
            exclude_author: self.exclude_author,
            top_k: self.top_k,
            hit_ks,
            execution_mode: self.execution_mode,
            max_workers: self.max_workers,
            predictor_timeout: std::time::Duration::from_secs(self.predictor_timeout_seconds),
            queue_include_ttfc: self.queue_include_ttfc,
        })
    }
}

/// Where the run's items come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CohortSource {
    /// A self-hashing cohort document.
    File { path: PathBuf },
    Explicit { pr_numbers: Vec<PrNumber> },
    Window {
        #[serde(default)]
        start_at: Option<DateTime<Utc>>,
        #[serde(default)]
        end_at: Option<DateTime<Utc>>,
        #[serde(default)]
        limit: Option<usize>,
        #[serde(default)]
        seed: Option<u64>,
    },
}

impl Default for CohortSource {
    fn default() -> Self {
        Self::Window {
            start_at: None,
            end_at: None,
            limit: None,
            seed: None,
        }
    }
}

/// A predictor to evaluate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictorSpec {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub config_path: Option<PathBuf>,
}

/// Full configuration of one evaluation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    pub repo: String,
    /// Excluded from its own hash.
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub cohort: CohortSource,
    #[serde(default)]
    pub predictors: Vec<PredictorSpec>,
    #[serde(default)]
    pub defaults: EvalDefaults,
}

impl RunConfig {
    pub fn new(repo: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            run_id: String::new(),
            cohort: CohortSource::default(),
            predictors: Vec::new(),
            defaults: EvalDefaults::default(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)?;
        let cfg: RunConfig = serde_json::from_slice(&raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let ok = self
            .repo
            .split_once('/')
            .is_some_and(|(o, n)| !o.is_empty() && !n.is_empty() && !n.contains('/'));
        if !ok {
            return Err(EvalError::InvalidConfig(format!(
                "repo must be owner/name, got {:?}",
                self.repo
            )));
        }
        let mut seen = Vec::new();
        for p in &self.predictors {
            let id = p.id.trim();
            if id.is_empty() {
                return Err(EvalError::InvalidConfig("predictor id is required".to_string()));
            }
            if seen.iter().any(|s: &String| s.eq_ignore_ascii_case(id)) {
                return Err(EvalError::InvalidConfig(format!("duplicate predictor id: {id}")));
            }
            seen.push(id.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve() {
        let r = EvalDefaults::default().resolve().expect("resolve");
        assert!(r.strict_streaming_eval);
        assert_eq!(r.cutoff_policy, CutoffPolicy::CreatedAt);
        assert_eq!(r.truth_window_seconds(), 3600);
        assert_eq!(r.truth_policy_ids, vec![FIRST_RESPONSE_V1, FIRST_APPROVAL_V1]);
        assert_eq!(r.truth_primary_policy, FIRST_APPROVAL_V1);
        assert_eq!(r.hit_ks, vec![1, 3, 5]);
        assert_eq!(r.predictor_timeout, std::time::Duration::from_secs(60));
    }

    #[test]
    fn legacy_window_is_used_when_primary_window_unset() {
        let d = EvalDefaults {
            truth_window_seconds: 0,
            intent_truth_window_seconds: 7200,
            ..EvalDefaults::default()
        };
        assert_eq!(d.resolve().unwrap().truth_window_seconds(), 7200);
    }

    #[test]
    fn empty_policy_list_falls_back_by_behavior() {
        let d = EvalDefaults {
            truth_policies: vec!["  ".to_string()],
            truth_primary_policy: String::new(),
            ..EvalDefaults::default()
        };
        let r = d.resolve().unwrap();
        assert_eq!(r.truth_policy_ids, vec![FIRST_RESPONSE_V1]);
        assert_eq!(r.truth_primary_policy, FIRST_RESPONSE_V1);

        let d = EvalDefaults {
            truth_policies: vec![],
            behavior_truth_policy: "other".to_string(),
            intent_truth_from_review_requests: true,
            ..EvalDefaults::default()
        };
        assert_eq!(d.resolve().unwrap().truth_policy_ids, vec![FIRST_APPROVAL_V1]);
    }

    #[test]
    fn policy_ids_are_trimmed_and_deduplicated() {
        let d = EvalDefaults {
            truth_policies: vec![
                " first_response_v1".to_string(),
                "first_response_v1".to_string(),
                "merger_v1".to_string(),
            ],
            ..EvalDefaults::default()
        };
        assert_eq!(
            d.resolve().unwrap().truth_policy_ids,
            vec![FIRST_RESPONSE_V1, "merger_v1"]
        );
    }

    #[test]
    fn hit_ks_sorted_and_deduplicated() {
        let d = EvalDefaults {
            hit_ks: vec![5, 1, 5, 3],
            ..EvalDefaults::default()
        };
        assert_eq!(d.resolve().unwrap().hit_ks, vec![1, 3, 5]);
    }

    #[test]
    fn malformed_cutoff_policy_fails_fast() {
        let d = EvalDefaults {
            cutoff_policy: "created_at+soon".to_string(),
            ..EvalDefaults::default()
        };
        assert!(matches!(d.resolve(), Err(EvalError::InvalidCutoffPolicy(_))));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: RunConfig = serde_json::from_str(
            r#"{"repo":"acme/widgets","defaults":{"top_k":3},"cohort":{"type":"explicit","pr_numbers":[1,2]}}"#,
        )
        .unwrap();
        assert_eq!(cfg.defaults.top_k, 3);
        assert_eq!(cfg.defaults.hit_ks, vec![1, 3, 5]);
        assert_eq!(cfg.cohort, CohortSource::Explicit { pr_numbers: vec![1, 2] });
        cfg.validate().unwrap();
    }

    #[test]
    fn duplicate_predictor_ids_rejected() {
        let mut cfg = RunConfig::new("acme/widgets");
        for id in ["Popularity", "popularity"] {
            cfg.predictors.push(PredictorSpec {
                id: id.to_string(),
                kind: "replay".to_string(),
                config_path: None,
            });
        }
        assert!(cfg.validate().is_err());
    }
}
