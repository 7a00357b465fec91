//! Predictor seam: the routing algorithms under evaluation.
//!
//! Predictors are external collaborators. The harness hands each one the
//! same pre-built, point-in-time [`InputBundle`] and never lets them touch the
//! history store directly.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use routing_history::{PrNumber, PrSnapshot};
use serde::{Deserialize, Serialize};

use crate::config::PredictorSpec;
use crate::domain::digest::sha256_hex;
use crate::domain::{Candidate, EvalError, Result, RouteResult};

pub const REPLAY_KIND: &str = "replay";

/// Point-in-time inputs shared by every predictor for one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputBundle {
    pub repo: String,
    pub pr_number: PrNumber,
    pub cutoff: DateTime<Utc>,
    pub snapshot: PrSnapshot,
}

#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub repo: String,
    pub pr_number: PrNumber,
    pub cutoff: DateTime<Utc>,
    pub top_k: usize,
    pub inputs: Arc<InputBundle>,
}

#[async_trait]
pub trait Predictor: Send + Sync {
    fn id(&self) -> &str;

    async fn route(&self, request: &RouteRequest) -> anyhow::Result<RouteResult>;
}

/// Sort predictors by id, case-insensitively.
pub fn sort_predictors(predictors: &mut [Arc<dyn Predictor>]) {
    predictors.sort_by(|a, b| {
        a.id()
            .to_lowercase()
            .cmp(&b.id().to_lowercase())
            .then_with(|| a.id().cmp(b.id()))
    });
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub type PredictorFactory = Box<dyn Fn(&PredictorSpec) -> Result<Arc<dyn Predictor>> + Send + Sync>;

/// Maps predictor kinds to factories.
pub struct PredictorRegistry {
    factories: BTreeMap<String, PredictorFactory>,
}

impl fmt::Debug for PredictorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PredictorRegistry")
            .field("kinds", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for PredictorRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(REPLAY_KIND, |spec| {
            let path = spec
                .config_path
                .as_deref()
                .ok_or_else(|| EvalError::MissingPredictorConfig {
                    predictor_id: spec.id.clone(),
                })?;
            Ok(Arc::new(ReplayPredictor::load(&spec.id, path)?) as Arc<dyn Predictor>)
        });
        registry
    }
}

impl PredictorRegistry {
    /// Registry with no kinds at all.
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&PredictorSpec) -> Result<Arc<dyn Predictor>> + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Box::new(factory));
    }

    pub fn kinds(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Instantiate every spec, sorted by id.
    pub fn build(&self, specs: &[PredictorSpec]) -> Result<Vec<Arc<dyn Predictor>>> {
        let mut out = Vec::with_capacity(specs.len());
        for spec in specs {
            let factory = self
                .factories
                .get(spec.kind.trim())
                .ok_or_else(|| EvalError::UnknownPredictorKind(spec.kind.clone()))?;
            out.push(factory(spec)?);
        }
        sort_predictors(&mut out);
        Ok(out)
    }
}

/// Content hash of a predictor's config file, if it has one.
pub fn predictor_config_hash(spec: &PredictorSpec) -> Result<Option<String>> {
    match &spec.config_path {
        Some(path) => Ok(Some(sha256_hex(&std::fs::read(path)?))),
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
struct ReplayEntry {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    risk: Option<String>,
    #[serde(default)]
    confidence: Option<String>,
    #[serde(default)]
    notes: Vec<String>,
}

/// Replays recorded route results from a JSON map keyed by PR number.
#[derive(Debug, Clone)]
pub struct ReplayPredictor {
    id: String,
    path: PathBuf,
    entries: BTreeMap<PrNumber, ReplayEntry>,
}

impl ReplayPredictor {
    pub fn load(id: &str, path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)?;
        let by_key: BTreeMap<String, ReplayEntry> = serde_json::from_slice(&raw)?;
        let mut entries = BTreeMap::new();
        for (key, entry) in by_key {
            let number: PrNumber = key.trim().parse().map_err(|_| {
                EvalError::InvalidConfig(format!(
                    "{}: replay key is not a PR number: {key:?}",
                    path.display()
                ))
            })?;
            entries.insert(number, entry);
        }
        Ok(Self {
            id: id.to_string(),
            path: path.to_path_buf(),
            entries,
        })
    }
}

#[async_trait]
impl Predictor for ReplayPredictor {
    fn id(&self) -> &str {
        &self.id
    }

    async fn route(&self, request: &RouteRequest) -> anyhow::Result<RouteResult> {
        let entry = self
            .entries
            .get(&request.pr_number)
            .ok_or_else(|| anyhow!("no replay entry for PR {}", request.pr_number))
            .with_context(|| format!("replaying {}", self.path.display()))?;
        let mut result = RouteResult::empty(&request.repo, request.pr_number, request.cutoff, request.top_k);
        result.candidates = entry.candidates.iter().take(request.top_k).cloned().collect();
        result.risk = entry.risk.clone();
        result.confidence = entry.confidence.clone();
        result.notes = entry.notes.clone();
        Ok(result)
    }
}
