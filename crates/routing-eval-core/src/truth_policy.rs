//! Truth policy catalog: built-in specs plus allow-listed plugins.
//!
//! A policy is a declarative, content-hashed description of how ground truth
//! is derived for one item. Plugins are registered at startup under a
//! namespaced source ref (`routing_eval.truth_plugins.<name>`) and may only be
//! loaded when that ref matches a configured allow-list prefix.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use regex::Regex;
use routing_history::ActivitySource;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::{FIRST_APPROVAL_V1, FIRST_RESPONSE_V1};
use crate::domain::digest::digest_of;
use crate::domain::{EvalError, PolicySource, Result, TruthStatus};

pub const MERGER_V1: &str = "merger_v1";
pub const HYBRID_OWNER_V1: &str = "hybrid_owner_v1";

const POLICY_ID_PATTERN: &str = "^[a-z0-9_]+$";
const DEFAULT_POLICY_VERSION: &str = "v1";
const DEFAULT_WINDOW_SECONDS: i64 = 3600;

// ---------------------------------------------------------------------------
// Spec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruthTargetKind {
    #[default]
    ActorSet,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruthSelector {
    /// Earliest eligible actor.
    #[default]
    First,
    /// Latest eligible actor.
    Last,
    /// Every distinct eligible actor, in candidate order.
    Union,
    /// First observed member of `fallback_chain`.
    PriorityChain,
}

/// Optional filter overrides. Unset fields fall back to the run defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruthFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_bots: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_author: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_states: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_types: Option<Vec<String>>,
}

/// Condition half of a status rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RuleCondition {
    TargetFound,
    CoverageComplete,
    PolicyNotReady,
    /// `<label>_branch`: a priority-chain member with this label was observed.
    Branch(String),
    Default,
}

const BRANCH_SUFFIX: &str = "_branch";

impl FromStr for RuleCondition {
    type Err = EvalError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "target_found" => Ok(Self::TargetFound),
            "coverage_complete" => Ok(Self::CoverageComplete),
            "policy_not_ready" => Ok(Self::PolicyNotReady),
            "default" => Ok(Self::Default),
            other => match other.strip_suffix(BRANCH_SUFFIX) {
                Some(label) if !label.is_empty() => Ok(Self::Branch(label.to_string())),
                _ => Err(EvalError::InvalidTruthPolicy(format!(
                    "unknown status rule condition: {other}"
                ))),
            },
        }
    }
}

impl fmt::Display for RuleCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TargetFound => f.write_str("target_found"),
            Self::CoverageComplete => f.write_str("coverage_complete"),
            Self::PolicyNotReady => f.write_str("policy_not_ready"),
            Self::Branch(label) => write!(f, "{label}{BRANCH_SUFFIX}"),
            Self::Default => f.write_str("default"),
        }
    }
}

impl Serialize for RuleCondition {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RuleCondition {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRule {
    #[serde(rename = "if")]
    pub condition: RuleCondition,
    pub status: TruthStatus,
}

impl StatusRule {
    pub fn new(condition: RuleCondition, status: TruthStatus) -> Self {
        Self { condition, status }
    }
}

fn default_version() -> String {
    DEFAULT_POLICY_VERSION.to_string()
}

fn default_window_seconds() -> i64 {
    DEFAULT_WINDOW_SECONDS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TruthPolicySpec {
    pub id: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub target_kind: TruthTargetKind,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: i64,
    #[serde(default)]
    pub sources: Vec<ActivitySource>,
    #[serde(default)]
    pub filters: TruthFilters,
    #[serde(default)]
    pub selector: TruthSelector,
    #[serde(default)]
    pub status_rules: Vec<StatusRule>,
    #[serde(default)]
    pub fallback_chain: Vec<String>,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl TruthPolicySpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: default_version(),
            target_kind: TruthTargetKind::ActorSet,
            window_seconds: DEFAULT_WINDOW_SECONDS,
            sources: Vec::new(),
            filters: TruthFilters::default(),
            selector: TruthSelector::First,
            status_rules: Vec::new(),
            fallback_chain: Vec::new(),
            params: Map::new(),
        }
    }

    /// Trim the id and check the invariants. Returns the normalised spec.
    pub fn validated(mut self) -> Result<Self> {
        self.id = self.id.trim().to_string();
        if self.id.is_empty() {
            return Err(EvalError::InvalidTruthPolicy("policy id is required".to_string()));
        }
        let pattern = Regex::new(POLICY_ID_PATTERN)
            .map_err(|e| EvalError::InvalidTruthPolicy(e.to_string()))?;
        if !pattern.is_match(&self.id) {
            return Err(EvalError::InvalidTruthPolicy(format!(
                "policy id must match [a-z0-9_]+: {:?}",
                self.id
            )));
        }
        if self.window_seconds <= 0 {
            return Err(EvalError::InvalidTruthPolicy(format!(
                "{}: window_seconds must be > 0",
                self.id
            )));
        }
        if self.selector == TruthSelector::PriorityChain && self.fallback_chain.is_empty() {
            return Err(EvalError::InvalidTruthPolicy(format!(
                "{}: priority_chain requires a fallback_chain",
                self.id
            )));
        }
        Ok(self)
    }

    /// SHA-256 of the canonical JSON encoding of the full spec.
    pub fn stable_hash(&self) -> Result<String> {
        digest_of(self)
    }

    /// Branch label for a chain member: `params.branches[member]`, else the id.
    pub fn branch_label(&self, member_id: &str) -> String {
        self.params
            .get("branches")
            .and_then(|b| b.get(member_id))
            .and_then(Value::as_str)
            .map_or_else(|| member_id.to_string(), str::to_string)
    }
}

// ---------------------------------------------------------------------------
// Built-ins
// ---------------------------------------------------------------------------

fn branch(label: &str) -> RuleCondition {
    RuleCondition::Branch(label.to_string())
}

fn coverage_rules() -> Vec<StatusRule> {
    vec![
        StatusRule::new(RuleCondition::TargetFound, TruthStatus::Observed),
        StatusRule::new(RuleCondition::CoverageComplete, TruthStatus::NoPostCutoffResponse),
        StatusRule::new(RuleCondition::Default, TruthStatus::UnknownDueToIngestionGap),
    ]
}

/// The built-in catalog, keyed by id.
pub fn builtin_truth_policy_specs() -> BTreeMap<String, TruthPolicySpec> {
    let first_response = TruthPolicySpec {
        sources: vec![ActivitySource::Reviews, ActivitySource::ReviewComments],
        filters: TruthFilters {
            exclude_bots: Some(true),
            exclude_author: Some(true),
            ..TruthFilters::default()
        },
        status_rules: coverage_rules(),
        ..TruthPolicySpec::new(FIRST_RESPONSE_V1)
    };

    let first_approval = TruthPolicySpec {
        sources: vec![ActivitySource::Reviews],
        filters: TruthFilters {
            exclude_bots: Some(true),
            exclude_author: Some(true),
            review_states: Some(vec!["APPROVED".to_string()]),
            ..TruthFilters::default()
        },
        status_rules: coverage_rules(),
        ..TruthPolicySpec::new(FIRST_APPROVAL_V1)
    };

    let merger = TruthPolicySpec {
        window_seconds: 48 * 3600,
        sources: vec![ActivitySource::Events],
        filters: TruthFilters {
            event_types: Some(vec!["pull_request.merged".to_string()]),
            ..TruthFilters::default()
        },
        status_rules: vec![
            StatusRule::new(RuleCondition::TargetFound, TruthStatus::Observed),
            StatusRule::new(RuleCondition::PolicyNotReady, TruthStatus::PolicyUnavailable),
            StatusRule::new(RuleCondition::Default, TruthStatus::NoPostCutoffResponse),
        ],
        ..TruthPolicySpec::new(MERGER_V1)
    };

    let mut branches = Map::new();
    branches.insert(FIRST_APPROVAL_V1.to_string(), Value::from("approval"));
    branches.insert(MERGER_V1.to_string(), Value::from("merger"));
    branches.insert(FIRST_RESPONSE_V1.to_string(), Value::from("request"));
    let mut params = Map::new();
    params.insert("branches".to_string(), Value::Object(branches));

    let hybrid = TruthPolicySpec {
        window_seconds: 48 * 3600,
        sources: vec![
            ActivitySource::Reviews,
            ActivitySource::Events,
            ActivitySource::ReviewRequests,
        ],
        filters: TruthFilters {
            exclude_bots: Some(true),
            exclude_author: Some(true),
            ..TruthFilters::default()
        },
        selector: TruthSelector::PriorityChain,
        status_rules: vec![
            StatusRule::new(branch("approval"), TruthStatus::Observed),
            StatusRule::new(branch("merger"), TruthStatus::Observed),
            StatusRule::new(branch("request"), TruthStatus::Observed),
            StatusRule::new(RuleCondition::CoverageComplete, TruthStatus::NoPostCutoffResponse),
            StatusRule::new(RuleCondition::Default, TruthStatus::UnknownDueToIngestionGap),
        ],
        fallback_chain: vec![
            FIRST_APPROVAL_V1.to_string(),
            MERGER_V1.to_string(),
            FIRST_RESPONSE_V1.to_string(),
        ],
        params,
        ..TruthPolicySpec::new(HYBRID_OWNER_V1)
    };

    [first_response, first_approval, merger, hybrid]
        .into_iter()
        .map(|s| (s.id.clone(), s))
        .collect()
}

// ---------------------------------------------------------------------------
// Plugins
// ---------------------------------------------------------------------------

pub type PolicyFactory = Box<dyn Fn() -> Result<TruthPolicySpec> + Send + Sync>;

/// Startup-populated map from plugin source ref to spec factory.
#[derive(Default)]
pub struct PluginRegistry {
    factories: BTreeMap<String, PolicyFactory>,
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("source_refs", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, source_ref: impl Into<String>, factory: F)
    where
        F: Fn() -> Result<TruthPolicySpec> + Send + Sync + 'static,
    {
        self.factories.insert(source_ref.into(), Box::new(factory));
    }

    pub fn register_spec(&mut self, source_ref: impl Into<String>, spec: TruthPolicySpec) {
        self.register(source_ref, move || Ok(spec.clone()));
    }

    /// Register a JSON spec file. The file is parsed now, not at load time.
    pub fn register_json_file(&mut self, source_ref: impl Into<String>, path: &Path) -> Result<()> {
        let raw = std::fs::read(path)?;
        let spec: TruthPolicySpec = serde_json::from_slice(&raw)?;
        self.register_spec(source_ref, spec.validated()?);
        Ok(())
    }

    pub fn contains(&self, source_ref: &str) -> bool {
        self.factories.contains_key(source_ref)
    }

    /// Instantiate a plugin after checking the allow-list.
    pub fn load(&self, source_ref: &str, allowlist: &[String]) -> Result<TruthPolicySpec> {
        let allowed = allowlist.iter().any(|prefix| source_ref.starts_with(prefix.as_str()));
        if !allowed {
            return Err(EvalError::PluginNotAllowed {
                source_ref: source_ref.to_string(),
            });
        }
        let factory = self
            .factories
            .get(source_ref)
            .ok_or_else(|| EvalError::PluginNotRegistered {
                source_ref: source_ref.to_string(),
            })?;
        factory()?.validated()
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// A spec bound to its origin and content hash.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTruthPolicy {
    pub spec: TruthPolicySpec,
    pub source: PolicySource,
    pub source_ref: String,
    pub policy_hash: String,
}

impl ResolvedTruthPolicy {
    pub fn new(spec: TruthPolicySpec, source: PolicySource, source_ref: impl Into<String>) -> Result<Self> {
        let policy_hash = spec.stable_hash()?;
        Ok(Self {
            spec,
            source,
            source_ref: source_ref.into(),
            policy_hash,
        })
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    /// Same policy with its window replaced; the hash is recomputed.
    pub fn with_window(&self, window_seconds: i64) -> Result<Self> {
        let mut spec = self.spec.clone();
        spec.window_seconds = window_seconds;
        let spec = spec.validated()?;
        Self::new(spec, self.source, self.source_ref.clone())
    }
}

/// Active policies in request order plus the full catalog for chain lookups.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPolicies {
    pub active: Vec<ResolvedTruthPolicy>,
    pub catalog: BTreeMap<String, ResolvedTruthPolicy>,
}

impl ResolvedPolicies {
    pub fn ids(&self) -> Vec<String> {
        self.active.iter().map(|p| p.spec.id.clone()).collect()
    }

    pub fn get(&self, id: &str) -> Option<&ResolvedTruthPolicy> {
        self.active.iter().find(|p| p.spec.id == id)
    }

    /// Override every active policy's window and recompute its hash.
    pub fn with_window(&self, window_seconds: i64) -> Result<Self> {
        let active = self
            .active
            .iter()
            .map(|p| p.with_window(window_seconds))
            .collect::<Result<Vec<_>>>()?;
        let mut catalog = self.catalog.clone();
        for p in &active {
            catalog.insert(p.spec.id.clone(), p.clone());
        }
        Ok(Self { active, catalog })
    }

    pub fn policy_hashes(&self) -> BTreeMap<String, String> {
        self.active
            .iter()
            .map(|p| (p.spec.id.clone(), p.policy_hash.clone()))
            .collect()
    }
}

fn sorted_case_insensitive(ids: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = ids.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
    out.sort_by(|a, b| a.to_lowercase().cmp(&b.to_lowercase()).then_with(|| a.cmp(b)));
    out
}

/// Build the catalog and pick the requested policies.
///
/// An empty request resolves to `first_response_v1`.
pub fn resolve_truth_policies(
    policy_ids: &[String],
    plugin_refs: &[String],
    allowlist: &[String],
    registry: &PluginRegistry,
) -> Result<ResolvedPolicies> {
    let mut catalog: BTreeMap<String, ResolvedTruthPolicy> = BTreeMap::new();
    for (id, spec) in builtin_truth_policy_specs() {
        let resolved = ResolvedTruthPolicy::new(spec, PolicySource::Builtin, id.clone())?;
        catalog.insert(id, resolved);
    }

    let mut plugin_ids: BTreeSet<String> = BTreeSet::new();
    for source_ref in plugin_refs.iter().map(|r| r.trim()).filter(|r| !r.is_empty()) {
        let spec = registry.load(source_ref, allowlist)?;
        if !plugin_ids.insert(spec.id.clone()) {
            return Err(EvalError::DuplicatePluginPolicy(spec.id));
        }
        if catalog.contains_key(&spec.id) {
            return Err(EvalError::PluginCollidesWithBuiltin(spec.id));
        }
        let resolved = ResolvedTruthPolicy::new(spec, PolicySource::Plugin, source_ref)?;
        catalog.insert(resolved.spec.id.clone(), resolved);
    }

    let mut requested: Vec<String> = Vec::new();
    for id in policy_ids.iter().map(|p| p.trim()).filter(|p| !p.is_empty()) {
        if !requested.iter().any(|r| r == id) {
            requested.push(id.to_string());
        }
    }
    if requested.is_empty() {
        requested.push(FIRST_RESPONSE_V1.to_string());
    }

    let missing: Vec<String> = requested
        .iter()
        .filter(|id| !catalog.contains_key(*id))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(EvalError::UnknownTruthPolicy {
            ids: sorted_case_insensitive(missing),
        });
    }

    let active: Vec<ResolvedTruthPolicy> = requested
        .iter()
        .filter_map(|id| catalog.get(id).cloned())
        .collect();

    for policy in &active {
        let unknown: Vec<String> = policy
            .spec
            .fallback_chain
            .iter()
            .filter(|m| !catalog.contains_key(*m))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(EvalError::InvalidTruthPolicy(format!(
                "{}: fallback_chain references unknown policies: {}",
                policy.spec.id,
                sorted_case_insensitive(unknown).join(", ")
            )));
        }
    }

    Ok(ResolvedPolicies { active, catalog })
}
