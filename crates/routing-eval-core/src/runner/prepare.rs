//! Prepare stage: resolve everything a run needs, or fail before any item.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use routing_history::{HistoryStore, IngestionWatermark, TruthCoverage};
use tracing::{debug, warn};

use crate::cohort::{create_cohort, read_cohort, Cohort, CohortFilters};
use crate::config::{CohortSource, ResolvedDefaults, RunConfig};
use crate::cutoff::{resolve_cutoffs, CutoffOrigin, ResolvedCutoffs};
use crate::artifacts::RunDir;
use crate::domain::{EvalError, Result};
use crate::manifest::{ManifestParts, PredictorEntry, RunManifest, TruthManifest};
use crate::obs;
use crate::predictor::{Predictor, PredictorRegistry};
use crate::promotion::PromotionCriteria;
use crate::run_id::{compute_run_id, config_hash};
use crate::truth::window_for;
use crate::truth_policy::{resolve_truth_policies, PluginRegistry, ResolvedPolicies};

/// Long-lived collaborators shared by every run.
pub struct EvalContext {
    pub store: Arc<dyn HistoryStore>,
    pub data_dir: PathBuf,
    pub predictors: PredictorRegistry,
    pub plugins: PluginRegistry,
    pub criteria: PromotionCriteria,
}

impl EvalContext {
    pub fn new(store: Arc<dyn HistoryStore>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            data_dir: data_dir.into(),
            predictors: PredictorRegistry::default(),
            plugins: PluginRegistry::new(),
            criteria: PromotionCriteria::default(),
        }
    }

    pub fn with_predictors(mut self, predictors: PredictorRegistry) -> Self {
        self.predictors = predictors;
        self
    }

    pub fn with_plugins(mut self, plugins: PluginRegistry) -> Self {
        self.plugins = plugins;
        self
    }

    pub fn with_criteria(mut self, criteria: PromotionCriteria) -> Self {
        self.criteria = criteria;
        self
    }
}

/// Everything resolved before the first item is evaluated.
pub struct PreparedRun {
    pub run_id: String,
    pub repo: String,
    pub generated_at: DateTime<Utc>,
    pub defaults: ResolvedDefaults,
    pub policies: ResolvedPolicies,
    pub predictors: Vec<Arc<dyn Predictor>>,
    pub predictor_ids: Vec<String>,
    pub cohort: Cohort,
    pub cutoffs: ResolvedCutoffs,
    pub watermark: IngestionWatermark,
    pub coverage: TruthCoverage,
    pub notes: Vec<String>,
    pub manifest: RunManifest,
    pub run_dir: RunDir,
}

impl PreparedRun {
    pub fn primary_policy(&self) -> &str {
        &self.defaults.truth_primary_policy
    }
}

/// The configured run id, or a fresh one derived from the config hash.
pub fn resolve_run_id(config: &RunConfig, now: DateTime<Utc>) -> Result<String> {
    let configured = config.run_id.trim();
    if configured.is_empty() {
        compute_run_id(config, now)
    } else {
        Ok(configured.to_string())
    }
}

pub(crate) fn iso(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Note describing items whose cutoff lies past the ingestion horizon.
pub fn stale_cutoff_note(watermark: Option<DateTime<Utc>>, cutoffs: &ResolvedCutoffs) -> Option<String> {
    let horizon = watermark?;
    let stale: Vec<String> = cutoffs
        .cutoffs
        .iter()
        .filter(|(_, cutoff)| **cutoff > horizon)
        .map(|(n, _)| n.to_string())
        .collect();
    if stale.is_empty() {
        return None;
    }
    Some(format!(
        "db_max_event_occurred_at={} is before cutoffs for PRs: [{}]",
        iso(horizon),
        stale.join(", ")
    ))
}

async fn resolve_cohort(
    store: &dyn HistoryStore,
    config: &RunConfig,
    defaults: &ResolvedDefaults,
) -> Result<(Cohort, ResolvedCutoffs)> {
    let repo = config.repo.as_str();
    let policy = &defaults.cutoff_policy;
    let cohort = match &config.cohort {
        CohortSource::File { path } => {
            let cohort = read_cohort(path)?;
            if cohort.repo != repo {
                return Err(EvalError::InvalidCohort(format!(
                    "cohort repo {} does not match run repo {repo}",
                    cohort.repo
                )));
            }
            let explicit = cohort.cutoff_map()?;
            let cutoffs = resolve_cutoffs(store, repo, &cohort.pr_numbers, policy, Some(&explicit)).await?;
            for (pr_number, cutoff) in &cutoffs.cutoffs {
                let created_at = store.pr_created_at(repo, *pr_number).await?;
                if *cutoff < created_at {
                    return Err(EvalError::CutoffBeforeCreation {
                        pr_number: *pr_number,
                        cutoff: iso(*cutoff),
                        created_at: iso(created_at),
                    });
                }
            }
            return Ok((cohort, cutoffs));
        }
        CohortSource::Explicit { pr_numbers } => {
            create_cohort(store, repo, pr_numbers, CohortFilters::default(), policy).await?
        }
        CohortSource::Window {
            start_at,
            end_at,
            limit,
            seed,
        } => {
            let filters = CohortFilters {
                start_at: *start_at,
                end_at: *end_at,
                limit: *limit,
                seed: *seed,
            };
            create_cohort(store, repo, &[], filters, policy).await?
        }
    };
    let cutoffs = ResolvedCutoffs {
        cutoffs: cohort.cutoff_map()?,
        origin: CutoffOrigin::Policy,
    };
    Ok((cohort, cutoffs))
}

/// Resolve configuration, policies, predictors, cohort and cutoffs.
///
/// Fails fast on any configuration inconsistency and, in strict mode, on
/// cutoffs past the ingestion horizon. Writes nothing.
pub async fn prepare_run(
    ctx: &EvalContext,
    config: &RunConfig,
    run_id: &str,
    now: DateTime<Utc>,
) -> Result<PreparedRun> {
    config.validate()?;
    let defaults = config.defaults.resolve()?;
    let store = ctx.store.as_ref();
    let run_dir = RunDir::new(&ctx.data_dir, &config.repo, run_id);
    if run_dir.exists() {
        return Err(EvalError::RunExists(run_dir.path().display().to_string()));
    }

    let policies = resolve_truth_policies(
        &defaults.truth_policy_ids,
        &defaults.truth_policy_plugins,
        &defaults.truth_policy_plugin_allowlist,
        &ctx.plugins,
    )?
    .with_window(defaults.truth_window_seconds())?;
    if policies.get(&defaults.truth_primary_policy).is_none() {
        return Err(EvalError::InactivePrimaryPolicy {
            primary: defaults.truth_primary_policy.clone(),
            active: policies.ids(),
        });
    }

    let predictors = ctx.predictors.build(&config.predictors)?;
    let predictor_ids: Vec<String> = predictors.iter().map(|p| p.id().to_string()).collect();
    let mut predictor_entries = Vec::with_capacity(config.predictors.len());
    for id in &predictor_ids {
        if let Some(spec) = config.predictors.iter().find(|s| &s.id == id) {
            predictor_entries.push(PredictorEntry::from_spec(spec)?);
        }
    }
    obs::emit_run_started(run_id, &config.repo, predictors.len());

    let (cohort, cutoffs) = resolve_cohort(store, config, &defaults).await?;
    if let Some(latest) = cutoffs.cutoffs.values().max() {
        for policy in &policies.active {
            window_for(&policy.spec, *latest)?;
        }
    }

    let watermark = store.ingestion_watermark(&config.repo).await?;
    let coverage = store.truth_coverage(&config.repo).await?;

    let mut notes = Vec::new();
    if let Some(note) = stale_cutoff_note(watermark.max_event_occurred_at, &cutoffs) {
        if defaults.strict_streaming_eval {
            return Err(EvalError::LeakageViolation { note });
        }
        warn!(run_id, %note, "stale cutoffs accepted in non-strict mode");
        notes.push(note);
    }

    let manifest = RunManifest::build(ManifestParts {
        config,
        config_hash: config_hash(config)?,
        run_id,
        generated_at: now,
        watermark: &watermark,
        cutoff_policy: defaults.cutoff_policy.to_string(),
        cutoffs: &cutoffs,
        cohort_hash: &cohort.hash,
        predictors: predictor_entries,
        truth: TruthManifest::new(
            &policies,
            &defaults.truth_primary_policy,
            defaults.truth_window_seconds(),
            defaults.truth_include_review_comments,
        ),
        top_k: defaults.top_k,
        hit_ks: &defaults.hit_ks,
        strict_streaming_eval: defaults.strict_streaming_eval,
        execution_mode: defaults.execution_mode,
    });

    let cutoff_source = match cutoffs.origin {
        CutoffOrigin::Policy => "policy",
        CutoffOrigin::Provided => "provided",
    };
    obs::emit_run_prepared(run_id, cutoffs.cutoffs.len(), &policies.ids(), cutoff_source);
    debug!(run_id, cohort_hash = %cohort.hash, "run prepared");

    Ok(PreparedRun {
        run_id: run_id.to_string(),
        repo: config.repo.clone(),
        generated_at: now,
        run_dir,
        defaults,
        policies,
        predictors,
        predictor_ids,
        cohort,
        cutoffs,
        watermark,
        coverage,
        notes,
        manifest,
    })
}
