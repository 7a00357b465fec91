//! Routing-Eval - offline backtesting for reviewer-routing predictors
//!
//! The `routing-eval` command drives the evaluation harness over a repository
//! history stored under the data directory.
//!
//! ## Commands
//!
//! - `sample` / `cohort` / `cutoff`: choose items and pin their cutoffs
//! - `run`: evaluate predictors over a cohort and write run artifacts
//! - `list` / `show` / `explain` / `diff`: inspect finished runs
//! - `summarize` / `compare`: digests for downstream automation
//! - `gate`: enforce quality gates and promotion with exit codes

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use routing_eval_core::cohort::{sample_pr_numbers, validate_hashed, COHORT_KIND};
use routing_eval_core::cutoff::cutoff_for_pr;
use routing_eval_core::run_summary::write_run_summary;
use routing_eval_core::{
    create_cohort, diff_runs, enforce_gates, enforce_promotion, explain, list_runs,
    load_or_build_run_summary, read_cohort, reaggregate, run_evaluation, show,
    write_cohort, write_compare_summary, CohortFilters, CohortSource, CutoffPolicy, EvalContext,
    ExecutionMode, ExplainSelection, GateEnforcement, PromotionCriteria, PromotionEvaluation,
    QualityGates, RunConfig, RunDir,
};
use routing_history::{FileHistoryStore, HistoryStore, PrNumber};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "routing-eval")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Leakage-safe backtesting for reviewer-routing predictors", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Root directory holding repository histories and run artifacts
    #[arg(long, global = true, env = "ROUTING_EVAL_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Item selection shared by `sample` and `cohort create`.
#[derive(Args, Debug, Clone, Default)]
struct SampleArgs {
    /// Explicit PR numbers (repeatable); bypasses the created-at window
    #[arg(long = "pr")]
    prs: Vec<PrNumber>,

    /// Inclusive lower bound on PR creation time (RFC 3339)
    #[arg(long)]
    start_at: Option<DateTime<Utc>>,

    /// Exclusive upper bound on PR creation time (RFC 3339)
    #[arg(long)]
    end_at: Option<DateTime<Utc>>,

    /// Maximum number of PRs to keep
    #[arg(long)]
    limit: Option<usize>,

    /// Seed for deterministic sampling when a limit is set
    #[arg(long)]
    seed: Option<u64>,
}

impl SampleArgs {
    fn filters(&self) -> CohortFilters {
        CohortFilters {
            start_at: self.start_at,
            end_at: self.end_at,
            limit: self.limit,
            seed: self.seed,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List the PR numbers a cohort window would select
    Sample {
        #[arg(long)]
        repo: String,

        #[command(flatten)]
        selection: SampleArgs,
    },

    /// Create or validate cohort documents
    Cohort {
        #[command(subcommand)]
        action: CohortAction,
    },

    /// Compute the cutoff of one PR under a cutoff policy
    Cutoff {
        #[arg(long)]
        repo: String,

        #[arg(long)]
        pr: PrNumber,

        /// `created_at`, `created_at+<delta>` or `ready_for_review`
        #[arg(long, default_value = "created_at")]
        policy: String,
    },

    /// Run an evaluation
    Run {
        /// Run configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Override the configured run id
        #[arg(long)]
        run_id: Option<String>,

        /// Evaluate the items and cutoffs pinned by this cohort file
        #[arg(long, conflicts_with = "prs")]
        cohort: Option<PathBuf>,

        /// Evaluate exactly these PR numbers (repeatable)
        #[arg(long = "pr")]
        prs: Vec<PrNumber>,

        /// Invoke predictors concurrently for each item
        #[arg(long)]
        parallel: bool,

        /// Maximum concurrent predictor invocations per item
        #[arg(long, requires = "parallel")]
        max_workers: Option<usize>,

        /// Record stale cutoffs as notes instead of aborting
        #[arg(long)]
        non_strict: bool,
    },

    /// List runs for a repository
    List {
        #[arg(long)]
        repo: String,
    },

    /// Print a run's report
    Show {
        #[arg(long)]
        repo: String,

        run_id: String,
    },

    /// Explain one item of a run
    Explain {
        #[arg(long)]
        repo: String,

        run_id: String,

        #[arg(long)]
        pr: PrNumber,

        /// Predictor to explain (default: first by name)
        #[arg(long)]
        predictor: Option<String>,

        /// Truth policy to explain (default: the run's primary policy)
        #[arg(long)]
        policy: Option<String>,
    },

    /// Diff metrics between two runs of the same cohort
    Diff {
        #[arg(long)]
        repo: String,

        run_a: String,

        run_b: String,

        /// Diff even when the runs used different cohorts
        #[arg(long)]
        force: bool,
    },

    /// Build (or rebuild) a run's summary and print it
    Summarize {
        #[arg(long)]
        repo: String,

        run_id: String,

        /// Recompute report.json from the record log first
        #[arg(long)]
        reaggregate: bool,
    },

    /// Compare a candidate run against a baseline run
    Compare {
        #[arg(long)]
        repo: String,

        baseline: String,

        candidate: String,
    },

    /// Enforce a run's quality gates (exit 0 pass, 1 failure, 2 undetermined)
    Gate {
        #[arg(long)]
        repo: String,

        run_id: String,

        /// Also require a promote decision
        #[arg(long)]
        require_promotion: bool,
    },
}

#[derive(Subcommand)]
enum CohortAction {
    /// Sample items, resolve cutoffs and write a hashed cohort file
    Create {
        #[arg(long)]
        repo: String,

        #[arg(short, long)]
        output: PathBuf,

        #[arg(long, default_value = "created_at")]
        cutoff_policy: String,

        #[command(flatten)]
        selection: SampleArgs,
    },

    /// Check a cohort file's kind and hash
    Validate { path: PathBuf },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    routing_eval_core::init_tracing(cli.json, level);

    let data_dir = cli.data_dir.as_path();
    match cli.command {
        Commands::Sample { repo, selection } => cmd_sample(data_dir, &repo, &selection).await,
        Commands::Cohort { action } => match action {
            CohortAction::Create {
                repo,
                output,
                cutoff_policy,
                selection,
            } => cmd_cohort_create(data_dir, &repo, &output, &cutoff_policy, &selection).await,
            CohortAction::Validate { path } => cmd_cohort_validate(&path),
        },
        Commands::Cutoff { repo, pr, policy } => cmd_cutoff(data_dir, &repo, pr, &policy).await,
        Commands::Run {
            config,
            run_id,
            cohort,
            prs,
            parallel,
            max_workers,
            non_strict,
        } => {
            let mut cfg = RunConfig::load(&config)
                .with_context(|| format!("Failed to load run config {:?}", config))?;
            apply_overrides(
                &mut cfg,
                RunOverrides {
                    run_id,
                    cohort,
                    prs,
                    parallel,
                    max_workers,
                    non_strict,
                },
            );
            cmd_run(data_dir, &cfg).await
        }
        Commands::List { repo } => cmd_list(data_dir, &repo),
        Commands::Show { repo, run_id } => cmd_show(data_dir, &repo, &run_id),
        Commands::Explain {
            repo,
            run_id,
            pr,
            predictor,
            policy,
        } => cmd_explain(
            data_dir,
            &repo,
            &run_id,
            pr,
            &ExplainSelection { predictor, policy },
        ),
        Commands::Diff {
            repo,
            run_a,
            run_b,
            force,
        } => cmd_diff(data_dir, &repo, &run_a, &run_b, force),
        Commands::Summarize {
            repo,
            run_id,
            reaggregate,
        } => cmd_summarize(data_dir, &repo, &run_id, reaggregate),
        Commands::Compare {
            repo,
            baseline,
            candidate,
        } => cmd_compare(data_dir, &repo, &baseline, &candidate),
        Commands::Gate {
            repo,
            run_id,
            require_promotion,
        } => cmd_gate(data_dir, &repo, &run_id, require_promotion),
    }
}

fn open_store(data_dir: &Path, repo: &str) -> Result<Arc<dyn HistoryStore>> {
    let store = FileHistoryStore::open(data_dir, repo)
        .with_context(|| format!("Failed to open history for {} under {:?}", repo, data_dir))?;
    Ok(Arc::new(store))
}

fn parse_policy(raw: &str) -> Result<CutoffPolicy> {
    raw.parse::<CutoffPolicy>()
        .with_context(|| format!("Invalid cutoff policy: {}", raw))
}

// ---------------------------------------------------------------------------
// Cohorts and cutoffs
// ---------------------------------------------------------------------------

async fn cmd_sample(data_dir: &Path, repo: &str, selection: &SampleArgs) -> Result<ExitCode> {
    let store = open_store(data_dir, repo)?;
    let prs = sample_pr_numbers(store.as_ref(), repo, &selection.prs, &selection.filters()).await?;
    for pr in &prs {
        println!("{}", pr);
    }
    info!(event = "cohort.sampled", repo, count = prs.len(), "sampled PRs");
    Ok(ExitCode::SUCCESS)
}

async fn cmd_cohort_create(
    data_dir: &Path,
    repo: &str,
    output: &Path,
    cutoff_policy: &str,
    selection: &SampleArgs,
) -> Result<ExitCode> {
    let policy = parse_policy(cutoff_policy)?;
    let store = open_store(data_dir, repo)?;
    let cohort = create_cohort(
        store.as_ref(),
        repo,
        &selection.prs,
        selection.filters(),
        &policy,
    )
    .await
    .context("Failed to create cohort")?;
    write_cohort(output, &cohort).with_context(|| format!("Failed to write {:?}", output))?;

    println!("Wrote cohort to {:?}", output);
    println!("PRs:  {}", cohort.pr_numbers.len());
    println!("Hash: {}", cohort.hash);
    Ok(ExitCode::SUCCESS)
}

fn cmd_cohort_validate(path: &Path) -> Result<ExitCode> {
    let raw = std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
    let value: Value = serde_json::from_slice(&raw).context("Cohort is not valid JSON")?;
    if let Err(e) = validate_hashed(&value, COHORT_KIND) {
        println!("invalid: {}", e);
        return Ok(ExitCode::FAILURE);
    }
    let cohort = read_cohort(path)?;
    println!(
        "ok {} ({} PRs, cutoff_policy {})",
        cohort.hash,
        cohort.pr_numbers.len(),
        cohort.cutoff_policy
    );
    Ok(ExitCode::SUCCESS)
}

async fn cmd_cutoff(data_dir: &Path, repo: &str, pr: PrNumber, policy: &str) -> Result<ExitCode> {
    let policy = parse_policy(policy)?;
    let store = open_store(data_dir, repo)?;
    let cutoff = cutoff_for_pr(store.as_ref(), repo, pr, &policy)
        .await
        .with_context(|| format!("Failed to resolve cutoff for PR {}", pr))?;
    println!("{}", cutoff.to_rfc3339_opts(chrono::SecondsFormat::Secs, true));
    Ok(ExitCode::SUCCESS)
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

/// Command-line values that take precedence over the config file.
#[derive(Debug, Default)]
struct RunOverrides {
    run_id: Option<String>,
    cohort: Option<PathBuf>,
    prs: Vec<PrNumber>,
    parallel: bool,
    max_workers: Option<usize>,
    non_strict: bool,
}

fn apply_overrides(cfg: &mut RunConfig, overrides: RunOverrides) {
    if let Some(run_id) = overrides.run_id {
        cfg.run_id = run_id;
    }
    if let Some(path) = overrides.cohort {
        cfg.cohort = CohortSource::File { path };
    } else if !overrides.prs.is_empty() {
        cfg.cohort = CohortSource::Explicit {
            pr_numbers: overrides.prs,
        };
    }
    if overrides.parallel {
        cfg.defaults.execution_mode = ExecutionMode::Parallel;
    }
    if overrides.max_workers.is_some() {
        cfg.defaults.max_workers = overrides.max_workers;
    }
    if overrides.non_strict {
        cfg.defaults.strict_streaming_eval = false;
    }
}

async fn cmd_run(data_dir: &Path, cfg: &RunConfig) -> Result<ExitCode> {
    let store = open_store(data_dir, &cfg.repo)?;
    let ctx = EvalContext::new(store, data_dir);
    let outcome = run_evaluation(&ctx, cfg).await.context("Evaluation failed")?;
    let report = &outcome.report;

    println!("Run:   {}", outcome.run_id);
    println!("Dir:   {:?}", outcome.run_dir.path());
    println!("PRs:   {}", report.pr_count);
    for predictor in &report.predictors {
        if let Some(summary) = report.routing_agreement.get(predictor) {
            println!(
                "  {:<20} n={:<5} mrr={}",
                predictor,
                summary.n,
                fmt_metric(summary.mrr)
            );
        }
    }
    let gates = &report.extra.quality_gates;
    if gates.all_pass {
        println!("Quality gates: pass");
    } else {
        println!("Quality gates: FAIL ({})", gates.failed_ids().join(", "));
    }
    for note in &report.notes {
        println!("Note: {}", note);
    }
    Ok(ExitCode::SUCCESS)
}

fn fmt_metric(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{:.4}", v))
}

fn cmd_list(data_dir: &Path, repo: &str) -> Result<ExitCode> {
    let runs = list_runs(data_dir, repo).with_context(|| format!("No runs for {}", repo))?;
    if runs.is_empty() {
        println!("No runs found for '{}'", repo);
    }
    for run_id in runs {
        println!("{}", run_id);
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_show(data_dir: &Path, repo: &str, run_id: &str) -> Result<ExitCode> {
    println!("{}", show(data_dir, repo, run_id)?);
    Ok(ExitCode::SUCCESS)
}

fn cmd_explain(
    data_dir: &Path,
    repo: &str,
    run_id: &str,
    pr: PrNumber,
    selection: &ExplainSelection,
) -> Result<ExitCode> {
    let text = explain(data_dir, repo, run_id, pr, selection)
        .with_context(|| format!("Failed to explain PR {} in run {}", pr, run_id))?;
    println!("{}", text);
    Ok(ExitCode::SUCCESS)
}

fn cmd_diff(data_dir: &Path, repo: &str, run_a: &str, run_b: &str, force: bool) -> Result<ExitCode> {
    let diff = diff_runs(data_dir, repo, run_a, run_b, force)?;
    println!("{}", diff.render());
    Ok(ExitCode::SUCCESS)
}

// ---------------------------------------------------------------------------
// Summaries and gates
// ---------------------------------------------------------------------------

fn cmd_summarize(data_dir: &Path, repo: &str, run_id: &str, rebuild: bool) -> Result<ExitCode> {
    let run_dir = RunDir::new(data_dir, repo, run_id);
    if !run_dir.exists() {
        bail!("Run not found: {:?}", run_dir.path());
    }
    let summary = if rebuild {
        reaggregate(data_dir, repo, run_id, &PromotionCriteria::default())?;
        load_or_build_run_summary(repo, run_id, &run_dir)?
    } else {
        let summary = routing_eval_core::build_run_summary(repo, run_id, &run_dir)?;
        write_run_summary(&run_dir, &summary)?;
        summary
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(ExitCode::SUCCESS)
}

fn cmd_compare(data_dir: &Path, repo: &str, baseline: &str, candidate: &str) -> Result<ExitCode> {
    let (path, summary) = write_compare_summary(data_dir, repo, baseline, candidate, Utc::now())
        .with_context(|| format!("Failed to compare {} against {}", candidate, baseline))?;

    println!("Compare: {}", summary.compare_id);
    println!("Wrote:   {:?}", path);
    for warning in &summary.compatibility.warnings {
        println!("Warning: {}", warning);
    }
    for delta in &summary.ranked_deltas {
        let mrr = delta.delta.get("mrr").copied().flatten();
        println!("  {:<20} Δmrr {}", delta.predictor_id, fmt_delta(mrr));
    }
    Ok(ExitCode::SUCCESS)
}

fn fmt_delta(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{:+.4}", v))
}

/// Gate decision over a parsed `report.json`. A missing or malformed block
/// counts as absent.
fn gate_enforcement(report: &Value, require_promotion: bool) -> GateEnforcement {
    let extra = report.get("extra");
    let gates: Option<QualityGates> = extra
        .and_then(|e| e.get("quality_gates"))
        .and_then(|v| serde_json::from_value(v.clone()).ok());
    if !require_promotion {
        return enforce_gates(gates.as_ref());
    }
    let promotion: Option<PromotionEvaluation> = extra
        .and_then(|e| e.get("promotion_evaluation"))
        .and_then(|v| serde_json::from_value(v.clone()).ok());
    enforce_promotion(gates.as_ref(), promotion.as_ref())
}

fn cmd_gate(data_dir: &Path, repo: &str, run_id: &str, require_promotion: bool) -> Result<ExitCode> {
    let run_dir = RunDir::new(data_dir, repo, run_id);
    let path = run_dir.report_json();
    let raw = std::fs::read(&path).with_context(|| format!("Failed to read {:?}", path))?;
    let report: Value = serde_json::from_slice(&raw).context("report.json is not valid JSON")?;

    let enforcement = gate_enforcement(&report, require_promotion);
    println!("{}", serde_json::to_string_pretty(&enforcement)?);
    let code = enforcement.outcome.exit_code();
    info!(event = "gates.enforced", repo, run_id, exit_code = code, "gate enforcement complete");
    Ok(ExitCode::from(code as u8))
}
