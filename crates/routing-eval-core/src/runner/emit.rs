//! Emit stage: persist the run documents, then summarize them.

use tracing::info;

use crate::artifacts::{write_json, write_text, RunDir};
use crate::cohort::write_cohort;
use crate::domain::Result;
use crate::report::EvalReport;
use crate::reporting::render_report_md;
use crate::run_summary::{build_run_summary, write_run_summary, RunSummary};
use crate::runner::prepare::PreparedRun;

/// Write `report.json` and `report.md`.
pub fn write_report(run_dir: &RunDir, report: &EvalReport) -> Result<String> {
    let sha = write_json(&run_dir.report_json(), report)?;
    write_text(&run_dir.report_md(), &render_report_md(report))?;
    Ok(sha)
}

/// Write every run document and the run summary derived from them.
pub fn emit_artifacts(prepared: &PreparedRun, report: &EvalReport) -> Result<RunSummary> {
    let run_dir = &prepared.run_dir;
    let report_sha = write_report(run_dir, report)?;
    let manifest_sha = write_json(&run_dir.manifest(), &prepared.manifest)?;
    let cohort_sha = write_cohort(&run_dir.cohort(), &prepared.cohort)?;

    let summary = build_run_summary(&prepared.repo, &prepared.run_id, run_dir)?;
    write_run_summary(run_dir, &summary)?;
    info!(
        run_id = %prepared.run_id,
        report_sha = %report_sha,
        manifest_sha = %manifest_sha,
        cohort_sha = %cohort_sha,
        "artifacts written"
    );
    Ok(summary)
}
