//! Structured lifecycle events for evaluation runs.
//!
//! A run is wrapped in a `RunSpan`; each stage boundary emits one `info!`
//! event with an `event` field so log pipelines can filter on it.

use tracing::{info, warn};

/// RAII guard that keeps a run-scoped span entered.
pub struct RunSpan {
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    pub fn enter(run_id: &str) -> Self {
        Self {
            _span: run_span(run_id).entered(),
        }
    }
}

/// The run-scoped span, for instrumenting futures that cross `.await`.
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("routing_eval.run", run_id = %run_id)
}

pub fn emit_run_started(run_id: &str, repo: &str, predictors: usize) {
    info!(event = "run.started", run_id = %run_id, repo = %repo, predictors);
}

pub fn emit_run_prepared(run_id: &str, items: usize, policies: &[String], cutoff_source: &str) {
    info!(
        event = "run.prepared",
        run_id = %run_id,
        items,
        policies = %policies.join(","),
        cutoff_source = %cutoff_source,
    );
}

pub fn emit_item_evaluated(run_id: &str, pr_number: u64, truth_status: &str, predictors_ok: usize) {
    info!(
        event = "item.evaluated",
        run_id = %run_id,
        pr_number,
        truth_status = %truth_status,
        predictors_ok,
    );
}

/// A predictor failed or timed out for one item (warning level).
pub fn emit_predictor_failed(run_id: &str, pr_number: u64, predictor_id: &str, error: &str, timed_out: bool) {
    warn!(
        event = "predictor.failed",
        run_id = %run_id,
        pr_number,
        predictor = %predictor_id,
        error = %error,
        timed_out,
    );
}

pub fn emit_gates_evaluated(run_id: &str, all_pass: bool, failed: &[String]) {
    info!(
        event = "gates.evaluated",
        run_id = %run_id,
        all_pass,
        failed = %failed.join(","),
    );
}

pub fn emit_run_finished(run_id: &str, duration_ms: u64, items: usize, success: bool) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms,
        items,
        success,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_span_enters() {
        let _span = RunSpan::enter("20240101T000000Z-abcdef012345");
        emit_run_started("r", "acme/widgets", 2);
        emit_predictor_failed("r", 3, "popularity", "boom", false);
    }
}
