//! Markdown rendering of `report.json`.

use crate::agreement::{AgreementSummary, DenominatorSlice};
use crate::report::EvalReport;

fn sorted_keys<'a, V>(map: &'a std::collections::BTreeMap<String, V>) -> Vec<&'a String> {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort_by(|a, b| a.to_lowercase().cmp(&b.to_lowercase()).then_with(|| a.cmp(b)));
    keys
}

fn push_summary(out: &mut String, prefix: &str, summary: &AgreementSummary) {
    out.push_str(&format!("- {prefix}.n: {}\n", summary.n));
    for (k, v) in &summary.hits {
        if let Some(v) = v {
            out.push_str(&format!("- {prefix}.hit@{k}: {v:.4}\n"));
        }
    }
    if let Some(mrr) = summary.mrr {
        out.push_str(&format!("- {prefix}.mrr: {mrr:.4}\n"));
    }
}

/// Render the human-readable report.
pub fn render_report_md(report: &EvalReport) -> String {
    let mut out = String::new();
    out.push_str("# Evaluation Report\n\n");
    out.push_str(&format!("- repo: {}\n", report.repo));
    out.push_str(&format!("- run_id: {}\n", report.run_id));
    out.push_str(&format!("- generated_at: {}\n", report.generated_at.to_rfc3339()));
    if let Some(at) = report.db_max_event_occurred_at {
        out.push_str(&format!("- db_max_event_occurred_at: {}\n", at.to_rfc3339()));
    }
    if let Some(at) = report.db_max_watermark_updated_at {
        out.push_str(&format!("- db_max_watermark_updated_at: {}\n", at.to_rfc3339()));
    }
    out.push_str(&format!("- pr_count: {}\n\n", report.pr_count));

    out.push_str("## Routing Agreement\n\n");
    for id in sorted_keys(&report.routing_agreement) {
        push_summary(&mut out, id, &report.routing_agreement[id]);
    }
    out.push('\n');

    let extra = &report.extra;
    if !extra.truth_coverage_counts.is_empty() {
        out.push_str("## Truth Coverage\n\n");
        out.push_str(&format!("- primary_policy: {}\n", extra.truth_primary_policy));
        for key in sorted_keys(&extra.truth_coverage_counts) {
            out.push_str(&format!("- {key}: {}\n", extra.truth_coverage_counts[key]));
        }
        out.push('\n');
    }

    if !extra.routing_agreement_by_policy.is_empty() {
        out.push_str("## Routing By Policy\n\n");
        for policy in sorted_keys(&extra.routing_agreement_by_policy) {
            out.push_str(&format!("- policy: {policy}\n"));
            let by_predictor = &extra.routing_agreement_by_policy[policy];
            for id in sorted_keys(by_predictor) {
                let s = &by_predictor[id];
                out.push_str(&format!("- {policy}.{id}.n: {}\n", s.n));
                if let Some(mrr) = s.mrr {
                    out.push_str(&format!("- {policy}.{id}.mrr: {mrr:.4}\n"));
                }
            }
        }
        out.push('\n');
    }

    if !extra.routing_denominators_by_policy.is_empty() {
        let canonical = DenominatorSlice::ObservedAndPredictorNonempty.as_str();
        out.push_str("## Denominator Slices\n\n");
        for policy in sorted_keys(&extra.routing_denominators_by_policy) {
            out.push_str(&format!("- policy: {policy}\n"));
            let by_predictor = &extra.routing_denominators_by_policy[policy];
            for id in sorted_keys(by_predictor) {
                let den = &by_predictor[id];
                let count = |slice: &str| den.get(slice).copied().unwrap_or(0);
                out.push_str(&format!("- {policy}.{id}.all: {}\n", count(DenominatorSlice::All.as_str())));
                out.push_str(&format!("- {policy}.{id}.{canonical}: {}\n", count(canonical)));
                let mrr = extra
                    .routing_agreement_slices_by_policy
                    .get(policy)
                    .and_then(|p| p.get(id))
                    .and_then(|s| s.get(canonical))
                    .and_then(|s| s.mrr);
                if let Some(mrr) = mrr {
                    out.push_str(&format!("- {policy}.{id}.{canonical}.mrr: {mrr:.4}\n"));
                }
            }
        }
        out.push('\n');
    }

    if !extra.queue.is_empty() {
        out.push_str("## Queue Metrics\n\n");
        for id in sorted_keys(&extra.queue) {
            let q = &extra.queue[id];
            out.push_str(&format!("- {id}.n: {}\n", q.n));
            for risk in sorted_keys(&q.by_risk) {
                let b = &q.by_risk[risk];
                out.push_str(&format!("- {id}.{risk}.n: {}\n", b.n));
                if let Some(v) = b.ttfr_seconds_mean {
                    out.push_str(&format!("- {id}.{risk}.ttfr_seconds_mean: {v:.2}\n"));
                }
                if let Some(v) = b.ttfc_seconds_mean {
                    out.push_str(&format!("- {id}.{risk}.ttfc_seconds_mean: {v:.2}\n"));
                }
            }
        }
        out.push('\n');
    }

    out.push_str("## Quality Gates\n\n");
    let gates = &extra.quality_gates;
    out.push_str(&format!("- profile: {}\n", gates.thresholds.profile));
    out.push_str(&format!("- all_pass: {}\n", gates.all_pass));
    for (id, gate) in &gates.gates {
        let verdict = if gate.pass { "pass" } else { "FAIL" };
        match (gate.value, gate.threshold()) {
            (Some(v), Some(t)) => out.push_str(&format!("- {id}: {verdict} (value={v:.4}, threshold={t:.4})\n")),
            _ => out.push_str(&format!("- {id}: {verdict}\n")),
        }
    }
    out.push('\n');

    out.push_str("## Promotion\n\n");
    let promo = &extra.promotion_evaluation;
    out.push_str(&format!("- eligible: {}\n", promo.eligible));
    if let Some(reason) = &promo.reason {
        out.push_str(&format!("- reason: {reason}\n"));
    }
    if let (Some(b), Some(c)) = (&promo.baseline, &promo.candidate) {
        out.push_str(&format!("- pair: {b} -> {c}\n"));
    }
    if let Some(n) = promo.n_observed_and_predictor_nonempty {
        out.push_str(&format!("- n: {n}\n"));
    }
    if let Some(d) = promo.delta_mrr {
        out.push_str(&format!("- delta_mrr: {d:.4}\n"));
    }
    if let Some([lo, hi]) = promo.delta_mrr_bootstrap_ci95 {
        out.push_str(&format!("- delta_mrr_ci95: [{lo:.4}, {hi:.4}]\n"));
    }
    if let Some(d) = promo.delta_hit_at_1 {
        out.push_str(&format!("- delta_hit@1: {d:.4}\n"));
    }
    out.push_str(&format!("- promote: {}\n", promo.promote));

    if !report.notes.is_empty() {
        out.push_str("\n## Notes\n\n");
        for note in &report.notes {
            out.push_str(&format!("- {note}\n"));
        }
    }
    out
}
