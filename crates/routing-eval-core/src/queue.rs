//! Queue latency: how long an item waited after its cutoff.
//!
//! Per item, `ttfr_seconds` is the delay to the first non-bot, non-author
//! review and `ttfc_seconds` the delay to the first such review comment
//! (measured only when enabled). The latencies come from the store and do not
//! depend on the predictor; each predictor's copy carries its own `risk`
//! label, which is what the aggregate buckets by.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use routing_history::{ActivityKind, ActivityQuery, ActivitySource, HistoryStore, PrNumber, TimeWindow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::agreement::stable_mean;
use crate::domain::{PerPrRecord, Result, RouteResult};

/// Bucket for predictors that report no risk.
pub const UNKNOWN_RISK: &str = "unknown";

/// Post-cutoff latencies of one item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueTimes {
    pub ttfr_seconds: Option<f64>,
    pub ttfc_seconds: Option<f64>,
}

/// Queue block stored on each successful predictor outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub ttfr_seconds: Option<f64>,
    pub ttfc_seconds: Option<f64>,
    #[serde(default)]
    pub risk: Option<String>,
}

impl QueueMetrics {
    pub fn new(times: QueueTimes, result: &RouteResult) -> Self {
        Self {
            ttfr_seconds: times.ttfr_seconds,
            ttfc_seconds: times.ttfc_seconds,
            risk: result.risk.clone(),
        }
    }

    /// Lower-cased risk label, `unknown` when absent.
    pub fn risk_bucket(&self) -> String {
        match self.risk.as_deref().map(str::trim) {
            Some(risk) if !risk.is_empty() => risk.to_lowercase(),
            _ => UNKNOWN_RISK.to_string(),
        }
    }
}

fn seconds_since(cutoff: DateTime<Utc>, at: DateTime<Utc>) -> f64 {
    (at - cutoff).num_milliseconds() as f64 / 1000.0
}

/// Measure queue latencies for one item from activity after `cutoff`.
pub async fn measure_queue(
    store: &dyn HistoryStore,
    repo: &str,
    pr_number: PrNumber,
    cutoff: DateTime<Utc>,
    include_ttfc: bool,
) -> Result<QueueTimes> {
    let mut sources = vec![ActivitySource::Reviews];
    if include_ttfc {
        sources.push(ActivitySource::ReviewComments);
    }
    let window = TimeWindow {
        start: cutoff,
        end: DateTime::<Utc>::MAX_UTC,
    };
    let scan = store
        .scan_activity(repo, pr_number, &ActivityQuery::new(window).with_sources(sources))
        .await?;

    let first = |kind: ActivityKind| {
        scan.rows
            .iter()
            .find(|row| row.kind == kind)
            .map(|row| seconds_since(cutoff, row.occurred_at))
    };
    let times = QueueTimes {
        ttfr_seconds: first(ActivityKind::ReviewSubmitted),
        ttfc_seconds: if include_ttfc {
            first(ActivityKind::ReviewComment)
        } else {
            None
        },
    };
    debug!(repo, pr_number, ttfr = ?times.ttfr_seconds, ttfc = ?times.ttfc_seconds, "queue measured");
    Ok(times)
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueBucket {
    pub n: usize,
    pub ttfr_seconds_mean: Option<f64>,
    pub ttfc_seconds_mean: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueSummary {
    pub n: usize,
    pub by_risk: BTreeMap<String, QueueBucket>,
}

/// Per-predictor queue summaries, bucketed by risk.
///
/// Only outcomes carrying a queue block count. Means are order-independent.
pub fn aggregate_queue(records: &[PerPrRecord], predictor_ids: &[String]) -> BTreeMap<String, QueueSummary> {
    let mut out = BTreeMap::new();
    for predictor in predictor_ids {
        let mut by_risk: BTreeMap<String, Vec<&QueueMetrics>> = BTreeMap::new();
        let mut n = 0;
        for queue in records
            .iter()
            .filter_map(|r| r.predictors.get(predictor)?.queue.as_ref())
        {
            n += 1;
            by_risk.entry(queue.risk_bucket()).or_default().push(queue);
        }
        let by_risk = by_risk
            .into_iter()
            .map(|(risk, rows)| {
                let bucket = QueueBucket {
                    n: rows.len(),
                    ttfr_seconds_mean: stable_mean(rows.iter().map(|q| q.ttfr_seconds)),
                    ttfc_seconds_mean: stable_mean(rows.iter().map(|q| q.ttfc_seconds)),
                };
                (risk, bucket)
            })
            .collect();
        out.insert(predictor.clone(), QueueSummary { n, by_risk });
    }
    out
}
