//! Process-wide evaluation counters.
//!
//! Incremented at the call site; [`Metrics::flush`] emits all values as one
//! `info!` event at the end of a run.

use std::sync::atomic::{AtomicU64, Ordering};

pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    items_evaluated: AtomicU64,
    predictor_invocations: AtomicU64,
    predictor_failures: AtomicU64,
    predictor_timeouts: AtomicU64,
    records_appended: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub items_evaluated: u64,
    pub predictor_invocations: u64,
    pub predictor_failures: u64,
    pub predictor_timeouts: u64,
    pub records_appended: u64,
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            items_evaluated: AtomicU64::new(0),
            predictor_invocations: AtomicU64::new(0),
            predictor_failures: AtomicU64::new(0),
            predictor_timeouts: AtomicU64::new(0),
            records_appended: AtomicU64::new(0),
        }
    }

    fn bump(counter: &AtomicU64, name: &'static str) {
        counter.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = name, "counter incremented");
    }

    pub fn inc_items_evaluated(&self) {
        Self::bump(&self.items_evaluated, "items_evaluated");
    }

    pub fn inc_predictor_invocations(&self) {
        Self::bump(&self.predictor_invocations, "predictor_invocations");
    }

    pub fn inc_predictor_failures(&self) {
        Self::bump(&self.predictor_failures, "predictor_failures");
    }

    pub fn inc_predictor_timeouts(&self) {
        Self::bump(&self.predictor_timeouts, "predictor_timeouts");
    }

    pub fn inc_records_appended(&self) {
        Self::bump(&self.records_appended, "records_appended");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            items_evaluated: self.items_evaluated.load(Ordering::Relaxed),
            predictor_invocations: self.predictor_invocations.load(Ordering::Relaxed),
            predictor_failures: self.predictor_failures.load(Ordering::Relaxed),
            predictor_timeouts: self.predictor_timeouts.load(Ordering::Relaxed),
            records_appended: self.records_appended.load(Ordering::Relaxed),
        }
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        let s = self.snapshot();
        tracing::info!(
            metric = "flush",
            items_evaluated = s.items_evaluated,
            predictor_invocations = s.predictor_invocations,
            predictor_failures = s.predictor_failures,
            predictor_timeouts = s.predictor_timeouts,
            records_appended = s.records_appended,
        );
    }

    /// Reset all counters to zero (tests).
    pub fn reset(&self) {
        for c in [
            &self.items_evaluated,
            &self.predictor_invocations,
            &self.predictor_failures,
            &self.predictor_timeouts,
            &self.records_appended,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }
}
