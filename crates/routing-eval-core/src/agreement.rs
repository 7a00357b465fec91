//! Routing-agreement metrics: hit@k and reciprocal rank.
//!
//! Per-item metrics are flattened on the wire as `hit_at_<k>` plus `mrr`, so
//! the configured `k` set drives the document shape. A predictor that failed
//! for an item carries null metrics and is left out of every mean.

use std::collections::BTreeMap;

use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::domain::route::RouteResult;
use crate::domain::truth::TruthStatus;

const HIT_PREFIX: &str = "hit_at_";

// ---------------------------------------------------------------------------
// Per-item metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemMetrics {
    pub hits: BTreeMap<usize, Option<f64>>,
    pub mrr: Option<f64>,
}

impl ItemMetrics {
    /// Null metrics for an unavailable predictor.
    pub fn unavailable(hit_ks: &[usize]) -> Self {
        Self {
            hits: hit_ks.iter().map(|k| (*k, None)).collect(),
            mrr: None,
        }
    }

    pub fn hit_at(&self, k: usize) -> Option<f64> {
        self.hits.get(&k).copied().flatten()
    }
}

/// Score one route result against truth targets.
///
/// Reciprocal rank is 0 when no target appears among the candidates,
/// otherwise `1/rank` of the best-ranked match.
pub fn item_metrics(result: Option<&RouteResult>, targets: &[String], hit_ks: &[usize]) -> ItemMetrics {
    let Some(result) = result else {
        return ItemMetrics::unavailable(hit_ks);
    };
    let rank = result.rank_of(targets);
    let hits = hit_ks
        .iter()
        .map(|k| {
            let hit = rank.is_some_and(|r| r <= *k);
            (*k, Some(if hit { 1.0 } else { 0.0 }))
        })
        .collect();
    ItemMetrics {
        hits,
        mrr: Some(rank.map_or(0.0, |r| 1.0 / r as f64)),
    }
}

impl Serialize for ItemMetrics {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.hits.len() + 1))?;
        for (k, v) in &self.hits {
            map.serialize_entry(&format!("{HIT_PREFIX}{k}"), v)?;
        }
        map.serialize_entry("mrr", &self.mrr)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for ItemMetrics {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, Option<f64>>::deserialize(deserializer)?;
        let mut out = ItemMetrics::default();
        for (key, value) in raw {
            if key == "mrr" {
                out.mrr = value;
            } else if let Some(k) = key.strip_prefix(HIT_PREFIX) {
                let k: usize = k.parse().map_err(D::Error::custom)?;
                out.hits.insert(k, value);
            }
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Summaries
// ---------------------------------------------------------------------------

/// Mean metrics over a set of items.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgreementSummary {
    /// Items with non-null metrics.
    pub n: usize,
    pub hits: BTreeMap<usize, Option<f64>>,
    pub mrr: Option<f64>,
}

impl AgreementSummary {
    pub fn hit_at(&self, k: usize) -> Option<f64> {
        self.hits.get(&k).copied().flatten()
    }
}

/// Order-independent mean: values are sorted before summation so that any
/// permutation of the input yields the same bits.
pub(crate) fn stable_mean(values: impl IntoIterator<Item = Option<f64>>) -> Option<f64> {
    let mut xs: Vec<f64> = values.into_iter().flatten().collect();
    if xs.is_empty() {
        return None;
    }
    xs.sort_by(|a, b| a.total_cmp(b));
    Some(xs.iter().sum::<f64>() / xs.len() as f64)
}

pub fn aggregate<'a>(rows: impl IntoIterator<Item = &'a ItemMetrics>, hit_ks: &[usize]) -> AgreementSummary {
    let rows: Vec<&ItemMetrics> = rows.into_iter().collect();
    let n = rows.iter().filter(|r| r.mrr.is_some()).count();
    let hits = hit_ks
        .iter()
        .map(|k| (*k, stable_mean(rows.iter().map(|r| r.hit_at(*k)))))
        .collect();
    AgreementSummary {
        n,
        hits,
        mrr: stable_mean(rows.iter().map(|r| r.mrr)),
    }
}

impl Serialize for AgreementSummary {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.hits.len() + 2))?;
        map.serialize_entry("n", &self.n)?;
        for (k, v) in &self.hits {
            map.serialize_entry(&format!("{HIT_PREFIX}{k}"), v)?;
        }
        map.serialize_entry("mrr", &self.mrr)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for AgreementSummary {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, serde_json::Value>::deserialize(deserializer)?;
        let mut out = AgreementSummary::default();
        for (key, value) in raw {
            if key == "n" {
                out.n = value.as_u64().unwrap_or(0) as usize;
            } else if key == "mrr" {
                out.mrr = value.as_f64();
            } else if let Some(k) = key.strip_prefix(HIT_PREFIX) {
                let k: usize = k.parse().map_err(D::Error::custom)?;
                out.hits.insert(k, value.as_f64());
            }
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Denominator slices
// ---------------------------------------------------------------------------

/// Named subsets of items used as metric denominators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenominatorSlice {
    All,
    KnownTruth,
    Observed,
    PredictorNonempty,
    ObservedAndPredictorNonempty,
}

impl DenominatorSlice {
    pub const ALL: [DenominatorSlice; 5] = [
        DenominatorSlice::All,
        DenominatorSlice::KnownTruth,
        DenominatorSlice::Observed,
        DenominatorSlice::PredictorNonempty,
        DenominatorSlice::ObservedAndPredictorNonempty,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::KnownTruth => "known_truth",
            Self::Observed => "observed",
            Self::PredictorNonempty => "predictor_nonempty",
            Self::ObservedAndPredictorNonempty => "observed_and_predictor_nonempty",
        }
    }

    pub fn admits(self, status: TruthStatus, predictor_nonempty: bool) -> bool {
        match self {
            Self::All => true,
            Self::KnownTruth => status.is_known(),
            Self::Observed => status == TruthStatus::Observed,
            Self::PredictorNonempty => predictor_nonempty,
            Self::ObservedAndPredictorNonempty => {
                status == TruthStatus::Observed && predictor_nonempty
            }
        }
    }
}
