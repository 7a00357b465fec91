//! Cutoff resolution: one temporal anchor per item.
//!
//! Policies:
//! - `created_at`: item creation time
//! - `created_at+<N><unit>`: creation plus a fixed offset, unit in `s m h d`
//!   (a bare number is seconds)
//! - `ready_for_review`: first transition out of draft, else creation time
//!
//! An explicit map can replace the policy entirely; every requested item must
//! then be present.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use routing_history::{HistoryStore, PrNumber};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{EvalError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CutoffPolicy {
    CreatedAt,
    CreatedAtPlus(Duration),
    ReadyForReview,
}

const CREATED_AT_PLUS: &str = "created_at+";

fn parse_delta(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(EvalError::InvalidCutoffPolicy(
            "missing delta for created_at+...".to_string(),
        ));
    }
    let (digits, unit) = match raw.char_indices().last() {
        Some((i, c)) if matches!(c, 's' | 'm' | 'h' | 'd') => (&raw[..i], c),
        _ => (raw, 's'),
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(EvalError::InvalidCutoffPolicy(format!(
            "invalid created_at delta: {raw:?}"
        )));
    }
    let n: i64 = digits
        .parse()
        .map_err(|_| EvalError::InvalidCutoffPolicy(format!("created_at delta out of range: {raw:?}")))?;
    let delta = match unit {
        'm' => Duration::try_minutes(n),
        'h' => Duration::try_hours(n),
        'd' => Duration::try_days(n),
        _ => Duration::try_seconds(n),
    };
    delta.ok_or_else(|| EvalError::InvalidCutoffPolicy(format!("created_at delta out of range: {raw:?}")))
}

impl FromStr for CutoffPolicy {
    type Err = EvalError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s {
            "created_at" => Ok(Self::CreatedAt),
            "ready_for_review" => Ok(Self::ReadyForReview),
            _ => match s.strip_prefix(CREATED_AT_PLUS) {
                Some(raw) => Ok(Self::CreatedAtPlus(parse_delta(raw)?)),
                None => Err(EvalError::InvalidCutoffPolicy(format!(
                    "unsupported cutoff policy: {s}"
                ))),
            },
        }
    }
}

impl fmt::Display for CutoffPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreatedAt => f.write_str("created_at"),
            Self::ReadyForReview => f.write_str("ready_for_review"),
            Self::CreatedAtPlus(d) => write!(f, "{CREATED_AT_PLUS}{}s", d.num_seconds()),
        }
    }
}

/// How the cutoffs of a run were obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CutoffOrigin {
    Policy,
    Provided,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCutoffs {
    pub cutoffs: BTreeMap<PrNumber, DateTime<Utc>>,
    pub origin: CutoffOrigin,
}

impl ResolvedCutoffs {
    /// Items ordered by `(cutoff, pr_number)`.
    pub fn ordered(&self) -> Vec<(PrNumber, DateTime<Utc>)> {
        let mut out: Vec<(PrNumber, DateTime<Utc>)> =
            self.cutoffs.iter().map(|(n, c)| (*n, *c)).collect();
        out.sort_by(|a, b| (a.1, a.0).cmp(&(b.1, b.0)));
        out
    }
}

/// Resolve one item's cutoff under `policy`.
pub async fn cutoff_for_pr(
    store: &dyn HistoryStore,
    repo: &str,
    pr_number: PrNumber,
    policy: &CutoffPolicy,
) -> Result<DateTime<Utc>> {
    let created = store.pr_created_at(repo, pr_number).await?;
    let cutoff = match policy {
        CutoffPolicy::CreatedAt => created,
        CutoffPolicy::CreatedAtPlus(delta) => created.checked_add_signed(*delta).ok_or_else(|| {
            EvalError::InvalidCutoffPolicy(format!(
                "{policy}: cutoff for PR {pr_number} is out of range"
            ))
        })?,
        CutoffPolicy::ReadyForReview => store
            .ready_for_review_at(repo, pr_number)
            .await?
            .unwrap_or(created),
    };
    debug!(repo, pr_number, %policy, %cutoff, "resolved cutoff");
    Ok(cutoff)
}

/// Resolve cutoffs for all items, from an explicit map when given.
pub async fn resolve_cutoffs(
    store: &dyn HistoryStore,
    repo: &str,
    pr_numbers: &[PrNumber],
    policy: &CutoffPolicy,
    explicit: Option<&BTreeMap<PrNumber, DateTime<Utc>>>,
) -> Result<ResolvedCutoffs> {
    if let Some(map) = explicit {
        let missing: Vec<PrNumber> = pr_numbers
            .iter()
            .copied()
            .filter(|n| !map.contains_key(n))
            .collect();
        if !missing.is_empty() {
            return Err(EvalError::MissingCutoffs { missing });
        }
        let cutoffs = pr_numbers
            .iter()
            .filter_map(|n| map.get(n).map(|c| (*n, *c)))
            .collect();
        return Ok(ResolvedCutoffs {
            cutoffs,
            origin: CutoffOrigin::Provided,
        });
    }

    let mut cutoffs = BTreeMap::new();
    for pr_number in pr_numbers {
        cutoffs.insert(*pr_number, cutoff_for_pr(store, repo, *pr_number, policy).await?);
    }
    Ok(ResolvedCutoffs {
        cutoffs,
        origin: CutoffOrigin::Policy,
    })
}
