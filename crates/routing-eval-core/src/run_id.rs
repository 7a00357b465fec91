//! Deterministic run identifiers.

use chrono::{DateTime, Utc};

use crate::config::RunConfig;
use crate::domain::digest::digest_without_field;
use crate::domain::Result;

const SHORT_HASH_LEN: usize = 12;

/// Digest of the config with `run_id` stripped.
pub fn config_hash(cfg: &RunConfig) -> Result<String> {
    digest_without_field(&serde_json::to_value(cfg)?, "run_id")
}

/// `<UTC timestamp>-<first 12 hex chars of the config hash>`.
pub fn compute_run_id(cfg: &RunConfig, now: DateTime<Utc>) -> Result<String> {
    let digest = config_hash(cfg)?;
    Ok(format!(
        "{}-{}",
        now.format("%Y%m%dT%H%M%SZ"),
        &digest[..SHORT_HASH_LEN]
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn run_id_ignores_its_own_field() {
        let now = Utc.with_ymd_and_hms(2024, 3, 4, 5, 6, 7).unwrap();
        let mut cfg = RunConfig::new("acme/widgets");
        let a = compute_run_id(&cfg, now).unwrap();
        cfg.run_id = a.clone();
        let b = compute_run_id(&cfg, now).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("20240304T050607Z-"));
        assert_eq!(a.len(), "20240304T050607Z-".len() + 12);
    }

    #[test]
    fn hash_is_timestamp_independent_but_config_sensitive() {
        let cfg = RunConfig::new("acme/widgets");
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let a = compute_run_id(&cfg, t1).unwrap();
        let b = compute_run_id(&cfg, t2).unwrap();
        assert_eq!(a[17..], b[17..]);

        let mut other = cfg.clone();
        other.defaults.top_k = 9;
        assert_ne!(config_hash(&cfg).unwrap(), config_hash(&other).unwrap());
    }
}
