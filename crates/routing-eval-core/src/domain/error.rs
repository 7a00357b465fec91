//! Error taxonomy for the evaluation pipeline.
//!
//! Configuration and resolution errors abort a run before any item is
//! evaluated. Per-item predictor failures never surface here; they are
//! recorded in the item's record instead.

use routing_history::{HistoryError, PrNumber};

/// Evaluation pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("invalid cutoff policy: {0}")]
    InvalidCutoffPolicy(String),

    #[error("pr_cutoffs missing entries for PR(s): {}", join_numbers(.missing))]
    MissingCutoffs { missing: Vec<PrNumber> },

    #[error("unknown truth policy ids: {}", .ids.join(", "))]
    UnknownTruthPolicy { ids: Vec<String> },

    #[error("truth policy plugin not allowlisted: {source_ref}")]
    PluginNotAllowed { source_ref: String },

    #[error("truth policy plugin not registered: {source_ref}")]
    PluginNotRegistered { source_ref: String },

    #[error("duplicate truth policy id from plugins: {0}")]
    DuplicatePluginPolicy(String),

    #[error("plugin policy id collides with builtin policy: {0}")]
    PluginCollidesWithBuiltin(String),

    #[error("invalid truth policy spec: {0}")]
    InvalidTruthPolicy(String),

    #[error("truth_primary_policy is not active: {primary}; active=[{}]", .active.join(", "))]
    InactivePrimaryPolicy { primary: String, active: Vec<String> },

    #[error("predictor {predictor_id} requires config_path")]
    MissingPredictorConfig { predictor_id: String },

    #[error("unknown predictor kind: {0}")]
    UnknownPredictorKind(String),

    #[error("invalid run config: {0}")]
    InvalidConfig(String),

    #[error(
        "strict_streaming_eval violation: {note}. Refresh ingestion data or disable strict_streaming_eval explicitly."
    )]
    LeakageViolation { note: String },

    #[error("pr {pr_number} cutoff {cutoff} precedes creation at {created_at}")]
    CutoffBeforeCreation {
        pr_number: PrNumber,
        cutoff: String,
        created_at: String,
    },

    #[error("run directory already exists: {0}; choose a new run_id")]
    RunExists(String),

    #[error("invalid cohort: {0}")]
    InvalidCohort(String),

    #[error("missing artifact: {0}")]
    MissingArtifact(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("history store error: {0}")]
    History(#[from] HistoryError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn join_numbers(numbers: &[PrNumber]) -> String {
    numbers
        .iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type for evaluation operations.
pub type Result<T> = std::result::Result<T, EvalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_cutoffs_lists_every_pr() {
        let err = EvalError::MissingCutoffs {
            missing: vec![3, 9],
        };
        assert_eq!(err.to_string(), "pr_cutoffs missing entries for PR(s): 3, 9");
    }

    #[test]
    fn leakage_violation_mentions_strict_flag() {
        let err = EvalError::LeakageViolation {
            note: "db_max_event_occurred_at=2024-01-01T00:00:00Z is before cutoffs for PRs: [4]"
                .to_string(),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("strict_streaming_eval violation: db_max_event_occurred_at="));
        assert!(msg.contains("[4]"));
    }

    #[test]
    fn unknown_policy_ids_are_joined() {
        let err = EvalError::UnknownTruthPolicy {
            ids: vec!["a_v1".to_string(), "b_v1".to_string()],
        };
        assert_eq!(err.to_string(), "unknown truth policy ids: a_v1, b_v1");
    }
}
