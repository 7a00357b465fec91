//! Domain models for routing evaluation.
//!
//! - `RouteResult`: predictor output
//! - `TruthDiagnostics` / `TruthStatus`: ground-truth outcome per policy
//! - `PerPrRecord`: one immutable row of the record log

pub mod digest;
pub mod error;
pub mod record;
pub mod route;
pub mod truth;

pub use error::{EvalError, Result};
pub use record::{PerPrRecord, PolicySource, PolicyTruth, PredictorOutcome, TruthBlock};
pub use route::{Candidate, Evidence, RouteResult, Target, TargetKind};
pub use truth::{TruthDiagnostics, TruthOutcome, TruthStatus};
