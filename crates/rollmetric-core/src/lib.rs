//! rollmetric-core: shared model for the rollmetric metric provider.
//!
//! Holds everything that does not touch the network: the host-facing
//! types (`Metric`, `Measurement`, `AnalysisPhase`), the error taxonomy,
//! the result normalizer, and the success/failure condition evaluator.
//!
//! # Pipeline
//!
//! ```text
//! Vec<Option<ResultRecord>>  (from a backend)
//!   └── normalize(records, field) → Observations
//!         └── SuccessEvaluator::evaluate(observations, metric) → AnalysisPhase
//! ```
//!
//! Observations render as `[1,0.5,0.9999]`, which is the string stored in
//! `Measurement::value`.

pub mod error;
pub mod evaluate;
mod expr;
pub mod normalize;
pub mod types;

pub use error::{ExtractionFailure, MetricError, MetricResult};
pub use evaluate::{ConditionEvaluator, SuccessEvaluator, eval_condition};
pub use normalize::{Observations, ResultRecord, normalize};
pub use types::*;
