//! Error types for a single measurement.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for measurement operations.
pub type MetricResult<T> = Result<T, MetricError>;

/// Everything that can turn a measurement into an `Error` phase.
#[derive(Debug, Error)]
pub enum MetricError {
    /// Missing or malformed endpoint, credentials or provider payload.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Connection failure or a non-success HTTP status.
    #[error("{0}")]
    Transport(String),

    /// The query did not finish before the invocation deadline.
    #[error("query timed out after {0:?}")]
    Timeout(Duration),

    /// The response does not have the expected shape.
    #[error("invalid response format: {0}")]
    Format(String),

    /// A JSON document could not be decoded at the named stage.
    #[error("failed to parse {stage}: {source}")]
    Decode {
        stage: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// A result record does not carry a usable numeric field.
    #[error("{key} {reason}")]
    Extraction {
        key: String,
        reason: ExtractionFailure,
    },

    /// The success or failure condition could not be evaluated.
    #[error("evaluation error: {0}")]
    Evaluation(String),
}

impl MetricError {
    pub fn decode(stage: &'static str, source: serde_json::Error) -> Self {
        Self::Decode { stage, source }
    }
}

/// Why a numeric field could not be extracted from a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionFailure {
    Missing,
    NotNumeric,
}

impl fmt::Display for ExtractionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => f.write_str("is missing"),
            Self::NotNumeric => f.write_str("is not of type float64"),
        }
    }
}
