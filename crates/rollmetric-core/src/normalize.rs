//! Result normalization: backend records to an observation sequence.
//!
//! Backends hand over their result list as `Option<ResultRecord>`; `None`
//! stands for a null element. Only the numeric target field of each record
//! is ever read. Everything else in the record stays opaque.

use std::fmt;

use serde_json::{Map, Value};

use crate::error::{ExtractionFailure, MetricError, MetricResult};

/// One element of a backend's result list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultRecord(Map<String, Value>);

impl ResultRecord {
    /// Wrap a decoded JSON value. Returns `None` unless it is an object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self(fields)),
            _ => None,
        }
    }

    /// Read `key` as a float. Integers are widened; nothing else is coerced.
    pub fn numeric(&self, key: &str) -> MetricResult<f64> {
        let value = self.0.get(key).ok_or_else(|| MetricError::Extraction {
            key: key.to_string(),
            reason: ExtractionFailure::Missing,
        })?;
        value.as_f64().ok_or_else(|| MetricError::Extraction {
            key: key.to_string(),
            reason: ExtractionFailure::NotNumeric,
        })
    }
}

impl From<Map<String, Value>> for ResultRecord {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

/// Ordered numeric values extracted from one query's results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observations(Vec<f64>);

impl Observations {
    pub fn values(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Bracketed, comma-joined, shortest round-trip decimals: `[1,0.5]`.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(2 + self.0.len() * 8);
        out.push('[');
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&v.to_string());
        }
        out.push(']');
        out
    }
}

impl From<Vec<f64>> for Observations {
    fn from(values: Vec<f64>) -> Self {
        Self(values)
    }
}

impl fmt::Display for Observations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Extract `field` from every non-null record, in order.
///
/// Fails on the first record whose field is missing or not a number.
pub fn normalize(records: &[Option<ResultRecord>], field: &str) -> MetricResult<Observations> {
    let mut values = Vec::with_capacity(records.len());
    for record in records.iter().flatten() {
        values.push(record.numeric(field)?);
    }
    Ok(Observations(values))
}
