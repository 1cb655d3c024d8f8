//! Host-facing types exchanged on every plugin call.
//!
//! Field names serialize in camelCase to match the analysis-run objects
//! the rollout controller hands to metric providers.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of a measurement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnalysisPhase {
    /// Not yet started by the host.
    #[default]
    Pending,
    /// Started but not completed.
    Running,
    /// The success condition held.
    Success,
    /// The failure condition held (or the success condition did not).
    Failure,
    /// The measurement could not be taken.
    Error,
    /// Neither condition held.
    Inconclusive,
}

impl AnalysisPhase {
    /// Whether the host can stop waiting on this measurement.
    pub fn is_completed(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

impl fmt::Display for AnalysisPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Success => "Success",
            Self::Failure => "Failure",
            Self::Error => "Error",
            Self::Inconclusive => "Inconclusive",
        };
        f.write_str(s)
    }
}

/// One invocation's result, returned to the host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Measurement {
    pub phase: AnalysisPhase,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub value: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl Measurement {
    /// A measurement that started now.
    pub fn start() -> Self {
        Self {
            started_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Complete the measurement with a value and phase.
    pub fn finish(mut self, value: String, phase: AnalysisPhase) -> Self {
        self.value = value;
        self.phase = phase;
        self.finished_at = Some(Utc::now());
        self
    }

    /// Complete the measurement as `Error`, replacing any pending value.
    pub fn mark_error(self, err: &dyn fmt::Display) -> Self {
        let message = err.to_string();
        let mut m = self.finish(message.clone(), AnalysisPhase::Error);
        m.message = message;
        m
    }
}

/// The metric an analysis step is measuring.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metric {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub success_condition: String,
    #[serde(default)]
    pub failure_condition: String,
    #[serde(default)]
    pub provider: MetricProvider,
}

impl Metric {
    /// Payload the host passed for the given plugin identifier.
    pub fn plugin_payload(&self, plugin_id: &str) -> Option<&serde_json::Value> {
        self.provider.plugin.get(plugin_id)
    }
}

/// Provider section of a metric.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricProvider {
    /// Plugin identifier → provider-specific configuration.
    #[serde(default)]
    pub plugin: HashMap<String, serde_json::Value>,
}

/// The analysis run a call belongs to. Opaque to the provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRun {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

/// Error slot returned by lifecycle calls. Empty means success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcError {
    #[serde(default)]
    pub error_string: String,
}

impl RpcError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            error_string: msg.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        !self.error_string.is_empty()
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.error_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn measurement_serializes_camel_case() {
        let m = Measurement::start().finish("[1]".to_string(), AnalysisPhase::Success);
        let json = serde_json::to_value(&m).unwrap();
        assert!(json.get("startedAt").is_some());
        assert!(json.get("finishedAt").is_some());
        assert_eq!(json["value"], "[1]");
        assert_eq!(json["phase"], "Success");
        assert!(json.get("message").is_none());
    }

    #[test]
    fn mark_error_replaces_value() {
        let mut m = Measurement::start();
        m.value = "[0.5]".to_string();
        let m = m.mark_error(&"boom");
        assert_eq!(m.phase, AnalysisPhase::Error);
        assert_eq!(m.value, "boom");
        assert_eq!(m.message, "boom");
        assert!(m.finished_at.is_some());
    }

    #[test]
    fn metric_parses_plugin_payload() {
        let json = r#"{
            "name": "error-ratio",
            "successCondition": "result[0] > 0.9",
            "provider": {
                "plugin": {
                    "argoproj-labs/coralogix-metric-plugin": {"query": "source logs"}
                }
            }
        }"#;
        let metric: Metric = serde_json::from_str(json).unwrap();
        assert_eq!(metric.success_condition, "result[0] > 0.9");
        assert!(metric.failure_condition.is_empty());
        let payload = metric
            .plugin_payload("argoproj-labs/coralogix-metric-plugin")
            .unwrap();
        assert_eq!(payload["query"], "source logs");
    }

    #[test]
    fn phase_completion() {
        assert!(!AnalysisPhase::Pending.is_completed());
        assert!(!AnalysisPhase::Running.is_completed());
        assert!(AnalysisPhase::Error.is_completed());
        assert!(AnalysisPhase::Inconclusive.is_completed());
    }

    #[test]
    fn rpc_error_empty_is_success() {
        assert!(!RpcError::default().is_error());
        assert!(RpcError::new("connection is shut down").is_error());
    }
}
