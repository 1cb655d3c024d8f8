//! Success evaluation: turns observations plus conditions into a phase.

use tracing::debug;

use crate::error::{MetricError, MetricResult};
use crate::expr::{self, Value};
use crate::normalize::Observations;
use crate::types::{AnalysisPhase, Metric};

/// Decides the phase of a measurement from its observations.
pub trait SuccessEvaluator: Send + Sync {
    fn evaluate(&self, observations: &Observations, metric: &Metric) -> MetricResult<AnalysisPhase>;
}

/// Evaluates `metric.success_condition` / `metric.failure_condition`
/// with the observations bound to `result`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionEvaluator;

impl SuccessEvaluator for ConditionEvaluator {
    fn evaluate(&self, observations: &Observations, metric: &Metric) -> MetricResult<AnalysisPhase> {
        let result = observations.values();
        let success_set = !metric.success_condition.is_empty();
        let failure_set = !metric.failure_condition.is_empty();

        let mut success = false;
        let mut failure = false;
        if success_set {
            success = eval_condition(&metric.success_condition, result)?;
        }
        if failure_set {
            failure = eval_condition(&metric.failure_condition, result)?;
        }

        match (success_set, failure_set) {
            (false, false) => return Ok(AnalysisPhase::Success),
            (true, false) => failure = !success,
            (false, true) => success = !failure,
            (true, true) => {}
        }

        let phase = if failure {
            AnalysisPhase::Failure
        } else if success {
            AnalysisPhase::Success
        } else {
            AnalysisPhase::Inconclusive
        };
        debug!(metric = %metric.name, %phase, "evaluated conditions");
        Ok(phase)
    }
}

/// Evaluate a single condition that must produce a boolean.
pub fn eval_condition(condition: &str, result: &[f64]) -> MetricResult<bool> {
    match expr::evaluate(condition, result) {
        Ok(Value::Bool(b)) => Ok(b),
        Ok(Value::Number(_)) => Err(MetricError::Evaluation(format!(
            "expected bool, but got float64 from {condition:?}"
        ))),
        Ok(Value::List(_)) => Err(MetricError::Evaluation(format!(
            "expected bool, but got []float64 from {condition:?}"
        ))),
        Err(e) => Err(MetricError::Evaluation(format!("{condition:?}: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STABLE_AND_HIGH: &str = "result[len(result)-1] > .9999 && (len(result) > 1 ? result[len(result)-1] >= result[len(result)-2] - 0.0001 : true)";

    fn metric(success: &str, failure: &str) -> Metric {
        Metric {
            name: "ratio".to_string(),
            success_condition: success.to_string(),
            failure_condition: failure.to_string(),
            ..Default::default()
        }
    }

    fn phase(values: &[f64], m: &Metric) -> AnalysisPhase {
        ConditionEvaluator
            .evaluate(&Observations::from(values.to_vec()), m)
            .unwrap()
    }

    #[test]
    fn no_conditions_is_success() {
        assert_eq!(phase(&[], &metric("", "")), AnalysisPhase::Success);
    }

    #[test]
    fn success_condition_only() {
        let m = metric(STABLE_AND_HIGH, "");
        assert_eq!(phase(&[0.98, 0.99, 1.0], &m), AnalysisPhase::Success);
        assert_eq!(phase(&[0.98, 0.99, 0.95], &m), AnalysisPhase::Failure);
        assert_eq!(phase(&[1.0, 0.5, 1.0], &m), AnalysisPhase::Success);
    }

    #[test]
    fn failure_condition_only() {
        let m = metric("", "result[0] > 10");
        assert_eq!(phase(&[11.0], &m), AnalysisPhase::Failure);
        assert_eq!(phase(&[3.0], &m), AnalysisPhase::Success);
    }

    #[test]
    fn both_conditions_can_be_inconclusive() {
        let m = metric("result[0] > 10", "result[0] < 5");
        assert_eq!(phase(&[11.0], &m), AnalysisPhase::Success);
        assert_eq!(phase(&[1.0], &m), AnalysisPhase::Failure);
        assert_eq!(phase(&[7.0], &m), AnalysisPhase::Inconclusive);
    }

    #[test]
    fn failure_wins_when_both_hold() {
        let m = metric("result[0] > 0", "result[0] > 0");
        assert_eq!(phase(&[1.0], &m), AnalysisPhase::Failure);
    }

    #[test]
    fn non_boolean_condition_is_an_error() {
        let m = metric("result[0]", "");
        let err = ConditionEvaluator
            .evaluate(&Observations::from(vec![1.0]), &m)
            .unwrap_err();
        assert!(matches!(err, MetricError::Evaluation(_)));
        assert!(err.to_string().contains("expected bool"));
    }

    #[test]
    fn empty_result_indexing_is_an_error() {
        let m = metric(STABLE_AND_HIGH, "");
        let err = ConditionEvaluator
            .evaluate(&Observations::default(), &m)
            .unwrap_err();
        assert!(err.to_string().contains("index out of range"));
    }
}
