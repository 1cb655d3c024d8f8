//! The capability interface a metric provider exposes to the host.

use std::collections::HashMap;

use rollmetric_core::{AnalysisRun, Measurement, Metric, RpcError};

/// Provider type reported to the host.
pub const PROVIDER_TYPE: &str = "RPCPlugin";

/// Lifecycle calls the rollout controller makes on a metric provider.
///
/// Implemented by the provider itself and by `PluginClient`, which
/// forwards each call to a served provider.
#[async_trait::async_trait]
pub trait MetricProviderPlugin: Send + Sync {
    async fn init_plugin(&self) -> RpcError;

    /// Take one measurement.
    async fn run(&self, analysis_run: &AnalysisRun, metric: &Metric) -> Measurement;

    /// Continue a measurement suspended by an earlier `run`.
    async fn resume(
        &self,
        analysis_run: &AnalysisRun,
        metric: &Metric,
        measurement: Measurement,
    ) -> Measurement;

    /// Stop an in-flight measurement.
    async fn terminate(
        &self,
        analysis_run: &AnalysisRun,
        metric: &Metric,
        measurement: Measurement,
    ) -> Measurement;

    /// Drop state for measurements beyond `limit`.
    async fn garbage_collect(
        &self,
        analysis_run: &AnalysisRun,
        metric: &Metric,
        limit: i32,
    ) -> RpcError;

    async fn type_name(&self) -> String;

    /// Informational key/value pairs shown next to the measurement.
    async fn get_metadata(&self, metric: &Metric) -> HashMap<String, String>;
}
