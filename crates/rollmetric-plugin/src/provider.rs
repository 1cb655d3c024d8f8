//! Measurement orchestration: one query and one decision per `run`.
//!
//! `run` walks configure → connect → query → normalize → evaluate. The
//! connect and query steps share a deadline measured from the start of
//! the call. Any failure ends the walk and becomes an `Error` measurement
//! carrying the error text; nothing is retried.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use rollmetric_backend::BackendKind;
use rollmetric_core::{
    AnalysisPhase, AnalysisRun, ConditionEvaluator, Measurement, Metric, MetricError,
    MetricResult, RpcError, SuccessEvaluator, normalize,
};

use crate::plugin::{MetricProviderPlugin, PROVIDER_TYPE};

/// Upper bound on connect + query for a single measurement.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Metadata key exposing the query a measurement runs.
pub const METADATA_QUERY_KEY: &str = "ResolvedQuery";

/// The metric provider for one backend.
#[derive(Debug, Clone)]
pub struct MetricProvider<E = ConditionEvaluator> {
    kind: BackendKind,
    query_timeout: Duration,
    evaluator: E,
}

impl MetricProvider {
    /// Provider for `kind` with the default timeout and condition evaluator.
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            evaluator: ConditionEvaluator,
        }
    }
}

impl<E: SuccessEvaluator> MetricProvider<E> {
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Replace the success evaluator.
    pub fn with_evaluator<F: SuccessEvaluator>(self, evaluator: F) -> MetricProvider<F> {
        MetricProvider {
            kind: self.kind,
            query_timeout: self.query_timeout,
            evaluator,
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    async fn measure(
        &self,
        metric: &Metric,
        started: Instant,
    ) -> MetricResult<(String, AnalysisPhase)> {
        let deadline = started + self.query_timeout;
        let timed_out = |_| MetricError::Timeout(self.query_timeout);

        let config = self
            .kind
            .decode_config(metric.plugin_payload(self.kind.plugin_id()))?;

        let backend = tokio::time::timeout_at(deadline, config.connect())
            .await
            .map_err(timed_out)??;

        let records = tokio::time::timeout_at(deadline, backend.execute(config.query()))
            .await
            .map_err(timed_out)??;
        debug!(records = records.len(), "query returned");

        let observations = normalize(&records, backend.value_field())?;
        let phase = self.evaluator.evaluate(&observations, metric)?;
        Ok((observations.render(), phase))
    }
}

#[async_trait::async_trait]
impl<E: SuccessEvaluator> MetricProviderPlugin for MetricProvider<E> {
    async fn init_plugin(&self) -> RpcError {
        info!(backend = %self.kind, "metric provider initialized");
        RpcError::default()
    }

    async fn run(&self, analysis_run: &AnalysisRun, metric: &Metric) -> Measurement {
        let measurement = Measurement::start();
        let started = Instant::now();

        match self.measure(metric, started).await {
            Ok((value, phase)) => {
                info!(
                    plugin = self.kind.plugin_id(),
                    run = %analysis_run.name,
                    metric = %metric.name,
                    %value,
                    %phase,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "measurement completed"
                );
                measurement.finish(value, phase)
            }
            Err(e) => {
                warn!(
                    plugin = self.kind.plugin_id(),
                    run = %analysis_run.name,
                    metric = %metric.name,
                    error = %e,
                    "measurement failed"
                );
                measurement.mark_error(&e)
            }
        }
    }

    async fn resume(
        &self,
        _analysis_run: &AnalysisRun,
        _metric: &Metric,
        measurement: Measurement,
    ) -> Measurement {
        measurement
    }

    async fn terminate(
        &self,
        _analysis_run: &AnalysisRun,
        _metric: &Metric,
        measurement: Measurement,
    ) -> Measurement {
        measurement
    }

    async fn garbage_collect(
        &self,
        _analysis_run: &AnalysisRun,
        _metric: &Metric,
        _limit: i32,
    ) -> RpcError {
        RpcError::default()
    }

    async fn type_name(&self) -> String {
        PROVIDER_TYPE.to_string()
    }

    async fn get_metadata(&self, metric: &Metric) -> HashMap<String, String> {
        let mut metadata = HashMap::new();
        if let Ok(config) = self
            .kind
            .decode_config(metric.plugin_payload(self.kind.plugin_id()))
        {
            if !config.query().is_empty() {
                metadata.insert(METADATA_QUERY_KEY.to_string(), config.query().to_string());
            }
        }
        metadata
    }
}

#[cfg(test)]
mod tests {
    use axum::Router;
    use axum::routing::{get, post};
    use serde_json::{Value, json};

    use rollmetric_core::Observations;

    use super::*;

    const CORALOGIX: &str = "argoproj-labs/coralogix-metric-plugin";
    const OPENSEARCH: &str = "argoproj-labs/opensearch-metric-plugin";
    const STABLE_AND_HIGH: &str = "result[len(result)-1] > .9999 && (len(result) > 1 ? result[len(result)-1] >= result[len(result)-2] - 0.0001 : true)";

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    /// Accepts connections and never answers.
    async fn black_hole() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((sock, _)) = listener.accept().await {
                held.push(sock);
            }
        });
        format!("http://{addr}")
    }

    fn dataprime_reply(ratios: &[f64]) -> String {
        let results: Vec<Value> = ratios
            .iter()
            .map(|r| json!({"userData": json!({"ratio": r}).to_string()}))
            .collect();
        format!(
            "{}\n{}\n",
            json!({"queryId": {"queryId": "q-1"}}),
            json!({"result": {"results": results}})
        )
    }

    fn metric(plugin_id: &str, payload: Value, success: &str) -> Metric {
        let mut m = Metric {
            name: "success-ratio".to_string(),
            success_condition: success.to_string(),
            ..Default::default()
        };
        m.provider.plugin.insert(plugin_id.to_string(), payload);
        m
    }

    #[tokio::test]
    async fn dataprime_ratios_succeed() {
        let router = Router::new().route(
            "/api/v1/query",
            post(|| async { dataprime_reply(&[0.98, 0.99, 1.0]) }),
        );
        let base = serve(router).await;

        let provider = MetricProvider::new(BackendKind::Coralogix);
        let m = metric(
            CORALOGIX,
            json!({"baseUrl": base, "apiKey": "k", "query": "source logs"}),
            STABLE_AND_HIGH,
        );
        let measurement = provider.run(&AnalysisRun::default(), &m).await;

        assert_eq!(measurement.phase, AnalysisPhase::Success);
        assert_eq!(measurement.value, "[0.98,0.99,1]");
        assert!(measurement.message.is_empty());
        assert!(measurement.started_at.is_some());
        assert!(measurement.finished_at.is_some());
    }

    #[tokio::test]
    async fn dropping_ratio_fails() {
        let router = Router::new().route(
            "/api/v1/query",
            post(|| async { dataprime_reply(&[0.99, 0.97]) }),
        );
        let base = serve(router).await;

        let provider = MetricProvider::new(BackendKind::Coralogix);
        let m = metric(
            CORALOGIX,
            json!({"baseUrl": base, "query": "source logs"}),
            STABLE_AND_HIGH,
        );
        let measurement = provider.run(&AnalysisRun::default(), &m).await;
        assert_eq!(measurement.phase, AnalysisPhase::Failure);
        assert_eq!(measurement.value, "[0.99,0.97]");
    }

    #[tokio::test]
    async fn hung_backend_times_out() {
        let base = black_hole().await;
        let provider = MetricProvider::new(BackendKind::Coralogix)
            .with_query_timeout(Duration::from_millis(200));
        let m = metric(
            CORALOGIX,
            json!({"baseUrl": base, "query": "source logs"}),
            STABLE_AND_HIGH,
        );

        let measurement = provider.run(&AnalysisRun::default(), &m).await;
        assert_eq!(measurement.phase, AnalysisPhase::Error);
        assert!(measurement.value.contains("timed out"), "{}", measurement.value);
        assert_eq!(measurement.value, measurement.message);
        assert!(measurement.finished_at.is_some());
    }

    #[tokio::test]
    async fn timed_out_query_closes_its_connection() {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let (closed_tx, closed_rx) = tokio::sync::oneshot::channel::<usize>();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut received = 0;
            let mut buf = [0u8; 1024];
            // Never answer; read until the client hangs up.
            loop {
                match sock.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => received += n,
                }
            }
            let _ = closed_tx.send(received);
        });

        let provider = MetricProvider::new(BackendKind::Coralogix)
            .with_query_timeout(Duration::from_millis(200));
        let m = metric(
            CORALOGIX,
            json!({"baseUrl": base, "query": "source logs"}),
            STABLE_AND_HIGH,
        );
        let measurement = provider.run(&AnalysisRun::default(), &m).await;
        assert_eq!(measurement.phase, AnalysisPhase::Error);
        assert_eq!(measurement.value, "query timed out after 200ms");

        let received = tokio::time::timeout(Duration::from_secs(2), closed_rx)
            .await
            .expect("connection still open after the measurement returned")
            .unwrap();
        assert!(received > 0, "request never reached the backend");
    }

    #[tokio::test]
    async fn hung_opensearch_handshake_times_out() {
        let base = black_hole().await;
        let provider = MetricProvider::new(BackendKind::OpenSearch)
            .with_query_timeout(Duration::from_millis(200));
        let m = metric(OPENSEARCH, json!({"address": base, "query": "{}"}), "");

        let measurement = provider.run(&AnalysisRun::default(), &m).await;
        assert_eq!(measurement.phase, AnalysisPhase::Error);
        assert!(measurement.value.contains("timed out"));
    }

    #[tokio::test]
    async fn invalid_payload_is_an_error() {
        let provider = MetricProvider::new(BackendKind::Coralogix);
        let m = metric(CORALOGIX, json!("{\"baseUrl\": "), STABLE_AND_HIGH);
        let measurement = provider.run(&AnalysisRun::default(), &m).await;

        assert_eq!(measurement.phase, AnalysisPhase::Error);
        assert!(measurement.value.starts_with("failed to parse plugin configuration"));
        assert!(measurement.finished_at.is_some());
    }

    #[tokio::test]
    async fn missing_payload_is_an_error() {
        let provider = MetricProvider::new(BackendKind::Coralogix);
        let measurement = provider.run(&AnalysisRun::default(), &Metric::default()).await;
        assert_eq!(measurement.phase, AnalysisPhase::Error);
        assert!(measurement.message.contains(CORALOGIX));
    }

    #[tokio::test]
    async fn bad_address_is_configuration_error() {
        let provider = MetricProvider::new(BackendKind::OpenSearch);
        let m = metric(OPENSEARCH, json!({"address": "opensearch:9200"}), "");
        let measurement = provider.run(&AnalysisRun::default(), &m).await;
        assert_eq!(measurement.phase, AnalysisPhase::Error);
        assert_eq!(
            measurement.value,
            "configuration error: opensearch address is not in url format"
        );
    }

    #[tokio::test]
    async fn opensearch_buckets_skip_nulls() {
        let router = Router::new()
            .route("/", get(|| async { axum::Json(json!({"cluster_name": "c"})) }))
            .route(
                "/logs/_search",
                post(|| async {
                    axum::Json(json!({
                        "took": 2,
                        "hits": {"total": {"value": 9}},
                        "aggregations": {"logs_per_5min": {"buckets": [
                            {"doc_count": 4}, null, {"doc_count": 5}
                        ]}}
                    }))
                }),
            );
        let base = serve(router).await;

        let provider = MetricProvider::new(BackendKind::OpenSearch);
        let m = metric(
            OPENSEARCH,
            json!({"address": base, "index": "logs", "query": "{\"size\": 0}"}),
            "len(result) == 2 && result[1] < 10",
        );
        let measurement = provider.run(&AnalysisRun::default(), &m).await;
        assert_eq!(measurement.phase, AnalysisPhase::Success);
        assert_eq!(measurement.value, "[4,5]");
    }

    #[tokio::test]
    async fn missing_field_is_extraction_error() {
        let router = Router::new()
            .route("/", get(|| async { axum::Json(json!({})) }))
            .route(
                "/_search",
                post(|| async {
                    axum::Json(json!({"aggregations": {"logs_per_5min": {"buckets": [{"key": 1}]}}}))
                }),
            );
        let base = serve(router).await;

        let provider = MetricProvider::new(BackendKind::OpenSearch);
        let m = metric(OPENSEARCH, json!({"address": base, "query": "{}"}), "");
        let measurement = provider.run(&AnalysisRun::default(), &m).await;
        assert_eq!(measurement.phase, AnalysisPhase::Error);
        assert_eq!(measurement.value, "doc_count is missing");
    }

    #[tokio::test]
    async fn custom_evaluator_decides_phase() {
        struct AlwaysInconclusive;
        impl SuccessEvaluator for AlwaysInconclusive {
            fn evaluate(&self, _: &Observations, _: &Metric) -> MetricResult<AnalysisPhase> {
                Ok(AnalysisPhase::Inconclusive)
            }
        }

        let router = Router::new().route("/api/v1/query", post(|| async { dataprime_reply(&[]) }));
        let base = serve(router).await;

        let provider =
            MetricProvider::new(BackendKind::Coralogix).with_evaluator(AlwaysInconclusive);
        let m = metric(CORALOGIX, json!({"baseUrl": base}), "");
        let measurement = provider.run(&AnalysisRun::default(), &m).await;
        assert_eq!(measurement.phase, AnalysisPhase::Inconclusive);
        assert_eq!(measurement.value, "[]");
    }

    #[tokio::test]
    async fn lifecycle_calls_pass_through() {
        let provider = MetricProvider::new(BackendKind::Coralogix);
        let run = AnalysisRun::default();
        let m = Metric::default();
        let previous = Measurement::start().finish("[1]".to_string(), AnalysisPhase::Success);

        assert!(!provider.init_plugin().await.is_error());
        assert_eq!(provider.resume(&run, &m, previous.clone()).await, previous);
        assert_eq!(provider.terminate(&run, &m, previous.clone()).await, previous);
        assert!(!provider.garbage_collect(&run, &m, 10).await.is_error());
        assert_eq!(provider.type_name().await, "RPCPlugin");
    }

    #[tokio::test]
    async fn metadata_exposes_query() {
        let provider = MetricProvider::new(BackendKind::Coralogix);
        let m = metric(CORALOGIX, json!({"query": "source logs | count"}), "");
        let metadata = provider.get_metadata(&m).await;
        assert_eq!(metadata.get(METADATA_QUERY_KEY).unwrap(), "source logs | count");

        assert!(provider.get_metadata(&Metric::default()).await.is_empty());
        let m = metric(CORALOGIX, json!({"baseUrl": "https://x"}), "");
        assert!(provider.get_metadata(&m).await.is_empty());
    }
}
