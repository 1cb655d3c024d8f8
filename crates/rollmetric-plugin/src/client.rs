//! Host side of the adapter: drives a served plugin over HTTP.
//!
//! Calls never fail outright. A transport or decode problem degrades into
//! the value the host would see from a broken connection: an `RpcError`,
//! an `Error` measurement, or an `{"error": ...}` metadata map.

use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::Bytes;
use http::{Method, Request, Uri, header};
use http_body_util::Full;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use rollmetric_backend::transport::{HttpTransport, join};
use rollmetric_core::{
    AnalysisPhase, AnalysisRun, Measurement, Metric, MetricError, MetricResult, RpcError,
};

use crate::plugin::MetricProviderPlugin;
use crate::server::{
    APP_PROTOCOL_VERSION, CORE_PROTOCOL_VERSION, GarbageCollectArgs, MeasurementArgs,
    MetadataArgs, RunArgs, TypeResponse,
};

/// Client for a plugin adapter listening on a local address.
#[derive(Clone)]
pub struct PluginClient {
    base: Uri,
    transport: HttpTransport,
}

impl PluginClient {
    pub fn new(addr: SocketAddr) -> MetricResult<Self> {
        let base: Uri = format!("http://{addr}")
            .parse()
            .map_err(|e| MetricError::Configuration(format!("invalid plugin address {addr}: {e}")))?;
        Ok(Self {
            base,
            transport: HttpTransport::new()?,
        })
    }

    /// Connect using the line a plugin printed on startup,
    /// `<core>|<app>|tcp|<addr>|http`.
    pub fn from_handshake(line: &str) -> MetricResult<Self> {
        let invalid = |reason: &str| {
            MetricError::Configuration(format!("invalid handshake line {:?}: {reason}", line.trim()))
        };

        let parts: Vec<&str> = line.trim().split('|').collect();
        let [core, app, network, addr, protocol] = parts.as_slice() else {
            return Err(invalid("expected 5 fields"));
        };
        if core.parse::<u32>().ok() != Some(CORE_PROTOCOL_VERSION) {
            return Err(invalid("unsupported core protocol version"));
        }
        if app.parse::<u32>().ok() != Some(APP_PROTOCOL_VERSION) {
            return Err(invalid("unsupported plugin protocol version"));
        }
        if *network != "tcp" || *protocol != "http" {
            return Err(invalid("unsupported transport"));
        }
        let addr: SocketAddr = addr.parse().map_err(|_| invalid("bad address"))?;
        Self::new(addr)
    }

    async fn call<R: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&(impl Serialize + Sync)>,
    ) -> MetricResult<R> {
        let uri = join(&self.base, path)?;
        let body = match body {
            Some(args) => Bytes::from(
                serde_json::to_vec(args).map_err(|e| MetricError::decode("plugin request", e))?,
            ),
            None => Bytes::new(),
        };
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(body))
            .map_err(|e| MetricError::Transport(format!("failed to create request: {e}")))?;

        let resp = self.transport.send(req).await?;
        if !resp.status.is_success() {
            return Err(MetricError::Transport(format!(
                "plugin call {path} failed with status {}: {}",
                resp.status.as_u16(),
                resp.text()
            )));
        }
        debug!(path, status = resp.status.as_u16(), "plugin call");
        serde_json::from_slice(&resp.body).map_err(|e| MetricError::decode("plugin response", e))
    }

    async fn post<A, R>(&self, path: &str, args: &A) -> MetricResult<R>
    where
        A: Serialize + Sync,
        R: DeserializeOwned,
    {
        self.call(Method::POST, path, Some(args)).await
    }
}

fn degraded_measurement(err: &MetricError) -> Measurement {
    Measurement {
        phase: AnalysisPhase::Error,
        message: err.to_string(),
        ..Default::default()
    }
}

#[async_trait::async_trait]
impl MetricProviderPlugin for PluginClient {
    async fn init_plugin(&self) -> RpcError {
        self.call(Method::POST, "/plugin/init", None::<&()>)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "init failed");
                RpcError::new(e.to_string())
            })
    }

    async fn run(&self, analysis_run: &AnalysisRun, metric: &Metric) -> Measurement {
        let args = RunArgs {
            analysis_run: analysis_run.clone(),
            metric: metric.clone(),
        };
        self.post("/plugin/run", &args)
            .await
            .unwrap_or_else(|e| degraded_measurement(&e))
    }

    async fn resume(
        &self,
        analysis_run: &AnalysisRun,
        metric: &Metric,
        measurement: Measurement,
    ) -> Measurement {
        let args = MeasurementArgs {
            analysis_run: analysis_run.clone(),
            metric: metric.clone(),
            measurement,
        };
        self.post("/plugin/resume", &args)
            .await
            .unwrap_or_else(|e| degraded_measurement(&e))
    }

    async fn terminate(
        &self,
        analysis_run: &AnalysisRun,
        metric: &Metric,
        measurement: Measurement,
    ) -> Measurement {
        let args = MeasurementArgs {
            analysis_run: analysis_run.clone(),
            metric: metric.clone(),
            measurement,
        };
        self.post("/plugin/terminate", &args)
            .await
            .unwrap_or_else(|e| degraded_measurement(&e))
    }

    async fn garbage_collect(
        &self,
        analysis_run: &AnalysisRun,
        metric: &Metric,
        limit: i32,
    ) -> RpcError {
        let args = GarbageCollectArgs {
            analysis_run: analysis_run.clone(),
            metric: metric.clone(),
            limit,
        };
        self.post("/plugin/gc", &args)
            .await
            .unwrap_or_else(|e| RpcError::new(e.to_string()))
    }

    async fn type_name(&self) -> String {
        let resp: MetricResult<TypeResponse> =
            self.call(Method::GET, "/plugin/type", None::<&()>).await;
        match resp {
            Ok(resp) => resp.type_name,
            Err(e) => e.to_string(),
        }
    }

    async fn get_metadata(&self, metric: &Metric) -> HashMap<String, String> {
        let args = MetadataArgs {
            metric: metric.clone(),
        };
        self.post("/plugin/metadata", &args)
            .await
            .unwrap_or_else(|e| HashMap::from([("error".to_string(), e.to_string())]))
    }
}
