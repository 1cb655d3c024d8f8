//! Host adapter: exposes a `MetricProviderPlugin` as JSON over HTTP.
//!
//! # Routes
//!
//! | Method | Path | Body | Response |
//! |---|---|---|---|
//! | POST | `/plugin/init` | none | `RpcError` |
//! | POST | `/plugin/run` | `RunArgs` | `Measurement` |
//! | POST | `/plugin/resume` | `MeasurementArgs` | `Measurement` |
//! | POST | `/plugin/terminate` | `MeasurementArgs` | `Measurement` |
//! | POST | `/plugin/gc` | `GarbageCollectArgs` | `RpcError` |
//! | GET | `/plugin/type` | none | `TypeResponse` |
//! | POST | `/plugin/metadata` | `MetadataArgs` | string map |
//!
//! The adapter holds no logic of its own; every route forwards to the
//! plugin. Bodies that do not decode are rejected by the `Json` extractor.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{debug, info};

use rollmetric_core::{AnalysisRun, Measurement, Metric};

use crate::plugin::MetricProviderPlugin;

/// Environment variable the host sets before launching a plugin.
pub const MAGIC_COOKIE_KEY: &str = "ARGO_ROLLOUTS_RPC_PLUGIN";
/// Value the host sets `MAGIC_COOKIE_KEY` to for metric providers.
pub const MAGIC_COOKIE_VALUE: &str = "metricprovider";

pub const CORE_PROTOCOL_VERSION: u32 = 1;
pub const APP_PROTOCOL_VERSION: u32 = 1;

type SharedPlugin = Arc<dyn MetricProviderPlugin>;

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error(
        "this binary is a plugin and must be launched by the rollout controller (ARGO_ROLLOUTS_RPC_PLUGIN is not set to metricprovider)"
    )]
    Handshake,

    #[error("server error: {0}")]
    Io(#[from] std::io::Error),
}

/// Body of `/plugin/run`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunArgs {
    #[serde(default)]
    pub analysis_run: AnalysisRun,
    pub metric: Metric,
}

/// Body of `/plugin/resume` and `/plugin/terminate`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementArgs {
    #[serde(default)]
    pub analysis_run: AnalysisRun,
    pub metric: Metric,
    #[serde(default)]
    pub measurement: Measurement,
}

/// Body of `/plugin/gc`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GarbageCollectArgs {
    #[serde(default)]
    pub analysis_run: AnalysisRun,
    pub metric: Metric,
    #[serde(default)]
    pub limit: i32,
}

/// Body of `/plugin/metadata`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataArgs {
    pub metric: Metric,
}

/// Response of `/plugin/type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeResponse {
    #[serde(rename = "type")]
    pub type_name: String,
}

/// Check the launch cookie the host passes through the environment.
pub fn check_handshake(cookie: Option<&str>) -> Result<(), ServeError> {
    match cookie {
        Some(MAGIC_COOKIE_VALUE) => Ok(()),
        _ => Err(ServeError::Handshake),
    }
}

/// The line a plugin prints on stdout once it is listening.
pub fn handshake_line(addr: SocketAddr) -> String {
    format!("{CORE_PROTOCOL_VERSION}|{APP_PROTOCOL_VERSION}|tcp|{addr}|http")
}

/// Build the adapter router around `plugin`.
pub fn build_router(plugin: SharedPlugin) -> Router {
    Router::new()
        .route("/plugin/init", post(init_plugin))
        .route("/plugin/run", post(run))
        .route("/plugin/resume", post(resume))
        .route("/plugin/terminate", post(terminate))
        .route("/plugin/gc", post(garbage_collect))
        .route("/plugin/type", get(type_name))
        .route("/plugin/metadata", post(get_metadata))
        .with_state(plugin)
}

/// Serve `plugin` on `listener` until `shutdown` resolves.
pub async fn serve<F>(
    plugin: SharedPlugin,
    listener: TcpListener,
    shutdown: F,
) -> Result<(), ServeError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!(%addr, "plugin adapter listening");
    axum::serve(listener, build_router(plugin))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("plugin adapter stopped");
    Ok(())
}

async fn init_plugin(State(plugin): State<SharedPlugin>) -> impl IntoResponse {
    debug!("init");
    Json(plugin.init_plugin().await)
}

async fn run(State(plugin): State<SharedPlugin>, Json(args): Json<RunArgs>) -> impl IntoResponse {
    debug!(metric = %args.metric.name, "run");
    Json(plugin.run(&args.analysis_run, &args.metric).await)
}

async fn resume(
    State(plugin): State<SharedPlugin>,
    Json(args): Json<MeasurementArgs>,
) -> impl IntoResponse {
    debug!(metric = %args.metric.name, "resume");
    Json(
        plugin
            .resume(&args.analysis_run, &args.metric, args.measurement)
            .await,
    )
}

async fn terminate(
    State(plugin): State<SharedPlugin>,
    Json(args): Json<MeasurementArgs>,
) -> impl IntoResponse {
    debug!(metric = %args.metric.name, "terminate");
    Json(
        plugin
            .terminate(&args.analysis_run, &args.metric, args.measurement)
            .await,
    )
}

async fn garbage_collect(
    State(plugin): State<SharedPlugin>,
    Json(args): Json<GarbageCollectArgs>,
) -> impl IntoResponse {
    debug!(metric = %args.metric.name, limit = args.limit, "garbage collect");
    Json(
        plugin
            .garbage_collect(&args.analysis_run, &args.metric, args.limit)
            .await,
    )
}

async fn type_name(State(plugin): State<SharedPlugin>) -> impl IntoResponse {
    Json(TypeResponse {
        type_name: plugin.type_name().await,
    })
}

async fn get_metadata(
    State(plugin): State<SharedPlugin>,
    Json(args): Json<MetadataArgs>,
) -> impl IntoResponse {
    Json(plugin.get_metadata(&args.metric).await)
}
