//! OpenSearch backend.
//!
//! Connecting performs an info request (`GET /`) as a handshake; the query
//! is a raw search body sent to `/{index}/_search`. Results come from the
//! `logs_per_5min` date-histogram aggregation.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue};
use http::{Method, Request, StatusCode, Uri};
use http_body_util::Full;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use rollmetric_core::{MetricError, MetricResult, ResultRecord};

use crate::QueryBackend;
use crate::transport::{self, HttpResponse, HttpTransport};

/// Key under which the host passes this backend's configuration.
pub const PLUGIN_ID: &str = "argoproj-labs/opensearch-metric-plugin";

/// Numeric field read from every bucket.
pub const VALUE_FIELD: &str = "doc_count";

/// Aggregation whose buckets become the result records.
pub const AGGREGATION: &str = "logs_per_5min";

/// Provider payload for the OpenSearch backend.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenSearchConfig {
    /// Base URL of the cluster, e.g. `https://opensearch:9200`.
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Skip server certificate verification.
    #[serde(default)]
    pub insecure_skip_verify: bool,
    /// Index (or comma-separated indices) to search.
    #[serde(default)]
    pub index: String,
    /// Raw search request body.
    #[serde(default)]
    pub query: String,
}

/// Client for one invocation against an OpenSearch cluster.
pub struct OpenSearchClient {
    base: Uri,
    index: String,
    auth: Option<HeaderValue>,
    transport: HttpTransport,
}

impl OpenSearchClient {
    /// Validate the configuration and check the cluster answers.
    pub async fn connect(config: &OpenSearchConfig) -> MetricResult<Self> {
        let base = transport::parse_endpoint(&config.address, "opensearch address")?;

        let auth = if config.username.is_empty() && config.password.is_empty() {
            None
        } else {
            let token = STANDARD.encode(format!("{}:{}", config.username, config.password));
            let value = HeaderValue::from_str(&format!("Basic {token}"))
                .map_err(|e| MetricError::Configuration(format!("invalid credentials: {e}")))?;
            Some(value)
        };

        let client = Self {
            base,
            index: config.index.trim().to_string(),
            auth,
            transport: HttpTransport::with_verification(!config.insecure_skip_verify)?,
        };
        client.info().await?;
        Ok(client)
    }

    async fn info(&self) -> MetricResult<()> {
        let resp = self
            .send(Method::GET, "/", Bytes::new())
            .await
            .map_err(response_error)?;

        if !resp.status.is_success() {
            return Err(MetricError::Transport(format!(
                "error: [{}] {}",
                resp.status,
                resp.text()
            )));
        }

        let info: Value = serde_json::from_slice(&resp.body)
            .map_err(|e| MetricError::decode("info response", e))?;
        let cluster = info.get("cluster_name").and_then(|v| v.as_str());
        let version = info.pointer("/version/number").and_then(|v| v.as_str());
        debug!(?cluster, ?version, "connected to opensearch");
        Ok(())
    }

    fn search_path(&self) -> String {
        if self.index.is_empty() {
            "/_search?track_total_hits=true".to_string()
        } else {
            format!("/{}/_search?track_total_hits=true", self.index)
        }
    }

    async fn send(&self, method: Method, path: &str, body: Bytes) -> MetricResult<HttpResponse> {
        let mut builder = Request::builder()
            .method(method)
            .uri(transport::join(&self.base, path)?)
            .header(CONTENT_TYPE, "application/json");
        if let Some(auth) = &self.auth {
            builder = builder.header(AUTHORIZATION, auth.clone());
        }
        let req = builder
            .body(Full::new(body))
            .map_err(|e| MetricError::Transport(format!("failed to create request: {e}")))?;
        self.transport.send(req).await
    }
}

#[async_trait::async_trait]
impl QueryBackend for OpenSearchClient {
    fn value_field(&self) -> &'static str {
        VALUE_FIELD
    }

    async fn execute(&self, query: &str) -> MetricResult<Vec<Option<ResultRecord>>> {
        let path = self.search_path();
        debug!(base = %self.base, %path, "sending search");
        let resp = self
            .send(Method::POST, &path, Bytes::copy_from_slice(query.as_bytes()))
            .await
            .map_err(response_error)?;
        parse_search_response(resp.status, &resp.body)
    }
}

/// Wrap a failed exchange. Configuration problems pass through as they are.
fn response_error(err: MetricError) -> MetricError {
    match err {
        MetricError::Configuration(_) => err,
        other => MetricError::Transport(format!("error getting response: {other}")),
    }
}

/// Decode a search reply into the aggregation's buckets.
pub fn parse_search_response(
    status: StatusCode,
    body: &[u8],
) -> MetricResult<Vec<Option<ResultRecord>>> {
    if !status.is_success() {
        let error: Value = serde_json::from_slice(body)
            .map_err(|e| MetricError::decode("error response", e))?;
        let kind = error.pointer("/error/type").and_then(Value::as_str);
        let reason = error.pointer("/error/reason").and_then(Value::as_str);
        return Err(MetricError::Transport(match (kind, reason) {
            (Some(kind), Some(reason)) => format!("[{status}] {kind}: {reason}"),
            _ => format!("[{status}] {}", String::from_utf8_lossy(body)),
        }));
    }

    let mut response: Value = serde_json::from_slice(body)
        .map_err(|e| MetricError::decode("search response", e))?;

    let hits = response.pointer("/hits/total/value").and_then(|v| v.as_u64());
    let took_ms = response.get("took").and_then(|v| v.as_u64());
    debug!(%status, ?hits, ?took_ms, "search completed");

    let path = format!("/aggregations/{AGGREGATION}/buckets");
    let buckets = match response.pointer_mut(&path).map(Value::take) {
        Some(Value::Array(buckets)) => buckets,
        Some(_) => {
            return Err(MetricError::Format(format!(
                "aggregations.{AGGREGATION}.buckets is not an array"
            )));
        }
        None => {
            return Err(MetricError::Format(format!(
                "missing aggregations.{AGGREGATION}.buckets"
            )));
        }
    };

    buckets
        .into_iter()
        .enumerate()
        .map(|(i, bucket)| match bucket {
            Value::Null => Ok(None),
            Value::Object(fields) => Ok(Some(ResultRecord::from(fields))),
            _ => Err(MetricError::Format(format!(
                "bucket {i} of {AGGREGATION} is not an object"
            ))),
        })
        .collect()
}
