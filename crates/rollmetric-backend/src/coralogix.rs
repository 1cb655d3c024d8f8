//! Coralogix DataPrime backend.
//!
//! Sends one `POST /api/v1/query` and reads the NDJSON reply. The second
//! document holds the results; each result carries its fields as a
//! JSON-encoded `userData` string, decoded in a second stage.

use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::{Request, StatusCode, Uri};
use http_body_util::Full;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use rollmetric_core::{MetricError, MetricResult, ResultRecord};

use crate::QueryBackend;
use crate::transport::{self, HttpTransport};

/// Key under which the host passes this backend's configuration.
pub const PLUGIN_ID: &str = "argoproj-labs/coralogix-metric-plugin";

/// Numeric field read from every result.
pub const VALUE_FIELD: &str = "ratio";

const QUERY_PATH: &str = "/api/v1/query";

/// Storage tier the query runs against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryTier {
    #[default]
    #[serde(rename = "TIER_FREQUENT_SEARCH")]
    FrequentSearch,
    #[serde(rename = "TIER_ARCHIVE")]
    Archive,
}

/// Provider payload for the Coralogix backend.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoralogixConfig {
    /// API base URL, e.g. `https://ng-api-http.coralogix.us`.
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    /// DataPrime query text.
    #[serde(default)]
    pub query: String,
    /// Unset or empty means `TIER_FREQUENT_SEARCH`.
    #[serde(default, deserialize_with = "tier_or_default")]
    pub query_tier: QueryTier,
}

fn tier_or_default<'de, D>(deserializer: D) -> Result<QueryTier, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)?.as_deref() {
        None | Some("") => Ok(QueryTier::default()),
        Some("TIER_FREQUENT_SEARCH") => Ok(QueryTier::FrequentSearch),
        Some("TIER_ARCHIVE") => Ok(QueryTier::Archive),
        Some(other) => Err(serde::de::Error::unknown_variant(
            other,
            &["TIER_FREQUENT_SEARCH", "TIER_ARCHIVE"],
        )),
    }
}

#[derive(Serialize)]
struct QueryRequest<'a> {
    query: &'a str,
    metadata: RequestMetadata,
}

#[derive(Serialize)]
struct RequestMetadata {
    tier: QueryTier,
}

#[derive(Deserialize)]
struct QueryResponse {
    result: QueryResults,
}

#[derive(Deserialize)]
struct QueryResults {
    results: Vec<QueryRow>,
}

#[derive(Deserialize)]
struct QueryRow {
    #[serde(rename = "userData")]
    user_data: String,
}

/// Client for one invocation against the DataPrime query API.
pub struct CoralogixClient {
    endpoint: Uri,
    api_key: String,
    tier: QueryTier,
    transport: HttpTransport,
}

impl CoralogixClient {
    /// Validate the configuration. Makes no network call.
    pub fn connect(config: &CoralogixConfig) -> MetricResult<Self> {
        let base = transport::parse_endpoint(&config.base_url, "coralogix base url")?;
        Ok(Self {
            endpoint: transport::join(&base, QUERY_PATH)?,
            api_key: config.api_key.clone(),
            tier: config.query_tier,
            transport: HttpTransport::new()?,
        })
    }

    pub fn endpoint(&self) -> &Uri {
        &self.endpoint
    }

    pub fn tier(&self) -> QueryTier {
        self.tier
    }
}

#[async_trait::async_trait]
impl QueryBackend for CoralogixClient {
    fn value_field(&self) -> &'static str {
        VALUE_FIELD
    }

    async fn execute(&self, query: &str) -> MetricResult<Vec<Option<ResultRecord>>> {
        let body = serde_json::to_vec(&QueryRequest {
            query,
            metadata: RequestMetadata { tier: self.tier },
        })
        .map_err(|e| MetricError::Transport(format!("failed to marshal request body: {e}")))?;

        let req = Request::post(self.endpoint.clone())
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| MetricError::Transport(format!("failed to create request: {e}")))?;

        debug!(endpoint = %self.endpoint, tier = ?self.tier, "sending dataprime query");
        let resp = self.transport.send(req).await?;

        if resp.status != StatusCode::OK {
            return Err(MetricError::Transport(format!(
                "request failed with status {}: {}",
                resp.status.as_u16(),
                resp.text()
            )));
        }

        let records = parse_response(&resp.body)?;
        debug!(results = records.len(), ?records, "coralogix query results");
        Ok(records)
    }
}

/// Decode an NDJSON query reply into result records.
pub fn parse_response(body: &[u8]) -> MetricResult<Vec<Option<ResultRecord>>> {
    let text = String::from_utf8_lossy(body);
    let mut documents: Vec<&str> = text.split('\n').collect();
    if documents.last().is_some_and(|last| last.trim().is_empty()) {
        documents.pop();
    }
    if documents.len() < 2 {
        return Err(MetricError::Format(
            "expected at least 2 JSON objects".to_string(),
        ));
    }

    let response: QueryResponse = serde_json::from_str(documents[1])
        .map_err(|e| MetricError::decode("result object", e))?;

    response
        .result
        .results
        .into_iter()
        .map(|row| {
            serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(&row.user_data)
                .map(|fields| Some(ResultRecord::from(fields)))
                .map_err(|e| MetricError::decode("userData", e))
        })
        .collect()
}
