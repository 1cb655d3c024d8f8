//! rollmetric-backend: query clients for the metric provider.
//!
//! Each backend turns one query string into the backend's result list,
//! as `Option<ResultRecord>` per element, and names the numeric field the
//! normalizer should read from each record.
//!
//! # Backends
//!
//! | Kind | Plugin identifier | Request | Field |
//! |---|---|---|---|
//! | `coralogix` | `argoproj-labs/coralogix-metric-plugin` | `POST /api/v1/query` (NDJSON reply) | `ratio` |
//! | `opensearch` | `argoproj-labs/opensearch-metric-plugin` | `POST /{index}/_search` | `doc_count` |
//!
//! Both go through [`transport::HttpTransport`]: one connection per
//! request, HTTP/1.1, rustls for `https` endpoints.

pub mod coralogix;
pub mod opensearch;
pub mod transport;

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use rollmetric_core::{MetricError, MetricResult, ResultRecord};

pub use coralogix::{CoralogixClient, CoralogixConfig, QueryTier};
pub use opensearch::{OpenSearchClient, OpenSearchConfig};
pub use transport::HttpTransport;

/// A backend able to run one query.
#[async_trait::async_trait]
pub trait QueryBackend: Send + Sync {
    /// Numeric field carried by every result record.
    fn value_field(&self) -> &'static str;

    /// Run `query` and return the backend's result list in order.
    async fn execute(&self, query: &str) -> MetricResult<Vec<Option<ResultRecord>>>;
}

/// Which backend a plugin process serves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Coralogix,
    OpenSearch,
}

impl BackendKind {
    /// Key under which the host passes this backend's payload.
    pub fn plugin_id(self) -> &'static str {
        match self {
            Self::Coralogix => coralogix::PLUGIN_ID,
            Self::OpenSearch => opensearch::PLUGIN_ID,
        }
    }

    /// Decode this backend's configuration from a metric's plugin payload.
    ///
    /// The payload is either an inline JSON object or a string holding
    /// JSON text.
    pub fn decode_config(self, payload: Option<&serde_json::Value>) -> MetricResult<BackendConfig> {
        let plugin_id = self.plugin_id();
        match self {
            Self::Coralogix => decode_payload(plugin_id, payload).map(BackendConfig::Coralogix),
            Self::OpenSearch => decode_payload(plugin_id, payload).map(BackendConfig::OpenSearch),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Coralogix => f.write_str("coralogix"),
            Self::OpenSearch => f.write_str("opensearch"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "coralogix" => Ok(Self::Coralogix),
            "opensearch" => Ok(Self::OpenSearch),
            other => Err(format!(
                "unknown backend {other:?} (expected coralogix or opensearch)"
            )),
        }
    }
}

fn decode_payload<T: DeserializeOwned>(
    plugin_id: &str,
    payload: Option<&serde_json::Value>,
) -> MetricResult<T> {
    let payload = payload.ok_or_else(|| {
        MetricError::Configuration(format!("no configuration found for plugin {plugin_id}"))
    })?;
    match payload {
        serde_json::Value::String(raw) => serde_json::from_str(raw),
        other => T::deserialize(other),
    }
    .map_err(|e| MetricError::decode("plugin configuration", e))
}

/// A decoded backend configuration.
#[derive(Debug, Clone)]
pub enum BackendConfig {
    Coralogix(CoralogixConfig),
    OpenSearch(OpenSearchConfig),
}

impl BackendConfig {
    /// Query text to execute.
    pub fn query(&self) -> &str {
        match self {
            Self::Coralogix(cfg) => &cfg.query,
            Self::OpenSearch(cfg) => &cfg.query,
        }
    }

    /// Build the client. The OpenSearch backend performs its handshake here.
    pub async fn connect(&self) -> MetricResult<Box<dyn QueryBackend>> {
        match self {
            Self::Coralogix(cfg) => Ok(Box::new(CoralogixClient::connect(cfg)?)),
            Self::OpenSearch(cfg) => Ok(Box::new(OpenSearchClient::connect(cfg).await?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn plugin_ids_per_kind() {
        assert_eq!(
            BackendKind::Coralogix.plugin_id(),
            "argoproj-labs/coralogix-metric-plugin"
        );
        assert_eq!(
            BackendKind::OpenSearch.plugin_id(),
            "argoproj-labs/opensearch-metric-plugin"
        );
    }

    #[test]
    fn kind_parses_case_insensitively() {
        assert_eq!("OpenSearch".parse::<BackendKind>(), Ok(BackendKind::OpenSearch));
        assert_eq!("coralogix".parse::<BackendKind>(), Ok(BackendKind::Coralogix));
        assert!("loki".parse::<BackendKind>().is_err());
        assert_eq!(BackendKind::OpenSearch.to_string(), "opensearch");
    }

    #[test]
    fn decodes_inline_object() {
        let payload = json!({"baseUrl": "https://api", "apiKey": "k", "query": "source logs"});
        let cfg = BackendKind::Coralogix.decode_config(Some(&payload)).unwrap();
        assert_eq!(cfg.query(), "source logs");
        assert!(matches!(cfg, BackendConfig::Coralogix(_)));
    }

    #[test]
    fn decodes_json_text() {
        let payload = json!(r#"{"address": "http://os:9200", "index": "logs", "query": "{}"}"#);
        let cfg = BackendKind::OpenSearch.decode_config(Some(&payload)).unwrap();
        match cfg {
            BackendConfig::OpenSearch(cfg) => {
                assert_eq!(cfg.address, "http://os:9200");
                assert_eq!(cfg.index, "logs");
                assert!(!cfg.insecure_skip_verify);
            }
            other => panic!("unexpected config {other:?}"),
        }
    }

    #[test]
    fn malformed_payload_is_decode_error() {
        let payload = json!("{not json");
        let err = BackendKind::Coralogix.decode_config(Some(&payload)).unwrap_err();
        assert!(matches!(err, MetricError::Decode { stage: "plugin configuration", .. }));

        let payload = json!({"insecureSkipVerify": "yes"});
        let err = BackendKind::OpenSearch.decode_config(Some(&payload)).unwrap_err();
        assert!(matches!(err, MetricError::Decode { .. }));
    }

    #[test]
    fn missing_payload_is_configuration_error() {
        let err = BackendKind::OpenSearch.decode_config(None).unwrap_err();
        assert!(matches!(err, MetricError::Configuration(_)));
        assert!(err.to_string().contains("argoproj-labs/opensearch-metric-plugin"));
    }

    #[tokio::test]
    async fn connect_validates_before_network() {
        let cfg = BackendConfig::Coralogix(CoralogixConfig::default());
        let err = cfg.connect().await.err().unwrap();
        assert!(err.to_string().contains("coralogix base url is not configured"));
    }
}
