//! rollmetricd.toml settings.
//!
//! ```toml
//! backend = "opensearch"
//! port = 0
//! query_timeout = "30s"
//! ```
//!
//! Every key is optional. Command-line flags override the file.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use rollmetric_backend::BackendKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Backend this process serves.
    pub backend: BackendKind,
    /// Loopback port for the adapter. 0 picks a free port.
    pub port: u16,
    /// Deadline for connect + query, e.g. "30s", "500ms", "1m".
    pub query_timeout: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            port: 0,
            query_timeout: "30s".to_string(),
        }
    }
}

impl Settings {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;
        let settings: Settings = toml::from_str(&content)
            .with_context(|| format!("invalid settings file {}", path.display()))?;
        Ok(settings)
    }

    pub fn query_timeout(&self) -> anyhow::Result<Duration> {
        match parse_duration(&self.query_timeout) {
            Some(d) if !d.is_zero() => Ok(d),
            _ => anyhow::bail!("invalid query timeout {:?}", self.query_timeout),
        }
    }
}

/// Parse "30s", "500ms", "1m", or a bare number of seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
