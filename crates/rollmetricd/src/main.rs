//! rollmetricd: the metric provider plugin process.
//!
//! Launched by the rollout controller with `ARGO_ROLLOUTS_RPC_PLUGIN`
//! set. Serves one backend on a loopback port and announces the address
//! with a single handshake line on stdout. Logs go to stderr.
//!
//! # Usage
//!
//! ```text
//! rollmetricd --backend opensearch --query-timeout 10s
//! rollmetricd --settings /etc/rollmetric/rollmetricd.toml --log-format json
//! ```

mod settings;

use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rollmetric_backend::BackendKind;
use rollmetric_plugin::server::{MAGIC_COOKIE_KEY, check_handshake, handshake_line};
use rollmetric_plugin::{MetricProvider, serve};

use crate::settings::Settings;

const DEFAULT_LOG_FILTER: &str = "info,rollmetric=debug";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "rollmetricd", about = "Rollout analysis metric provider plugin", version)]
struct Cli {
    /// Backend to serve (coralogix or opensearch).
    #[arg(long)]
    backend: Option<BackendKind>,

    /// Settings file (TOML).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Loopback port to listen on; 0 picks a free one.
    #[arg(long)]
    port: Option<u16>,

    /// Deadline for one measurement's connect and query ("30s", "500ms").
    #[arg(long)]
    query_timeout: Option<String>,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

impl Cli {
    /// Settings from the file (if any) with flags applied on top.
    fn resolve_settings(&self) -> anyhow::Result<Settings> {
        let mut settings = match &self.settings {
            Some(path) => Settings::from_file(path)?,
            None => Settings::default(),
        };
        if let Some(backend) = self.backend {
            settings.backend = backend;
        }
        if let Some(port) = self.port {
            settings.port = port;
        }
        if let Some(timeout) = &self.query_timeout {
            settings.query_timeout = timeout.clone();
        }
        Ok(settings)
    }
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    check_handshake(std::env::var(MAGIC_COOKIE_KEY).ok().as_deref())?;

    let settings = cli.resolve_settings()?;
    let query_timeout = settings.query_timeout()?;
    let provider = MetricProvider::new(settings.backend).with_query_timeout(query_timeout);

    let listener =
        tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], settings.port))).await?;
    let addr = listener.local_addr()?;
    info!(
        backend = %settings.backend,
        plugin = settings.backend.plugin_id(),
        %addr,
        ?query_timeout,
        "metric provider plugin starting"
    );

    // The host reads exactly one line from stdout.
    {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{}", handshake_line(addr))?;
        stdout.flush()?;
    }

    serve(Arc::new(provider), listener, shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to install ctrl-c handler");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
