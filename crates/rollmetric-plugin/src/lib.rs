//! rollmetric-plugin: the metric provider as seen by the rollout controller.
//!
//! # Architecture
//!
//! ```text
//! host ──HTTP/JSON──▶ server::build_router
//!                       └── dyn MetricProviderPlugin
//!                             └── MetricProvider (one measurement per Run)
//!                                   ├── BackendKind::decode_config
//!                                   ├── BackendConfig::connect ─┐ under one
//!                                   ├── QueryBackend::execute ──┘ deadline
//!                                   ├── normalize
//!                                   └── SuccessEvaluator::evaluate
//! ```
//!
//! `PluginClient` is the host side of the same interface, used to drive a
//! served plugin over its handshake address.

pub mod client;
pub mod plugin;
pub mod provider;
pub mod server;

pub use client::PluginClient;
pub use plugin::{MetricProviderPlugin, PROVIDER_TYPE};
pub use provider::{DEFAULT_QUERY_TIMEOUT, METADATA_QUERY_KEY, MetricProvider};
pub use server::{ServeError, build_router, serve};
