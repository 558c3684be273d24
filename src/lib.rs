//! Switchyard - a reverse-proxy gateway with etcd-backed service discovery.
//!
//! Requests arrive as `/<service>/<rest>`. The gateway resolves `<service>` to one of
//! the hosts currently registered for it in etcd, rewrites the request to
//! `http://<host>/<rest>` and forwards it. Around that path sit an admission chain
//! (IP blacklist, global token bucket), a short-lived sticky route cache per client
//! and service, and a best-effort telemetry sink that batches one record per request
//! into Elasticsearch.
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use switchyard::{
//!     adapters::{EtcdStore, HttpClientAdapter, HttpHandler},
//!     core::{
//!         AdmissionChain, BalancerRegistry, Dispatcher, DispatcherOptions, RegistryOptions,
//!         ServiceBalancers, ServiceRegistry, TelemetryHandle,
//!     },
//! };
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = switchyard::config::load_validated_config("config.yaml")?;
//! let store = Arc::new(EtcdStore::connect(&config.etcd).await?);
//! let registry = Arc::new(ServiceRegistry::new(store, RegistryOptions::default()));
//! registry.start(&config.service_names()).await;
//!
//! let dispatcher = Dispatcher::new(
//!     registry,
//!     ServiceBalancers::from_config(&config, &BalancerRegistry::with_builtin())?,
//!     AdmissionChain::from_config(&config)?,
//!     Arc::new(HttpClientAdapter::new(&config.http_transport)?),
//!     TelemetryHandle::inactive(),
//!     DispatcherOptions::from_config(&config),
//! );
//! let app = HttpHandler::new(Arc::new(dispatcher)).router();
//! # let _ = app;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters** (implementations) while keeping
//! the dispatch logic inside `core`. The etcd store, the outbound HTTP client and the
//! telemetry bulk writer can each be swapped for in-memory doubles, which is how the
//! test suite drives the dispatcher.
//!
//! # Concurrency & Data Structures
//! Shared maps (endpoint cache, route cache) are `scc::HashMap`s accessed through their
//! async API only, so request handlers never block a runtime worker.
pub mod config;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{ElasticsearchWriter, EtcdStore, HttpClientAdapter, HttpHandler},
    core::{Dispatcher, ServiceRegistry, TelemetrySink},
    ports::{http_client::HttpClient, service_store::ServiceStore, telemetry::BulkWriter},
    utils::GracefulShutdown,
};
