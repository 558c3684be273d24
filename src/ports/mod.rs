//! Ports: the traits the core depends on. Adapters under `crate::adapters`
//! implement them against real networks, tests implement them in memory.
pub mod http_client;
pub mod service_store;
pub mod telemetry;
