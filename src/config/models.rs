//! Configuration data structures for Switchyard.
//!
//! These types map directly to YAML (also JSON / TOML) configuration files. Field names
//! follow the snake_case keys operators already write for the gateway, and every section
//! carries defaults so that a minimal config only needs the services and the etcd
//! endpoints.
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const LOAD_BALANCE_MODE_RANDOM: &str = "random";
pub const LOAD_BALANCE_MODE_IP_HASH: &str = "ip_hash";
pub const LOAD_BALANCE_MODE_WEIGHT: &str = "weight";
pub const LOAD_BALANCE_MODE_ROUND_ROBIN: &str = "round_robin";

/// Collector switch value selecting the Elasticsearch bulk writer.
pub const COLLECTOR_SWITCH_ES: &str = "es";

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_timeout() -> u64 {
    10
}

fn default_load_balance_mode() -> String {
    LOAD_BALANCE_MODE_ROUND_ROBIN.to_string()
}

/// A service the gateway discovers and proxies to.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ReverseHost {
    pub service_name: String,
    /// Overrides the global `load_balance_mode` for this service.
    #[serde(default)]
    pub load_balance_mode: Option<String>,
}

impl ReverseHost {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            load_balance_mode: None,
        }
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.load_balance_mode = Some(mode.into());
        self
    }
}

/// etcd connection settings and registry cache lifetimes (all durations in seconds).
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
    pub username: String,
    pub password: String,
    pub dial_timeout: u64,
    pub dial_keepalive_time: u64,
    /// Lifetime of a discovered endpoint set without a refreshing watch event.
    pub local_cache_default_expiration: u64,
    /// Interval of the background purge of expired cache entries.
    pub local_cache_clean_up_time: u64,
    /// Timeout of point lookups and deletes.
    pub request_timeout: u64,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            username: String::new(),
            password: String::new(),
            dial_timeout: 5,
            dial_keepalive_time: 30,
            local_cache_default_expiration: 600,
            local_cache_clean_up_time: 60,
            request_timeout: 3,
        }
    }
}

impl EtcdConfig {
    pub fn cache_expiration(&self) -> Duration {
        Duration::from_secs(self.local_cache_default_expiration)
    }

    pub fn clean_up_interval(&self) -> Duration {
        Duration::from_secs(self.local_cache_clean_up_time)
    }
}

/// Lifetimes of the per (client, service) sticky route cache.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RouteCacheConfig {
    pub default_expiration: u64,
    pub clean_up_interval: u64,
}

impl Default for RouteCacheConfig {
    fn default() -> Self {
        Self {
            default_expiration: 3,
            clean_up_interval: 10,
        }
    }
}

/// Outbound connection settings (seconds).
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpTransportConfig {
    pub dial_time_out: u64,
    pub dial_keep_alive: u64,
    pub max_idle_conns_per_host: usize,
    pub idle_conn_timeout: u64,
    /// Upper bound on waiting for the upstream response head. 0 disables it.
    pub response_header_timeout: u64,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            dial_time_out: 5,
            dial_keep_alive: 30,
            max_idle_conns_per_host: 32,
            idle_conn_timeout: 90,
            response_header_timeout: 30,
        }
    }
}

/// Global token bucket throttle.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct RestrictorConfig {
    pub open: bool,
    /// Tokens refilled per second.
    pub rate: u32,
    /// Bucket capacity.
    pub max_token: u32,
    /// Seconds a request may wait for a token.
    pub wait_time: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ElasticSearchConfig {
    pub username: String,
    pub password: String,
    pub host: String,
    pub port: String,
    pub index: String,
    pub bulk_max_count: usize,
    /// Seconds between forced flushes of a partial buffer.
    pub flush_interval: u64,
    /// Seconds allowed for one bulk call.
    pub request_timeout: u64,
    pub queue_capacity: usize,
    pub max_flush_workers: usize,
}

impl Default for ElasticSearchConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            host: "http://127.0.0.1".to_string(),
            port: "9200".to_string(),
            index: "switchyard-transmit".to_string(),
            bulk_max_count: 20,
            flush_interval: 5,
            request_timeout: 5,
            queue_capacity: 200,
            max_flush_workers: 100,
        }
    }
}

impl ElasticSearchConfig {
    pub fn base_url(&self) -> String {
        format!("{}:{}", self.host.trim_end_matches('/'), self.port)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CollectorConfig {
    pub switch: String,
    pub es: ElasticSearchConfig,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            switch: COLLECTOR_SWITCH_ES.to_string(),
            es: ElasticSearchConfig::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub reverse_host: Vec<ReverseHost>,
    #[serde(default)]
    pub etcd: EtcdConfig,
    /// Global shutdown timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_load_balance_mode")]
    pub load_balance_mode: String,
    /// Host used when a service cannot be resolved. Empty disables the fallback.
    #[serde(default)]
    pub default_url: String,
    #[serde(default)]
    pub route_cache: RouteCacheConfig,
    #[serde(default)]
    pub http_transport: HttpTransportConfig,
    #[serde(default)]
    pub ip_table: Vec<String>,
    #[serde(default)]
    pub restrictor: RestrictorConfig,
    #[serde(default)]
    pub open_collector: bool,
    #[serde(default)]
    pub collector: CollectorConfig,
}

impl GatewayConfig {
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::default()
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn service_names(&self) -> Vec<String> {
        self.reverse_host
            .iter()
            .map(|host| host.service_name.clone())
            .collect()
    }

    /// Load balance mode for a service: its own override, else the global mode.
    pub fn mode_for(&self, service_name: &str) -> &str {
        self.reverse_host
            .iter()
            .find(|host| host.service_name == service_name)
            .and_then(|host| host.load_balance_mode.as_deref())
            .unwrap_or(&self.load_balance_mode)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            reverse_host: Vec::new(),
            etcd: EtcdConfig::default(),
            timeout: default_timeout(),
            load_balance_mode: default_load_balance_mode(),
            default_url: String::new(),
            route_cache: RouteCacheConfig::default(),
            http_transport: HttpTransportConfig::default(),
            ip_table: Vec::new(),
            restrictor: RestrictorConfig::default(),
            open_collector: false,
            collector: CollectorConfig::default(),
        }
    }
}

/// Builder for GatewayConfig, mostly used by embedders and tests.
#[derive(Default)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    pub fn service(mut self, host: ReverseHost) -> Self {
        self.config.reverse_host.push(host);
        self
    }

    pub fn load_balance_mode(mut self, mode: impl Into<String>) -> Self {
        self.config.load_balance_mode = mode.into();
        self
    }

    pub fn default_url(mut self, url: impl Into<String>) -> Self {
        self.config.default_url = url.into();
        self
    }

    pub fn blacklist(mut self, ip: impl Into<String>) -> Self {
        self.config.ip_table.push(ip.into());
        self
    }

    pub fn restrictor(mut self, restrictor: RestrictorConfig) -> Self {
        self.config.restrictor = restrictor;
        self
    }

    pub fn etcd(mut self, etcd: EtcdConfig) -> Self {
        self.config.etcd = etcd;
        self
    }

    pub fn build(self) -> GatewayConfig {
        self.config
    }
}
