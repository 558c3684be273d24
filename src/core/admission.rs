//! Admission chain run before any upstream work.
//!
//! Gates are evaluated in registration order and the first refusal wins. The
//! chain only knows the [`AdmissionGate`] trait, so new gates plug in without
//! touching the dispatcher.
use std::{
    collections::HashSet,
    net::{AddrParseError, IpAddr, Ipv4Addr},
    sync::Arc,
};

use async_trait::async_trait;

use crate::{config::GatewayConfig, core::rate_limiter::RestrictorGate};

/// Map the forms of one client onto a single key: IPv4-mapped IPv6 becomes
/// IPv4, and the IPv6 loopback becomes `127.0.0.1`.
pub fn normalize_client_ip(ip: IpAddr) -> IpAddr {
    match ip.to_canonical() {
        IpAddr::V6(v6) if v6.is_loopback() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        other => other,
    }
}

#[async_trait]
pub trait AdmissionGate: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    async fn admit(&self, client_ip: IpAddr) -> bool;
}

/// Static set of denied client addresses.
pub struct IpBlacklist {
    denied: HashSet<IpAddr>,
}

impl IpBlacklist {
    pub fn new(denied: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            denied: denied.into_iter().map(normalize_client_ip).collect(),
        }
    }

    pub fn from_entries(entries: &[String]) -> Result<Self, AddrParseError> {
        let denied = entries
            .iter()
            .map(|entry| entry.trim().parse::<IpAddr>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(denied))
    }

    pub fn len(&self) -> usize {
        self.denied.len()
    }

    pub fn is_empty(&self) -> bool {
        self.denied.is_empty()
    }
}

#[async_trait]
impl AdmissionGate for IpBlacklist {
    fn name(&self) -> &'static str {
        "ip_blacklist"
    }

    async fn admit(&self, client_ip: IpAddr) -> bool {
        !self.denied.contains(&normalize_client_ip(client_ip))
    }
}

#[derive(Default, Clone)]
pub struct AdmissionChain {
    gates: Vec<Arc<dyn AdmissionGate>>,
}

impl AdmissionChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a gate; it runs after every gate registered before it.
    pub fn with_gate(mut self, gate: Arc<dyn AdmissionGate>) -> Self {
        self.gates.push(gate);
        self
    }

    /// Blacklist first, then the global restrictor.
    pub fn from_config(config: &GatewayConfig) -> eyre::Result<Self> {
        let blacklist = IpBlacklist::from_entries(&config.ip_table)
            .map_err(|e| eyre::eyre!("Invalid ip_table entry: {e}"))?;
        let restrictor = RestrictorGate::new(&config.restrictor)?;

        tracing::info!(
            blacklisted = blacklist.len(),
            restrictor_open = config.restrictor.open,
            "Admission chain configured"
        );

        Ok(Self::new()
            .with_gate(Arc::new(blacklist))
            .with_gate(Arc::new(restrictor)))
    }

    pub fn len(&self) -> usize {
        self.gates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }

    pub async fn admit(&self, client_ip: IpAddr) -> bool {
        for gate in &self.gates {
            if !gate.admit(client_ip).await {
                tracing::info!(client_ip = %client_ip, gate = gate.name(), "Request rejected");
                return false;
            }
        }
        true
    }
}
