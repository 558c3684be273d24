use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use rand::Rng;
use thiserror::Error;

use crate::{
    config::{
        GatewayConfig, LOAD_BALANCE_MODE_IP_HASH, LOAD_BALANCE_MODE_RANDOM,
        LOAD_BALANCE_MODE_ROUND_ROBIN, LOAD_BALANCE_MODE_WEIGHT,
    },
    core::endpoint::Endpoint,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BalanceError {
    #[error("unknown load balance mode '{mode}' for {scope}")]
    UnknownMode { mode: String, scope: String },
}

/// Trait defining the interface for load balancing strategies
pub trait LoadBalancingStrategy: Send + Sync + 'static {
    /// Select the address of one endpoint for a request from `client_ip`.
    /// Returns `None` only when `endpoints` is empty.
    fn select_target(&self, endpoints: &[Endpoint], client_ip: &str) -> Option<String>;
    /// Create a new instance of this strategy as a shared trait object
    fn shared(self) -> Arc<dyn LoadBalancingStrategy>
    where
        Self: Sized,
    {
        Arc::new(self)
    }
}

/// Round-robin load balancing strategy
///
/// The counter is shared by every service using this instance and is folded
/// back below the current set size so it never grows without bound.
pub struct RoundRobinStrategy {
    counter: AtomicUsize,
}

impl Default for RoundRobinStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundRobinStrategy {
    /// Create a new round-robin strategy
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl LoadBalancingStrategy for RoundRobinStrategy {
    fn select_target(&self, endpoints: &[Endpoint], _client_ip: &str) -> Option<String> {
        if endpoints.is_empty() {
            return None;
        }
        let len = endpoints.len();
        let current = self.counter.load(Ordering::Relaxed);
        if current >= len {
            // racy under concurrent shrink; the index below is still taken modulo len
            let _ = self.counter.compare_exchange(
                current,
                current % len,
                Ordering::Relaxed,
                Ordering::Relaxed,
            );
        }
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        Some(endpoints[count % len].address.clone())
    }
}

/// Random selection load balancing strategy
pub struct RandomStrategy;

impl Default for RandomStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl RandomStrategy {
    /// Create a new random selection strategy
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancingStrategy for RandomStrategy {
    fn select_target(&self, endpoints: &[Endpoint], _client_ip: &str) -> Option<String> {
        if endpoints.is_empty() {
            return None;
        }
        let index = rand::rng().random_range(0..endpoints.len());
        Some(endpoints[index].address.clone())
    }
}

/// Client affinity: CRC32 of the client IP modulo the set size.
///
/// Affinity holds only while the set keeps its size and order.
pub struct IpHashStrategy;

impl LoadBalancingStrategy for IpHashStrategy {
    fn select_target(&self, endpoints: &[Endpoint], client_ip: &str) -> Option<String> {
        if endpoints.is_empty() {
            return None;
        }
        let hash = crc32fast::hash(client_ip.as_bytes()) as usize;
        Some(endpoints[hash % endpoints.len()].address.clone())
    }
}

/// Weighted random selection over the cumulative weight range.
pub struct WeightedStrategy;

impl LoadBalancingStrategy for WeightedStrategy {
    fn select_target(&self, endpoints: &[Endpoint], _client_ip: &str) -> Option<String> {
        let first = endpoints.first()?;
        let total: u64 = endpoints.iter().map(|e| u64::from(e.weight)).sum();
        if total == 0 {
            return Some(first.address.clone());
        }

        let draw = rand::rng().random_range(0..total);
        let mut cumulative = 0u64;
        for endpoint in endpoints {
            cumulative += u64::from(endpoint.weight);
            if cumulative > draw {
                return Some(endpoint.address.clone());
            }
        }
        Some(first.address.clone())
    }
}

/// Strategies registered by mode name.
///
/// Built once at startup and handed to the dispatcher; new strategies can be
/// registered under their own name before the dispatcher is built.
pub struct BalancerRegistry {
    strategies: HashMap<String, Arc<dyn LoadBalancingStrategy>>,
}

impl Default for BalancerRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl BalancerRegistry {
    pub fn empty() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    /// Registry holding `random`, `ip_hash`, `weight` and `round_robin`.
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(LOAD_BALANCE_MODE_RANDOM, RandomStrategy::new().shared());
        registry.register(LOAD_BALANCE_MODE_IP_HASH, IpHashStrategy.shared());
        registry.register(LOAD_BALANCE_MODE_WEIGHT, WeightedStrategy.shared());
        registry.register(
            LOAD_BALANCE_MODE_ROUND_ROBIN,
            RoundRobinStrategy::new().shared(),
        );
        registry
    }

    pub fn register(&mut self, mode: &str, strategy: Arc<dyn LoadBalancingStrategy>) {
        self.strategies.insert(mode.to_string(), strategy);
    }

    pub fn get(&self, mode: &str) -> Option<Arc<dyn LoadBalancingStrategy>> {
        self.strategies.get(mode).cloned()
    }
}

/// Strategy per configured service, resolved once so request time never sees
/// an unknown mode.
pub struct ServiceBalancers {
    default: Arc<dyn LoadBalancingStrategy>,
    per_service: HashMap<String, Arc<dyn LoadBalancingStrategy>>,
}

impl ServiceBalancers {
    pub fn from_config(
        config: &GatewayConfig,
        registry: &BalancerRegistry,
    ) -> Result<Self, BalanceError> {
        let default =
            registry
                .get(&config.load_balance_mode)
                .ok_or_else(|| BalanceError::UnknownMode {
                    mode: config.load_balance_mode.clone(),
                    scope: "load_balance_mode".to_string(),
                })?;

        let mut per_service = HashMap::new();
        for host in &config.reverse_host {
            if let Some(mode) = &host.load_balance_mode {
                let strategy = registry.get(mode).ok_or_else(|| BalanceError::UnknownMode {
                    mode: mode.clone(),
                    scope: format!("service '{}'", host.service_name),
                })?;
                per_service.insert(host.service_name.clone(), strategy);
            }
        }

        Ok(Self {
            default,
            per_service,
        })
    }

    pub fn for_service(&self, service_name: &str) -> &Arc<dyn LoadBalancingStrategy> {
        self.per_service.get(service_name).unwrap_or(&self.default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReverseHost;

    fn endpoints(pairs: &[(&str, u32)]) -> Vec<Endpoint> {
        pairs.iter().map(|(a, w)| Endpoint::new(*a, *w)).collect()
    }

    #[test]
    fn test_round_robin_strategy() {
        let strategy = RoundRobinStrategy::new();
        let targets = endpoints(&[("server1", 1), ("server2", 1), ("server3", 1)]);

        assert_eq!(strategy.select_target(&targets, "ip"), Some("server1".to_string()));
        assert_eq!(strategy.select_target(&targets, "ip"), Some("server2".to_string()));
        assert_eq!(strategy.select_target(&targets, "ip"), Some("server3".to_string()));
        assert_eq!(strategy.select_target(&targets, "ip"), Some("server1".to_string())); // Wraps around
    }

    #[test]
    fn test_round_robin_alternates_over_two() {
        let strategy = RoundRobinStrategy::new();
        let targets = endpoints(&[("a", 1), ("b", 1)]);

        let picks: Vec<_> = (0..10)
            .map(|_| strategy.select_target(&targets, "ip").unwrap())
            .collect();
        for pair in picks.windows(2) {
            assert_ne!(pair[0], pair[1]);
        }
        assert!(strategy.counter.load(Ordering::Relaxed) <= targets.len());
    }

    #[test]
    fn test_round_robin_adapts_to_shrunk_set() {
        let strategy = RoundRobinStrategy::new();
        let big = endpoints(&[("a", 1), ("b", 1), ("c", 1), ("d", 1)]);
        for _ in 0..3 {
            strategy.select_target(&big, "ip");
        }

        let small = endpoints(&[("x", 1)]);
        assert_eq!(strategy.select_target(&small, "ip"), Some("x".to_string()));
        assert_eq!(strategy.select_target(&small, "ip"), Some("x".to_string()));
    }

    #[test]
    fn test_empty_targets() {
        let targets: Vec<Endpoint> = vec![];
        assert_eq!(RoundRobinStrategy::new().select_target(&targets, "ip"), None);
        assert_eq!(RandomStrategy::new().select_target(&targets, "ip"), None);
        assert_eq!(IpHashStrategy.select_target(&targets, "ip"), None);
        assert_eq!(WeightedStrategy.select_target(&targets, "ip"), None);
    }

    #[test]
    fn test_random_strategy() {
        let strategy = RandomStrategy::new();
        let targets = endpoints(&[("server1", 1), ("server2", 1), ("server3", 1)]);

        let selected = strategy.select_target(&targets, "ip").unwrap();
        assert!(targets.iter().any(|e| e.address == selected));
    }

    #[test]
    fn test_ip_hash_is_stable() {
        let targets = endpoints(&[("a", 1), ("b", 1), ("c", 1)]);
        let first = IpHashStrategy.select_target(&targets, "192.168.1.20");
        for _ in 0..20 {
            assert_eq!(IpHashStrategy.select_target(&targets, "192.168.1.20"), first);
        }

        let expected = crc32fast::hash(b"192.168.1.20") as usize % 3;
        assert_eq!(first, Some(targets[expected].address.clone()));
    }

    #[test]
    fn test_ip_hash_single_endpoint() {
        let targets = endpoints(&[("only", 1)]);
        for ip in ["1.1.1.1", "10.0.0.7", "127.0.0.1", "fe80::1"] {
            assert_eq!(IpHashStrategy.select_target(&targets, ip), Some("only".to_string()));
        }
    }

    #[test]
    fn test_weighted_distribution() {
        let targets = endpoints(&[("A", 1), ("B", 3)]);
        let trials = 40_000;
        let mut b_count = 0usize;
        for _ in 0..trials {
            if WeightedStrategy.select_target(&targets, "ip").unwrap() == "B" {
                b_count += 1;
            }
        }
        let a_count = trials - b_count;
        let ratio = b_count as f64 / a_count as f64;
        assert!((2.6..3.4).contains(&ratio), "ratio was {ratio}");
    }

    #[test]
    fn test_weighted_never_picks_zero_weight() {
        let targets = endpoints(&[("zero", 0), ("one", 1), ("also-zero", 0)]);
        for _ in 0..1_000 {
            assert_eq!(WeightedStrategy.select_target(&targets, "ip"), Some("one".to_string()));
        }
    }

    #[test]
    fn test_weighted_all_zero_falls_back_to_first() {
        let targets = endpoints(&[("first", 0), ("second", 0)]);
        assert_eq!(WeightedStrategy.select_target(&targets, "ip"), Some("first".to_string()));
    }

    #[test]
    fn test_service_balancers_from_config() {
        let config = GatewayConfig::builder()
            .load_balance_mode(LOAD_BALANCE_MODE_ROUND_ROBIN)
            .service(ReverseHost::new("users").with_mode(LOAD_BALANCE_MODE_IP_HASH))
            .build();
        let balancers = ServiceBalancers::from_config(&config, &BalancerRegistry::with_builtin())
            .unwrap();

        let targets = endpoints(&[("a", 1), ("b", 1)]);
        let sticky = balancers.for_service("users");
        let first = sticky.select_target(&targets, "10.0.0.1");
        assert_eq!(sticky.select_target(&targets, "10.0.0.1"), first);
        assert!(balancers.for_service("orders").select_target(&targets, "x").is_some());
    }

    #[test]
    fn test_unknown_mode_is_rejected() {
        let config = GatewayConfig::builder()
            .service(ReverseHost::new("users").with_mode("least_conn"))
            .build();
        let result = ServiceBalancers::from_config(&config, &BalancerRegistry::with_builtin());

        assert!(matches!(result, Err(BalanceError::UnknownMode { mode, .. }) if mode == "least_conn"));
    }
}
