pub mod admission;
pub mod dispatcher;
pub mod endpoint;
pub mod load_balancer;
pub mod rate_limiter;
pub mod registry;
pub mod telemetry;

pub use admission::{AdmissionChain, AdmissionGate, IpBlacklist};
pub use dispatcher::{DispatchError, Dispatcher, DispatcherOptions};
pub use endpoint::{Endpoint, EndpointSet};
pub use load_balancer::{BalancerRegistry, LoadBalancingStrategy, ServiceBalancers};
pub use rate_limiter::RestrictorGate;
pub use registry::{RegistryError, RegistryOptions, ServiceRegistry};
pub use telemetry::{TelemetryHandle, TelemetryOptions, TelemetryRecord, TelemetrySink};
