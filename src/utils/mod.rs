pub mod expiring_cache;
pub mod graceful_shutdown;

pub use expiring_cache::ExpiringCache;
pub use graceful_shutdown::{GracefulShutdown, ShutdownReason};
