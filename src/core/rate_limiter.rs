//! Global token bucket throttle built atop `governor`.
//!
//! One bucket is shared by every client (it is not keyed per IP). A request
//! waits up to the configured time for a token and is refused when none
//! arrives in that window.
use std::{net::IpAddr, num::NonZeroU32, time::Duration};

use async_trait::async_trait;
use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};

use crate::{config::models::RestrictorConfig, core::admission::AdmissionGate};

pub type DirectRateLimiterImpl = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

pub struct RestrictorGate {
    limiter: Option<DirectRateLimiterImpl>,
    max_wait: Duration,
}

impl RestrictorGate {
    /// Build the gate; a closed restrictor admits everything.
    pub fn new(config: &RestrictorConfig) -> eyre::Result<Self> {
        if !config.open {
            return Ok(Self::disabled());
        }

        let rate = NonZeroU32::new(config.rate)
            .ok_or_else(|| eyre::eyre!("Restrictor 'rate' must be greater than 0"))?;
        let burst = NonZeroU32::new(config.max_token)
            .ok_or_else(|| eyre::eyre!("Restrictor 'max_token' must be greater than 0"))?;

        tracing::info!(
            "Creating restrictor: rate={}/s, burst={}, wait_time={}s",
            config.rate,
            config.max_token,
            config.wait_time
        );

        Ok(Self {
            limiter: Some(RateLimiter::direct(Quota::per_second(rate).allow_burst(burst))),
            max_wait: Duration::from_secs(config.wait_time),
        })
    }

    pub fn disabled() -> Self {
        Self {
            limiter: None,
            max_wait: Duration::ZERO,
        }
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn is_open(&self) -> bool {
        self.limiter.is_some()
    }
}

#[async_trait]
impl AdmissionGate for RestrictorGate {
    fn name(&self) -> &'static str {
        "restrictor"
    }

    async fn admit(&self, _client_ip: IpAddr) -> bool {
        let Some(limiter) = &self.limiter else {
            return true;
        };
        if limiter.check().is_ok() {
            return true;
        }
        if self.max_wait.is_zero() {
            return false;
        }
        tokio::time::timeout(self.max_wait, limiter.until_ready())
            .await
            .is_ok()
    }
}
