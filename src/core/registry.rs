//! Service registry backed by a distributed store and a local expiring cache.
//!
//! Discovery (pull) fills the cache once at startup; one watch loop per
//! service (push) keeps it current afterwards. Every cached endpoint set also
//! carries a deadline so a stalled subscription can only serve stale data for
//! a bounded time. The read path never touches the store.
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures_util::{StreamExt, future::join_all};
use thiserror::Error;
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    core::endpoint::EndpointSet,
    ports::service_store::{ServiceStore, WatchEvent, WatchEventKind},
    utils::expiring_cache::ExpiringCache,
};

/// Delay before re-opening a watch subscription that ended or failed.
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("service not found: {0}")]
    ServiceNotFound(String),
}

#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Lifetime of an endpoint set without a refreshing event.
    pub cache_expiration: Duration,
    /// Interval of the expired-entry purge.
    pub clean_up_interval: Duration,
    /// Upper bound on waiting for watch loops to exit in [`ServiceRegistry::stop`].
    pub stop_timeout: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            cache_expiration: Duration::from_secs(600),
            clean_up_interval: Duration::from_secs(60),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

pub struct ServiceRegistry {
    store: Arc<dyn ServiceStore>,
    cache: Arc<ExpiringCache<String, EndpointSet>>,
    options: RegistryOptions,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl ServiceRegistry {
    pub fn new(store: Arc<dyn ServiceStore>, options: RegistryOptions) -> Self {
        Self {
            store,
            cache: Arc::new(ExpiringCache::new(options.cache_expiration)),
            options,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        }
    }

    /// Discover every service, then keep them current. Convenience for process wiring.
    pub async fn start(&self, service_names: &[String]) {
        self.discover_all(service_names).await;
        self.watch(service_names).await;

        let janitor = self.cache.spawn_janitor(
            "service_registry",
            self.options.clean_up_interval,
            self.cancel.child_token(),
        );
        self.tasks.lock().await.push(janitor);
    }

    /// Look up every service concurrently and install what was found.
    ///
    /// Individual failures are logged; a service that could not be discovered
    /// simply has no endpoints until a watch event arrives.
    pub async fn discover_all(&self, service_names: &[String]) {
        let lookups = service_names.iter().map(|name| self.discover(name));
        join_all(lookups).await;
        tracing::info!(
            services = service_names.len(),
            cached = self.cache.len(),
            "Initial service discovery finished"
        );
    }

    async fn discover(&self, service_name: &str) {
        discover_into(self.store.as_ref(), &self.cache, service_name).await;
    }

    /// Cached endpoint set of `service_name`, if present and not expired.
    pub async fn get(&self, service_name: &str) -> Result<EndpointSet, RegistryError> {
        self.cache
            .get(&service_name.to_string())
            .await
            .ok_or_else(|| RegistryError::ServiceNotFound(service_name.to_string()))
    }

    /// Remove a service from the store and from the local cache.
    pub async fn delete(&self, service_name: &str) {
        if let Err(e) = self.store.delete(service_name).await {
            tracing::error!(service = service_name, error = %e, "Failed to delete service from store");
        }
        self.cache.remove(&service_name.to_string()).await;
    }

    /// Spawn one watch loop per service. The loops run until [`stop`](Self::stop).
    pub async fn watch(&self, service_names: &[String]) {
        if self.stopped.load(Ordering::Acquire) {
            tracing::warn!("Registry is stopped, ignoring watch request");
            return;
        }

        let mut tasks = self.tasks.lock().await;
        for name in service_names {
            let store = Arc::clone(&self.store);
            let cache = Arc::clone(&self.cache);
            let cancel = self.cancel.child_token();
            let name = name.clone();
            tasks.push(tokio::spawn(async move {
                watch_loop(store, cache, name, cancel).await;
            }));
        }
    }

    /// Stop watch loops, wait for them (bounded), flush the cache and close the store.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();

        let handles: Vec<_> = self.tasks.lock().await.drain(..).collect();
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        match tokio::time::timeout(self.options.stop_timeout, join_all(handles)).await {
            Ok(_) => tracing::debug!("All registry watch loops exited"),
            Err(_) => {
                tracing::error!(
                    timeout = ?self.options.stop_timeout,
                    "Registry watcher stop timeout"
                );
                aborts.iter().for_each(|a| a.abort());
            }
        }

        self.cache.clear().await;
        self.store.close().await;
        tracing::info!("Service registry stopped");
    }

    /// Number of cached services (expired entries included until purged).
    pub fn cached_services(&self) -> usize {
        self.cache.len()
    }
}

async fn discover_into(
    store: &dyn ServiceStore,
    cache: &ExpiringCache<String, EndpointSet>,
    service_name: &str,
) {
    match store.get(service_name).await {
        Ok(Some(value)) => match EndpointSet::decode(&value) {
            Ok(set) if !set.is_empty() => {
                tracing::debug!(service = service_name, endpoints = set.len(), "Discovered service");
                cache.insert(service_name.to_string(), set).await;
            }
            Ok(_) => tracing::debug!(service = service_name, "Service has no endpoints yet"),
            Err(e) => {
                tracing::error!(service = service_name, error = %e, "Undecodable endpoint list")
            }
        },
        Ok(None) => tracing::debug!(service = service_name, "Service not registered yet"),
        Err(e) => tracing::error!(service = service_name, error = %e, "Discover service error"),
    }
}

async fn watch_loop(
    store: Arc<dyn ServiceStore>,
    cache: Arc<ExpiringCache<String, EndpointSet>>,
    service_name: String,
    cancel: CancellationToken,
) {
    let mut resubscribe = false;
    while !cancel.is_cancelled() {
        if resubscribe {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(WATCH_RETRY_DELAY) => {}
            }
            // events may have been missed while unsubscribed
            discover_into(store.as_ref(), &cache, &service_name).await;
        }
        resubscribe = true;

        let mut stream = tokio::select! {
            _ = cancel.cancelled() => break,
            opened = store.watch(&service_name) => match opened {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::error!(service = %service_name, error = %e, "Failed to open watch");
                    continue;
                }
            },
        };
        tracing::debug!(service = %service_name, "Watch subscription opened");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = stream.next() => match next {
                    Some(Ok(batch)) => apply_events(&cache, &batch).await,
                    Some(Err(e)) => {
                        tracing::warn!(service = %service_name, error = %e, "Watch stream error");
                        break;
                    }
                    None => {
                        tracing::warn!(service = %service_name, "Watch stream ended");
                        break;
                    }
                },
            }
        }
    }
    tracing::debug!(service = %service_name, "Watch loop exited");
}

/// Apply one watch batch in order: PUT replaces (and refreshes), anything else removes.
pub(crate) async fn apply_events(cache: &ExpiringCache<String, EndpointSet>, events: &[WatchEvent]) {
    for event in events {
        match event.kind {
            WatchEventKind::Put => match EndpointSet::decode(&event.value) {
                Ok(set) => {
                    tracing::info!(service = %event.key, endpoints = set.len(), "Service updated");
                    cache.insert(event.key.clone(), set).await;
                }
                Err(e) => {
                    tracing::error!(service = %event.key, error = %e, "Ignoring undecodable PUT event")
                }
            },
            WatchEventKind::Delete => {
                tracing::info!(service = %event.key, "Service removed");
                cache.remove(&event.key).await;
            }
        }
    }
}
