//! Concurrent key/value cache with per-entry expiration.
//!
//! Backs both the service registry cache and the sticky route cache. Reads
//! never observe an entry past its deadline; memory held by expired entries is
//! reclaimed by [`ExpiringCache::purge_expired`], which callers run
//! periodically (see [`ExpiringCache::spawn_janitor`]).
use std::{hash::Hash, sync::Arc, time::Duration};

use scc::HashMap;
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

/// Shortest purge period a janitor will run at.
pub const MIN_JANITOR_INTERVAL: Duration = Duration::from_secs(1);

// Deadline used when `now + ttl` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

fn deadline_after(ttl: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(ttl)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

struct Slot<V> {
    value: V,
    expires_at: Instant,
}

pub struct ExpiringCache<K, V> {
    entries: HashMap<K, Slot<V>>,
    default_ttl: Duration,
}

impl<K, V> ExpiringCache<K, V>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Insert or replace with the default lifetime.
    pub async fn insert(&self, key: K, value: V) {
        self.insert_with_ttl(key, value, self.default_ttl).await;
    }

    pub async fn insert_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let slot = Slot {
            value,
            expires_at: deadline_after(ttl),
        };
        let _ = self.entries.upsert_async(key, slot).await;
    }

    /// Returns a clone of the live value, `None` if absent or expired.
    pub async fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        self.entries
            .read_async(key, |_, slot| {
                (slot.expires_at > now).then(|| slot.value.clone())
            })
            .await
            .flatten()
    }

    pub async fn remove(&self, key: &K) -> bool {
        self.entries.remove_async(key).await.is_some()
    }

    pub async fn clear(&self) {
        self.entries.clear_async().await;
    }

    /// Drop every entry whose deadline has passed. Returns how many were dropped.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut purged = 0;
        self.entries
            .retain_async(|_, slot| {
                let keep = slot.expires_at > now;
                if !keep {
                    purged += 1;
                }
                keep
            })
            .await;
        purged
    }

    /// Number of stored entries, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `purge_expired` every `interval` until `cancel` fires. Intervals
    /// below [`MIN_JANITOR_INTERVAL`] are raised to it.
    pub fn spawn_janitor(
        self: &Arc<Self>,
        name: &'static str,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(MIN_JANITOR_INTERVAL));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = cache.purge_expired().await;
                        if purged > 0 {
                            tracing::debug!(cache = name, purged, "Purged expired cache entries");
                        }
                    }
                }
            }
            tracing::debug!(cache = name, "Cache janitor stopped");
        })
    }
}
