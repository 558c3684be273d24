//! In-process [`ServiceStore`] with etcd-like watch semantics.
//!
//! Every mutation is broadcast to the open watch streams of its key. Handy for
//! tests and for embedding the gateway where no etcd cluster is available.
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use scc::HashMap;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};
use tokio_util::sync::CancellationToken;

use crate::ports::service_store::{
    ServiceStore, StoreError, StoreResult, WatchEvent, WatchStream,
};

const EVENT_BUFFER: usize = 256;

pub struct MemoryStore {
    data: HashMap<String, Bytes>,
    events: broadcast::Sender<WatchEvent>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            data: HashMap::new(),
            events,
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Store a value and notify watchers of `key` with a PUT event.
    pub async fn put(&self, key: &str, value: impl Into<Bytes>) {
        let value = value.into();
        let _ = self.data.upsert_async(key.to_string(), value.clone()).await;
        // no receivers is fine
        let _ = self.events.send(WatchEvent::put(key, value));
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.is_closed() {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ServiceStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Bytes>> {
        self.ensure_open()?;
        Ok(self.data.read_async(key, |_, v| v.clone()).await)
    }

    async fn watch(&self, key: &str) -> StoreResult<WatchStream> {
        self.ensure_open()?;
        let key = key.to_string();
        let stream = BroadcastStream::new(self.events.subscribe())
            .take_until(self.shutdown.clone().cancelled_owned())
            .filter_map(move |item| {
                let result = match item {
                    Ok(event) if event.key == key => Some(Ok(vec![event])),
                    Ok(_) => None,
                    Err(BroadcastStreamRecvError::Lagged(missed)) => Some(Err(
                        StoreError::Protocol(format!("watcher lagged behind by {missed} events")),
                    )),
                };
                futures_util::future::ready(result)
            });
        Ok(stream.boxed())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.ensure_open()?;
        if self.data.remove_async(key).await.is_some() {
            let _ = self.events.send(WatchEvent::delete(key));
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::service_store::WatchEventKind;

    #[tokio::test]
    async fn test_watch_receives_only_its_key() {
        let store = MemoryStore::new();
        let mut stream = store.watch("svc").await.unwrap();

        store.put("other", "x").await;
        store.put("svc", "y").await;
        store.delete("svc").await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first, vec![WatchEvent::put("svc", "y")]);
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second[0].kind, WatchEventKind::Delete);
    }

    #[tokio::test]
    async fn test_close_ends_streams_and_rejects_calls() {
        let store = MemoryStore::new();
        let mut stream = store.watch("svc").await.unwrap();

        store.close().await;

        assert!(stream.next().await.is_none());
        assert!(matches!(store.get("svc").await, Err(StoreError::Closed)));
    }
}
