use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use thiserror::Error;

/// Errors raised by a distributed service store.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("store request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("store authentication failed: {0}")]
    Auth(String),

    #[error("unexpected store response: {0}")]
    Protocol(String),

    #[error("store client is closed")]
    Closed,
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Put,
    Delete,
}

/// One change to a watched key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub key: String,
    /// Empty for deletes.
    pub value: Bytes,
}

impl WatchEvent {
    pub fn put(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            kind: WatchEventKind::Put,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            kind: WatchEventKind::Delete,
            key: key.into(),
            value: Bytes::new(),
        }
    }
}

/// Events delivered together by one watch response, in store order.
pub type WatchBatch = Vec<WatchEvent>;

/// A stream of watch batches. The stream ends when the subscription is torn
/// down by the store; dropping it cancels the subscription.
pub type WatchStream = BoxStream<'static, StoreResult<WatchBatch>>;

/// Port for the distributed key-value store holding the service endpoint lists.
#[async_trait]
pub trait ServiceStore: Send + Sync + 'static {
    /// Point lookup. `Ok(None)` when the key does not exist.
    async fn get(&self, key: &str) -> StoreResult<Option<Bytes>>;

    /// Open a long-lived change subscription on exactly `key`.
    async fn watch(&self, key: &str) -> StoreResult<WatchStream>;

    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Release connections. Further calls fail with [`StoreError::Closed`].
    async fn close(&self);
}
