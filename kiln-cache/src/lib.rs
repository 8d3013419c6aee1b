//! Kiln Cache
//!
//! Key-value, queue and publish/subscribe store backing every piece of
//! coordination state in Kiln.
//!
//! Two backends implement [`Store`]:
//! - [`LocalStore`]: in-memory, one coarse lock, single-instance deployments
//! - [`RedisStore`]: shared Redis, required once several orchestrators or
//!   hatcheries run side by side
//!
//! Values cross the store as JSON. The typed helpers of [`StoreExt`] treat
//! encode/decode failures on best-effort operations as logged no-ops.
//!
//! # Example
//!
//! ```no_run
//! use kiln_cache::{LocalStore, Store, StoreExt};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let store = LocalStore::new();
//! store.set("answer", &42u32, Some(Duration::from_secs(60))).await;
//! let value: Option<u32> = store.get("answer").await;
//! assert_eq!(value, Some(42));
//! # }
//! ```

pub mod error;
mod local;
mod redis_store;
mod subscription;

pub use error::{Result, StoreError};
pub use local::LocalStore;
pub use redis_store::RedisStore;
pub use subscription::Subscription;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Default interval between two polls of an empty queue
///
/// Blocking dequeues poll instead of waiting on a wakeup: this bounds
/// worst-case latency to one interval and trades it against backend load.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Raw byte-level contract every backend implements
#[async_trait]
pub trait Store: Send + Sync {
    /// Reads a key, `None` when absent or expired
    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Writes a key, with an optional expiry
    async fn set_raw(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    /// Writes a key only if it does not exist yet, returns whether it wrote
    async fn set_nx_raw(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>)
    -> Result<bool>;

    /// Removes a key
    async fn delete(&self, key: &str) -> Result<()>;

    /// Removes an exact key, or every key sharing the prefix before a
    /// trailing `*`. No other globbing is supported.
    async fn delete_all(&self, pattern: &str) -> Result<()>;

    /// Pushes a value at the tail of a queue
    async fn enqueue_raw(&self, queue: &str, value: Vec<u8>) -> Result<()>;

    /// Pops the head of a queue without waiting
    async fn try_dequeue_raw(&self, queue: &str) -> Result<Option<Vec<u8>>>;

    /// Number of items waiting in a queue
    async fn queue_len(&self, queue: &str) -> Result<usize>;

    /// Publishes a message to every current subscriber of a channel
    async fn publish_raw(&self, channel: &str, value: Vec<u8>) -> Result<()>;

    /// Subscribes to a channel
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;

    /// Adds (or replaces) the member identified by `member_key` in a set
    async fn set_add_raw(&self, root: &str, member_key: &str, value: Vec<u8>) -> Result<()>;

    /// Cardinality of a set
    async fn set_card(&self, root: &str) -> Result<usize>;

    /// Reads `count` members of a set, fails with
    /// [`StoreError::TooManyMembers`] when the set holds fewer
    async fn set_scan_raw(&self, root: &str, count: usize) -> Result<Vec<Vec<u8>>>;

    /// Interval used by blocking dequeues
    fn poll_interval(&self) -> Duration;

    /// Human readable health of the backend
    async fn status(&self) -> String;
}

/// Typed helpers over [`Store`]
///
/// Best-effort operations (`get`, `set`, `enqueue`, `publish`, `set_add`)
/// log failures and carry on; the store is left unchanged.
#[async_trait]
pub trait StoreExt: Store {
    /// Reads and decodes a key; decode failures count as a miss
    async fn get<T: DeserializeOwned + Send>(&self, key: &str) -> Option<T> {
        match self.get_raw(key).await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!("Cache> Cannot unmarshal {}: {}", key, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("Cache> Cannot get {}: {}", key, e);
                None
            }
        }
    }

    /// Encodes and writes a key
    async fn set<T: Serialize + Sync + ?Sized>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Cache> Cannot marshal {}: {}", key, e);
                return;
            }
        };
        if let Err(e) = self.set_raw(key, bytes, ttl).await {
            warn!("Cache> Cannot set {}: {}", key, e);
        }
    }

    /// Conditional write; `false` when the key exists or the write failed
    async fn set_nx<T: Serialize + Sync + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> bool {
        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Cache> Cannot marshal {}: {}", key, e);
                return false;
            }
        };
        match self.set_nx_raw(key, bytes, ttl).await {
            Ok(written) => written,
            Err(e) => {
                warn!("Cache> Cannot set {}: {}", key, e);
                false
            }
        }
    }

    /// Pushes a value on a queue
    async fn enqueue<T: Serialize + Sync + ?Sized>(&self, queue: &str, value: &T) {
        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Cache> Cannot marshal item for {}: {}", queue, e);
                return;
            }
        };
        if let Err(e) = self.enqueue_raw(queue, bytes).await {
            error!("Cache> Cannot enqueue to {}: {}", queue, e);
        }
    }

    /// Pops one decodable item if any is waiting
    ///
    /// Items that fail to decode are dropped with a warning.
    async fn try_dequeue<T: DeserializeOwned + Send>(&self, queue: &str) -> Option<T> {
        loop {
            match self.try_dequeue_raw(queue).await {
                Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                    Ok(value) => return Some(value),
                    Err(e) => warn!("Cache> Dropping undecodable item from {}: {}", queue, e),
                },
                Ok(None) => return None,
                Err(e) => {
                    warn!("Cache> Cannot dequeue from {}: {}", queue, e);
                    return None;
                }
            }
        }
    }

    /// Waits until an item is available, polling every [`Store::poll_interval`]
    async fn dequeue<T: DeserializeOwned + Send>(&self, queue: &str) -> T {
        let mut ticker = tokio::time::interval(self.poll_interval());
        loop {
            ticker.tick().await;
            if let Some(value) = self.try_dequeue(queue).await {
                return value;
            }
        }
    }

    /// Like [`StoreExt::dequeue`], returning `None` once `token` is cancelled
    ///
    /// The poll loop lives in the returned future itself: it stops on
    /// delivery or on cancellation, whichever comes first, and nothing keeps
    /// polling afterwards. An already-cancelled token returns at once
    /// without touching the queue.
    async fn dequeue_with_cancellation<T: DeserializeOwned + Send>(
        &self,
        token: &CancellationToken,
        queue: &str,
    ) -> Option<T> {
        if token.is_cancelled() {
            return None;
        }

        let mut ticker = tokio::time::interval(self.poll_interval());
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return None,
                _ = ticker.tick() => {
                    if let Some(value) = self.try_dequeue(queue).await {
                        return Some(value);
                    }
                }
            }
        }
    }

    /// Publishes a message
    async fn publish<T: Serialize + Sync + ?Sized>(&self, channel: &str, value: &T) {
        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Cache> Cannot marshal message for {}: {}", channel, e);
                return;
            }
        };
        if let Err(e) = self.publish_raw(channel, bytes).await {
            error!("Cache> Cannot publish on {}: {}", channel, e);
        }
    }

    /// Adds a member to a set
    async fn set_add<T: Serialize + Sync + ?Sized>(&self, root: &str, member_key: &str, member: &T) {
        let bytes = match serde_json::to_vec(member) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Cache> Unable to marshal member value for {}: {}", root, e);
                return;
            }
        };
        if let Err(e) = self.set_add_raw(root, member_key, bytes).await {
            error!("Cache> Cannot add member to {}: {}", root, e);
        }
    }

    /// Reads and decodes `count` members of a set
    ///
    /// Unlike the other helpers this propagates every failure.
    async fn set_scan<T: DeserializeOwned + Send>(&self, root: &str, count: usize) -> Result<Vec<T>> {
        self.set_scan_raw(root, count)
            .await?
            .iter()
            .map(|bytes| serde_json::from_slice(bytes).map_err(StoreError::from))
            .collect()
    }
}

impl<S: Store + ?Sized> StoreExt for S {}

/// Opens the store described by `url`
///
/// `local` (or an empty string) selects the in-memory backend,
/// `redis://` and `rediss://` URLs the shared one.
pub async fn open_store(url: &str) -> Result<Arc<dyn Store>> {
    match url {
        "" | "local" => Ok(Arc::new(LocalStore::new())),
        url if url.starts_with("redis://") || url.starts_with("rediss://") => {
            Ok(Arc::new(RedisStore::connect(url).await?))
        }
        other => Err(StoreError::InvalidUrl(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_local_store() {
        let store = open_store("local").await.unwrap();
        assert_eq!(store.status().await, "OK (local)");
    }

    #[tokio::test]
    async fn test_open_store_rejects_unknown_scheme() {
        let result = open_store("memcached://localhost").await;
        assert!(matches!(result, Err(StoreError::InvalidUrl(_))));
    }
}
