//! In-memory store
//!
//! Every map (keys, queues, sets, subscribers) sits behind one coarse lock.
//! That is enough for a single orchestrator process; it gives no guarantee
//! across processes, use the Redis backend there.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::subscription::Subscription;
use crate::{DEFAULT_POLL_INTERVAL, Store};

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Default)]
struct Inner {
    data: HashMap<String, Entry>,
    queues: HashMap<String, VecDeque<Vec<u8>>>,
    /// root -> ordered (member key, value)
    sets: HashMap<String, Vec<(String, Vec<u8>)>>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl Inner {
    fn live_entry(&mut self, key: &str) -> Option<&Entry> {
        let now = Instant::now();
        if self.data.get(key).is_some_and(|e| e.is_expired(now)) {
            self.data.remove(key);
        }
        self.data.get(key)
    }

    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.data.retain(|_, entry| !entry.is_expired(now));
    }
}

/// In-memory [`Store`] for single-instance deployments and tests
pub struct LocalStore {
    inner: Mutex<Inner>,
    poll_interval: Duration,
}

impl LocalStore {
    /// Creates an empty store polling queues every 500 ms
    pub fn new() -> Self {
        Self::with_poll_interval(DEFAULT_POLL_INTERVAL)
    }

    /// Creates an empty store with a custom queue poll interval
    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            poll_interval,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves plain maps behind, still usable
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}

fn matches_pattern(pattern: &str, key: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}

#[async_trait]
impl Store for LocalStore {
    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut inner = self.lock();
        Ok(inner.live_entry(key).map(|entry| entry.value.clone()))
    }

    async fn set_raw(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let mut inner = self.lock();
        inner.purge_expired();
        inner.data.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_nx_raw(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let mut inner = self.lock();
        if inner.live_entry(key).is_some() {
            return Ok(false);
        }
        inner.data.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.data.remove(key);
        inner.queues.remove(key);
        inner.sets.remove(key);
        Ok(())
    }

    async fn delete_all(&self, pattern: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.data.retain(|key, _| !matches_pattern(pattern, key));
        inner.queues.retain(|key, _| !matches_pattern(pattern, key));
        inner.sets.retain(|key, _| !matches_pattern(pattern, key));
        Ok(())
    }

    async fn enqueue_raw(&self, queue: &str, value: Vec<u8>) -> Result<()> {
        let mut inner = self.lock();
        debug!("Cache> Enqueueing to {}", queue);
        inner
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(value);
        Ok(())
    }

    async fn try_dequeue_raw(&self, queue: &str) -> Result<Option<Vec<u8>>> {
        let mut inner = self.lock();
        Ok(inner.queues.get_mut(queue).and_then(|q| q.pop_front()))
    }

    async fn queue_len(&self, queue: &str) -> Result<usize> {
        let inner = self.lock();
        Ok(inner.queues.get(queue).map_or(0, VecDeque::len))
    }

    async fn publish_raw(&self, channel: &str, value: Vec<u8>) -> Result<()> {
        let mut inner = self.lock();
        if let Some(subscribers) = inner.subscribers.get_mut(channel) {
            subscribers.retain(|tx| tx.send(value.clone()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        inner
            .subscribers
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(channel, rx, None))
    }

    async fn set_add_raw(&self, root: &str, member_key: &str, value: Vec<u8>) -> Result<()> {
        let mut inner = self.lock();
        let set = inner.sets.entry(root.to_string()).or_default();
        match set.iter_mut().find(|(key, _)| key == member_key) {
            Some((_, existing)) => *existing = value,
            None => set.push((member_key.to_string(), value)),
        }
        Ok(())
    }

    async fn set_card(&self, root: &str) -> Result<usize> {
        let inner = self.lock();
        Ok(inner.sets.get(root).map_or(0, Vec::len))
    }

    async fn set_scan_raw(&self, root: &str, count: usize) -> Result<Vec<Vec<u8>>> {
        let inner = self.lock();
        let set = inner.sets.get(root).map(Vec::as_slice).unwrap_or_default();
        if count > set.len() {
            return Err(StoreError::TooManyMembers {
                requested: count,
                available: set.len(),
            });
        }
        Ok(set[..count].iter().map(|(_, value)| value.clone()).collect())
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn status(&self) -> String {
        "OK (local)".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreExt;
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        id: u32,
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = LocalStore::new();
        store.set("k", &Item { id: 1 }, None).await;
        assert_eq!(store.get::<Item>("k").await, Some(Item { id: 1 }));

        store.delete("k").await.unwrap();
        assert_eq!(store.get::<Item>("k").await, None);
    }

    #[tokio::test]
    async fn test_undecodable_value_is_a_miss() {
        let store = LocalStore::new();
        store.set("k", "not an item", None).await;
        assert_eq!(store.get::<Item>("k").await, None);
        // state untouched
        assert_eq!(store.get::<String>("k").await, Some("not an item".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let store = LocalStore::new();
        store.set("k", &1u32, Some(Duration::from_secs(10))).await;

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(store.get::<u32>("k").await, Some(1));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.get::<u32>("k").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_nx_respects_live_keys_only() {
        let store = LocalStore::new();
        assert!(store.set_nx("lock", "a", Some(Duration::from_secs(5))).await);
        assert!(!store.set_nx("lock", "b", Some(Duration::from_secs(5))).await);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.set_nx("lock", "c", None).await);
        assert_eq!(store.get::<String>("lock").await, Some("c".to_string()));
    }

    #[tokio::test]
    async fn test_delete_all_trailing_wildcard_only() {
        let store = LocalStore::new();
        store.set("queue:listing:all", &1u32, None).await;
        store.set("queue:listing:model:3", &2u32, None).await;
        store.set("queue:other", &3u32, None).await;

        store.delete_all("queue:listing*").await.unwrap();
        assert_eq!(store.get::<u32>("queue:listing:all").await, None);
        assert_eq!(store.get::<u32>("queue:listing:model:3").await, None);
        assert_eq!(store.get::<u32>("queue:other").await, Some(3));

        // no general globbing: the star only works as a trailing wildcard
        store.delete_all("queue:*er").await.unwrap();
        assert_eq!(store.get::<u32>("queue:other").await, Some(3));

        store.delete_all("queue:other").await.unwrap();
        assert_eq!(store.get::<u32>("queue:other").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dequeue_is_fifo() {
        let store = LocalStore::new();
        store.enqueue("q", &Item { id: 1 }).await;
        store.enqueue("q", &Item { id: 2 }).await;
        assert_eq!(store.queue_len("q").await.unwrap(), 2);

        assert_eq!(store.dequeue::<Item>("q").await, Item { id: 1 });
        assert_eq!(store.dequeue::<Item>("q").await, Item { id: 2 });
        assert_eq!(store.queue_len("q").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dequeue_blocks_until_item_arrives() {
        let store = Arc::new(LocalStore::new());
        let consumer = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.dequeue::<Item>("q").await })
        };

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!consumer.is_finished());

        store.enqueue("q", &Item { id: 7 }).await;
        assert_eq!(consumer.await.unwrap(), Item { id: 7 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_dequeue_with_cancellation_returns_on_cancel() {
        let store = Arc::new(LocalStore::new());
        let token = CancellationToken::new();
        let consumer = {
            let store = Arc::clone(&store);
            let token = token.clone();
            tokio::spawn(async move { store.dequeue_with_cancellation::<Item>(&token, "q").await })
        };

        tokio::time::sleep(Duration::from_secs(2)).await;
        token.cancel();
        assert_eq!(consumer.await.unwrap(), None);

        // no stale poller left behind: a later item stays in the queue
        store.enqueue("q", &Item { id: 1 }).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(store.queue_len("q").await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dequeue_with_cancelled_token_returns_immediately() {
        let store = LocalStore::new();
        store.enqueue("q", &Item { id: 1 }).await;

        let token = CancellationToken::new();
        token.cancel();

        let started = Instant::now();
        assert_eq!(store.dequeue_with_cancellation::<Item>(&token, "q").await, None);
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(store.queue_len("q").await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dequeue_with_cancellation_delivers() {
        let store = LocalStore::new();
        let token = CancellationToken::new();
        store.enqueue("q", &Item { id: 3 }).await;

        let item = store.dequeue_with_cancellation::<Item>(&token, "q").await;
        assert_eq!(item, Some(Item { id: 3 }));
        assert_eq!(store.queue_len("q").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecodable_queue_item_is_dropped() {
        let store = LocalStore::new();
        store.enqueue("q", "garbage").await;
        store.enqueue("q", &Item { id: 4 }).await;

        assert_eq!(store.dequeue::<Item>("q").await, Item { id: 4 });
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber_in_order() {
        let store = LocalStore::new();
        let token = CancellationToken::new();
        let mut first = store.subscribe("events").await.unwrap();
        let mut second = store.subscribe("events").await.unwrap();

        store.publish("events", &Item { id: 1 }).await;
        store.publish("events", &Item { id: 2 }).await;

        assert_eq!(first.next::<Item>(&token).await, Some(Item { id: 1 }));
        assert_eq!(first.next::<Item>(&token).await, Some(Item { id: 2 }));
        assert_eq!(second.next::<Item>(&token).await, Some(Item { id: 1 }));
        assert_eq!(first.channel(), "events");
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let store = LocalStore::new();
        let sub = store.subscribe("events").await.unwrap();
        drop(sub);

        store.publish("events", &Item { id: 1 }).await;
        assert!(store.lock().subscribers["events"].is_empty());
    }

    #[tokio::test]
    async fn test_subscription_next_honours_cancellation() {
        let store = LocalStore::new();
        let mut sub = store.subscribe("events").await.unwrap();
        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(sub.next::<Item>(&token).await, None);
    }

    #[tokio::test]
    async fn test_set_semantics() {
        let store = LocalStore::new();
        store.set_add("root", "k", &Item { id: 1 }).await;
        assert_eq!(store.set_card("root").await.unwrap(), 1);

        // same member key replaces
        store.set_add("root", "k", &Item { id: 2 }).await;
        assert_eq!(store.set_card("root").await.unwrap(), 1);

        let members: Vec<Item> = store.set_scan("root", 1).await.unwrap();
        assert_eq!(members, vec![Item { id: 2 }]);

        let err = store.set_scan::<Item>("root", 2).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::TooManyMembers {
                requested: 2,
                available: 1
            }
        ));
    }

    #[tokio::test]
    async fn test_set_scan_on_missing_root() {
        let store = LocalStore::new();
        assert_eq!(store.set_card("none").await.unwrap(), 0);
        assert!(store.set_scan::<Item>("none", 0).await.unwrap().is_empty());
        assert!(store.set_scan::<Item>("none", 1).await.is_err());
    }
}
