//! Redis backed store

use async_trait::async_trait;
use futures::StreamExt;
use redis::Client;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::subscription::Subscription;
use crate::{DEFAULT_POLL_INTERVAL, Store};

const SCAN_BATCH: usize = 100;

/// [`Store`] on top of a shared Redis instance
///
/// Queues are lists (`LPUSH` then `RPOP`), sets are hashes keyed by member
/// key, pub/sub maps to Redis channels.
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
    poll_interval: Duration,
}

impl RedisStore {
    /// Connects to `url` (`redis://` or `rediss://`)
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        info!("Cache> Connected to redis");
        Ok(Self {
            client,
            conn,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Overrides the interval used by blocking dequeues
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Escapes glob metacharacters so a prefix matches literally in `SCAN MATCH`
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn millis(ttl: Duration) -> u64 {
    // PX 0 is rejected by redis
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl Store for RedisStore {
    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set_raw(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn set_nx_raw(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        // nil reply when the key already exists
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn delete_all(&self, pattern: &str) -> Result<()> {
        let Some(prefix) = pattern.strip_suffix('*') else {
            return self.delete(pattern).await;
        };

        let mut conn = self.conn.clone();
        let matcher = format!("{}*", escape_glob(prefix));
        let mut cursor: u64 = 0;
        let mut deleted = 0usize;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&matcher)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            if !keys.is_empty() {
                deleted += keys.len();
                let _: i64 = redis::cmd("DEL").arg(&keys).query_async(&mut conn).await?;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        debug!("Cache> Deleted {} keys matching {}", deleted, pattern);
        Ok(())
    }

    async fn enqueue_raw(&self, queue: &str, value: Vec<u8>) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("LPUSH")
            .arg(queue)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn try_dequeue_raw(&self, queue: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = redis::cmd("RPOP").arg(queue).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn queue_len(&self, queue: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = redis::cmd("LLEN").arg(queue).query_async(&mut conn).await?;
        Ok(len)
    }

    async fn publish_raw(&self, channel: &str, value: Vec<u8>) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let name = channel.to_string();
        let forwarder = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload: Vec<u8> = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("Cache> Cannot read message on {}: {}", name, e);
                        continue;
                    }
                };
                if tx.send(payload).is_err() {
                    break;
                }
            }
            debug!("Cache> Subscription to {} closed", name);
        });

        Ok(Subscription::new(channel, rx, Some(forwarder)))
    }

    async fn set_add_raw(&self, root: &str, member_key: &str, value: Vec<u8>) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("HSET")
            .arg(root)
            .arg(member_key)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_card(&self, root: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = redis::cmd("HLEN").arg(root).query_async(&mut conn).await?;
        Ok(len)
    }

    async fn set_scan_raw(&self, root: &str, count: usize) -> Result<Vec<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let mut members: Vec<Vec<u8>> = redis::cmd("HVALS").arg(root).query_async(&mut conn).await?;
        if count > members.len() {
            return Err(crate::StoreError::TooManyMembers {
                requested: count,
                available: members.len(),
            });
        }
        members.truncate(count);
        Ok(members)
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn status(&self) -> String {
        let mut conn = self.conn.clone();
        let pong: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        match pong {
            Ok(_) => "OK (redis)".to_string(),
            Err(e) => format!("KO (redis): {}", e),
        }
    }
}
