//! Channel subscriptions

use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Receiving end of a pub/sub channel
///
/// Messages arrive in publish order for a single store instance. Dropping
/// the subscription unsubscribes; a backend forwarding task, if any, is
/// aborted with it.
pub struct Subscription {
    channel: String,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    forwarder: Option<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn new(
        channel: impl Into<String>,
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
        forwarder: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            channel: channel.into(),
            rx,
            forwarder,
        }
    }

    /// Channel this subscription listens to
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next raw message, `None` on cancellation or when the channel closed
    pub async fn next_raw(&mut self, token: &CancellationToken) -> Option<Vec<u8>> {
        tokio::select! {
            biased;
            _ = token.cancelled() => None,
            msg = self.rx.recv() => msg,
        }
    }

    /// Next decodable message; undecodable ones are logged and skipped
    pub async fn next<T: DeserializeOwned>(&mut self, token: &CancellationToken) -> Option<T> {
        loop {
            let bytes = self.next_raw(token).await?;
            match serde_json::from_slice(&bytes) {
                Ok(value) => return Some(value),
                Err(e) => warn!(
                    "Cache> Cannot unmarshal message from {}: {}",
                    self.channel, e
                ),
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}
