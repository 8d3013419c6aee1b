//! Heartbeat task
//!
//! Refreshes the worker registration at a fixed interval. The first failure
//! ends the task and tells the agent through a channel: a `403` means the
//! worker was disabled, anything else that the identity is lost.

use kiln_client::OrchestratorClient;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatSignal {
    /// The registration must be redone
    Lost,
    /// The orchestrator disabled this worker
    Disabled,
}

pub fn spawn_heartbeat(
    client: OrchestratorClient,
    interval: Duration,
    signals: mpsc::UnboundedSender<HeartbeatSignal>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }

            match client.refresh().await {
                Ok(()) => debug!("Heartbeat sent"),
                Err(e) if e.is_forbidden() => {
                    warn!("Worker has been disabled");
                    let _ = signals.send(HeartbeatSignal::Disabled);
                    return;
                }
                Err(e) => {
                    warn!("Cannot refresh heartbeat: {}", e);
                    let _ = signals.send(HeartbeatSignal::Lost);
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn signal_for(status: u16) -> HeartbeatSignal {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/worker/refresh"))
            .respond_with(ResponseTemplate::new(204))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/worker/refresh"))
            .respond_with(ResponseTemplate::new(status))
            .mount(&server)
            .await;

        let mut client = OrchestratorClient::new(server.uri());
        client.set_session("w1");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_heartbeat(client, Duration::from_millis(10), tx, CancellationToken::new());

        let signal = rx.recv().await.unwrap();
        handle.await.unwrap();
        signal
    }

    #[tokio::test]
    async fn test_disabled_worker() {
        assert_eq!(signal_for(403).await, HeartbeatSignal::Disabled);
    }

    #[tokio::test]
    async fn test_failure_loses_identity() {
        assert_eq!(signal_for(500).await, HeartbeatSignal::Lost);
        assert_eq!(signal_for(401).await, HeartbeatSignal::Lost);
    }

    #[tokio::test]
    async fn test_stops_on_cancellation() {
        let client = OrchestratorClient::new("http://127.0.0.1:1");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let handle = spawn_heartbeat(client, Duration::from_secs(3600), tx, token.clone());

        token.cancel();
        handle.await.unwrap();
        assert!(rx.recv().await.is_none());
    }
}
