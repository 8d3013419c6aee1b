//! Build log buffering and streaming
//!
//! Steps write into a [`LogBuffer`]; a sender task drains it periodically
//! and streams batches to the orchestrator. When the job ends the remainder
//! is flushed and the stream closed with an acknowledged line count.
//!
//! Batches never exceed [`MAX_BATCH_SIZE`] lines and messages longer than
//! [`MAX_MESSAGE_LENGTH`] chars are split, so the orchestrator accepts
//! everything the buffer holds.

use chrono::Utc;
use kiln_client::{ClientError, OrchestratorClient};
use kiln_core::domain::job::JobId;
use kiln_core::domain::log::{LogLevel, LogLine};
use kiln_core::dto::log::{MAX_BATCH_SIZE, MAX_MESSAGE_LENGTH};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Thread-safe buffer of log lines waiting to be sent
#[derive(Clone, Default)]
pub struct LogBuffer {
    lines: Arc<Mutex<Vec<LogLine>>>,
    total: Arc<AtomicU64>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<LogLine>> {
        self.lines.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Buffers a message, split in several lines when it is too long
    pub fn push(&self, step: usize, level: LogLevel, message: impl Into<String>) {
        let timestamp = Utc::now();
        let pieces = split_message(message.into());
        let count = pieces.len() as u64;

        let mut lines = self.lock();
        lines.extend(pieces.into_iter().map(|message| LogLine {
            step,
            timestamp,
            level,
            message,
        }));
        self.total.fetch_add(count, Ordering::Relaxed);
    }

    /// Takes every buffered line, oldest first
    pub fn drain(&self) -> Vec<LogLine> {
        std::mem::take(&mut *self.lock())
    }

    /// Puts back lines that could not be sent, ahead of newer ones
    pub fn restore(&self, mut lines: Vec<LogLine>) {
        let mut buffer = self.lock();
        lines.append(&mut buffer);
        *buffer = lines;
    }

    /// Lines written since the buffer was created
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

fn split_message(message: String) -> Vec<String> {
    if message.chars().count() <= MAX_MESSAGE_LENGTH {
        return vec![message];
    }

    let chars: Vec<char> = message.chars().collect();
    chars
        .chunks(MAX_MESSAGE_LENGTH)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

/// Sends `lines` in batches of at most [`MAX_BATCH_SIZE`]
///
/// A batch the orchestrator refuses with a 4xx is dropped, retrying it
/// cannot succeed. Any other failure stops the sending and hands back every
/// unsent line.
async fn send_batches(
    client: &OrchestratorClient,
    job_id: JobId,
    mut lines: Vec<LogLine>,
) -> Result<(), (Vec<LogLine>, ClientError)> {
    while !lines.is_empty() {
        let rest = lines.split_off(lines.len().min(MAX_BATCH_SIZE));
        let batch = std::mem::replace(&mut lines, rest);

        debug!("Sending {} log lines for job {}", batch.len(), job_id);
        match client.send_logs(job_id, batch.clone()).await {
            Ok(()) => {}
            Err(e) if e.is_client_error() => {
                warn!("Dropping {} log lines of job {}: {}", batch.len(), job_id, e);
            }
            Err(e) => {
                let mut unsent = batch;
                unsent.append(&mut lines);
                return Err((unsent, e));
            }
        }
    }

    Ok(())
}

/// Streams the buffer every `interval` until `token` is cancelled
pub fn spawn_log_sender(
    client: OrchestratorClient,
    job_id: JobId,
    buffer: LogBuffer,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let lines = buffer.drain();
            if lines.is_empty() {
                continue;
            }

            if let Err((unsent, e)) = send_batches(&client, job_id, lines).await {
                warn!("Failed to send logs for job {}: {}", job_id, e);
                buffer.restore(unsent);
            }
        }
    })
}

/// Flushes what is left and closes the stream
///
/// Returns the number of lines the orchestrator acknowledged, `None` when
/// the handshake failed.
pub async fn flush_and_close(
    client: &OrchestratorClient,
    job_id: JobId,
    buffer: &LogBuffer,
) -> Option<u64> {
    let remaining = buffer.drain();
    if let Err((unsent, e)) = send_batches(client, job_id, remaining).await {
        warn!(
            "Failed to send final logs for job {}, {} lines lost: {}",
            job_id,
            unsent.len(),
            e
        );
    }

    match client.close_logs(job_id).await {
        Ok(ack) => {
            if ack.received != buffer.total() {
                warn!(
                    "Orchestrator acknowledged {} of {} log lines for job {}",
                    ack.received,
                    buffer.total(),
                    job_id
                );
            }
            Some(ack.received)
        }
        Err(e) => {
            warn!("Failed to close log stream of job {}: {}", job_id, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::dto::log::LogBatch;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn session_client(server: &MockServer) -> OrchestratorClient {
        let mut client = OrchestratorClient::new(server.uri());
        client.set_session("w1");
        client
    }

    #[test]
    fn test_buffer_drain_and_restore() {
        let buffer = LogBuffer::new();
        buffer.push(0, LogLevel::Info, "one");
        buffer.push(0, LogLevel::Info, "two");

        let drained = buffer.drain();
        assert_eq!(drained.len(), 2);
        assert!(buffer.drain().is_empty());

        buffer.push(1, LogLevel::Error, "three");
        buffer.restore(drained);

        let messages: Vec<_> = buffer.drain().into_iter().map(|l| l.message).collect();
        assert_eq!(messages, vec!["one", "two", "three"]);
        assert_eq!(buffer.total(), 3);
    }

    #[tokio::test]
    async fn test_flush_and_close() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/queue/4/log"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/queue/4/log/close"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "job_id": 4, "received": 2 })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let mut client = OrchestratorClient::new(server.uri());
        client.set_session("w1");
        let buffer = LogBuffer::new();
        buffer.push(0, LogLevel::Info, "compiling");
        buffer.push(0, LogLevel::Info, "done");

        assert_eq!(flush_and_close(&client, 4, &buffer).await, Some(2));
    }

    #[tokio::test]
    async fn test_sender_keeps_lines_on_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/queue/5/log"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let mut client = OrchestratorClient::new(server.uri());
        client.set_session("w1");
        let buffer = LogBuffer::new();
        buffer.push(0, LogLevel::Info, "kept");

        let token = CancellationToken::new();
        let sender = spawn_log_sender(
            client,
            5,
            buffer.clone(),
            Duration::from_millis(10),
            token.clone(),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
        sender.await.unwrap();

        let lines = buffer.drain();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].message, "kept");
    }

    #[test]
    fn test_long_messages_are_split() {
        let buffer = LogBuffer::new();
        buffer.push(0, LogLevel::Info, "x".repeat(MAX_MESSAGE_LENGTH * 2 + 5));
        buffer.push(0, LogLevel::Info, "é".repeat(MAX_MESSAGE_LENGTH));

        let lines = buffer.drain();
        let lengths: Vec<_> = lines.iter().map(|l| l.message.chars().count()).collect();
        assert_eq!(
            lengths,
            vec![MAX_MESSAGE_LENGTH, MAX_MESSAGE_LENGTH, 5, MAX_MESSAGE_LENGTH]
        );
        assert_eq!(buffer.total(), 4);
    }

    #[tokio::test]
    async fn test_large_output_is_sent_in_batches() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/queue/6/log"))
            .respond_with(ResponseTemplate::new(202))
            .expect(3)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/queue/6/log/close"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "job_id": 6, "received": 2500 })),
            )
            .mount(&server)
            .await;

        let buffer = LogBuffer::new();
        for i in 0..2500 {
            buffer.push(0, LogLevel::Info, i.to_string());
        }

        let client = session_client(&server).await;
        assert_eq!(flush_and_close(&client, 6, &buffer).await, Some(2500));

        let sizes: Vec<_> = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.url.path() == "/queue/6/log")
            .map(|r| serde_json::from_slice::<LogBatch>(&r.body).unwrap().lines.len())
            .collect();
        assert_eq!(sizes, vec![1000, 1000, 500]);
    }

    #[tokio::test]
    async fn test_sender_drops_rejected_batches() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/queue/7/log"))
            .respond_with(ResponseTemplate::new(400))
            .expect(2)
            .mount(&server)
            .await;

        let buffer = LogBuffer::new();
        for i in 0..1500 {
            buffer.push(0, LogLevel::Info, i.to_string());
        }

        let token = CancellationToken::new();
        let sender = spawn_log_sender(
            session_client(&server).await,
            7,
            buffer.clone(),
            Duration::from_millis(10),
            token.clone(),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
        sender.await.unwrap();

        assert!(buffer.drain().is_empty());
    }

    #[tokio::test]
    async fn test_unsent_batches_are_restored_in_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/queue/8/log"))
            .respond_with(ResponseTemplate::new(202))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/queue/8/log"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let lines: Vec<_> = (0..2200)
            .map(|i| LogLine {
                step: 0,
                timestamp: Utc::now(),
                level: LogLevel::Info,
                message: i.to_string(),
            })
            .collect();

        let (unsent, e) = send_batches(&session_client(&server).await, 8, lines)
            .await
            .unwrap_err();
        assert!(e.is_server_error());
        assert_eq!(unsent.len(), 1200);
        assert_eq!(unsent[0].message, "1000");
        assert_eq!(unsent[1199].message, "2199");
    }
}
