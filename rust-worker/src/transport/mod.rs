//! Queue ingress and topic egress.
//!
//! This module provides:
//! - The backend traits a broker has to implement
//! - The receive and settle loops that turn a backend into a pair of channels
//! - A retrying topic publisher
//!
//! ## Architecture
//!
//! ```text
//! queue → receive loop → inbound (capacity 1) → consumer
//! consumer → settle (Delete | Release | Reject) → settle loop → queue
//! ```
//!
//! The transport knows nothing about message content. Delivery is at least
//! once: anything not deleted comes back after the visibility timeout.

pub mod amqp;
pub mod memory;
pub mod publisher;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TransportError;

pub use amqp::{AmqpQueue, AmqpTopic};
pub use memory::{MemoryQueue, MemoryTopic};
pub use publisher::Publisher;

/// Pause after a failed receive before trying again.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Opaque token that settles one delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message as delivered by the queue.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub subject: Option<String>,
    pub body: String,
    pub receipt: ReceiptHandle,
}

/// What to do with a delivery once the consumer is done with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// Processed; remove from the queue.
    Delete(ReceiptHandle),
    /// Make it visible again for redelivery.
    Release(ReceiptHandle),
    /// Move it to the dead-letter route without further attempts.
    Reject(ReceiptHandle),
}

impl Settlement {
    pub fn receipt(&self) -> &ReceiptHandle {
        match self {
            Settlement::Delete(r) | Settlement::Release(r) | Settlement::Reject(r) => r,
        }
    }
}

/// Tunables for one receive call.
#[derive(Debug, Clone)]
pub struct ReceiveParams {
    pub max_messages: usize,
    pub visibility_timeout: Duration,
    pub wait_time: Duration,
}

impl Default for ReceiveParams {
    fn default() -> Self {
        Self {
            max_messages: 1,
            visibility_timeout: Duration::from_secs(600),
            wait_time: Duration::from_secs(20),
        }
    }
}

/// A queue that hands out messages under a visibility timeout.
#[async_trait]
pub trait QueueBackend: Send + Sync + 'static {
    /// Wait up to `params.wait_time` for up to `params.max_messages` messages.
    async fn receive(&self, params: &ReceiveParams) -> Result<Vec<RawMessage>, TransportError>;

    async fn delete(&self, receipt: &ReceiptHandle) -> Result<(), TransportError>;

    /// Brokers with visibility timeouts redeliver on their own.
    async fn release(&self, _receipt: &ReceiptHandle) -> Result<(), TransportError> {
        Ok(())
    }

    /// Brokers with a redrive policy dead-letter on their own.
    async fn reject(&self, _receipt: &ReceiptHandle) -> Result<(), TransportError> {
        Ok(())
    }
}

/// A topic that fans a message out to every subscribed queue.
#[async_trait]
pub trait TopicBackend: Send + Sync + 'static {
    /// Publish once and return the message id the broker confirmed.
    async fn publish(&self, body: &str, subject: Option<&str>) -> Result<String, TransportError>;
}

/// Consumer side of a running ingress.
pub struct Ingress {
    pub inbound: mpsc::Receiver<RawMessage>,
    pub settle: mpsc::Sender<Settlement>,
}

/// Start the receive and settle loops for `backend`.
pub fn start_receiving<B: QueueBackend>(
    backend: Arc<B>,
    params: ReceiveParams,
    token: CancellationToken,
) -> Ingress {
    start_receiving_with_retry(backend, params, RETRY_INTERVAL, token)
}

/// As [`start_receiving`] with an explicit pause after receive errors.
pub fn start_receiving_with_retry<B: QueueBackend>(
    backend: Arc<B>,
    params: ReceiveParams,
    retry: Duration,
    token: CancellationToken,
) -> Ingress {
    // tokio has no rendezvous channel; capacity 1 is the closest, so at most
    // one message waits ahead of the consumer.
    let (inbound_tx, inbound_rx) = mpsc::channel(1);
    let (settle_tx, settle_rx) = mpsc::channel(1);

    tokio::spawn(receive_loop(
        Arc::clone(&backend),
        params,
        retry,
        inbound_tx,
        token.clone(),
    ));
    tokio::spawn(settle_loop(backend, settle_rx, token));

    Ingress {
        inbound: inbound_rx,
        settle: settle_tx,
    }
}

async fn receive_loop<B: QueueBackend>(
    backend: Arc<B>,
    params: ReceiveParams,
    retry: Duration,
    inbound: mpsc::Sender<RawMessage>,
    token: CancellationToken,
) {
    info!(
        max_messages = params.max_messages,
        visibility_timeout_secs = params.visibility_timeout.as_secs(),
        wait_time_secs = params.wait_time.as_secs(),
        "queue_receive_loop_started"
    );

    loop {
        let received = tokio::select! {
            _ = token.cancelled() => break,
            r = backend.receive(&params) => r,
        };

        let messages = match received {
            Ok(messages) => messages,
            Err(e) => {
                warn!(error = %e, retry_secs = retry.as_secs(), "queue_receive_failed");
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(retry) => {}
                }
                continue;
            }
        };

        for message in messages {
            debug!(receipt = %message.receipt, body_length = message.body.len(), "queue_message_received");

            // Blocks while the consumer is busy. A message that is never handed
            // over is not deleted, so the queue redelivers it.
            let sent = tokio::select! {
                _ = token.cancelled() => false,
                r = inbound.send(message) => r.is_ok(),
            };

            if !sent {
                info!("queue_receive_loop_stopped");
                return;
            }
        }
    }

    info!("queue_receive_loop_stopped");
}

async fn settle_loop<B: QueueBackend>(
    backend: Arc<B>,
    mut settle: mpsc::Receiver<Settlement>,
    token: CancellationToken,
) {
    loop {
        let settlement = tokio::select! {
            _ = token.cancelled() => break,
            s = settle.recv() => match s {
                Some(s) => s,
                None => break,
            },
        };

        let result = match &settlement {
            Settlement::Delete(r) => backend.delete(r).await,
            Settlement::Release(r) => backend.release(r).await,
            Settlement::Reject(r) => backend.reject(r).await,
        };

        // Best effort: an unsettled message is redelivered after its timeout.
        if let Err(e) = result {
            warn!(
                receipt = %settlement.receipt(),
                settlement = ?settlement,
                error = %e,
                "queue_settle_failed"
            );
        }
    }

    info!("queue_settle_loop_stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Fails the first `failures` receives, then serves `bodies` one per call.
    struct FlakyQueue {
        failures: AtomicUsize,
        bodies: Mutex<Vec<String>>,
        deleted: Mutex<Vec<ReceiptHandle>>,
    }

    #[async_trait]
    impl QueueBackend for FlakyQueue {
        async fn receive(&self, _params: &ReceiveParams) -> Result<Vec<RawMessage>, TransportError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(TransportError::Closed);
            }

            let next = self.bodies.lock().unwrap().pop();
            match next {
                Some(body) => Ok(vec![RawMessage {
                    subject: None,
                    receipt: ReceiptHandle::new(format!("r-{}", body)),
                    body,
                }]),
                None => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(Vec::new())
                }
            }
        }

        async fn delete(&self, receipt: &ReceiptHandle) -> Result<(), TransportError> {
            if receipt.as_str() == "r-broken" {
                return Err(TransportError::UnknownReceipt(receipt.to_string()));
            }
            self.deleted.lock().unwrap().push(receipt.clone());
            Ok(())
        }
    }

    fn flaky(failures: usize, bodies: &[&str]) -> Arc<FlakyQueue> {
        Arc::new(FlakyQueue {
            failures: AtomicUsize::new(failures),
            bodies: Mutex::new(bodies.iter().rev().map(|s| s.to_string()).collect()),
            deleted: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn test_receive_retries_after_errors() {
        let queue = flaky(2, &["a"]);
        let token = CancellationToken::new();
        let mut ingress = start_receiving_with_retry(
            Arc::clone(&queue),
            ReceiveParams::default(),
            Duration::from_millis(5),
            token.clone(),
        );

        let message = tokio::time::timeout(Duration::from_secs(2), ingress.inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.body, "a");
        token.cancel();
    }

    #[tokio::test]
    async fn test_settle_failures_do_not_stop_the_loop() {
        let queue = flaky(0, &[]);
        let token = CancellationToken::new();
        let ingress = start_receiving(Arc::clone(&queue), ReceiveParams::default(), token.clone());

        ingress
            .settle
            .send(Settlement::Delete(ReceiptHandle::new("r-broken")))
            .await
            .unwrap();
        ingress
            .settle
            .send(Settlement::Delete(ReceiptHandle::new("r-ok")))
            .await
            .unwrap();

        for _ in 0..100 {
            if !queue.deleted.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(*queue.deleted.lock().unwrap(), vec![ReceiptHandle::new("r-ok")]);
        token.cancel();
    }

    #[test]
    fn test_settlement_receipt() {
        let r = ReceiptHandle::new("abc");
        assert_eq!(Settlement::Release(r.clone()).receipt(), &r);
        assert_eq!(r.to_string(), "abc");
    }
}
