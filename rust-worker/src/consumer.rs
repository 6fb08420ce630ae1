//! Consumer main loop.
//!
//! Pulls one message at a time from an [`Ingress`], decodes it, hands the
//! payload to a [`Handler`] under the [`Supervisor`] and settles the delivery:
//!
//! ```text
//! inbound → decode ─┬─ error ─────────────────────────────→ Ack (or DeadLetter)
//!                   └─ handle ─┬─ Ok / Invalid ────────────→ Ack
//!                              └─ Transient → health gate → Redeliver
//! ```
//!
//! A consumer without a health gate pauses for [`ConsumerOptions::retry`]
//! before asking for redelivery, so an outage never turns into a hot loop.
//!
//! Processing is strictly sequential. While a transient failure holds the loop
//! in the health gate nothing else is received, so the rest of the backlog
//! stays on the queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{HandleError, ProcessError};
use crate::health::{HealthGate, Probe};
use crate::msg::Envelope;
use crate::supervisor::{Message, Outcome, Supervisor};
use crate::transport::{Ingress, RawMessage, Settlement, RETRY_INTERVAL};

/// Type-erased gate so consumers don't carry the probe type around.
pub type Gate = HealthGate<Arc<dyn Probe>>;

/// Domain logic of one consumer.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, envelope: Envelope) -> Result<(), HandleError>;
}

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Ack undecodable messages instead of dead-lettering them.
    pub delete_malformed: bool,
    /// Pause before redelivering after a transient failure when there is no
    /// health gate to wait on.
    pub retry: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            delete_malformed: true,
            retry: RETRY_INTERVAL,
        }
    }
}

/// One delivery on its way through the supervisor.
struct Job<'a, H> {
    body: &'a str,
    handler: &'a H,
    gate: Option<&'a Gate>,
    token: &'a CancellationToken,
    delete_malformed: bool,
    retry: Duration,
    error: Option<ProcessError>,
}

#[async_trait]
impl<'a, H: Handler> Message for Job<'a, H> {
    async fn process(&mut self) -> Outcome {
        let envelope = match Envelope::decode(self.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.error = Some(e.into());
                return if self.delete_malformed {
                    Outcome::Ack
                } else {
                    Outcome::DeadLetter
                };
            }
        };

        let kind = envelope.kind();
        match self.handler.handle(envelope).await {
            Ok(()) => Outcome::Ack,
            Err(e @ HandleError::Invalid(_)) => {
                self.error = Some(e.into());
                Outcome::Ack
            }
            Err(e @ HandleError::Transient(_)) => {
                self.error = Some(e.into());

                match self.gate {
                    Some(gate) => {
                        info!(kind, "consumer_waiting_for_health");
                        if gate.wait_until_healthy(self.token).await.is_err() {
                            debug!("consumer_health_wait_cancelled");
                        }
                    }
                    None => {
                        info!(kind, retry_secs = self.retry.as_secs(), "consumer_backing_off");
                        tokio::select! {
                            _ = self.token.cancelled() => {}
                            _ = tokio::time::sleep(self.retry) => {}
                        }
                    }
                }
                Outcome::Redeliver
            }
        }
    }

    fn err(&self) -> Option<&ProcessError> {
        self.error.as_ref()
    }
}

/// Receive → decode → supervise → settle, until cancelled.
pub struct Consumer<H> {
    ingress: Ingress,
    supervisor: Supervisor,
    handler: H,
    gate: Option<Gate>,
    options: ConsumerOptions,
}

impl<H: Handler> Consumer<H> {
    pub fn new(
        ingress: Ingress,
        supervisor: Supervisor,
        handler: H,
        gate: Option<Gate>,
        options: ConsumerOptions,
    ) -> Self {
        Self {
            ingress,
            supervisor,
            handler,
            gate,
            options,
        }
    }

    pub async fn run(mut self, token: CancellationToken) {
        info!(
            health_gate = self.gate.is_some(),
            delete_malformed = self.options.delete_malformed,
            "consumer_started"
        );

        loop {
            let message = tokio::select! {
                _ = token.cancelled() => break,
                m = self.ingress.inbound.recv() => match m {
                    Some(m) => m,
                    None => {
                        warn!("consumer_inbound_closed");
                        break;
                    }
                },
            };

            let settlement = self.consume(&message, &token).await;

            if self.ingress.settle.send(settlement).await.is_err() {
                warn!("consumer_settle_closed");
                break;
            }
        }

        info!("consumer_stopped");
    }

    async fn consume(&self, message: &RawMessage, token: &CancellationToken) -> Settlement {
        debug!(
            receipt = %message.receipt,
            subject = message.subject.as_deref().unwrap_or(""),
            "consumer_message_received"
        );

        let mut job = Job {
            body: &message.body,
            handler: &self.handler,
            gate: self.gate.as_ref(),
            token,
            delete_malformed: self.options.delete_malformed,
            retry: self.options.retry,
            error: None,
        };

        let receipt = message.receipt.clone();
        match self.supervisor.supervise(&mut job).await {
            Outcome::Ack => Settlement::Delete(receipt),
            Outcome::Redeliver => Settlement::Release(receipt),
            Outcome::DeadLetter => Settlement::Reject(receipt),
        }
    }
}
