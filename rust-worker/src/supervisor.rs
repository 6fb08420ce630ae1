//! Runs one message through its processing and keeps the books.
//!
//! The supervisor knows nothing about payloads. It counts, times and logs, and
//! passes the message's own [`Outcome`] straight back to the caller.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::ProcessError;
use crate::metrics::Metrics;

/// What the transport should do with a delivery after processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Done with it, successfully or not. Remove from the queue.
    Ack,
    /// Leave it for redelivery.
    Redeliver,
    /// Give up on it and route it to the dead-letter destination.
    DeadLetter,
}

/// Something the supervisor can process.
#[async_trait]
pub trait Message: Send {
    async fn process(&mut self) -> Outcome;

    /// Error recorded by the last `process` call, if any.
    fn err(&self) -> Option<&ProcessError>;
}

#[derive(Clone)]
pub struct Supervisor {
    metrics: Arc<Metrics>,
}

impl Supervisor {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { metrics }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub async fn supervise<M: Message + ?Sized>(&self, message: &mut M) -> Outcome {
        self.metrics.received();

        let started = Instant::now();
        let outcome = message.process().await;
        let elapsed = started.elapsed();

        self.metrics.processed(elapsed);

        if let Some(err) = message.err() {
            self.metrics.error();
            warn!(error = %err, outcome = ?outcome, "message_processing_failed");
        } else {
            debug!(
                outcome = ?outcome,
                elapsed_ms = elapsed.as_millis() as u64,
                "message_processed"
            );
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DecodeError, HandleError};

    struct Scripted {
        outcome: Outcome,
        error: Option<ProcessError>,
        fail_with: Option<ProcessError>,
        calls: usize,
    }

    impl Scripted {
        fn new(outcome: Outcome, fail_with: Option<ProcessError>) -> Self {
            Self {
                outcome,
                error: None,
                fail_with,
                calls: 0,
            }
        }
    }

    #[async_trait]
    impl Message for Scripted {
        async fn process(&mut self) -> Outcome {
            self.calls += 1;
            self.error = self.fail_with.take();
            self.outcome
        }

        fn err(&self) -> Option<&ProcessError> {
            self.error.as_ref()
        }
    }

    #[tokio::test]
    async fn test_outcome_is_passed_through() {
        let supervisor = Supervisor::new(Metrics::new());

        for outcome in [Outcome::Ack, Outcome::Redeliver, Outcome::DeadLetter] {
            let mut message = Scripted::new(outcome, None);
            assert_eq!(supervisor.supervise(&mut message).await, outcome);
            assert_eq!(message.calls, 1);
        }

        let window = supervisor.metrics().take_window();
        assert_eq!(window.received, 3);
        assert_eq!(window.processed, 3);
        assert_eq!(window.errors, 0);
    }

    #[tokio::test]
    async fn test_errors_are_counted() {
        let supervisor = Supervisor::new(Metrics::new());

        let mut decode = Scripted::new(Outcome::Ack, Some(DecodeError::Empty.into()));
        let mut transient = Scripted::new(
            Outcome::Redeliver,
            Some(HandleError::transient(anyhow::anyhow!("db down")).into()),
        );

        assert_eq!(supervisor.supervise(&mut decode).await, Outcome::Ack);
        assert_eq!(supervisor.supervise(&mut transient).await, Outcome::Redeliver);

        let window = supervisor.metrics().take_window();
        assert_eq!(window.received, 2);
        assert_eq!(window.errors, 2);
    }
}
