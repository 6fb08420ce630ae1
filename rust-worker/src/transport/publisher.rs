//! Retrying topic publisher.
//!
//! A publish only counts once the broker hands back a message id. Failed
//! attempts are retried with a fixed pause; after the last attempt the error is
//! returned and the caller decides whether its own message needs redelivery.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{TopicBackend, RETRY_INTERVAL};
use crate::error::TransportError;

/// Publisher shared across tasks.
pub struct Publisher<T> {
    topic: Arc<T>,
    retry: Duration,
    token: CancellationToken,
}

impl<T> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Self {
            topic: Arc::clone(&self.topic),
            retry: self.retry,
            token: self.token.clone(),
        }
    }
}

impl<T: TopicBackend> Publisher<T> {
    pub fn new(topic: Arc<T>, token: CancellationToken) -> Self {
        Self {
            topic,
            retry: RETRY_INTERVAL,
            token,
        }
    }

    /// Override the pause between attempts.
    pub fn with_retry_interval(mut self, retry: Duration) -> Self {
        self.retry = retry;
        self
    }

    /// Publish `body`, trying `retries` more times after a failure.
    ///
    /// `retries` can be 0 to attempt publishing only once. Returns the
    /// confirmed message id.
    pub async fn publish(
        &self,
        body: &str,
        subject: Option<&str>,
        retries: u32,
    ) -> Result<String, TransportError> {
        let mut attempt = 0;

        loop {
            let err = match self.topic.publish(body, subject).await {
                Ok(id) if !id.is_empty() => {
                    info!(message_id = %id, body_length = body.len(), attempt, "topic_published");
                    return Ok(id);
                }
                Ok(_) => TransportError::MissingMessageId,
                Err(e) => e,
            };

            if attempt >= retries {
                warn!(error = %err, attempts = attempt + 1, "topic_publish_failed");
                return Err(err);
            }
            attempt += 1;

            warn!(
                error = %err,
                attempt,
                retries,
                retry_secs = self.retry.as_secs(),
                "topic_publish_retrying"
            );

            tokio::select! {
                _ = self.token.cancelled() => return Err(err),
                _ = tokio::time::sleep(self.retry) => {}
            }
        }
    }
}
