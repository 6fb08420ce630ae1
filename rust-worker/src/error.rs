//! Error taxonomy shared by the transport, the consumers and their collaborators.
//!
//! The consumer loop only cares about which class an error falls into:
//! - [`DecodeError`] and [`ValidationError`] are terminal for a delivery (ack it)
//! - [`HandleError::Transient`] asks for redelivery after the health gate
//! - [`TransportError`] is retried inside the transport and never reaches a handler

use thiserror::Error;

/// A message body that could not be turned into an [`crate::msg::Envelope`].
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),

    #[error("envelope carries no payload")]
    Empty,

    #[error("envelope carries more than one payload: {0}")]
    Ambiguous(String),
}

/// A well-formed payload that must not be acted on.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("invalid source: {0} must match {1}")]
    Source(String, &'static str),

    #[error("invalid quality: {0}")]
    Quality(String),

    #[error("invalid MMI: {0}")]
    Mmi(i32),

    #[error("longitude not in range -180 to 180: {0}")]
    Longitude(f64),

    #[error("latitude not in range -90 to 90: {0}")]
    Latitude(f64),

    #[error("old message for {0}")]
    Old(String),

    #[error("message from the future for {0}")]
    Future(String),

    #[error("rate limited message for {0}")]
    RateLimited(String),

    #[error("no handler for {0} payloads")]
    Unsupported(&'static str),
}

/// Failure returned by a consumer's domain handler.
#[derive(Debug, Error)]
pub enum HandleError {
    /// Permanent for this delivery; logged and acked.
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    /// Believed to clear up on its own, typically an unreachable database.
    #[error("transient failure: {0:#}")]
    Transient(anyhow::Error),
}

impl HandleError {
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        HandleError::Transient(err.into())
    }
}

/// The error slot of one supervised message.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Handle(#[from] HandleError),
}

/// Queue and topic failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("amqp: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("publish was not confirmed by the broker")]
    NotConfirmed,

    #[error("empty message id from publish")]
    MissingMessageId,

    #[error("unknown receipt handle: {0}")]
    UnknownReceipt(String),

    #[error("transport closed")]
    Closed,
}

/// Persistence failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("no method to save intensity message with quality: {0}")]
    Quality(String),
}

/// Notification sink failures.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("notification rejected with status {0}")]
    Rejected(u16),
}

/// Returned by waits that were interrupted by shutdown.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("cancelled")]
pub struct Cancelled;
