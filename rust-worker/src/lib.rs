//! Haz - reliable queue consumers for seismic event messages.
//!
//! This library provides shared modules for the consumer binaries:
//! - `haz-db-consumer`: Stores quakes and heartbeats in the hazard database
//! - `impact-intensity-consumer`: Stores validated, rate-limited intensity reports
//! - `haz-heartbeat`: Publishes a heartbeat to the topic
//!
//! ## Architecture
//!
//! ```text
//! Producers → topic → queue → receive loop → Consumer → Handler → store
//!                                  ↑                        │
//!                                  └── settle loop ← Delete | Release | Reject
//! ```

pub mod config;
pub mod consumer;
pub mod consumers;
pub mod error;
pub mod health;
pub mod metrics;
pub mod msg;
pub mod notify;
pub mod ratelimit;
pub mod runtime;
pub mod store;
pub mod supervisor;
pub mod transport;

// Re-export commonly used types
pub use config::Config;
pub use consumer::{Consumer, ConsumerOptions, Gate, Handler};
pub use error::{DecodeError, HandleError, ProcessError, TransportError, ValidationError};
pub use health::{HealthGate, Probe};
pub use metrics::Metrics;
pub use msg::{Envelope, HeartBeat, Intensity, Quake};
pub use ratelimit::RateLimiter;
pub use supervisor::{Message, Outcome, Supervisor};
pub use transport::{Ingress, Publisher, RawMessage, ReceiptHandle, Settlement};
