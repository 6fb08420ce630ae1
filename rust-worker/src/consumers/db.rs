use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use crate::consumer::Handler;
use crate::error::{HandleError, ValidationError};
use crate::msg::{Envelope, HeartBeat, Quake};
use crate::store::Save;

/// Saves quakes and heartbeats. Any store failure is treated as transient.
pub struct DbHandler<S> {
    store: S,
}

impl<S> DbHandler<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S> Handler for DbHandler<S>
where
    S: Save<Quake> + Save<HeartBeat>,
{
    async fn handle(&self, envelope: Envelope) -> Result<(), HandleError> {
        match envelope {
            Envelope::HeartBeat(h) => {
                h.rx_log();
                if h.is_old(Utc::now()) {
                    debug!(service_id = %h.service_id, sent_time = %h.sent_time, "heartbeat_skipped_old");
                    return Ok(());
                }
                Save::<HeartBeat>::save(&self.store, &h)
                    .await
                    .map_err(HandleError::transient)
            }
            Envelope::Quake(q) => {
                q.rx_log();
                Save::<Quake>::save(&self.store, &q)
                    .await
                    .map_err(HandleError::transient)
            }
            other => Err(ValidationError::Unsupported(other.kind()).into()),
        }
    }
}
