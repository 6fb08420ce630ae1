use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use crate::consumer::Handler;
use crate::error::{HandleError, ValidationError};
use crate::msg::Envelope;
use crate::notify::{AlertPolicy, IdempotencyOracle, Notifier};

/// Pages the duty officer for quakes the policy alerts on.
///
/// A quake is remembered only after the page went out, so a failed page is
/// redelivered and tried again.
pub struct DutyHandler<O, N, A> {
    oracle: O,
    notifier: N,
    policy: A,
}

impl<O, N, A> DutyHandler<O, N, A> {
    pub fn new(oracle: O, notifier: N, policy: A) -> Self {
        Self {
            oracle,
            notifier,
            policy,
        }
    }
}

#[async_trait]
impl<O, N, A> Handler for DutyHandler<O, N, A>
where
    O: IdempotencyOracle,
    N: Notifier,
    A: AlertPolicy,
{
    async fn handle(&self, envelope: Envelope) -> Result<(), HandleError> {
        let quake = match envelope {
            Envelope::Quake(q) => q,
            Envelope::HeartBeat(h) => {
                h.rx_log();
                return Ok(());
            }
            other => return Err(ValidationError::Unsupported(other.kind()).into()),
        };

        quake.rx_log();

        if self.oracle.seen(&quake).await {
            info!(public_id = %quake.public_id, "duty_already_notified");
            return Ok(());
        }

        let Some(message) = self.policy.alert(&quake, Utc::now()) else {
            return Ok(());
        };

        info!(public_id = %quake.public_id, "duty_notifying");
        self.notifier
            .send(&message, &quake.public_id)
            .await
            .map_err(HandleError::transient)?;

        self.oracle.add(&quake).await;
        Ok(())
    }
}
