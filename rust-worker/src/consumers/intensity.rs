use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::consumer::Handler;
use crate::error::{HandleError, ValidationError};
use crate::msg::intensity::MAX_AGE_MINUTES;
use crate::msg::Envelope;
use crate::ratelimit::RateLimiter;
use crate::store::IntensityStore;

/// How often old measured intensities are deleted.
pub const EXPIRE_INTERVAL: Duration = Duration::from_secs(10);

/// Validates and stores intensity reports.
///
/// Reported (public) intensities are limited to one per source per window.
/// A source is only recorded once its report has been saved.
pub struct IntensityHandler<S> {
    store: S,
    limiter: Arc<RateLimiter>,
}

impl<S> IntensityHandler<S> {
    pub fn new(store: S, limiter: Arc<RateLimiter>) -> Self {
        Self { store, limiter }
    }
}

#[async_trait]
impl<S: IntensityStore> Handler for IntensityHandler<S> {
    async fn handle(&self, envelope: Envelope) -> Result<(), HandleError> {
        let mut intensity = match envelope {
            Envelope::Intensity(i) => i,
            other => return Err(ValidationError::Unsupported(other.kind()).into()),
        };

        let now = Utc::now();
        intensity.validate()?;
        intensity.check_age(now)?;
        intensity.check_future(now)?;

        let limited = intensity.is_reported();
        if limited {
            self.limiter.admit(&intensity.source, intensity.time).await?;
        }

        self.store
            .save(&intensity)
            .await
            .map_err(HandleError::transient)?;

        if limited {
            self.limiter.record(&intensity.source, intensity.time).await;
        }

        debug!(
            source = %intensity.source,
            quality = %intensity.quality,
            mmi = intensity.mmi,
            "intensity_saved"
        );
        Ok(())
    }
}

/// Delete measured intensities past their age every [`EXPIRE_INTERVAL`].
pub fn spawn_expirer<S: IntensityStore>(store: S, token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(EXPIRE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let before = Utc::now() - chrono::Duration::minutes(MAX_AGE_MINUTES);
            match store.expire_measured(before).await {
                Ok(0) => {}
                Ok(removed) => info!(removed, "intensity_measured_expired"),
                Err(e) => warn!(error = %e, "intensity_expire_failed"),
            }
        }
    })
}
