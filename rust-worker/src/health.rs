//! Backpressure gate for a critical dependency.
//!
//! When a side effect fails because a dependency is down, the consumer waits
//! here instead of spinning on redeliveries or dropping messages. Everything
//! else stays on the queue until the probe succeeds again.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::Cancelled;

/// Pause between failed probes.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Cheap liveness check against a dependency.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn ping(&self) -> anyhow::Result<()>;
}

#[async_trait]
impl<P: Probe + ?Sized> Probe for Arc<P> {
    async fn ping(&self) -> anyhow::Result<()> {
        (**self).ping().await
    }
}

/// Blocks callers until `probe` succeeds.
pub struct HealthGate<P> {
    probe: P,
    interval: Duration,
}

impl<P: Probe> HealthGate<P> {
    pub fn new(probe: P) -> Self {
        Self {
            probe,
            interval: PROBE_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Probe until healthy. Only cancellation ends the wait early.
    pub async fn wait_until_healthy(&self, token: &CancellationToken) -> Result<(), Cancelled> {
        let mut failures: u64 = 0;

        loop {
            let result = tokio::select! {
                _ = token.cancelled() => return Err(Cancelled),
                r = self.probe.ping() => r,
            };

            match result {
                Ok(()) => {
                    if failures > 0 {
                        info!(failures, "health_probe_recovered");
                    }
                    return Ok(());
                }
                Err(e) => {
                    failures += 1;
                    let detail = format!("{:#}", e);
                    warn!(
                        error = %detail,
                        failures,
                        retry_secs = self.interval.as_secs(),
                        "health_probe_failed"
                    );
                }
            }

            tokio::select! {
                _ = token.cancelled() => return Err(Cancelled),
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}
