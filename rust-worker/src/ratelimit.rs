//! Per-source throttle for publicly submitted messages.
//!
//! Each source may have one message accepted per window. The window is
//! checked against the last *recorded* time, and recording only happens after
//! the side effect succeeded, so a failed save never blocks a retry.
//!
//! Delivery order is not guaranteed, so the window is the absolute difference
//! between event times, not "newer than".

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::ValidationError;

/// Minimum spacing between accepted events from one source.
pub const WINDOW: Duration = Duration::from_secs(60);

/// Entries older than this are swept.
pub const RETENTION: Duration = Duration::from_secs(60 * 60);

/// How often the sweeper runs.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Shared map of source to last accepted event time.
#[derive(Debug)]
pub struct RateLimiter {
    last: RwLock<HashMap<String, DateTime<Utc>>>,
    window: chrono::Duration,
    retention: chrono::Duration,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(WINDOW, RETENTION)
    }
}

impl RateLimiter {
    pub fn new(window: Duration, retention: Duration) -> Self {
        Self {
            last: RwLock::new(HashMap::new()),
            window: chrono::Duration::milliseconds(window.as_millis() as i64),
            retention: chrono::Duration::milliseconds(retention.as_millis() as i64),
        }
    }

    /// Reject `event_time` if it falls within the window of the recorded time.
    ///
    /// Admission does not record anything; call [`RateLimiter::record`] once
    /// the side effect has succeeded.
    pub async fn admit(&self, source: &str, event_time: DateTime<Utc>) -> Result<(), ValidationError> {
        let last = self.last.read().await;

        match last.get(source) {
            Some(recorded) if abs_diff(event_time, *recorded) < self.window => {
                debug!(source, %event_time, recorded = %recorded, "rate_limit_rejected");
                Err(ValidationError::RateLimited(source.to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Record an accepted event. Older times never replace newer ones.
    pub async fn record(&self, source: &str, event_time: DateTime<Utc>) {
        let mut last = self.last.write().await;

        last.entry(source.to_string())
            .and_modify(|recorded| {
                if event_time > *recorded {
                    *recorded = event_time;
                }
            })
            .or_insert(event_time);
    }

    /// Remove sources last recorded before `now - retention`. Returns how many went.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.retention;
        let mut last = self.last.write().await;

        let before = last.len();
        last.retain(|_, recorded| *recorded >= cutoff);
        before - last.len()
    }

    pub async fn len(&self) -> usize {
        self.last.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn abs_diff(a: DateTime<Utc>, b: DateTime<Utc>) -> chrono::Duration {
    if a >= b {
        a - b
    } else {
        b - a
    }
}

/// Sweep `limiter` every [`SWEEP_INTERVAL`] until cancelled.
pub fn spawn_sweeper(limiter: Arc<RateLimiter>, token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = limiter.sweep_at(Utc::now()).await;
                    if removed > 0 {
                        let remaining = limiter.len().await;
                        info!(removed, remaining, "rate_limit_swept");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn t0() -> DateTime<Utc> {
        "2015-05-01T10:00:00Z".parse().unwrap()
    }

    #[tokio::test]
    async fn test_unknown_source_is_admitted_without_recording() {
        let limiter = RateLimiter::default();
        assert!(limiter.admit("ios.abc", t0()).await.is_ok());
        assert!(limiter.is_empty().await);
    }

    #[tokio::test]
    async fn test_window_both_sides() {
        let limiter = RateLimiter::default();
        limiter.record("ios.abc", t0()).await;

        assert_eq!(
            limiter.admit("ios.abc", t0() + ChronoDuration::seconds(30)).await,
            Err(ValidationError::RateLimited("ios.abc".to_string()))
        );
        assert!(limiter.admit("ios.abc", t0() + ChronoDuration::seconds(90)).await.is_ok());

        // The window is exclusive at exactly 60 s.
        assert!(limiter.admit("ios.abc", t0() + ChronoDuration::seconds(60)).await.is_ok());
        assert!(limiter
            .admit("ios.abc", t0() + ChronoDuration::milliseconds(59_999))
            .await
            .is_err());

        // Other sources are unaffected.
        assert!(limiter.admit("android.xyz", t0()).await.is_ok());
    }

    #[tokio::test]
    async fn test_out_of_order_uses_absolute_difference() {
        let limiter = RateLimiter::default();
        limiter.record("ios.abc", t0()).await;

        assert!(limiter.admit("ios.abc", t0() - ChronoDuration::seconds(30)).await.is_err());
        assert!(limiter.admit("ios.abc", t0() - ChronoDuration::seconds(90)).await.is_ok());
    }

    #[tokio::test]
    async fn test_record_never_regresses() {
        let limiter = RateLimiter::default();
        limiter.record("ios.abc", t0()).await;
        limiter.record("ios.abc", t0() - ChronoDuration::seconds(90)).await;

        // Still measured against t0.
        assert!(limiter.admit("ios.abc", t0() + ChronoDuration::seconds(30)).await.is_err());

        limiter.record("ios.abc", t0() + ChronoDuration::seconds(90)).await;
        assert!(limiter.admit("ios.abc", t0() + ChronoDuration::seconds(120)).await.is_err());
        assert!(limiter.admit("ios.abc", t0() + ChronoDuration::seconds(30)).await.is_ok());
    }

    #[tokio::test]
    async fn test_sweep_bounds_memory() {
        let limiter = RateLimiter::default();
        let now = t0();

        for i in 0..100 {
            limiter
                .record(&format!("ios.{}", i), now - ChronoDuration::minutes(61))
                .await;
        }
        assert_eq!(limiter.len().await, 100);

        assert_eq!(limiter.sweep_at(now).await, 100);
        assert!(limiter.is_empty().await);
    }

    #[tokio::test]
    async fn test_sweep_keeps_recent_sources() {
        let limiter = RateLimiter::default();
        let now = t0();

        limiter.record("stale", now - ChronoDuration::minutes(90)).await;
        limiter.record("fresh", now - ChronoDuration::minutes(59)).await;

        assert_eq!(limiter.sweep_at(now).await, 1);
        assert_eq!(limiter.len().await, 1);
        assert!(limiter.admit("fresh", now - ChronoDuration::minutes(59)).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_every_interval() {
        let limiter = Arc::new(RateLimiter::default());
        limiter
            .record("stale", Utc::now() - ChronoDuration::hours(2))
            .await;

        let token = CancellationToken::new();
        let handle = spawn_sweeper(Arc::clone(&limiter), token.clone());

        tokio::time::sleep(SWEEP_INTERVAL + Duration::from_secs(1)).await;
        assert!(limiter.is_empty().await);

        token.cancel();
        handle.await.unwrap();
    }
}
