//! Notification seams for the duty consumer.
//!
//! - [`IdempotencyOracle`] remembers which quakes were already notified
//! - [`AlertPolicy`] decides whether a quake warrants a page and words it
//! - [`Notifier`] delivers the page
//!
//! Thin adapters are provided for each; deployments can swap in their own.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::NotifyError;
use crate::msg::Quake;

const PAGERDUTY_URL: &str = "https://events.pagerduty.com/generic/2010-04-15/create_event.json";

#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    /// Deliver `description`. `incident_key` lets the receiver de-duplicate.
    async fn send(&self, description: &str, incident_key: &str) -> Result<(), NotifyError>;
}

#[async_trait]
pub trait IdempotencyOracle: Send + Sync + 'static {
    async fn seen(&self, quake: &Quake) -> bool;
    async fn add(&self, quake: &Quake);
}

pub trait AlertPolicy: Send + Sync + 'static {
    /// The notification text when `quake` should be alerted on at `now`.
    fn alert(&self, quake: &Quake, now: DateTime<Utc>) -> Option<String>;
}

// =============================================================================
// Adapters
// =============================================================================

/// Process-local oracle keyed on the public id. Forgets on restart.
#[derive(Debug, Default)]
pub struct MemoryOracle {
    seen: Mutex<HashSet<String>>,
}

#[async_trait]
impl IdempotencyOracle for MemoryOracle {
    async fn seen(&self, quake: &Quake) -> bool {
        self.seen.lock().await.contains(&quake.public_id)
    }

    async fn add(&self, quake: &Quake) {
        self.seen.lock().await.insert(quake.public_id.clone());
    }
}

/// Alerts on well constrained, recent quakes above a magnitude.
#[derive(Debug, Clone)]
pub struct ThresholdPolicy {
    pub min_magnitude: f64,
    pub max_age: Duration,
    pub min_phases: i32,
    pub min_magnitude_stations: i32,
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self {
            min_magnitude: 4.5,
            max_age: Duration::minutes(60),
            min_phases: 20,
            min_magnitude_stations: 10,
        }
    }
}

impl ThresholdPolicy {
    fn suitable(&self, quake: &Quake, now: DateTime<Utc>) -> bool {
        match quake.status() {
            "deleted" | "duplicate" => false,
            "automatic"
                if quake.used_phase_count < self.min_phases
                    || quake.magnitude_station_count < self.min_magnitude_stations =>
            {
                false
            }
            _ => quake.time >= now - self.max_age,
        }
    }
}

impl AlertPolicy for ThresholdPolicy {
    fn alert(&self, quake: &Quake, now: DateTime<Utc>) -> Option<String> {
        if !self.suitable(quake, now) || quake.magnitude < self.min_magnitude {
            return None;
        }

        Some(format!(
            "Eq Rpt: MAG {:.1}, DEP {:.0}, LAT {:.2}, LON {:.2}, TIME {}",
            quake.magnitude,
            quake.depth,
            quake.latitude,
            quake.longitude,
            quake.time.format("%H:%M %d/%m/%Y UTC"),
        ))
    }
}

#[derive(Serialize)]
struct Trigger<'a> {
    service_key: &'a str,
    event_type: &'static str,
    description: &'a str,
    incident_key: &'a str,
}

/// Triggers incidents through the PagerDuty events API.
pub struct PagerDutyNotifier {
    client: Client,
    api_token: String,
    service_key: String,
}

impl PagerDutyNotifier {
    pub fn new(client: Client, api_token: impl Into<String>, service_key: impl Into<String>) -> Self {
        Self {
            client,
            api_token: api_token.into(),
            service_key: service_key.into(),
        }
    }

    fn trigger<'a>(&'a self, description: &'a str, incident_key: &'a str) -> Trigger<'a> {
        Trigger {
            service_key: &self.service_key,
            event_type: "trigger",
            description,
            incident_key,
        }
    }
}

#[async_trait]
impl Notifier for PagerDutyNotifier {
    async fn send(&self, description: &str, incident_key: &str) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(PAGERDUTY_URL)
            .header("Authorization", format!("Token token={}", self.api_token))
            .json(&self.trigger(description, incident_key))
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(NotifyError::Rejected(status.as_u16()));
        }

        info!(incident_key, "pagerduty_triggered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::quake::tests::quake;

    fn now() -> DateTime<Utc> {
        "2015-05-01T10:30:00Z".parse().unwrap()
    }

    fn big_reviewed() -> Quake {
        let mut q = quake("2015p012816");
        q.time = now() - Duration::minutes(5);
        q.magnitude = 5.02;
        q.depth = 10.0;
        q.evaluation_mode = "manual".to_string();
        q
    }

    #[tokio::test]
    async fn test_memory_oracle() {
        let oracle = MemoryOracle::default();
        let q = big_reviewed();

        assert!(!oracle.seen(&q).await);
        oracle.add(&q).await;
        assert!(oracle.seen(&q).await);
        assert!(!oracle.seen(&quake("2015p000001")).await);
    }

    #[test]
    fn test_policy_alerts_on_large_quake() {
        let message = ThresholdPolicy::default().alert(&big_reviewed(), now()).unwrap();
        assert!(message.starts_with("Eq Rpt: MAG 5.0, DEP 10"));
    }

    #[test]
    fn test_policy_skips_unsuitable() {
        let policy = ThresholdPolicy::default();

        let mut small = big_reviewed();
        small.magnitude = 3.1;
        assert_eq!(policy.alert(&small, now()), None);

        let mut old = big_reviewed();
        old.time = now() - Duration::minutes(61);
        assert_eq!(policy.alert(&old, now()), None);

        let mut deleted = big_reviewed();
        deleted.kind = "not existing".to_string();
        assert_eq!(policy.alert(&deleted, now()), None);

        let mut thin = big_reviewed();
        thin.evaluation_mode = "automatic".to_string();
        thin.used_phase_count = 12;
        assert_eq!(policy.alert(&thin, now()), None);
    }

    #[test]
    fn test_trigger_body() {
        let notifier = PagerDutyNotifier::new(Client::new(), "token", "service");
        let json = serde_json::to_value(notifier.trigger("Eq Rpt", "2015p012816")).unwrap();

        assert_eq!(json["service_key"], "service");
        assert_eq!(json["event_type"], "trigger");
        assert_eq!(json["incident_key"], "2015p012816");
    }
}
