//! HeartBeat payload.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Heartbeats older than this are not worth storing.
const HEARTBEAT_MAX_AGE_MINUTES: i64 = 5;

/// Liveness signal periodically published by each producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartBeat {
    #[serde(rename = "ServiceID")]
    pub service_id: String,
    #[serde(rename = "SentTime")]
    pub sent_time: DateTime<Utc>,
}

impl HeartBeat {
    pub fn new(service_id: impl Into<String>, sent_time: DateTime<Utc>) -> Self {
        Self {
            service_id: service_id.into(),
            sent_time,
        }
    }

    pub fn is_old(&self, now: DateTime<Utc>) -> bool {
        self.sent_time < now - Duration::minutes(HEARTBEAT_MAX_AGE_MINUTES)
    }

    pub fn rx_log(&self) {
        info!(service_id = %self.service_id, "heartbeat_received");
    }

    pub fn tx_log(&self) {
        info!(service_id = %self.service_id, "heartbeat_sending");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_old() {
        let now = Utc::now();
        assert!(!HeartBeat::new("haz-sc3-producer", now).is_old(now));
        assert!(!HeartBeat::new("haz-sc3-producer", now - Duration::minutes(4)).is_old(now));
        assert!(HeartBeat::new("haz-sc3-producer", now - Duration::minutes(6)).is_old(now));
    }

    #[test]
    fn test_heartbeat_deserialization() {
        let json = r#"{"ServiceID": "haz-sc3-producer", "SentTime": "2015-05-01T10:00:00Z"}"#;
        let hb: HeartBeat = serde_json::from_str(json).unwrap();
        assert_eq!(hb.service_id, "haz-sc3-producer");
        assert_eq!(hb.sent_time.to_rfc3339(), "2015-05-01T10:00:00+00:00");
    }
}
