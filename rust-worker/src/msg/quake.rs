//! Quake payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

/// A located earthquake as produced by the seismic processing pipeline.
///
/// Field names match the upstream producer's JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quake {
    #[serde(rename = "PublicID")]
    pub public_id: String,
    #[serde(rename = "Type", default)]
    pub kind: String,
    #[serde(rename = "AgencyID", default)]
    pub agency_id: String,
    /// The Unix epoch when absent.
    #[serde(rename = "ModificationTime", default)]
    pub modification_time: DateTime<Utc>,
    /// The Unix epoch when absent.
    #[serde(rename = "Time", default)]
    pub time: DateTime<Utc>,
    #[serde(rename = "Latitude", default)]
    pub latitude: f64,
    #[serde(rename = "Longitude", default)]
    pub longitude: f64,
    #[serde(rename = "Depth", default)]
    pub depth: f64,
    #[serde(rename = "DepthType", default)]
    pub depth_type: String,
    #[serde(rename = "MethodID", default)]
    pub method_id: String,
    #[serde(rename = "EarthModelID", default)]
    pub earth_model_id: String,
    #[serde(rename = "EvaluationMode", default)]
    pub evaluation_mode: String,
    #[serde(rename = "EvaluationStatus", default)]
    pub evaluation_status: String,
    #[serde(rename = "UsedPhaseCount", default)]
    pub used_phase_count: i32,
    #[serde(rename = "UsedStationCount", default)]
    pub used_station_count: i32,
    #[serde(rename = "StandardError", default)]
    pub standard_error: f64,
    #[serde(rename = "AzimuthalGap", default)]
    pub azimuthal_gap: f64,
    #[serde(rename = "MinimumDistance", default)]
    pub minimum_distance: f64,
    #[serde(rename = "Magnitude", default)]
    pub magnitude: f64,
    #[serde(rename = "MagnitudeUncertainty", default)]
    pub magnitude_uncertainty: f64,
    #[serde(rename = "MagnitudeType", default)]
    pub magnitude_type: String,
    #[serde(rename = "MagnitudeStationCount", default)]
    pub magnitude_station_count: i32,
    #[serde(rename = "Site", default)]
    pub site: String,
}

impl Quake {
    /// Public status derived from the event type and evaluation fields.
    pub fn status(&self) -> &'static str {
        match self.kind.as_str() {
            "not existing" => "deleted",
            "duplicate" => "duplicate",
            _ if self.evaluation_mode == "manual" || self.evaluation_status == "confirmed" => {
                "reviewed"
            }
            _ => "automatic",
        }
    }

    pub fn rx_log(&self) {
        info!(public_id = %self.public_id, status = self.status(), "quake_received");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn quake(public_id: &str) -> Quake {
        let now = Utc::now();
        Quake {
            public_id: public_id.to_string(),
            kind: "earthquake".to_string(),
            agency_id: "WEL".to_string(),
            modification_time: now,
            time: now,
            latitude: -41.5,
            longitude: 174.2,
            depth: 12.0,
            depth_type: String::new(),
            method_id: "LOCSAT".to_string(),
            earth_model_id: "iasp91".to_string(),
            evaluation_mode: "automatic".to_string(),
            evaluation_status: String::new(),
            used_phase_count: 20,
            used_station_count: 15,
            standard_error: 0.5,
            azimuthal_gap: 120.0,
            minimum_distance: 0.1,
            magnitude: 4.2,
            magnitude_uncertainty: 0.1,
            magnitude_type: "M".to_string(),
            magnitude_station_count: 10,
            site: "primary".to_string(),
        }
    }

    #[test]
    fn test_status() {
        let mut q = quake("2015p012816");
        assert_eq!(q.status(), "automatic");

        q.evaluation_status = "confirmed".to_string();
        assert_eq!(q.status(), "reviewed");

        q.evaluation_status = String::new();
        q.evaluation_mode = "manual".to_string();
        assert_eq!(q.status(), "reviewed");

        q.kind = "duplicate".to_string();
        assert_eq!(q.status(), "duplicate");

        q.kind = "not existing".to_string();
        assert_eq!(q.status(), "deleted");
    }

    #[test]
    fn test_quake_field_names() {
        let json = serde_json::to_value(quake("2015p012816")).unwrap();
        assert_eq!(json["PublicID"], "2015p012816");
        assert_eq!(json["AgencyID"], "WEL");
        assert!(json.get("public_id").is_none());
    }

    #[test]
    fn test_missing_times_decode_as_epoch() {
        let q: Quake = serde_json::from_str(r#"{"PublicID": "2015p012816", "Type": "earthquake"}"#).unwrap();
        assert_eq!(q.public_id, "2015p012816");
        assert_eq!(q.time.timestamp(), 0);
        assert_eq!(q.modification_time, DateTime::<Utc>::default());
        assert_eq!(q.status(), "automatic");
    }
}
