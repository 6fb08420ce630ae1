//! Intensity payload and its validation rules.
//!
//! Intensity messages are either `measured` by instruments or `reported` by
//! the public. Only recent, well-formed messages are stored.

use std::sync::OnceLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

const SOURCE_PATTERN: &str = r"^[a-zA-Z0-9\.\-]+$";

/// Messages older than this are not saved.
pub const MAX_AGE_MINUTES: i64 = 60;

/// Clock skew tolerated for messages stamped in the future.
pub const FUTURE_TOLERANCE_SECONDS: i64 = 10;

const MAX_COMMENT_CHARS: usize = 139;

pub const MEASURED: &str = "measured";
pub const REPORTED: &str = "reported";

fn source_regex() -> &'static Regex {
    static SOURCE: OnceLock<Regex> = OnceLock::new();
    SOURCE.get_or_init(|| Regex::new(SOURCE_PATTERN).expect("source pattern is valid"))
}

/// A measured or reported intensity, e.g.
///
/// ```json
/// {
///    "Time": "2014-12-31T02:39:00Z",
///    "Longitude": 172,
///    "Latitude": -42.4,
///    "MMI": 4,
///    "Comment": "",
///    "Quality": "measured",
///    "Source": "test.test"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intensity {
    /// Unique identifier of the reporter or instrument, e.g. `ios.xxx` or `NZ.xxx`.
    #[serde(rename = "Source")]
    pub source: String,
    #[serde(rename = "Quality")]
    pub quality: String,
    #[serde(rename = "Comment", default)]
    pub comment: String,
    #[serde(rename = "MMI")]
    pub mmi: i32,
    #[serde(rename = "Latitude")]
    pub latitude: f64,
    #[serde(rename = "Longitude")]
    pub longitude: f64,
    #[serde(rename = "Time")]
    pub time: DateTime<Utc>,
}

impl Intensity {
    /// Check the static fields and trim the comment.
    pub fn validate(&mut self) -> Result<(), ValidationError> {
        if !source_regex().is_match(&self.source) {
            return Err(ValidationError::Source(self.source.clone(), SOURCE_PATTERN));
        }

        if !self.is_measured() && !self.is_reported() {
            return Err(ValidationError::Quality(self.quality.clone()));
        }

        if !(1..=12).contains(&self.mmi) {
            return Err(ValidationError::Mmi(self.mmi));
        }

        if !(self.longitude > -180.0 && self.longitude < 180.0) {
            return Err(ValidationError::Longitude(self.longitude));
        }

        if !(self.latitude > -90.0 && self.latitude < 90.0) {
            return Err(ValidationError::Latitude(self.latitude));
        }

        if self.comment.chars().count() > MAX_COMMENT_CHARS {
            self.comment = self.comment.chars().take(MAX_COMMENT_CHARS).collect();
        }

        Ok(())
    }

    pub fn check_age(&self, now: DateTime<Utc>) -> Result<(), ValidationError> {
        if self.time < now - Duration::minutes(MAX_AGE_MINUTES) {
            return Err(ValidationError::Old(self.source.clone()));
        }
        Ok(())
    }

    pub fn check_future(&self, now: DateTime<Utc>) -> Result<(), ValidationError> {
        if self.time > now + Duration::seconds(FUTURE_TOLERANCE_SECONDS) {
            return Err(ValidationError::Future(self.source.clone()));
        }
        Ok(())
    }

    pub fn is_measured(&self) -> bool {
        self.quality == MEASURED
    }

    pub fn is_reported(&self) -> bool {
        self.quality == REPORTED
    }
}
