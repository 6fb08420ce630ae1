//! Envelope wire format.
//!
//! On the wire an envelope is a JSON object with one optional key per payload
//! kind. Producers set exactly one of them:
//!
//! ```json
//! {"HeartBeat": {"ServiceID": "haz-sc3-producer", "SentTime": "2015-05-01T10:00:00Z"}}
//! ```
//!
//! Unknown keys are ignored. In memory the envelope is a sum type so that
//! consumers match on the payload exhaustively.

use serde::{Deserialize, Serialize};

use super::{HeartBeat, Intensity, Quake};
use crate::error::DecodeError;

/// Exactly one payload carried by a message.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Quake(Quake),
    HeartBeat(HeartBeat),
    Intensity(Intensity),
}

/// Nullable-field form used for (de)serialization.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Wire {
    #[serde(rename = "Quake", default, skip_serializing_if = "Option::is_none")]
    quake: Option<Quake>,
    #[serde(rename = "HeartBeat", default, skip_serializing_if = "Option::is_none")]
    heartbeat: Option<HeartBeat>,
    #[serde(rename = "Intensity", default, skip_serializing_if = "Option::is_none")]
    intensity: Option<Intensity>,
}

impl Envelope {
    /// Decode a message body.
    pub fn decode(body: &str) -> Result<Self, DecodeError> {
        let wire: Wire = serde_json::from_str(body)?;

        let present: Vec<&str> = [
            wire.quake.as_ref().map(|_| "Quake"),
            wire.heartbeat.as_ref().map(|_| "HeartBeat"),
            wire.intensity.as_ref().map(|_| "Intensity"),
        ]
        .into_iter()
        .flatten()
        .collect();

        if present.len() > 1 {
            return Err(DecodeError::Ambiguous(present.join(",")));
        }

        match wire {
            Wire { quake: Some(q), .. } => Ok(Envelope::Quake(q)),
            Wire { heartbeat: Some(h), .. } => Ok(Envelope::HeartBeat(h)),
            Wire { intensity: Some(i), .. } => Ok(Envelope::Intensity(i)),
            _ => Err(DecodeError::Empty),
        }
    }

    /// Encode as JSON.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let wire = match self {
            Envelope::Quake(q) => Wire {
                quake: Some(q.clone()),
                ..Default::default()
            },
            Envelope::HeartBeat(h) => Wire {
                heartbeat: Some(h.clone()),
                ..Default::default()
            },
            Envelope::Intensity(i) => Wire {
                intensity: Some(i.clone()),
                ..Default::default()
            },
        };

        serde_json::to_string(&wire)
    }

    /// Payload kind, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Quake(_) => "quake",
            Envelope::HeartBeat(_) => "heartbeat",
            Envelope::Intensity(_) => "intensity",
        }
    }
}
