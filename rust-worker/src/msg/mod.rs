//! Message payloads and the envelope that carries them.
//!
//! ```text
//! body (JSON) → Envelope::decode() → Envelope::{Quake, HeartBeat, Intensity}
//! ```

pub mod envelope;
pub mod heartbeat;
pub mod intensity;
pub mod quake;

pub use envelope::Envelope;
pub use heartbeat::HeartBeat;
pub use intensity::Intensity;
pub use quake::Quake;
