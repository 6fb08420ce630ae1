//! Per-consumer [`crate::consumer::Handler`]s.
//!
//! - [`DbHandler`]: quakes and heartbeats into the hazard database
//! - [`IntensityHandler`]: validated, rate-limited intensity reports
//! - [`DutyHandler`]: pages the duty officer once per qualifying quake

pub mod db;
pub mod duty;
pub mod intensity;

pub use db::DbHandler;
pub use duty::DutyHandler;
pub use intensity::{spawn_expirer, IntensityHandler};
