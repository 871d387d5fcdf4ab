//! Core library for beat-synchronised lighting.
//!
//! The crate turns a tempo (typed or tapped) into a grid of beats, derives one
//! device command per beat from the selected effect, and sends those commands
//! to a networked LED controller early enough to cover the API's latency.
//! Each module owns one piece of that pipeline; [`scheduler`] wires them
//! together into a running show.

pub mod color;
pub mod config;
pub mod device;
pub mod effect;
pub mod error;
pub mod latency;
pub mod scheduler;
pub mod tempo;
pub mod timeline;

pub use color::Rgb;
pub use config::{AppConfig, DeviceTarget, StopAction};
pub use device::{DeviceAck, DeviceCommand, HttpDevice, LightDevice};
pub use effect::{EffectKind, EffectSpec};
pub use error::{BeatLightError, Result};
pub use latency::{LatencyEstimator, LatencyStats};
pub use scheduler::{
    spawn_show, EffectScheduler, SchedulerPhase, ShowContext, ShowEvent, ShowHandle, ShowStatus,
};
pub use tempo::{bpm_from_taps, Bpm, TapTempo, TempoRange};
pub use timeline::{BeatClock, BeatInstant};
