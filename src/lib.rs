//! Real-time MIDI relay: a dual-lane transport (reliable signaling +
//! unreliable WebRTC performance channel) with per-client adaptive jitter
//! buffering and a single monotonic dispatcher.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod latency;
pub mod midi_sink;
pub mod negotiator;
pub mod queue;
pub mod registry;
pub mod server;
pub mod signaling;
pub mod telemetry;

pub use config::Config;
pub use error::RelayError;
pub use server::Relay;
