//! Structured error taxonomy for boundaries that need to match on failure kind.
//!
//! Most of the relay swallows errors and logs them (see `spec.md` §7 — the
//! dispatcher and the immediate lane are the two hot paths and must never
//! propagate). This type exists for the few call sites where a caller wants
//! to distinguish *why* something failed rather than just that it did:
//! device selection at startup, config loading, and listener bind.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("no MIDI output device available and virtual port creation failed: {0}")]
    MidiDeviceUnavailable(String),

    #[error("failed to send MIDI message: {0}")]
    MidiSend(String),

    #[error("failed to decode signaling message: {0}")]
    SignalingDecode(#[from] serde_json::Error),

    #[error("peer negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("failed to bind listener on {addr}: {source}")]
    BindFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load config from {path}: {source}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),
}
