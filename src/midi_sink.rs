//! C1 — MIDI Sink: low-level device send of note-on/off, CC, program, transport.
//!
//! Channels are accepted 1-based (per `spec.md` §3/§4.6) and translated to
//! 0-based at the device boundary here, the only place that needs to know
//! the device's wire convention.

use log::{error, info, warn};
use midir::{MidiOutput, MidiOutputConnection};

use crate::error::RelayError;

const DEVICE_NAME_PREFERENCES: &[&str] = &["loopMIDI", "MIDI Controller", "Virtual", "IAC"];
const VIRTUAL_PORT_NAME: &str = "Web MIDI Controller";

pub struct MidiSink {
    conn: Option<MidiOutputConnection>,
    warned_null: bool,
}

impl MidiSink {
    /// Selects a device per `spec.md` §4.6: a name-matched physical/virtual
    /// port, then a freshly created virtual port, then the first enumerated
    /// output, then null mode.
    pub fn new() -> Self {
        let conn = Self::select_device();
        if conn.is_none() {
            warn!("no MIDI output device selected; sink is running in null mode");
        }
        Self {
            conn,
            warned_null: false,
        }
    }

    fn select_device() -> Option<MidiOutputConnection> {
        let mut midi_out = match MidiOutput::new("midi-relay") {
            Ok(m) => m,
            Err(e) => {
                error!("failed to initialize MIDI output backend: {e}");
                return None;
            }
        };

        let ports = midi_out.ports();
        let preferred_index = ports.iter().position(|port| {
            let name = midi_out.port_name(port).unwrap_or_default();
            DEVICE_NAME_PREFERENCES
                .iter()
                .any(|pref| name.to_lowercase().contains(&pref.to_lowercase()))
        });
        if let Some(index) = preferred_index {
            let port = ports[index].clone();
            let name = midi_out.port_name(&port).unwrap_or_default();
            match midi_out.connect(&port, "midi-relay-output") {
                Ok(conn) => {
                    info!("connected to preferred MIDI output: {name}");
                    return Some(conn);
                }
                Err(e) => {
                    warn!("failed to connect to preferred MIDI output {name}: {e}, falling back");
                    midi_out = e.into_inner();
                }
            }
        }

        match midi_out.create_virtual(VIRTUAL_PORT_NAME) {
            Ok(conn) => {
                info!("created virtual MIDI output: {VIRTUAL_PORT_NAME}");
                return Some(conn);
            }
            Err(e) => {
                warn!("failed to create virtual MIDI output: {e}");
                midi_out = e.into_inner();
            }
        }

        let ports = midi_out.ports();
        if let Some(port) = ports.first() {
            let name = midi_out.port_name(port).unwrap_or_default();
            match midi_out.connect(port, "midi-relay-output") {
                Ok(conn) => {
                    info!("connected to first enumerated MIDI output: {name}");
                    return Some(conn);
                }
                Err(e) => {
                    error!("{}", RelayError::MidiDeviceUnavailable(
                        format!("failed to connect to first enumerated MIDI output {name}: {e}")
                    ));
                    return None;
                }
            }
        }

        error!("{}", RelayError::MidiDeviceUnavailable("no output ports enumerated".to_string()));
        None
    }

    fn send(&mut self, bytes: &[u8]) {
        match &mut self.conn {
            Some(conn) => {
                if let Err(e) = conn.send(bytes) {
                    error!("{}", RelayError::MidiSend(e.to_string()));
                }
            }
            None => {
                if !self.warned_null {
                    warn!("MIDI sink has no device attached; discarding output (further occurrences suppressed)");
                    self.warned_null = true;
                }
            }
        }
    }

    pub fn note_on(&mut self, channel: u8, note: u8, velocity: u8) {
        self.send(&[0x90 | channel_nibble(channel), note, velocity]);
    }

    pub fn note_off(&mut self, channel: u8, note: u8, velocity: u8) {
        self.send(&[0x80 | channel_nibble(channel), note, velocity]);
    }

    pub fn control_change(&mut self, channel: u8, controller: u8, value: u8) {
        self.send(&[0xB0 | channel_nibble(channel), controller, value]);
    }

    pub fn program_change(&mut self, channel: u8, program: u8) {
        self.send(&[0xC0 | channel_nibble(channel), program]);
    }

    pub fn transport_start(&mut self) {
        self.send(&[0xFA]);
    }

    pub fn transport_stop(&mut self) {
        self.send(&[0xFC]);
    }

    pub fn transport_continue(&mut self) {
        self.send(&[0xFB]);
    }

    pub fn is_attached(&self) -> bool {
        self.conn.is_some()
    }
}

/// Translates a 1-based external channel (§3, §4.6) to the 0-based nibble a
/// MIDI status byte expects. Out-of-range input is clamped defensively since
/// the sink must never panic the caller.
fn channel_nibble(channel: u8) -> u8 {
    channel.saturating_sub(1).min(15)
}
