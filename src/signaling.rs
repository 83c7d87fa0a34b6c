//! C2 — Signaling Endpoint: the reliable duplex control channel to each
//! client, its JSON wire schema (§6), and the per-connection handler that
//! wires inbound messages into the rest of the relay.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::config::debug_enabled;
use crate::negotiator;
use crate::server::Relay;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SdpDescription {
    pub sdp: String,
    #[serde(rename = "type")]
    pub sdp_type: String,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportAction {
    Play,
    Pause,
    Stop,
    Record,
}

/// Inbound messages (client → server, §6). An envelope `{type}` selects the
/// variant; unknown `type` values fail to deserialize here and are handled
/// by the caller as a protocol error (logged, dropped, connection kept open
/// per §7).
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "client-hello")]
    ClientHello,
    #[serde(rename = "webrtc-offer")]
    WebrtcOffer { offer: SdpDescription },
    #[serde(rename = "webrtc-ice-candidate")]
    WebrtcIceCandidate { candidate: serde_json::Value },
    #[serde(rename = "noteOn")]
    NoteOn {
        channel: u8,
        note: u8,
        velocity: u8,
        timestamp: Option<i64>,
    },
    #[serde(rename = "noteOff")]
    NoteOff {
        channel: u8,
        note: u8,
        timestamp: Option<i64>,
    },
    #[serde(rename = "controlChange")]
    ControlChange {
        channel: u8,
        control: u8,
        value: u8,
        timestamp: Option<i64>,
    },
    #[serde(rename = "programChange")]
    ProgramChange {
        channel: u8,
        program: u8,
        timestamp: Option<i64>,
    },
    #[serde(rename = "transport")]
    Transport { action: TransportAction },
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    pub id: u64,
    #[serde(rename = "bufferSizeMs")]
    pub buffer_size_ms: i64,
    #[serde(rename = "rttP95")]
    pub rtt_p95: Option<u32>,
    #[serde(rename = "rttAvg")]
    pub rtt_avg: Option<f64>,
    #[serde(rename = "latencyHistory")]
    pub latency_history: Vec<u32>,
    #[serde(rename = "dcState")]
    pub dc_state: String,
    #[serde(rename = "lastSeen")]
    pub last_seen: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct LaneCountersSnapshot {
    #[serde(rename = "rtcPerf")]
    pub rtc_perf: u64,
    #[serde(rename = "wsImmediate")]
    pub ws_immediate: u64,
}

/// Outbound messages (server → client, §6).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "server-welcome")]
    ServerWelcome {
        id: u64,
        #[serde(rename = "midiAvailable")]
        midi_available: bool,
    },
    #[serde(rename = "webrtc-answer")]
    WebrtcAnswer { answer: SdpDescription },
    #[serde(rename = "webrtc-ice-candidate")]
    WebrtcIceCandidate { candidate: serde_json::Value },
    #[serde(rename = "jcmp-stats")]
    JcmpStats {
        #[serde(rename = "serverTime")]
        server_time: i64,
        #[serde(rename = "queueLength")]
        queue_length: usize,
        #[serde(rename = "laneCounters")]
        lane_counters: LaneCountersSnapshot,
        clients: Vec<ClientStats>,
    },
}

/// Drives one client's signaling connection to completion. Runs until the
/// socket closes; registers the client on entry and unregisters on exit
/// (§4.8 lifecycle).
pub async fn handle_connection<S>(ws_stream: WebSocketStream<S>, relay: Arc<Relay>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_sink, mut ws_stream) = ws_stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerMessage>();

    let client_id = relay.registry.lock().await.register(outbound_tx.clone());
    info!("client {client_id} connected");

    let forward_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(text) => {
                    if ws_sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("failed to encode outbound signaling message: {e}"),
            }
        }
        let _ = ws_sink.close().await;
    });

    while let Some(frame) = ws_stream.next().await {
        let frame = match frame {
            Ok(f) => f,
            Err(e) => {
                debug!("client {client_id} socket error: {e}");
                break;
            }
        };
        let text = match frame {
            Message::Text(t) => t,
            Message::Close(_) => break,
            _ => continue,
        };
        handle_inbound_text(&text, client_id, &relay, &outbound_tx).await;
    }

    relay.registry.lock().await.unregister(client_id);
    forward_task.abort();
    info!("client {client_id} disconnected");
}

/// Two-stage decode: the envelope's `type` field drives which concrete
/// inbound shape is expected, so a malformed payload for a recognized type
/// is distinguished from a wholly unrecognized type — both are protocol
/// errors (§7) and neither closes the connection.
async fn handle_inbound_text(
    text: &str,
    client_id: u64,
    relay: &Arc<Relay>,
    outbound_tx: &UnboundedSender<ServerMessage>,
) {
    let envelope: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            debug!("client {client_id} sent unparseable JSON: {e}");
            return;
        }
    };
    let msg_type = envelope.get("type").and_then(|v| v.as_str()).unwrap_or("");

    let message: ClientMessage = match serde_json::from_value(envelope) {
        Ok(m) => m,
        Err(_) => {
            warn!("client {client_id} sent unknown or malformed message type {msg_type:?}; dropping");
            return;
        }
    };

    match message {
        ClientMessage::ClientHello => {
            let midi_available = relay.midi_sink.lock().await.is_attached();
            let _ = outbound_tx.send(ServerMessage::ServerWelcome {
                id: client_id,
                midi_available,
            });
        }
        ClientMessage::WebrtcOffer { offer } => {
            match negotiator::handle_offer(relay.clone(), client_id, offer).await {
                Ok(answer) => {
                    let _ = outbound_tx.send(ServerMessage::WebrtcAnswer { answer });
                }
                Err(e) => warn!("client {client_id} negotiation failed: {e}"),
            }
        }
        ClientMessage::WebrtcIceCandidate { candidate } => {
            if let Err(e) = negotiator::handle_ice_candidate(relay.clone(), client_id, candidate).await {
                warn!("client {client_id} ICE candidate rejected: {e}");
            }
        }
        ClientMessage::NoteOn { channel, note, velocity, timestamp: _ } => {
            relay.lane_counters.record_ws_immediate();
            relay.midi_sink.lock().await.note_on(channel, note, velocity);
            if debug_enabled() {
                debug!("client {client_id} immediate-lane noteOn ch{channel} note{note}");
            }
        }
        ClientMessage::NoteOff { channel, note, timestamp: _ } => {
            relay.lane_counters.record_ws_immediate();
            relay.midi_sink.lock().await.note_off(channel, note, 0);
        }
        ClientMessage::ControlChange { channel, control, value, timestamp: _ } => {
            relay.lane_counters.record_ws_immediate();
            relay.midi_sink.lock().await.control_change(channel, control, value);
        }
        ClientMessage::ProgramChange { channel, program, timestamp: _ } => {
            relay.lane_counters.record_ws_immediate();
            relay.midi_sink.lock().await.program_change(channel, program);
        }
        ClientMessage::Transport { action } => {
            let mut sink = relay.midi_sink.lock().await;
            match action {
                TransportAction::Play => sink.transport_start(),
                TransportAction::Stop => sink.transport_stop(),
                TransportAction::Pause => sink.transport_continue(),
                TransportAction::Record => sink.control_change(1, 119, 127),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_hello_decodes() {
        let v: serde_json::Value = serde_json::from_str(r#"{"type":"client-hello"}"#).unwrap();
        let msg: ClientMessage = serde_json::from_value(v).unwrap();
        assert!(matches!(msg, ClientMessage::ClientHello));
    }

    #[test]
    fn test_note_on_decodes_with_optional_timestamp_absent() {
        let v: serde_json::Value =
            serde_json::from_str(r#"{"type":"noteOn","channel":1,"note":60,"velocity":100}"#).unwrap();
        let msg: ClientMessage = serde_json::from_value(v).unwrap();
        match msg {
            ClientMessage::NoteOn { channel, note, velocity, timestamp } => {
                assert_eq!(channel, 1);
                assert_eq!(note, 60);
                assert_eq!(velocity, 100);
                assert_eq!(timestamp, None);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_transport_action_mapping_values() {
        let v: serde_json::Value = serde_json::from_str(r#"{"type":"transport","action":"record"}"#).unwrap();
        let msg: ClientMessage = serde_json::from_value(v).unwrap();
        assert!(matches!(
            msg,
            ClientMessage::Transport { action: TransportAction::Record }
        ));
    }

    #[test]
    fn test_unknown_type_fails_to_decode() {
        let v: serde_json::Value = serde_json::from_str(r#"{"type":"not-a-real-type"}"#).unwrap();
        let result: Result<ClientMessage, _> = serde_json::from_value(v);
        assert!(result.is_err());
    }

    #[test]
    fn test_server_welcome_encodes_expected_shape() {
        let msg = ServerMessage::ServerWelcome { id: 7, midi_available: true };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "server-welcome");
        assert_eq!(json["id"], 7);
        assert_eq!(json["midiAvailable"], true);
    }
}
