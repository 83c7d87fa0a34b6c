//! C3 — Peer Negotiator: establishes each client's unreliable performance
//! data channel via offer/answer + ICE, relayed over C2 (§4.2).

use std::sync::Arc;

use log::{debug, info, warn};
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::config::debug_enabled;
use crate::error::RelayError;
use crate::latency;
use crate::queue::{EventKind, ScheduledEvent};
use crate::server::Relay;
use crate::signaling::{ClientMessage, SdpDescription, ServerMessage};

/// Companion NoteOff safety window (§3, §9).
const SAFETY_NOTE_OFF_MS: i64 = 800;

/// Handles an incoming `webrtc-offer` for `client_id` (§4.2 steps 1-3): tears
/// down any prior peer, creates a fresh one with an empty (LAN-only) ICE
/// server list, applies the offer, and returns the local answer.
pub async fn handle_offer(
    relay: Arc<Relay>,
    client_id: u64,
    offer: SdpDescription,
) -> Result<SdpDescription, RelayError> {
    // Step 1: close a prior peer, if any (idempotent).
    {
        let mut registry = relay.registry.lock().await;
        if let Some(record) = registry.get_mut(client_id) {
            if let Some(old_peer) = record.peer.take() {
                let _ = old_peer.close().await;
            }
        }
    }

    let peer = create_peer_connection()
        .await
        .map_err(|e| RelayError::NegotiationFailed(e.to_string()))?;

    register_ice_forwarding(&peer, relay.clone(), client_id);
    register_data_channel_handler(&peer, relay.clone(), client_id);

    let remote_offer = RTCSessionDescription::offer(offer.sdp)
        .map_err(|e| RelayError::NegotiationFailed(e.to_string()))?;
    peer.set_remote_description(remote_offer)
        .await
        .map_err(|e| RelayError::NegotiationFailed(e.to_string()))?;

    let answer = peer
        .create_answer(None)
        .await
        .map_err(|e| RelayError::NegotiationFailed(e.to_string()))?;
    peer.set_local_description(answer.clone())
        .await
        .map_err(|e| RelayError::NegotiationFailed(e.to_string()))?;

    let peer = Arc::new(peer);
    {
        let mut registry = relay.registry.lock().await;
        if let Some(record) = registry.get_mut(client_id) {
            record.peer = Some(peer);
        }
    }

    info!("client {client_id} negotiated a new peer connection");
    Ok(SdpDescription {
        sdp: answer.sdp,
        sdp_type: "answer".to_string(),
    })
}

/// Forwards a remote ICE candidate to the named client's peer (§4.2 step 5
/// is the local→remote direction; this is remote→local).
pub async fn handle_ice_candidate(
    relay: Arc<Relay>,
    client_id: u64,
    candidate: serde_json::Value,
) -> Result<(), RelayError> {
    let init: RTCIceCandidateInit = serde_json::from_value(candidate)?;
    let registry = relay.registry.lock().await;
    let peer = registry
        .get(client_id)
        .and_then(|record| record.peer.clone())
        .ok_or_else(|| RelayError::NegotiationFailed("no peer for client".to_string()))?;
    drop(registry);
    peer.add_ice_candidate(init)
        .await
        .map_err(|e| RelayError::NegotiationFailed(e.to_string()))
}

async fn create_peer_connection() -> webrtc::error::Result<RTCPeerConnection> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;
    let api = APIBuilder::new().with_media_engine(media_engine).build();

    // Empty ICE server list: LAN-only assumption (§4.2 step 2).
    let config = RTCConfiguration {
        ice_servers: vec![],
        ..Default::default()
    };

    api.new_peer_connection(config).await
}

fn register_ice_forwarding(peer: &RTCPeerConnection, relay: Arc<Relay>, client_id: u64) {
    peer.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidateInit>| {
        let relay = relay.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else { return };
            let candidate_json = match serde_json::to_value(candidate) {
                Ok(v) => v,
                Err(e) => {
                    warn!("failed to encode ICE candidate for client {client_id}: {e}");
                    return;
                }
            };
            let registry = relay.registry.lock().await;
            if let Some(record) = registry.get(client_id) {
                let _ = record.signaling.send(ServerMessage::WebrtcIceCandidate {
                    candidate: candidate_json,
                });
            }
        })
    }));
}

/// Registers the data-channel handler (§4.2 step 4): when the remote opens
/// the performance-lane channel, attach it to the client record and route
/// inbound messages into C4/C5.
fn register_data_channel_handler(peer: &RTCPeerConnection, relay: Arc<Relay>, client_id: u64) {
    peer.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let relay = relay.clone();
        let dc_for_registry = dc.clone();
        Box::pin(async move {
            {
                let mut registry = relay.registry.lock().await;
                if let Some(record) = registry.get_mut(client_id) {
                    record.data = Some(dc_for_registry);
                }
            }

            let relay = relay.clone();
            dc.on_message(Box::new(move |msg: DataChannelMessage| {
                let relay = relay.clone();
                Box::pin(async move {
                    handle_performance_message(relay, client_id, msg).await;
                })
            }));
        })
    }));
}

/// Decodes one performance-lane datagram and runs it through C4 (latency +
/// buffer sizing) and C5 (enqueue), per §4.3.
async fn handle_performance_message(relay: Arc<Relay>, client_id: u64, msg: DataChannelMessage) {
    let text = match std::str::from_utf8(&msg.data) {
        Ok(t) => t,
        Err(_) => return,
    };
    let parsed: Result<ClientMessage, _> = serde_json::from_str(text);
    let Ok(message) = parsed else {
        debug!("client {client_id} sent malformed performance packet");
        return;
    };

    let now = crate::dispatcher::now_ms();
    let (channel, kind, timestamp) = match message {
        ClientMessage::NoteOn { channel, note, velocity, timestamp } => {
            (channel, EventKind::NoteOn { note, velocity }, timestamp)
        }
        ClientMessage::NoteOff { channel, note, timestamp } => {
            (channel, EventKind::NoteOff { note }, timestamp)
        }
        ClientMessage::ControlChange { channel, control, value, timestamp } => {
            (channel, EventKind::ControlChange { controller: control, value }, timestamp)
        }
        ClientMessage::ProgramChange { channel, program, timestamp } => {
            (channel, EventKind::ProgramChange { program }, timestamp)
        }
        _ => return,
    };
    let timestamp = timestamp.unwrap_or(now);

    relay.lane_counters.record_rtc_perf();

    let latency_ms = latency::compute_latency_ms(now, timestamp);
    let buffer_depth_ms = {
        let mut registry = relay.registry.lock().await;
        let Some(record) = registry.get_mut(client_id) else { return };
        record.latency_window.push(latency_ms);
        record.last_seen = Some(now);
        let p95 = record.latency_window.p95().unwrap_or(latency_ms);
        record.buffer_depth_ms = latency::buffer_depth_ms(p95);
        record.buffer_depth_ms
    };

    let play_at = timestamp + buffer_depth_ms;
    if debug_enabled() {
        debug!("client {client_id} rtc latency={latency_ms}ms buffer={buffer_depth_ms}ms play_at={play_at}");
    }

    let mut queue = relay.queue.lock().await;
    queue.insert(ScheduledEvent::new(play_at, channel, kind));
    if let EventKind::NoteOn { note, .. } = kind {
        // Safety NoteOff (§3, §9): may be superseded by an earlier explicit
        // NoteOff, per the open question this implementation leaves as-is.
        queue.insert(ScheduledEvent::new(
            play_at + SAFETY_NOTE_OFF_MS,
            channel,
            EventKind::NoteOff { note },
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safety_note_off_offset_matches_spec() {
        assert_eq!(SAFETY_NOTE_OFF_MS, 800);
    }
}
