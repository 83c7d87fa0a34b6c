//! C8 — Client Registry & Lifecycle: monotonic client IDs, per-client state,
//! and cascading cleanup on disconnect (§3, §4.8).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::RTCPeerConnection;

use crate::latency::LatencyWindow;
use crate::signaling::ServerMessage;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

fn next_client_id() -> u64 {
    NEXT_CLIENT_ID.fetch_add(1, AtomicOrdering::Relaxed)
}

#[cfg(test)]
pub fn reset_client_id_for_test() {
    NEXT_CLIENT_ID.store(1, AtomicOrdering::Relaxed);
}

/// One entry per connected browser (§3 "Client record").
pub struct ClientRecord {
    pub id: u64,
    /// Outbound half of the reliable signaling channel.
    pub signaling: UnboundedSender<ServerMessage>,
    /// Negotiation state; unbound until an offer has been seen (§3).
    pub peer: Option<Arc<RTCPeerConnection>>,
    /// The unreliable performance data channel; unbound or closed (§3).
    pub data: Option<Arc<RTCDataChannel>>,
    pub latency_window: LatencyWindow,
    pub buffer_depth_ms: i64,
    pub last_seen: Option<i64>,
}

impl ClientRecord {
    fn new(id: u64, signaling: UnboundedSender<ServerMessage>) -> Self {
        Self {
            id,
            signaling,
            peer: None,
            data: None,
            latency_window: LatencyWindow::new(),
            // Initial buffer depth per §3.
            buffer_depth_ms: 40,
            last_seen: None,
        }
    }
}

#[derive(Default)]
pub struct ClientRegistry {
    clients: HashMap<u64, ClientRecord>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: HashMap::new(),
        }
    }

    /// Allocates a fresh monotonic id and registers a client record (§4.8).
    pub fn register(&mut self, signaling: UnboundedSender<ServerMessage>) -> u64 {
        let id = next_client_id();
        self.clients.insert(id, ClientRecord::new(id, signaling));
        id
    }

    /// Closes the peer handle (if any) and removes the record (§4.8). The
    /// data channel is dropped along with the peer connection it belongs to.
    pub fn unregister(&mut self, id: u64) {
        if let Some(record) = self.clients.remove(&id) {
            if let Some(peer) = record.peer {
                tokio::spawn(async move {
                    let _ = peer.close().await;
                });
            }
        }
    }

    pub fn get(&self, id: u64) -> Option<&ClientRecord> {
        self.clients.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut ClientRecord> {
        self.clients.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientRecord> {
        self.clients.values()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn clear(&mut self) {
        self.clients.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_allocates_monotonic_ids() {
        reset_client_id_for_test();
        let mut reg = ClientRegistry::new();
        let (tx1, _rx1) = tokio::sync::mpsc::unbounded_channel();
        let (tx2, _rx2) = tokio::sync::mpsc::unbounded_channel();
        let a = reg.register(tx1);
        let b = reg.register(tx2);
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_unregister_removes_record() {
        reset_client_id_for_test();
        let mut reg = ClientRegistry::new();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let id = reg.register(tx);
        assert!(reg.get(id).is_some());
        reg.unregister(id);
        assert!(reg.get(id).is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn test_initial_buffer_depth_is_40() {
        reset_client_id_for_test();
        let mut reg = ClientRegistry::new();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let id = reg.register(tx);
        assert_eq!(reg.get(id).unwrap().buffer_depth_ms, 40);
    }
}
