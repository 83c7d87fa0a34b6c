//! Ties the components together: the `Relay` singleton bundle (§9 "global
//! mutable state"), the combined HTTP-status/signaling-upgrade TCP listener
//! (§6), and graceful shutdown.

use std::sync::Arc;

use log::{error, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify};

use crate::config::Config;
use crate::error::RelayError;
use crate::midi_sink::MidiSink;
use crate::queue::PlaybackQueue;
use crate::registry::ClientRegistry;
use crate::signaling;
use crate::telemetry::LaneCounters;

/// The process-wide singleton bundle (§9: "the playback queue, lane
/// counters, and client registry are process-wide singletons").
pub struct Relay {
    pub config: Config,
    pub registry: Mutex<ClientRegistry>,
    pub queue: Mutex<PlaybackQueue>,
    pub lane_counters: LaneCounters,
    pub midi_sink: Mutex<MidiSink>,
    pub shutdown: Notify,
}

impl Relay {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: Mutex::new(ClientRegistry::new()),
            queue: Mutex::new(PlaybackQueue::new()),
            lane_counters: LaneCounters::new(),
            midi_sink: Mutex::new(MidiSink::new()),
            shutdown: Notify::new(),
        })
    }

    /// Clears the queue, counters, and registry without restarting the
    /// process (§9: "Provide a test-mode reset operation that clears all
    /// three").
    pub async fn reset_for_test(&self) {
        self.queue.lock().await.clear();
        self.registry.lock().await.clear();
        self.lane_counters.reset();
    }

    pub fn request_shutdown(&self) {
        self.shutdown.notify_waiters();
    }
}

const HTTP_PEEK_LEN: usize = 4;

/// Runs the combined listener until shutdown is requested. Each accepted
/// connection is classified by peeking its first bytes: `GET ` selects the
/// HTTP status responder, anything else is assumed to be a WebSocket
/// upgrade handshake (§6: one TCP listener serving both).
pub async fn run_listener(relay: Arc<Relay>) -> Result<(), RelayError> {
    let addr = relay.config.bind_address();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| RelayError::BindFailed { addr: addr.clone(), source })?;
    info!("listening on {addr}");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        let relay = relay.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, relay).await {
                                warn!("connection from {peer_addr} ended with error: {e}");
                            }
                        });
                    }
                    Err(e) => error!("accept failed: {e}"),
                }
            }
            _ = relay.shutdown.notified() => {
                info!("listener shutting down");
                return Ok(());
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, relay: Arc<Relay>) -> Result<(), RelayError> {
    let mut peek_buf = [0u8; HTTP_PEEK_LEN];
    let n = stream
        .peek(&mut peek_buf)
        .await
        .map_err(|source| RelayError::BindFailed { addr: "peek".to_string(), source })?;

    if &peek_buf[..n] == b"GET " && is_status_request(&mut stream).await {
        serve_http_status(stream, &relay).await;
        return Ok(());
    }

    match tokio_tungstenite::accept_async(stream).await {
        Ok(ws_stream) => {
            signaling::handle_connection(ws_stream, relay).await;
            Ok(())
        }
        Err(e) => {
            warn!("websocket handshake failed: {e}");
            Ok(())
        }
    }
}

/// Peeking only tells us it's an HTTP GET; we still need to decide between
/// `/api/status` and a WebSocket upgrade request, both of which start with
/// `GET `. A WebSocket upgrade carries `Upgrade: websocket`, so read the
/// request line and headers to disambiguate.
async fn is_status_request(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 1024];
    match stream.peek(&mut buf).await {
        Ok(n) => {
            let head = String::from_utf8_lossy(&buf[..n]);
            head.contains("/api/status") && !head.to_lowercase().contains("upgrade: websocket")
        }
        Err(_) => false,
    }
}

async fn serve_http_status(mut stream: TcpStream, relay: &Arc<Relay>) {
    // Drain the request so the client doesn't see a connection reset.
    let mut discard = [0u8; 1024];
    let _ = stream.read(&mut discard).await;

    let midi_connected = relay.midi_sink.lock().await.is_attached();
    let body = serde_json::json!({
        "server": "midi-relay",
        "midiConnected": midi_connected,
        "timestamp": crate::dispatcher::now_ms(),
    })
    .to_string();

    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}
