use std::sync::Arc;

use log::info;
use midi_relay::config::{debug_enabled, Config};
use midi_relay::server::{run_listener, Relay};
use midi_relay::{dispatcher, telemetry};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = Config::load_default_or_fallback();
    info!(
        "starting midi-relay on {} (JCMP_DEBUG={})",
        config.bind_address(),
        debug_enabled()
    );

    let relay = Relay::new(config);

    register_shutdown_handler(relay.clone());

    let dispatcher_relay = relay.clone();
    let dispatcher_task = tokio::spawn(async move { dispatcher::run(dispatcher_relay).await });

    let telemetry_relay = relay.clone();
    let telemetry_task = tokio::spawn(async move { telemetry::run(telemetry_relay).await });

    if let Err(e) = run_listener(relay).await {
        log::error!("listener exited with error: {e}");
        std::process::exit(1);
    }

    let _ = dispatcher_task.await;
    let _ = telemetry_task.await;
}

/// Wires SIGINT to the shared shutdown notifier (§9: "destroyed on SIGINT,
/// which also flushes and closes the MIDI device"). The MIDI device closes
/// naturally when `Relay` (and its `MidiSink`) is dropped at process exit.
fn register_shutdown_handler(relay: Arc<Relay>) {
    let result = ctrlc::set_handler(move || {
        info!("received SIGINT, shutting down");
        relay.request_shutdown();
    });
    if let Err(e) = result {
        log::warn!("failed to register SIGINT handler: {e}");
    }
}
