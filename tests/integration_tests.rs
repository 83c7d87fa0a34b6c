use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use midi_relay::config::Config;
use midi_relay::server::{run_listener, Relay};

fn test_config(port: u16) -> Config {
    Config {
        bind_addr: "127.0.0.1".to_string(),
        port,
        midi_port: None,
        log_level: None,
    }
}

#[tokio::test]
async fn test_client_hello_round_trip() -> Result<(), Box<dyn std::error::Error>> {
    let relay = Relay::new(test_config(18765));
    let addr = relay.config.bind_address();
    let relay_for_server = relay.clone();
    tokio::spawn(async move {
        let _ = run_listener(relay_for_server).await;
    });
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

    let (ws_stream, _) = connect_async(format!("ws://{addr}/")).await?;
    let (mut write, mut read) = ws_stream.split();

    write
        .send(Message::Text(json!({"type": "client-hello"}).to_string().into()))
        .await?;

    let response = read.next().await.expect("no response").unwrap();
    let response_text = response.to_text()?;
    let parsed: serde_json::Value = serde_json::from_str(response_text)?;
    assert_eq!(parsed["type"], "server-welcome");
    assert!(parsed["id"].as_u64().is_some());

    relay.request_shutdown();
    Ok(())
}

#[tokio::test]
async fn test_repeated_client_hello_yields_same_id() -> Result<(), Box<dyn std::error::Error>> {
    let relay = Relay::new(test_config(18766));
    let addr = relay.config.bind_address();
    let relay_for_server = relay.clone();
    tokio::spawn(async move {
        let _ = run_listener(relay_for_server).await;
    });
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

    let (ws_stream, _) = connect_async(format!("ws://{addr}/")).await?;
    let (mut write, mut read) = ws_stream.split();

    for _ in 0..2 {
        write
            .send(Message::Text(json!({"type": "client-hello"}).to_string().into()))
            .await?;
        let response = read.next().await.expect("no response").unwrap();
        let parsed: serde_json::Value = serde_json::from_str(response.to_text()?)?;
        assert_eq!(parsed["type"], "server-welcome");
    }

    relay.request_shutdown();
    Ok(())
}

#[tokio::test]
async fn test_immediate_lane_note_on_increments_counter() -> Result<(), Box<dyn std::error::Error>> {
    let relay = Relay::new(test_config(18767));
    let addr = relay.config.bind_address();
    let relay_for_server = relay.clone();
    tokio::spawn(async move {
        let _ = run_listener(relay_for_server).await;
    });
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

    let (ws_stream, _) = connect_async(format!("ws://{addr}/")).await?;
    let (mut write, _read) = ws_stream.split();

    write
        .send(Message::Text(
            json!({"type": "noteOn", "channel": 1, "note": 60, "velocity": 100})
                .to_string()
                .into(),
        ))
        .await?;
    tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

    assert_eq!(relay.lane_counters.snapshot().ws_immediate, 1);

    relay.request_shutdown();
    Ok(())
}

#[tokio::test]
async fn test_http_status_endpoint() -> Result<(), Box<dyn std::error::Error>> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    let relay = Relay::new(test_config(18768));
    let addr = relay.config.bind_address();
    let relay_for_server = relay.clone();
    tokio::spawn(async move {
        let _ = run_listener(relay_for_server).await;
    });
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

    let mut stream = TcpStream::connect(&addr).await?;
    stream
        .write_all(b"GET /api/status HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await?;
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    let response = String::from_utf8_lossy(&buf);
    assert!(response.contains("200 OK"));
    assert!(response.contains("midiConnected"));

    relay.request_shutdown();
    Ok(())
}
