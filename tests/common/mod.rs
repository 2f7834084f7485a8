//! Black-box harness shared by the scenario tests (§8, §13): spins up a
//! real `ConnectionMux` on a loopback ephemeral port and drives it with
//! `tokio-tungstenite`'s client half, mirroring the source's own
//! `tests/call_server_integration.rs`-style approach.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use vox_gateway::adapters::Adapters;
use vox_gateway::config::GatewayConfig;
use vox_gateway::{ConnectionMux, PeerRegistry};

pub type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Starts a gateway on an OS-assigned loopback port using the given
/// adapter stack and returns its address. The server task runs for the
/// lifetime of the test process (tests are short-lived, so it's never
/// explicitly torn down).
pub async fn spawn_gateway(adapters: Adapters) -> SocketAddr {
    let mut config = GatewayConfig::default();
    config.server.idle_timeout_secs = 5;
    spawn_gateway_with_config(adapters, config).await
}

pub async fn spawn_gateway_with_config(adapters: Adapters, config: GatewayConfig) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");

    let config = Arc::new(config);
    let peer_registry = Arc::new(PeerRegistry::new());
    let mux = Arc::new(ConnectionMux::new(config, adapters, peer_registry));

    tokio::spawn(async move {
        let _ = mux.run(listener).await;
    });

    addr
}

/// Same as `spawn_gateway`, but the caller supplies a pre-built registry
/// so two sessions (e.g. for the friend-relay scenario) can share it.
pub async fn spawn_gateway_sharing_registry(adapters: Adapters, registry: Arc<PeerRegistry>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");

    let mut config = GatewayConfig::default();
    config.server.idle_timeout_secs = 5;
    let config = Arc::new(config);
    let mux = Arc::new(ConnectionMux::new(config, adapters, registry));

    tokio::spawn(async move {
        let _ = mux.run(listener).await;
    });

    addr
}

pub async fn connect(addr: SocketAddr, device_id: &str, client_id: &str) -> Client {
    let url = format!("ws://{addr}/?device-id={device_id}&client-id={client_id}");
    let (ws, _) = connect_async(url).await.expect("client connects");
    ws
}

pub async fn send_json(client: &mut Client, value: &Value) {
    client.send(Message::Text(value.to_string().into())).await.expect("send text frame");
}

pub async fn recv_json(client: &mut Client) -> Value {
    recv_json_timeout(client, Duration::from_secs(2)).await
}

pub async fn recv_json_timeout(client: &mut Client, timeout: Duration) -> Value {
    loop {
        let message = tokio::time::timeout(timeout, client.next())
            .await
            .expect("timed out waiting for a text frame")
            .expect("stream ended")
            .expect("websocket error");
        match message {
            Message::Text(text) => return serde_json::from_str(&text).expect("valid json"),
            Message::Binary(_) | Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message while waiting for json: {other:?}"),
        }
    }
}

/// Waits for the next binary (Opus) frame, skipping any interleaved text
/// frames.
pub async fn recv_binary(client: &mut Client, timeout: Duration) -> Option<Vec<u8>> {
    loop {
        let message = tokio::time::timeout(timeout, client.next()).await.ok()??.ok()?;
        match message {
            Message::Binary(bytes) => return Some(bytes.to_vec()),
            Message::Text(_) => continue,
            _ => continue,
        }
    }
}

pub fn hello(device_id: &str, mcp: bool) -> Value {
    json!({
        "type": "hello",
        "version": 1,
        "transport": "websocket",
        "device_id": device_id,
        "device_name": "test-device",
        "features": {"mcp": mcp},
        "audio_params": {"format": "opus", "sample_rate": 16000, "channels": 1, "frame_duration": 60},
    })
}

/// Encodes `frames` Opus packets of a loud tone (enough to cross the
/// default VAD energy threshold) via the crate's own codec, so tests
/// exercise the real encode/decode path rather than hand-rolled bytes.
pub fn loud_opus_frames(frames: usize) -> Vec<Vec<u8>> {
    use vox_gateway::audio::constants::DEFAULT_FRAME_SIZE;
    use vox_gateway::audio::FrameCodec;

    let mut codec = FrameCodec::new(DEFAULT_FRAME_SIZE).expect("codec constructs");
    (0..frames)
        .map(|i| {
            let pcm: Vec<i16> = (0..DEFAULT_FRAME_SIZE)
                .map(|n| {
                    let t = (i * DEFAULT_FRAME_SIZE + n) as f32 / 16_000.0;
                    (8000.0 * (t * 440.0 * std::f32::consts::TAU).sin()) as i16
                })
                .collect();
            codec.encode(&pcm).expect("encode succeeds")
        })
        .collect()
}
