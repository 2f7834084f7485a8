//! `ConnectionMux` (§4.8): accepts WebSocket upgrades, resolves the
//! device-id/client-id/authorization triple from headers or query
//! string, demultiplexes text/binary frames into a per-connection
//! [`SessionKernel`], and enforces idle-timeout/heartbeat at the
//! transport boundary. Holds no session state itself beyond the
//! listener and the shared singletons every session is constructed
//! with.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::adapters::Adapters;
use crate::config::GatewayConfig;
use crate::error::PolicyError;
use crate::peer::PeerRegistry;
use crate::protocol::ServerEnvelope;
use crate::session::{IngestEvent, OutboundItem, OutboundQueue, OutboundSender, SessionKernel};

/// Device/client identity resolved from the upgrade request, before the
/// `hello` envelope even arrives. The kernel still reads its own
/// authoritative `device_id`/`client_id` off `hello` (§3) — this is only
/// what `ConnectionMux` had on hand to seed the kernel with and to
/// refuse the upgrade early when required fields are absent (§6).
struct ConnectParams {
    device_id: Option<String>,
    client_id: Option<String>,
    authorization: Option<String>,
}

/// Upgrade rejection code for a missing device-id or client-id (§6).
const MISSING_IDENTITY_CODE: u16 = 4001;

pub struct ConnectionMux {
    config: Arc<GatewayConfig>,
    adapters: Adapters,
    peer_registry: Arc<PeerRegistry>,
    active_sessions: Arc<tokio::sync::Semaphore>,
}

impl ConnectionMux {
    pub fn new(config: Arc<GatewayConfig>, adapters: Adapters, peer_registry: Arc<PeerRegistry>) -> Self {
        let max_sessions = config.server.max_sessions;
        Self { config, adapters, peer_registry, active_sessions: Arc::new(tokio::sync::Semaphore::new(max_sessions)) }
    }

    /// Binds the configured address and accepts connections until the
    /// process is torn down. Each accepted socket gets its own task; the
    /// mux itself never blocks on a single connection's lifetime.
    pub async fn serve(self: Arc<Self>) -> std::io::Result<()> {
        let addr = self.config.server.bind_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!(%addr, "gateway listening");
        self.run(listener).await
    }

    /// Accepts connections off an already-bound listener. Split out from
    /// `serve` so tests can bind an ephemeral port (`127.0.0.1:0`), read
    /// back the OS-assigned address, and only then hand the listener to
    /// the mux — `serve` itself never exposes the bound address.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let mux = Arc::clone(&self);
            tokio::spawn(async move {
                mux.handle_connection(stream, peer_addr).await;
            });
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) {
        let Ok(permit) = self.active_sessions.clone().try_acquire_owned() else {
            let err = PolicyError::SessionLimitReached(self.config.server.max_sessions);
            warn!(%peer_addr, error = %err, "rejecting connection");
            return;
        };

        let mut connect_params = ConnectParams { device_id: None, client_id: None, authorization: None };
        let callback = |req: &Request, resp: Response| {
            connect_params = parse_connect_params(req);
            Ok(resp)
        };

        let mut ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(%peer_addr, error = %e, "websocket upgrade failed");
                return;
            }
        };

        if connect_params.device_id.is_none() || connect_params.client_id.is_none() {
            warn!(%peer_addr, "upgrade missing device_id/client_id, closing");
            let (code, reason) = missing_identity_rejection();
            let _ = ws_stream.close(Some(CloseFrame { code: CloseCode::Library(code), reason: reason.into() })).await;
            drop(permit);
            return;
        }

        let device_id = connect_params.device_id.unwrap_or_default();
        let client_id = connect_params.client_id.unwrap_or_default();
        debug!(
            %peer_addr, device_id, client_id,
            authorized = connect_params.authorization.is_some(),
            "accepted websocket upgrade"
        );

        let (mut ws_sink, mut ws_source) = ws_stream.split();

        let outbound = Arc::new(OutboundQueue::new(self.config.audio.outbound_queue_depth));
        let outbound_sender = OutboundSender(Arc::clone(&outbound));

        let (ingest_tx, ingest_rx) = mpsc::channel::<IngestEvent>(64);

        let writer_task = tokio::spawn(async move {
            loop {
                let Some(item) = outbound.pop().await else { break };
                let message = match item {
                    OutboundItem::Control(envelope) => match serde_json::to_string(&envelope) {
                        Ok(json) => Message::Text(json.into()),
                        Err(e) => {
                            warn!(error = %e, "failed to serialize outbound envelope, dropping");
                            continue;
                        }
                    },
                    OutboundItem::Audio(frame) => Message::Binary(frame.into()),
                };
                if ws_sink.send(message).await.is_err() {
                    break;
                }
            }
            let _ = ws_sink.close().await;
        });

        let kernel = SessionKernel::new(
            device_id,
            client_id,
            Arc::clone(&self.config),
            self.adapters.clone(),
            Arc::clone(&self.peer_registry),
            outbound_sender,
        );
        let session_id = kernel.session_id().to_string();
        let kernel_task = tokio::spawn(kernel.run(ingest_rx));

        let idle_timeout = Duration::from_secs(self.config.server.idle_timeout_secs);
        let heartbeat_interval = Duration::from_secs(self.config.server.heartbeat_interval_secs);
        let mut heartbeat = tokio::time::interval(heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut missed_pongs: u32 = 0;

        loop {
            tokio::select! {
                frame = tokio::time::timeout(idle_timeout, ws_source.next()) => {
                    match frame {
                        Ok(Some(Ok(Message::Text(text)))) => {
                            if ingest_tx.send(IngestEvent::Text(text.to_string())).await.is_err() {
                                break;
                            }
                        }
                        Ok(Some(Ok(Message::Binary(bytes)))) => {
                            if ingest_tx.send(IngestEvent::Binary(bytes.to_vec())).await.is_err() {
                                break;
                            }
                        }
                        Ok(Some(Ok(Message::Pong(_)))) => {
                            missed_pongs = 0;
                        }
                        Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
                        Ok(Some(Ok(_))) => {}
                        Ok(Some(Err(e))) => {
                            warn!(session_id, error = %e, "websocket read error");
                            break;
                        }
                        Err(_) => {
                            let err = PolicyError::IdleTimeout(self.config.server.idle_timeout_secs);
                            info!(session_id, error = %err, "closing session");
                            break;
                        }
                    }
                }

                _ = heartbeat.tick() => {
                    missed_pongs += 1;
                    if missed_pongs > 2 {
                        info!(session_id, "missing pong for two intervals, closing session");
                        break;
                    }
                }
            }
        }

        drop(ingest_tx);
        let _ = kernel_task.await;
        writer_task.abort();
        drop(permit);
    }
}

/// Resolves the device-id/client-id/authorization triple from the
/// upgrade request: query parameters first, then a header override for
/// `authorization`, per the §9 resolution (header wins over query when
/// both are present).
fn parse_connect_params(req: &Request) -> ConnectParams {
    let query = req.uri().query().unwrap_or("");
    let params = parse_query_string(query);

    let header_auth = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    ConnectParams {
        device_id: params.get("device-id").or_else(|| params.get("device_id")).cloned(),
        client_id: params.get("client-id").or_else(|| params.get("client_id")).cloned(),
        authorization: header_auth.or_else(|| params.get("authorization").cloned()),
    }
}

/// Minimal `application/x-www-form-urlencoded` query parser: no external
/// `url`/`form_urlencoded` dependency is otherwise needed by this crate,
/// and query strings here are small, flat key-value pairs.
fn parse_query_string(query: &str) -> std::collections::HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?;
            let value = parts.next().unwrap_or("");
            Some((percent_decode(key), percent_decode(value)))
        })
        .collect()
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                if let Ok(byte) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                    out.push(byte);
                    i += 3;
                } else {
                    out.push(bytes[i]);
                    i += 1;
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// The close code and reason used when an upgrade is missing device-id
/// or client-id (§6). Also exposed for deployments whose reverse proxy
/// terminates the upgrade itself and wants to pre-validate identity
/// before the request ever reaches `tokio-tungstenite`.
pub fn missing_identity_rejection() -> (u16, &'static str) {
    (MISSING_IDENTITY_CODE, "device-id and client-id are required")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flat_query_pairs() {
        let params = parse_query_string("device-id=esp32-a&client-id=abc&timestamp=123");
        assert_eq!(params.get("device-id").map(String::as_str), Some("esp32-a"));
        assert_eq!(params.get("client-id").map(String::as_str), Some("abc"));
    }

    #[test]
    fn percent_decodes_values() {
        let params = parse_query_string("authorization=Bearer%20abc123");
        assert_eq!(params.get("authorization").map(String::as_str), Some("Bearer abc123"));
    }

    #[test]
    fn empty_query_yields_empty_map() {
        assert!(parse_query_string("").is_empty());
    }

    #[test]
    fn missing_identity_rejection_uses_4001() {
        assert_eq!(missing_identity_rejection().0, MISSING_IDENTITY_CODE);
    }
}
