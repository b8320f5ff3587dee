//! Downstream WebSocket surface: one session per connected map client.
//!
//! Each session runs a single socket task that multiplexes three concerns:
//! inbound client messages, the session's outbound queue (filled by the
//! dispatcher, the heartbeat monitor and the session itself), and the
//! server-wide shutdown signal. Writes are therefore serialized per session
//! and bounded by the outbound queue's drop-oldest policy.

use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use tokio::sync::broadcast;

use lib_common::core::VesselStore;
use lib_common::tiles::TileKey;

use crate::ais_logic::config::Config;
use crate::ais_logic::dispatcher::{Dispatcher, Outbound, SessionHandle};
use crate::ais_logic::model::{ClientMessage, ServerMessage};

static NEXT_CLIENT_ID: AtomicUsize = AtomicUsize::new(1);

/// Depth of each session's outbound queue. Overflow sheds the oldest
/// pending vessel update for that session only.
const OUTBOUND_QUEUE_DEPTH: usize = 256;

pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 1006;

#[derive(Clone)]
struct HttpState {
    store: Arc<VesselStore>,
    dispatcher: Arc<Dispatcher>,
    draining: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
}

pub async fn run(
    config: Config,
    store: Arc<VesselStore>,
    dispatcher: Arc<Dispatcher>,
    draining: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
) {
    let mut shutdown = shutdown_tx.subscribe();
    let state = HttpState {
        store,
        dispatcher,
        draining,
        shutdown_tx: shutdown_tx.clone(),
    };

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    log::info!("Downstream server listening on {}", addr);

    if let (Some(cert_path), Some(key_path)) = (&config.tls_cert_path, &config.tls_key_path) {
        let tls_config = match RustlsConfig::from_pem_file(cert_path, key_path).await {
            Ok(tls_config) => tls_config,
            Err(e) => {
                log::error!("Failed to load TLS configuration: {}", e);
                let _ = shutdown_tx.send(());
                return;
            }
        };

        if let Err(e) = axum_server::bind_rustls(addr, tls_config)
            .serve(app.into_make_service())
            .await
        {
            log::error!("Downstream TLS server failed: {}", e);
            let _ = shutdown_tx.send(());
        }
    } else {
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                log::error!("Failed to bind {}: {}", addr, e);
                let _ = shutdown_tx.send(());
                return;
            }
        };
        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            shutdown.recv().await.ok();
            log::info!("Downstream server shutting down.");
        });
        if let Err(e) = serve.await {
            log::error!("Downstream server failed: {}", e);
            let _ = shutdown_tx.send(());
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<HttpState>) -> impl IntoResponse {
    // New connections are refused while draining so sessions can flush out.
    if state.draining.load(Ordering::Relaxed) {
        return (StatusCode::SERVICE_UNAVAILABLE, "server shutting down").into_response();
    }
    ws.on_upgrade(|socket| handle_socket(socket, state))
        .into_response()
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn handle_socket(mut socket: WebSocket, state: HttpState) {
    let client_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed) as u64;
    let session = Arc::new(SessionHandle::new(client_id, OUTBOUND_QUEUE_DEPTH));
    state.dispatcher.register(Arc::clone(&session));
    log::info!("Client {} connected", client_id);

    session.queue.push(Outbound::Frame(ServerMessage::Connected {
        client_id: format!("client-{}", client_id),
        message: "connected to AIS tile stream".to_string(),
    }));

    let mut shutdown = state.shutdown_tx.subscribe();
    let close_reason = loop {
        tokio::select! {
            _ = shutdown.recv() => {
                let frame = CloseFrame {
                    code: CLOSE_GOING_AWAY,
                    reason: "server shutting down".into(),
                };
                let _ = socket.send(Message::Close(Some(frame))).await;
                break "server shutdown";
            }
            item = session.queue.pop() => {
                match item {
                    Outbound::Frame(msg) => match serde_json::to_string(&msg) {
                        Ok(json) => {
                            if socket.send(Message::Text(json.into())).await.is_err() {
                                break "send failed";
                            }
                        }
                        Err(e) => log::error!("Failed to encode server message: {}", e),
                    },
                    Outbound::Ping => {
                        if socket.send(Message::Ping(Bytes::new())).await.is_err() {
                            break "send failed";
                        }
                    }
                    Outbound::Close { code, reason } => {
                        let frame = CloseFrame { code, reason: reason.into() };
                        let _ = socket.send(Message::Close(Some(frame))).await;
                        break reason;
                    }
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(message)) => {
                        // Any traffic, protocol pongs included, proves the
                        // session is alive for the heartbeat monitor.
                        session.alive.store(true, Ordering::Relaxed);
                        if handle_inbound(message, &session, &state).is_break() {
                            break "client closed";
                        }
                    }
                    Some(Err(e)) => {
                        log::debug!("Client {} socket error: {}", client_id, e);
                        break "socket error";
                    }
                    None => break "client disconnected",
                }
            }
        }
    };

    state.dispatcher.unregister(client_id);
    if session.queue.dropped() > 0 {
        log::warn!(
            "Client {} had {} vessel updates shed by its outbound queue",
            client_id,
            session.queue.dropped()
        );
    }
    log::info!("Client {} disconnected ({})", client_id, close_reason);
}

fn handle_inbound(
    message: Message,
    session: &Arc<SessionHandle>,
    state: &HttpState,
) -> ControlFlow<()> {
    match message {
        Message::Text(text) => {
            match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Subscribe { tiles }) => {
                    let keys = parse_tile_keys(session.id, &tiles);
                    state.dispatcher.subscribe(session.id, &keys, &state.store);
                }
                Ok(ClientMessage::Unsubscribe { tiles }) => {
                    let keys = parse_tile_keys(session.id, &tiles);
                    state.dispatcher.unsubscribe(session.id, &keys);
                }
                Ok(ClientMessage::Ping) => {
                    session.queue.push(Outbound::Frame(ServerMessage::Pong));
                }
                Err(e) => {
                    log::debug!(
                        "Client {} sent an unknown or malformed message: {}",
                        session.id,
                        e
                    );
                }
            }
            ControlFlow::Continue(())
        }
        Message::Close(_) => ControlFlow::Break(()),
        // Protocol pings are answered by the websocket layer; both ping and
        // pong already refreshed the liveness flag.
        _ => ControlFlow::Continue(()),
    }
}

fn parse_tile_keys(client_id: u64, tiles: &[String]) -> Vec<TileKey> {
    tiles
        .iter()
        .filter_map(|raw| match raw.parse::<TileKey>() {
            Ok(key) => Some(key),
            Err(e) => {
                log::debug!("Client {} sent an invalid tile key: {}", client_id, e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_keys_and_skips_garbage() {
        let raw = vec![
            "12/3346/1786".to_string(),
            "not-a-tile".to_string(),
            "12/4096/0".to_string(),
            "12/2048/2048".to_string(),
        ];
        let keys = parse_tile_keys(7, &raw);
        assert_eq!(
            keys,
            vec![TileKey::new(12, 3346, 1786), TileKey::new(12, 2048, 2048)]
        );
    }

    #[test]
    fn empty_input_yields_no_keys() {
        assert!(parse_tile_keys(7, &[]).is_empty());
    }
}
