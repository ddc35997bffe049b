/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use peerlens_protocol::{ClientMsg, RelayMsg};
use std::{net::SocketAddr, sync::Arc};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, info_span, warn};

mod hub;
use hub::Hub;

#[derive(Debug, Clone)]
struct RelayConfig {
    bind: SocketAddr,
    max_message_bytes: usize,
    notify_peer_left: bool,
}

#[derive(Clone)]
struct AppState {
    hub: Arc<Hub>,
    cfg: RelayConfig,
    shutdown: CancellationToken,
}

/// Frames above this are refused by the websocket layer and end the
/// connection; frames between `max_message_bytes` and this are read and dropped.
fn frame_limit(max_message_bytes: usize) -> usize {
    max_message_bytes.saturating_mul(4)
}

fn load_config() -> Result<RelayConfig> {
    let bind = std::env::var("PEERLENS_RELAY_BIND").unwrap_or_else(|_| "0.0.0.0:3001".to_string());
    let bind: SocketAddr = bind.parse().context("PEERLENS_RELAY_BIND invalid")?;

    let max_message_bytes = std::env::var("PEERLENS_RELAY_MAX_MESSAGE_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(256 * 1024)
        .clamp(4 * 1024, 4 * 1024 * 1024);

    let notify_peer_left = std::env::var("PEERLENS_RELAY_NOTIFY_PEER_LEFT")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(true);

    Ok(RelayConfig {
        bind,
        max_message_bytes,
        notify_peer_left,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cfg = load_config()?;
    let shutdown = CancellationToken::new();
    let state = AppState {
        hub: Arc::new(Hub::new(cfg.notify_peer_left)),
        cfg: cfg.clone(),
        shutdown: shutdown.clone(),
    };

    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
        on_signal.cancel();
    });

    info!("peerlens_relay listening on http://{}", cfg.bind);
    let listener = tokio::net::TcpListener::bind(cfg.bind)
        .await
        .with_context(|| format!("bind {}", cfg.bind))?;
    axum::serve(listener, app(state).into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("serve")?;
    Ok(())
}

fn app(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(signal_ws))
        .route("/healthz", get(healthz))
        .layer(
            TraceLayer::new_for_http().make_span_with(|req: &axum::http::Request<_>| {
                info_span!("http", method = %req.method(), uri = %req.uri())
            }),
        )
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "ok": true,
        "connected": state.hub.connected().await,
    }))
}

async fn signal_ws(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let limit = frame_limit(state.cfg.max_message_bytes);
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| handle_socket(state, peer, socket))
}

async fn handle_socket(state: AppState, addr: SocketAddr, socket: WebSocket) {
    let (id, mut rx) = state.hub.register().await;
    info!(peer=%id, %addr, "signaling socket connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let cancel = state.shutdown.child_token();

    let welcome = RelayMsg::Welcome { id: id.clone() };
    let writer_cancel = cancel.clone();
    let writer_id = id.clone();
    let writer = tokio::spawn(async move {
        let mut pending = Some(welcome);
        loop {
            let msg = match pending.take() {
                Some(m) => m,
                None => tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    m = rx.recv() => match m {
                        Some(m) => m,
                        None => break,
                    },
                },
            };
            let json = match serde_json::to_string(&msg) {
                Ok(v) => v,
                Err(e) => {
                    error!(peer=%writer_id, "serialize relay message failed: {e}");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let max = state.cfg.max_message_bytes;
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            m = ws_rx.next() => match m {
                Some(Ok(m)) => m,
                _ => break,
            },
        };
        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => break,
            _ => continue,
        };
        if text.len() > max {
            warn!(peer=%id, len = text.len(), "signal dropped: too large");
            continue;
        }
        let msg: ClientMsg = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                warn!(peer=%id, "bad signal json: {e}");
                continue;
            }
        };
        let kind = msg.kind();
        if let Err(e) = state.hub.handle(&id, msg).await {
            warn!(peer=%id, kind, "signal not delivered: {e:#}");
            let message = format!("{kind} not delivered: {e}");
            let _ = state.hub.send_to(&id, RelayMsg::Error { message }).await;
        }
    }

    cancel.cancel();
    let _ = writer.await;
    state.hub.leave(&id).await;
}
