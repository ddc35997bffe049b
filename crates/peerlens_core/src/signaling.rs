/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, Stream, StreamExt};
use peerlens_protocol::{ClientMsg, RelayMsg};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const WELCOME_TIMEOUT: Duration = Duration::from_secs(10);
const QUEUE: usize = 64;

/// A live relay connection. Dropping `outbox` or cancelling the token closes it;
/// `inbox` ends when the socket does.
pub struct SignalingClient {
    pub self_id: String,
    pub outbox: mpsc::Sender<ClientMsg>,
    pub inbox: mpsc::Receiver<RelayMsg>,
    pub task: JoinHandle<()>,
}

fn parse_relay(text: &str) -> Option<RelayMsg> {
    match serde_json::from_str::<RelayMsg>(text) {
        Ok(m) => Some(m),
        Err(e) => {
            warn!("bad relay message: {e}");
            None
        }
    }
}

async fn await_welcome<S>(ws_rx: &mut S) -> Result<String>
where
    S: Stream<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    while let Some(msg) = ws_rx.next().await {
        match msg.context("relay read")? {
            tungstenite::Message::Text(t) => match parse_relay(&t) {
                Some(RelayMsg::Welcome { id }) => return Ok(id),
                Some(other) => debug!(?other, "message before welcome ignored"),
                None => {}
            },
            tungstenite::Message::Close(_) => break,
            _ => {}
        }
    }
    Err(anyhow!("relay closed before welcome"))
}

/// Connects and waits for the relay to assign this connection an identity.
pub async fn connect(url: &str, cancel: CancellationToken) -> Result<SignalingClient> {
    info!(%url, "connecting to relay");
    let (ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .with_context(|| format!("connect relay {url}"))?;
    let (mut ws_tx, mut ws_rx) = ws.split();

    let self_id = tokio::time::timeout(WELCOME_TIMEOUT, await_welcome(&mut ws_rx))
        .await
        .map_err(|_| anyhow!("relay did not send welcome"))??;
    info!(id = %self_id, "connected to relay");

    let (out_tx, mut out_rx) = mpsc::channel::<ClientMsg>(QUEUE);
    let (in_tx, in_rx) = mpsc::channel::<RelayMsg>(QUEUE);

    let task = tokio::spawn(async move {
        let mut ping = tokio::time::interval(Duration::from_secs(15));
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = ws_tx.send(tungstenite::Message::Close(None)).await;
                    break;
                }
                _ = ping.tick() => {
                    if let Err(e) = ws_tx.send(tungstenite::Message::Ping(Vec::new())).await {
                        warn!("relay ping failed: {e}");
                        break;
                    }
                }
                out = out_rx.recv() => {
                    let Some(out) = out else {
                        let _ = ws_tx.send(tungstenite::Message::Close(None)).await;
                        break;
                    };
                    let kind = out.kind();
                    let json = match serde_json::to_string(&out) {
                        Ok(j) => j,
                        Err(e) => {
                            warn!(kind, "encode failed: {e}");
                            continue;
                        }
                    };
                    debug!(kind, target = ?out.target(), "-> relay");
                    if let Err(e) = ws_tx.send(tungstenite::Message::Text(json)).await {
                        warn!(kind, "relay send failed: {e}");
                        break;
                    }
                }
                msg = ws_rx.next() => {
                    let Some(msg) = msg else { break };
                    let msg = match msg {
                        Ok(m) => m,
                        Err(e) => {
                            warn!("relay read failed: {e}");
                            break;
                        }
                    };
                    match msg {
                        tungstenite::Message::Text(t) => {
                            let Some(m) = parse_relay(&t) else { continue };
                            // Never wait on the consumer here: it may itself be
                            // waiting for room in the outbox this task drains.
                            match in_tx.try_send(m) {
                                Ok(()) => {}
                                Err(TrySendError::Full(m)) => {
                                    warn!(kind = m.kind(), "inbox full, relay message dropped");
                                }
                                Err(TrySendError::Closed(_)) => break,
                            }
                        }
                        tungstenite::Message::Ping(p) => {
                            let _ = ws_tx.send(tungstenite::Message::Pong(p)).await;
                        }
                        tungstenite::Message::Close(_) => break,
                        _ => {}
                    }
                }
            }
        }
        info!("relay connection closed");
    });

    Ok(SignalingClient {
        self_id,
        outbox: out_tx,
        inbox: in_rx,
        task,
    })
}
