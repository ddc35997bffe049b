/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{anyhow, Result};
use peerlens_protocol::{ClientMsg, RelayMsg};
use std::collections::HashMap;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

const PEER_QUEUE: usize = 64;

fn random_id() -> String {
    let mut b = [0u8; 16];
    use rand::RngCore as _;
    rand::rngs::OsRng.fill_bytes(&mut b);
    b.iter().map(|v| format!("{v:02x}")).collect()
}

struct PeerEntry {
    tx: mpsc::Sender<RelayMsg>,
    joined: bool,
}

/// Queues without waiting. A participant whose writer has fallen behind
/// loses the message instead of stalling everyone else.
fn enqueue(to: &str, tx: &mpsc::Sender<RelayMsg>, msg: RelayMsg) -> Result<()> {
    match tx.try_send(msg) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(m)) => {
            warn!(peer=%to, kind = m.kind(), "peer queue full, message dropped");
            Err(anyhow!("target {to} is not keeping up"))
        }
        Err(TrySendError::Closed(_)) => Err(anyhow!("target {to} disconnected")),
    }
}

/// Fan-out router keyed by connection identity.
///
/// The hub only knows who is currently connected. It never stores or
/// inspects negotiation payloads.
pub struct Hub {
    peers: RwLock<HashMap<String, PeerEntry>>,
    notify_peer_left: bool,
}

impl Hub {
    pub fn new(notify_peer_left: bool) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            notify_peer_left,
        }
    }

    /// Registers a freshly connected participant and returns its identity plus
    /// the queue the socket writer drains.
    pub async fn register(&self) -> (String, mpsc::Receiver<RelayMsg>) {
        let (tx, rx) = mpsc::channel(PEER_QUEUE);
        let mut guard = self.peers.write().await;
        let mut id = random_id();
        while guard.contains_key(&id) {
            id = random_id();
        }
        guard.insert(id.clone(), PeerEntry { tx, joined: false });
        (id, rx)
    }

    pub async fn connected(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn handle(&self, from: &str, msg: ClientMsg) -> Result<()> {
        match msg {
            ClientMsg::Join => {
                self.join(from).await;
                Ok(())
            }
            ClientMsg::Offer { target, offer, .. } => {
                let out = RelayMsg::Offer {
                    from: from.to_string(),
                    offer,
                };
                self.send_to(&target, out).await
            }
            ClientMsg::Answer { target, answer } => self.send_to(&target, RelayMsg::Answer { answer }).await,
            ClientMsg::IceCandidate { target, candidate } => {
                self.send_to(&target, RelayMsg::IceCandidate { candidate }).await
            }
        }
    }

    async fn join(&self, id: &str) {
        let (own_tx, existing, others): (_, _, Vec<(String, mpsc::Sender<RelayMsg>)>) = {
            let mut guard = self.peers.write().await;
            let Some(entry) = guard.get_mut(id) else {
                warn!(peer=%id, "join from unregistered connection");
                return;
            };
            entry.joined = true;
            let own_tx = entry.tx.clone();
            let existing = guard
                .iter()
                .filter(|(k, v)| k.as_str() != id && v.joined)
                .map(|(k, _)| k.clone())
                .collect::<Vec<_>>();
            let others = guard
                .iter()
                .filter(|(k, _)| k.as_str() != id)
                .map(|(k, v)| (k.clone(), v.tx.clone()))
                .collect();
            (own_tx, existing, others)
        };

        info!(peer=%id, existing = existing.len(), "peer joined");
        let _ = enqueue(id, &own_tx, RelayMsg::ExistingPeers { peers: existing });
        for (other, tx) in others {
            let _ = enqueue(&other, &tx, RelayMsg::PeerJoined { peer: id.to_string() });
        }
    }

    pub async fn send_to(&self, target: &str, msg: RelayMsg) -> Result<()> {
        let tx = {
            let guard = self.peers.read().await;
            guard.get(target).map(|e| e.tx.clone())
        };
        let Some(tx) = tx else {
            return Err(anyhow!("unknown target {target}"));
        };
        debug!(to=%target, "forwarding signal");
        enqueue(target, &tx, msg)
    }

    /// Drops a participant. Peer-left notification is a hardening addition and
    /// can be switched off.
    pub async fn leave(&self, id: &str) {
        let (was_joined, others) = {
            let mut guard = self.peers.write().await;
            let was_joined = guard.remove(id).map(|e| e.joined).unwrap_or(false);
            let others = guard
                .iter()
                .map(|(k, v)| (k.clone(), v.tx.clone()))
                .collect::<Vec<_>>();
            (was_joined, others)
        };
        info!(peer=%id, "peer disconnected");
        if !(self.notify_peer_left && was_joined) {
            return;
        }
        for (other, tx) in others {
            let _ = enqueue(&other, &tx, RelayMsg::PeerLeft { peer: id.to_string() });
        }
    }
}
