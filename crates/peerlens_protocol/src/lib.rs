/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages a participant sends to the relay.
///
/// Negotiation payloads are carried as opaque JSON so the relay never has to
/// understand (or re-encode) them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ClientMsg {
    Join,
    Offer {
        target: String,
        /// Ignored by the relay, which stamps the real sender identity.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        offer: Value,
    },
    Answer {
        target: String,
        answer: Value,
    },
    IceCandidate {
        target: String,
        candidate: Value,
    },
}

impl ClientMsg {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMsg::Join => "join",
            ClientMsg::Offer { .. } => "offer",
            ClientMsg::Answer { .. } => "answer",
            ClientMsg::IceCandidate { .. } => "ice-candidate",
        }
    }

    pub fn target(&self) -> Option<&str> {
        match self {
            ClientMsg::Join => None,
            ClientMsg::Offer { target, .. }
            | ClientMsg::Answer { target, .. }
            | ClientMsg::IceCandidate { target, .. } => Some(target),
        }
    }
}

/// Messages the relay delivers to a participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum RelayMsg {
    /// Identity assigned by the relay to this connection.
    Welcome { id: String },
    /// Peers already present when this participant joined.
    ExistingPeers { peers: Vec<String> },
    PeerJoined { peer: String },
    PeerLeft { peer: String },
    Offer { from: String, offer: Value },
    Answer { answer: Value },
    IceCandidate { candidate: Value },
    Error { message: String },
}

impl RelayMsg {
    pub fn kind(&self) -> &'static str {
        match self {
            RelayMsg::Welcome { .. } => "welcome",
            RelayMsg::ExistingPeers { .. } => "existing-peers",
            RelayMsg::PeerJoined { .. } => "peer-joined",
            RelayMsg::PeerLeft { .. } => "peer-left",
            RelayMsg::Offer { .. } => "offer",
            RelayMsg::Answer { .. } => "answer",
            RelayMsg::IceCandidate { .. } => "ice-candidate",
            RelayMsg::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// Browser-compatible `RTCSessionDescriptionInit` (`{"type": .., "sdp": ..}`).
///
/// This is also the body of the server-mode `POST /offer` exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_value(v: Value) -> serde_json::Result<Self> {
        serde_json::from_value(v)
    }
}

/// Browser-compatible `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_value(v: Value) -> serde_json::Result<Self> {
        serde_json::from_value(v)
    }
}
