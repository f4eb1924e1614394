//! Signaling wire protocol
//!
//! One JSON object per WebSocket text frame, discriminated by `type`.
//! Negotiation payloads (`data`) are opaque and routed untouched.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message types this host understands, including accepted aliases
const KNOWN_TYPES: &[&str] = &[
    "register-host",
    "registered",
    "welcome",
    "peer-joined",
    "user-joined",
    "peer-left",
    "user-left",
    "offer",
    "answer",
    "ice-candidate",
    "ping",
    "heartbeat",
    "pong",
    "host-disconnected",
];

/// Signaling message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    /// Ask the relay to treat this connection as the broadcast host
    RegisterHost,

    /// Relay confirmed registration
    Registered {
        /// Role assigned by the relay
        role: String,
    },

    /// Relay greeting on connect
    Welcome {
        /// Client id assigned by the relay
        #[serde(rename = "clientId", default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,

        /// Whether a host is already registered
        #[serde(rename = "hostConnected", default)]
        host_connected: bool,
    },

    /// A viewer joined
    #[serde(alias = "user-joined")]
    PeerJoined {
        /// Viewer id
        #[serde(rename = "peerId", alias = "userId")]
        peer_id: String,
    },

    /// A viewer left
    #[serde(alias = "user-left")]
    PeerLeft {
        /// Viewer id
        #[serde(rename = "peerId", alias = "userId")]
        peer_id: String,
    },

    /// SDP offer
    Offer {
        /// Remote peer the offer is from or for
        #[serde(rename = "peerId", alias = "userId", default, skip_serializing_if = "Option::is_none")]
        peer_id: Option<String>,

        /// Session description
        #[serde(default)]
        data: Value,
    },

    /// SDP answer
    Answer {
        /// Remote peer the answer is from or for
        #[serde(rename = "peerId", alias = "userId", default, skip_serializing_if = "Option::is_none")]
        peer_id: Option<String>,

        /// Session description
        #[serde(default)]
        data: Value,
    },

    /// Trickled ICE candidate
    IceCandidate {
        /// Remote peer the candidate is from or for
        #[serde(rename = "peerId", alias = "userId", default, skip_serializing_if = "Option::is_none")]
        peer_id: Option<String>,

        /// Candidate init object
        #[serde(default)]
        data: Value,
    },

    /// Liveness probe
    #[serde(alias = "heartbeat")]
    Ping,

    /// Liveness reply
    Pong,

    /// The registered host went away
    HostDisconnected,
}

/// Result of decoding an inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A recognized message
    Message(SignalingMessage),
    /// Well-formed JSON with an unrecognized `type`
    Unknown(String),
}

impl SignalingMessage {
    /// SDP offer addressed to a peer
    pub fn offer(peer_id: impl Into<String>, data: Value) -> Self {
        SignalingMessage::Offer {
            peer_id: Some(peer_id.into()),
            data,
        }
    }

    /// SDP answer addressed to a peer
    pub fn answer(peer_id: impl Into<String>, data: Value) -> Self {
        SignalingMessage::Answer {
            peer_id: Some(peer_id.into()),
            data,
        }
    }

    /// ICE candidate addressed to a peer
    pub fn ice_candidate(peer_id: impl Into<String>, data: Value) -> Self {
        SignalingMessage::IceCandidate {
            peer_id: Some(peer_id.into()),
            data,
        }
    }

    /// Wire `type` of this message
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::RegisterHost => "register-host",
            SignalingMessage::Registered { .. } => "registered",
            SignalingMessage::Welcome { .. } => "welcome",
            SignalingMessage::PeerJoined { .. } => "peer-joined",
            SignalingMessage::PeerLeft { .. } => "peer-left",
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::IceCandidate { .. } => "ice-candidate",
            SignalingMessage::Ping => "ping",
            SignalingMessage::Pong => "pong",
            SignalingMessage::HostDisconnected => "host-disconnected",
        }
    }

    /// Peer the message refers to, if any
    pub fn peer_id(&self) -> Option<&str> {
        match self {
            SignalingMessage::PeerJoined { peer_id } | SignalingMessage::PeerLeft { peer_id } => {
                Some(peer_id)
            }
            SignalingMessage::Offer { peer_id, .. }
            | SignalingMessage::Answer { peer_id, .. }
            | SignalingMessage::IceCandidate { peer_id, .. } => peer_id.as_deref(),
            _ => None,
        }
    }

    /// Serialize to a JSON text frame
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode an inbound text frame
    ///
    /// Malformed JSON, a missing `type`, or a known type with invalid fields
    /// is an error. A well-formed frame with an unknown `type` decodes to
    /// [`Decoded::Unknown`].
    pub fn decode(text: &str) -> Result<Decoded> {
        let value: Value = serde_json::from_str(text)?;

        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::SerializationError("message has no string `type` field".to_string()))?;

        if !KNOWN_TYPES.contains(&kind) {
            return Ok(Decoded::Unknown(kind.to_string()));
        }

        Ok(Decoded::Message(serde_json::from_value(value)?))
    }
}
