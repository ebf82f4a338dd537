//! Rendezvous wire messages
//!
//! JSON text frames tagged by `type`. The rendezvous server only relays
//! `signal` payloads between registered identifiers; SDP and ICE candidates
//! travel inside them.

use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// Client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Claim an identifier
    Register { id: String },
    /// Relay `payload` to `to`
    Signal {
        to: String,
        connection_id: String,
        payload: SignalPayload,
    },
    Heartbeat,
    Leave,
}

/// Server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Registration accepted
    Open { id: String },
    /// Relayed from `from`
    Signal {
        from: String,
        connection_id: String,
        payload: SignalPayload,
    },
    Error {
        kind: ServerErrorKind,
        message: String,
        /// Identifier the failed request was addressed to
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerErrorKind {
    /// The addressed identifier is not registered
    PeerUnavailable,
    IdTaken,
    InvalidId,
    ServerError,
}

impl ServerErrorKind {
    pub fn into_error(self, message: String, peer: Option<String>) -> SessionError {
        match self {
            ServerErrorKind::PeerUnavailable => {
                SessionError::TargetUnreachable(peer.unwrap_or(message))
            }
            _ => SessionError::Rendezvous(message),
        }
    }
}

/// Which kind of peer connection an offer opens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Media,
    Data,
}

/// Negotiation step for one peer connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalPayload {
    Offer { sdp: String, channel: ChannelKind },
    Answer { sdp: String },
    Candidate(IceCandidate),
    /// The sender closed or rejected the connection
    Close,
}

impl SignalPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalPayload::Offer { .. } => "offer",
            SignalPayload::Answer { .. } => "answer",
            SignalPayload::Candidate(_) => "candidate",
            SignalPayload::Close => "close",
        }
    }
}

/// ICE candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate string
    pub candidate: String,
    /// SDP mid (media ID)
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    /// SDP mline index
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    /// Username fragment
    #[serde(rename = "usernameFragment")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    pub fn with_mid(mut self, mid: impl Into<String>, index: u16) -> Self {
        self.sdp_mid = Some(mid.into());
        self.sdp_mline_index = Some(index);
        self
    }
}
