//! Negotiation state and the payloads carried by offer/answer/candidate envelopes

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of one negotiator session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Nothing opened yet
    Idle,
    /// Signaling channel open, no peer connection
    SignalingConnected,
    /// Local offer sent, waiting for an answer
    OfferSent,
    /// Remote offer accepted and answer sent
    Answered,
    /// Remote answer applied, waiting for a usable path
    Negotiating,
    /// The peer transport reported a usable path
    Connected,
    /// Terminal
    Closed,
}

impl SessionState {
    /// A remote description has been applied in this state.
    pub fn has_remote_description(&self) -> bool {
        matches!(
            self,
            SessionState::Answered | SessionState::Negotiating | SessionState::Connected
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::SignalingConnected => "signaling_connected",
            SessionState::OfferSent => "offer_sent",
            SessionState::Answered => "answered",
            SessionState::Negotiating => "negotiating",
            SessionState::Connected => "connected",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Offer or answer payload, in the `{ "type": .., "sdp": .. }` shape browsers use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A network-path candidate, in the `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}
