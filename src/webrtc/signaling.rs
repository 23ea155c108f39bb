//! Relay signaling messages
//!
//! The transport for these messages (a WebSocket or the chat backend) is
//! owned by the application; this module only defines the JSON shapes the
//! relay and the engine exchange.

use serde::{Deserialize, Serialize};

use super::identity::{ParticipantId, SsrcMapping};
use crate::error::{AppError, Result};

/// Message from the relay to this participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    /// Relay-issued session offer
    Offer(SdpOffer),
    /// Trickled relay candidate
    Candidate(IceCandidate),
    /// One stream started
    SsrcMapping(SsrcMapping),
    /// Streams of participants already present
    SsrcMappings { mappings: Vec<SsrcMapping> },
    /// A participant left; their routes are stale
    ParticipantLeft { participant: ParticipantId },
    /// Relay closed the session
    Close,
}

/// Message from this participant to the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Answer(SdpAnswer),
    Candidate(IceCandidate),
}

/// SDP offer from the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SdpOffer {
    pub sdp: String,
}

impl SdpOffer {
    pub fn new(sdp: impl Into<String>) -> Self {
        Self { sdp: sdp.into() }
    }

    /// Reject offers that are obviously not a session description
    pub fn validate(&self) -> Result<()> {
        let sdp = self.sdp.trim_start();
        if !sdp.starts_with("v=0") {
            return Err(AppError::NegotiationFailed(
                "Malformed offer: missing version line".to_string(),
            ));
        }
        if !sdp.contains("\nm=") {
            return Err(AppError::NegotiationFailed(
                "Malformed offer: no media sections".to_string(),
            ));
        }
        Ok(())
    }
}

/// SDP answer for the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SdpAnswer {
    pub sdp: String,
    /// Candidates gathered while the answer was created
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ice_candidates: Vec<IceCandidate>,
}

impl SdpAnswer {
    pub fn with_candidates(sdp: impl Into<String>, ice_candidates: Vec<IceCandidate>) -> Self {
        Self {
            sdp: sdp.into(),
            ice_candidates,
        }
    }
}

/// ICE candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
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
