//! Engine event types
//!
//! Defines all event types that can be broadcast through the event bus.

use serde::Serialize;

use crate::capture::{CaptureState, SourceKind};
use crate::webrtc::identity::ParticipantId;
use crate::webrtc::session::SessionState;

/// Engine event (serialized as `{"event": ..., "data": ...}`)
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum MediaEvent {
    /// A capture source changed lifecycle state
    #[serde(rename = "capture.state_changed")]
    CaptureStateChanged {
        kind: SourceKind,
        state: CaptureState,
        /// Failure detail when the source became unavailable
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// The relay session changed state
    #[serde(rename = "relay.state_changed")]
    RelayStateChanged { state: SessionState },

    /// Local speaking indicator flipped
    #[serde(rename = "audio.speaking_changed")]
    SpeakingChanged { speaking: bool },

    /// An SSRC was mapped to a participant
    #[serde(rename = "identity.resolved")]
    IdentityResolved { ssrc: u32, participant: ParticipantId },

    /// The watched screen share changed (`None` = nobody)
    #[serde(rename = "identity.screen_selected")]
    ScreenSelectionChanged { participant: Option<ParticipantId> },
}
