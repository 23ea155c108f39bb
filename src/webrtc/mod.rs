//! Relay transport over a single WebRTC peer connection
//!
//! Architecture:
//! ```text
//! capture sources ──> StreamMultiplexer ──> per-kind tracks ──┐
//!   (4 slots: camera, screen, mic, screen audio)              │
//!                                                  RTCPeerConnection <──> relay
//!                                                             │
//! MediaHandler <── ReceiveDemux <── remote tracks <───────────┘
//!      (reassembly, StreamIdentityTable, screen selection)
//! ```

pub mod config;
pub mod fragmenter;
pub mod identity;
pub mod multiplexer;
pub mod reassembler;
pub mod session;
pub mod signaling;
pub mod stream;

pub use config::TurnServer;
pub use fragmenter::H264Fragmenter;
pub use identity::{Identity, ParticipantId, SsrcMapping, StreamIdentityTable};
pub use multiplexer::{
    Disposition, InboundAudio, InboundVideo, MediaHandler, PacketSink, ReceiveDemux,
    StreamMultiplexer,
};
pub use reassembler::H264Reassembler;
pub use session::{RelaySession, SessionState};
pub use signaling::{ClientMessage, IceCandidate, RelayMessage, SdpAnswer, SdpOffer};
pub use stream::{PayloadTypeMap, StreamKind};
