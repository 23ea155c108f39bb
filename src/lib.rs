//! confab-media - per-participant media engine for relay-based calls
//!
//! This crate captures microphone, camera and screen media (through a
//! platform capture helper or a local ALSA device), conditions and encodes
//! it, and carries all four logical streams over a single WebRTC session to
//! the call relay. Inbound media is reassembled, attributed to participants,
//! decoded and mixed for playback.

pub mod audio;
pub mod capture;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod utils;
pub mod video;
pub mod webrtc;

pub use engine::MediaEngine;
pub use error::{AppError, Result};
