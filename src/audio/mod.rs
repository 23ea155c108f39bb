//! Audio processing
//!
//! This module provides:
//! - Microphone conditioning (AGC, gate) and the speaking indicator
//! - Opus encoding for outbound streams and decoding for inbound ones
//! - Local ALSA capture and playback
//! - The playback mixer

pub mod conditioner;
pub mod decoder;
pub mod device;
pub mod encoder;
pub mod mixer;
pub mod playback;
pub mod speaking;

pub use conditioner::{AudioConditioner, BlockAnalysis};
pub use decoder::{DecoderBank, OpusDecoder};
pub use device::{list_capture_devices, AudioDeviceInfo};
pub use encoder::{OpusApplication, OpusEncoder};
pub use mixer::{PlaybackMixer, VolumeSettings};
pub use playback::AudioPlayback;
pub use speaking::SpeakingDetector;

/// Engine sample rate (Hz)
pub const SAMPLE_RATE: u32 = 48_000;
/// Engine channel count
pub const CHANNELS: usize = 2;
/// Frames per 20ms block
pub const FRAME_SAMPLES: usize = 960;
