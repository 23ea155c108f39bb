//! Logical streams carried on a relay session
//!
//! A session carries at most four independent streams. Each gets one SSRC
//! and one payload type for the session's lifetime, and owns its own
//! sequence and timestamp counters.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::PayloadTypeConfig;

/// H264 clock rate (always 90kHz per RFC 6184)
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

/// Opus RTP clock rate
pub const AUDIO_CLOCK_RATE: u32 = 48_000;

/// Opus frame duration used on the send path (20ms at 48kHz)
pub const AUDIO_FRAME_SAMPLES: u32 = 960;

/// The four logical stream kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    MicAudio,
    ScreenAudio,
    CameraVideo,
    ScreenVideo,
}

impl StreamKind {
    pub const ALL: [StreamKind; 4] = [
        StreamKind::MicAudio,
        StreamKind::ScreenAudio,
        StreamKind::CameraVideo,
        StreamKind::ScreenVideo,
    ];

    pub fn is_video(&self) -> bool {
        matches!(self, StreamKind::CameraVideo | StreamKind::ScreenVideo)
    }

    pub fn is_screen(&self) -> bool {
        matches!(self, StreamKind::ScreenAudio | StreamKind::ScreenVideo)
    }

    pub fn clock_rate(&self) -> u32 {
        if self.is_video() {
            VIDEO_CLOCK_RATE
        } else {
            AUDIO_CLOCK_RATE
        }
    }

    pub fn mime_type(&self) -> &'static str {
        if self.is_video() {
            "video/H264"
        } else {
            "audio/opus"
        }
    }

    /// Track id used in session descriptions
    pub fn track_id(&self) -> &'static str {
        match self {
            StreamKind::MicAudio => "mic",
            StreamKind::ScreenAudio => "screen-audio",
            StreamKind::CameraVideo => "camera",
            StreamKind::ScreenVideo => "screen",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.track_id())
    }
}

/// Bidirectional payload type table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadTypeMap {
    config: PayloadTypeConfig,
}

impl PayloadTypeMap {
    pub fn new(config: PayloadTypeConfig) -> Self {
        Self { config }
    }

    pub fn payload_type(&self, kind: StreamKind) -> u8 {
        match kind {
            StreamKind::MicAudio => self.config.mic_audio,
            StreamKind::ScreenAudio => self.config.screen_audio,
            StreamKind::CameraVideo => self.config.camera_video,
            StreamKind::ScreenVideo => self.config.screen_video,
        }
    }

    /// Classify an inbound packet; `None` for payload types not in the table
    pub fn kind_for(&self, payload_type: u8) -> Option<StreamKind> {
        StreamKind::ALL
            .into_iter()
            .find(|kind| self.payload_type(*kind) == payload_type)
    }
}

impl Default for PayloadTypeMap {
    fn default() -> Self {
        Self::new(PayloadTypeConfig::default())
    }
}

/// Send statistics for one stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamSendStats {
    pub units_sent: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub keyframes_sent: u64,
}

/// Per-stream RTP state
#[derive(Debug, Clone)]
pub struct StreamSlot {
    pub kind: StreamKind,
    pub ssrc: u32,
    pub payload_type: u8,
    sequence: u16,
    timestamp: u32,
    pub stats: StreamSendStats,
}

impl StreamSlot {
    /// New slot with random SSRC and random initial counters
    pub fn new(kind: StreamKind, payload_type: u8) -> Self {
        Self::with_initial(
            kind,
            payload_type,
            rand::random(),
            rand::random(),
            rand::random(),
        )
    }

    pub fn with_initial(
        kind: StreamKind,
        payload_type: u8,
        ssrc: u32,
        sequence: u16,
        timestamp: u32,
    ) -> Self {
        Self {
            kind,
            ssrc,
            payload_type,
            sequence,
            timestamp,
            stats: StreamSendStats::default(),
        }
    }

    /// Take the next sequence number (wraps at 16 bits)
    pub fn next_sequence(&mut self) -> u16 {
        let seq = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        seq
    }

    /// Timestamp of the unit currently being sent
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Move the clock forward by `ticks` (wraps at 32 bits)
    pub fn advance(&mut self, ticks: u32) {
        self.timestamp = self.timestamp.wrapping_add(ticks);
    }

    /// Clock ticks for one video frame at `fps`
    pub fn frame_ticks(fps: u32) -> u32 {
        VIDEO_CLOCK_RATE / fps.max(1)
    }
}
