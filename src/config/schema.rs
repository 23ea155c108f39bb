use serde::{Deserialize, Serialize};

pub use crate::webrtc::config::TurnServer;

/// Main engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Capture helper and source settings
    pub capture: CaptureConfig,
    /// Audio processing and playback settings
    pub audio: AudioConfig,
    /// Relay transport settings
    pub relay: RelayConfig,
}

/// Capture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Path or name of the platform capture helper executable
    pub helper_path: String,
    /// Time producer loops get to exit before the helper is killed (ms)
    pub shutdown_grace_ms: u64,
    /// Camera capture settings
    pub camera: VideoSourceConfig,
    /// Screen capture settings
    pub screen: ScreenSourceConfig,
    /// Microphone settings
    pub microphone: MicrophoneConfig,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            helper_path: "confab-capture".to_string(),
            shutdown_grace_ms: 500,
            camera: VideoSourceConfig::default(),
            screen: ScreenSourceConfig::default(),
            microphone: MicrophoneConfig::default(),
        }
    }
}

/// Encoded video source parameters passed to the helper
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoSourceConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Target bitrate in Mbps
    pub bitrate_mbps: u32,
}

impl Default for VideoSourceConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 15,
            bitrate_mbps: 2,
        }
    }
}

/// Screen capture parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenSourceConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Target bitrate in Mbps
    pub bitrate_mbps: u32,
    /// Also capture system audio alongside the screen
    pub capture_audio: bool,
    /// Application ids excluded from the capture
    pub exclude_apps: Vec<String>,
}

impl Default for ScreenSourceConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 30,
            bitrate_mbps: 6,
            capture_audio: true,
            exclude_apps: Vec::new(),
        }
    }
}

impl ScreenSourceConfig {
    /// Encoding parameters shared with the camera path
    pub fn video(&self) -> VideoSourceConfig {
        VideoSourceConfig {
            width: self.width,
            height: self.height,
            fps: self.fps,
            bitrate_mbps: self.bitrate_mbps,
        }
    }
}

/// Where microphone audio comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MicrophoneBackend {
    /// Capture helper process (`--microphone <id>`)
    Helper,
    /// Local ALSA capture device
    Alsa,
}

impl Default for MicrophoneBackend {
    fn default() -> Self {
        Self::Helper
    }
}

/// Microphone configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MicrophoneConfig {
    pub backend: MicrophoneBackend,
    /// ALSA device name when `backend = "alsa"`
    pub device: String,
    pub noise_suppression: bool,
    pub echo_cancellation: bool,
}

impl Default for MicrophoneConfig {
    fn default() -> Self {
        Self {
            backend: MicrophoneBackend::Helper,
            device: "default".to_string(),
            noise_suppression: true,
            echo_cancellation: true,
        }
    }
}

/// Audio configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Gain control and gating parameters
    pub conditioner: ConditionerConfig,
    /// Opus encoder settings
    pub opus: OpusSettings,
    /// ALSA playback device
    pub playback_device: String,
    /// Per-participant queue cap in the playback mixer (ms)
    pub mixer_max_buffer_ms: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            conditioner: ConditionerConfig::default(),
            opus: OpusSettings::default(),
            playback_device: "default".to_string(),
            mixer_max_buffer_ms: 200,
        }
    }
}

/// Microphone conditioning parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConditionerConfig {
    /// Output RMS the AGC steers towards (i16 scale)
    pub target_rms: f32,
    pub min_gain: f32,
    pub max_gain: f32,
    /// Smoothing factor when gain is reduced
    pub attack: f32,
    /// Smoothing factor when gain is raised
    pub release: f32,
    /// Blocks quieter than this RMS leave the AGC untouched
    pub silence_rms: f32,
    pub baseline_gain: f32,
    /// Normalized RMS below which a block is zeroed
    pub gate_threshold: f32,
    /// Gated time required before the speaking indicator turns off (ms)
    pub speaking_debounce_ms: u64,
}

impl Default for ConditionerConfig {
    fn default() -> Self {
        Self {
            target_rms: 3000.0,
            min_gain: 1.0,
            max_gain: 8.0,
            attack: 0.1,
            release: 0.005,
            silence_rms: 50.0,
            baseline_gain: 1.0,
            gate_threshold: 0.01,
            speaking_debounce_ms: 200,
        }
    }
}

/// Opus encoder settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpusSettings {
    /// Bitrate in bits per second
    pub bitrate: u32,
    /// In-band forward error correction
    pub fec: bool,
}

impl Default for OpusSettings {
    fn default() -> Self {
        Self {
            bitrate: 64000,
            fec: true,
        }
    }
}

/// Relay transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Largest RTP payload produced by the fragmenter
    pub max_payload_size: usize,
    pub payload_types: PayloadTypeConfig,
    /// How long to wait for ICE gathering before answering (ms)
    pub ice_gathering_timeout_ms: u64,
    pub stun_servers: Vec<String>,
    pub turn_servers: Vec<TurnServer>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 1200,
            payload_types: PayloadTypeConfig::default(),
            ice_gathering_timeout_ms: 2000,
            stun_servers: vec![],
            turn_servers: vec![],
        }
    }
}

/// RTP payload type per logical stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PayloadTypeConfig {
    pub camera_video: u8,
    pub screen_video: u8,
    pub mic_audio: u8,
    pub screen_audio: u8,
}

impl Default for PayloadTypeConfig {
    fn default() -> Self {
        Self {
            camera_video: 96,
            screen_video: 97,
            mic_audio: 111,
            screen_audio: 112,
        }
    }
}
