//! Capture helper command line
//!
//! The helper takes exactly one target flag (`--microphone`, `--camera`,
//! `--display`, `--window` or `--app`), encoding parameters for video
//! targets, and feature switches. Bitrate is passed in Mbps.

use std::fmt;

use crate::config::{MicrophoneConfig, ScreenSourceConfig, VideoSourceConfig};
use crate::error::{AppError, Result};

use super::session::SourceKind;

const MAX_DIMENSION: u32 = 4096;
const MAX_FPS: u32 = 120;
const MAX_BITRATE_MBPS: u32 = 100;

/// What the helper should capture
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureTarget {
    Microphone(String),
    Camera(String),
    Display(String),
    Window(String),
    App(String),
}

impl CaptureTarget {
    pub fn flag(&self) -> &'static str {
        match self {
            CaptureTarget::Microphone(_) => "--microphone",
            CaptureTarget::Camera(_) => "--camera",
            CaptureTarget::Display(_) => "--display",
            CaptureTarget::Window(_) => "--window",
            CaptureTarget::App(_) => "--app",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            CaptureTarget::Microphone(id)
            | CaptureTarget::Camera(id)
            | CaptureTarget::Display(id)
            | CaptureTarget::Window(id)
            | CaptureTarget::App(id) => id,
        }
    }

    pub fn source_kind(&self) -> SourceKind {
        match self {
            CaptureTarget::Microphone(_) => SourceKind::Microphone,
            CaptureTarget::Camera(_) => SourceKind::Camera,
            CaptureTarget::Display(_) | CaptureTarget::Window(_) | CaptureTarget::App(_) => {
                SourceKind::Screen
            }
        }
    }
}

impl fmt::Display for CaptureTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.flag(), self.id())
    }
}

/// Full helper invocation for one capture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperArgs {
    pub target: CaptureTarget,
    pub video: Option<VideoSourceConfig>,
    /// Capture system audio alongside the screen
    pub audio: bool,
    /// Ask the helper for H.264 instead of raw frames
    pub encode: bool,
    pub noise_suppression: bool,
    pub echo_cancellation: bool,
    pub exclude_apps: Vec<String>,
}

impl HelperArgs {
    pub fn camera(id: impl Into<String>, config: &VideoSourceConfig) -> Self {
        Self {
            target: CaptureTarget::Camera(id.into()),
            video: Some(config.clone()),
            audio: false,
            encode: true,
            noise_suppression: false,
            echo_cancellation: false,
            exclude_apps: Vec::new(),
        }
    }

    /// Screen capture; `target` must be a display, window or app
    pub fn screen(target: CaptureTarget, config: &ScreenSourceConfig) -> Result<Self> {
        if target.source_kind() != SourceKind::Screen {
            return Err(AppError::Config(format!("{} is not a screen target", target)));
        }
        Ok(Self {
            target,
            video: Some(config.video()),
            audio: config.capture_audio,
            encode: true,
            noise_suppression: false,
            echo_cancellation: false,
            exclude_apps: config.exclude_apps.clone(),
        })
    }

    pub fn microphone(id: impl Into<String>, config: &MicrophoneConfig) -> Self {
        Self {
            target: CaptureTarget::Microphone(id.into()),
            video: None,
            audio: false,
            encode: false,
            noise_suppression: config.noise_suppression,
            echo_cancellation: config.echo_cancellation,
            exclude_apps: Vec::new(),
        }
    }

    /// Reject parameters the helper would refuse
    pub fn validate(&self) -> Result<()> {
        if self.target.id().is_empty() {
            return Err(AppError::Config(format!(
                "Empty source id for {}",
                self.target.flag()
            )));
        }
        if let Some(video) = &self.video {
            if !(1..=MAX_DIMENSION).contains(&video.width)
                || !(1..=MAX_DIMENSION).contains(&video.height)
            {
                return Err(AppError::Config(format!(
                    "Invalid resolution {}x{} (must be 1-{})",
                    video.width, video.height, MAX_DIMENSION
                )));
            }
            if !(1..=MAX_FPS).contains(&video.fps) {
                return Err(AppError::Config(format!(
                    "Invalid fps {} (must be 1-{})",
                    video.fps, MAX_FPS
                )));
            }
            if !(1..=MAX_BITRATE_MBPS).contains(&video.bitrate_mbps) {
                return Err(AppError::Config(format!(
                    "Invalid bitrate {} Mbps (must be 1-{})",
                    video.bitrate_mbps, MAX_BITRATE_MBPS
                )));
            }
        }
        Ok(())
    }

    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![self.target.flag().to_string(), self.target.id().to_string()];

        if let Some(video) = &self.video {
            args.extend([
                "--width".to_string(),
                video.width.to_string(),
                "--height".to_string(),
                video.height.to_string(),
                "--fps".to_string(),
                video.fps.to_string(),
                "--bitrate".to_string(),
                video.bitrate_mbps.to_string(),
            ]);
        }
        if self.audio {
            args.push("--audio".to_string());
        }
        if self.encode {
            args.push("--encode".to_string());
        }
        if self.target.source_kind() == SourceKind::Microphone {
            if !self.noise_suppression {
                args.push("--no-noise-suppression".to_string());
            }
            if !self.echo_cancellation {
                args.push("--no-echo-cancellation".to_string());
            }
        }
        for app in &self.exclude_apps {
            args.push("--exclude-app".to_string());
            args.push(app.clone());
        }
        args
    }
}

/// Arguments for the helper's source listing mode
pub fn list_args(microphones_only: bool) -> Vec<String> {
    let mut args = vec!["list".to_string(), "--json".to_string()];
    if microphones_only {
        args.push("--microphones-only".to_string());
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_camera_args() {
        let args = HelperArgs::camera("/dev/video0", &VideoSourceConfig::default());
        assert_eq!(
            args.to_args(),
            vec![
                "--camera", "/dev/video0", "--width", "640", "--height", "480", "--fps", "15",
                "--bitrate", "2", "--encode",
            ]
        );
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_screen_args() {
        let config = ScreenSourceConfig {
            exclude_apps: vec!["com.example.chat".to_string()],
            ..Default::default()
        };
        let args = HelperArgs::screen(CaptureTarget::Window("0x3a00007".into()), &config).unwrap();
        let argv = args.to_args();
        assert_eq!(&argv[..2], ["--window", "0x3a00007"]);
        assert!(argv.contains(&"1920".to_string()));
        assert!(argv.contains(&"--audio".to_string()));
        assert_eq!(&argv[argv.len() - 2..], ["--exclude-app", "com.example.chat"]);

        assert!(HelperArgs::screen(CaptureTarget::Camera("0".into()), &config).is_err());
    }

    #[test]
    fn test_microphone_args() {
        let config = MicrophoneConfig {
            noise_suppression: false,
            ..Default::default()
        };
        let args = HelperArgs::microphone("mic-1", &config);
        assert_eq!(
            args.to_args(),
            vec!["--microphone", "mic-1", "--no-noise-suppression"]
        );
        assert_eq!(args.target.source_kind(), SourceKind::Microphone);
    }

    #[test]
    fn test_validation_bounds() {
        let mut video = VideoSourceConfig::default();
        video.fps = 121;
        assert!(HelperArgs::camera("0", &video).validate().is_err());
        video.fps = 30;
        video.width = 5000;
        assert!(HelperArgs::camera("0", &video).validate().is_err());
        video.width = 1280;
        video.bitrate_mbps = 0;
        assert!(HelperArgs::camera("0", &video).validate().is_err());
        assert!(HelperArgs::camera("", &VideoSourceConfig::default()).validate().is_err());
    }

    #[test]
    fn test_list_args() {
        assert_eq!(list_args(false), vec!["list", "--json"]);
        assert_eq!(list_args(true), vec!["list", "--json", "--microphones-only"]);
    }
}
