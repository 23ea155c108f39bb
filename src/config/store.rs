use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::EngineConfig;
use crate::error::{AppError, Result};

/// Read-only configuration loaded from a TOML file
#[derive(Clone)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    config: Arc<EngineConfig>,
}

impl ConfigStore {
    /// Load configuration from `path`, or use defaults when no path is given
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::from_config(EngineConfig::default()));
        };

        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            AppError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::parse(&text)?;

        tracing::info!("Loaded configuration from {}", path.display());
        Ok(Self {
            path: Some(path.to_path_buf()),
            config: Arc::new(config),
        })
    }

    /// Parse a TOML document; missing sections take their defaults
    pub fn parse(text: &str) -> Result<EngineConfig> {
        let config: EngineConfig = toml::from_str(text)
            .map_err(|e| AppError::Config(format!("Invalid configuration: {}", e)))?;
        Self::validate(&config)?;
        Ok(config)
    }

    pub fn from_config(config: EngineConfig) -> Self {
        Self {
            path: None,
            config: Arc::new(config),
        }
    }

    /// Current configuration
    pub fn get(&self) -> Arc<EngineConfig> {
        self.config.clone()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn validate(config: &EngineConfig) -> Result<()> {
        let relay = &config.relay;
        // FU-A needs two header bytes plus at least one byte of data
        if relay.max_payload_size < 3 {
            return Err(AppError::Config(format!(
                "relay.max_payload_size must be at least 3, got {}",
                relay.max_payload_size
            )));
        }

        let pts = relay.payload_types;
        let all = [pts.camera_video, pts.screen_video, pts.mic_audio, pts.screen_audio];
        for (i, pt) in all.iter().enumerate() {
            if *pt > 127 {
                return Err(AppError::Config(format!("Payload type {} out of range", pt)));
            }
            if all[i + 1..].contains(pt) {
                return Err(AppError::Config(format!(
                    "Payload type {} assigned to more than one stream",
                    pt
                )));
            }
        }

        let cond = &config.audio.conditioner;
        if cond.min_gain <= 0.0 || cond.min_gain > cond.max_gain {
            return Err(AppError::Config(format!(
                "Invalid AGC gain range [{}, {}]",
                cond.min_gain, cond.max_gain
            )));
        }

        for video in [config.capture.camera.clone(), config.capture.screen.video()] {
            if video.fps == 0 || video.width == 0 || video.height == 0 {
                return Err(AppError::Config(
                    "Video sources need non-zero size and frame rate".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MicrophoneBackend;
    use std::io::Write;

    #[tokio::test]
    async fn test_defaults_without_file() {
        let store = ConfigStore::load(None).await.unwrap();
        let config = store.get();
        assert_eq!(config.capture.helper_path, "confab-capture");
        assert_eq!(config.capture.camera.fps, 15);
        assert_eq!(config.capture.screen.width, 1920);
        assert_eq!(config.relay.payload_types.mic_audio, 111);
        assert!(store.path().is_none());
    }

    #[tokio::test]
    async fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[capture]
helper_path = "/opt/confab/capture"

[capture.microphone]
backend = "alsa"
device = "hw:1"

[capture.screen]
fps = 60
capture_audio = false

[relay]
max_payload_size = 1400
"#
        )
        .unwrap();

        let store = ConfigStore::load(Some(file.path())).await.unwrap();
        let config = store.get();
        assert_eq!(config.capture.helper_path, "/opt/confab/capture");
        assert_eq!(config.capture.microphone.backend, MicrophoneBackend::Alsa);
        assert_eq!(config.capture.microphone.device, "hw:1");
        assert_eq!(config.capture.screen.fps, 60);
        assert_eq!(config.capture.screen.width, 1920);
        assert!(!config.capture.screen.capture_audio);
        assert_eq!(config.relay.max_payload_size, 1400);
        assert_eq!(config.audio.conditioner.target_rms, 3000.0);
    }

    #[test]
    fn test_duplicate_payload_type_rejected() {
        let err = ConfigStore::parse(
            r#"
[relay.payload_types]
camera_video = 111
"#,
        )
        .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[tokio::test]
    async fn test_missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = ConfigStore::load(Some(&dir.path().join("absent.toml"))).await;
        assert!(matches!(result, Err(AppError::Config(_))));
    }
}
