//! Microphone capture
//!
//! Audio comes either from the helper (`--microphone <id>`, packets on
//! stderr) or from a local ALSA device. Both feed the conditioned send path
//! and drive the speaking indicator.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alsa::Direction;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::args::HelperArgs;
use super::channel::ChannelStats;
use super::helper_io::pump_channel;
use super::pipeline::{AudioPipelineStats, AudioSendPipeline, InputGain};
use super::session::{CaptureState, SourceKind};
use super::source::HelperSource;
use super::MediaSink;
use crate::audio::device::{capture_loop, open_pcm};
use crate::audio::SpeakingDetector;
use crate::config::{AudioConfig, CaptureConfig, MicrophoneBackend, MicrophoneConfig};
use crate::error::{AppError, Result};
use crate::events::EventBus;

struct DeviceCapture {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub struct MicrophoneSource {
    helper: HelperSource,
    config: MicrophoneConfig,
    audio: AudioConfig,
    sink: Arc<dyn MediaSink>,
    speaking: SpeakingDetector,
    gain: InputGain,
    stats: Arc<AudioPipelineStats>,
    channel_stats: Arc<ChannelStats>,
    device: tokio::sync::Mutex<Option<DeviceCapture>>,
    timer: Mutex<Option<CancellationToken>>,
}

impl MicrophoneSource {
    pub fn new(
        capture: &CaptureConfig,
        audio: &AudioConfig,
        sink: Arc<dyn MediaSink>,
        events: Option<Arc<EventBus>>,
    ) -> Self {
        let debounce = Duration::from_millis(audio.conditioner.speaking_debounce_ms);
        let speaking = match &events {
            Some(events) => SpeakingDetector::with_events(debounce, events.clone()),
            None => SpeakingDetector::new(debounce),
        };
        Self {
            helper: HelperSource::new(SourceKind::Microphone, capture, events),
            config: capture.microphone.clone(),
            audio: audio.clone(),
            sink,
            speaking,
            gain: InputGain::default(),
            stats: Arc::new(AudioPipelineStats::default()),
            channel_stats: Arc::new(ChannelStats::default()),
            device: tokio::sync::Mutex::new(None),
            timer: Mutex::new(None),
        }
    }

    /// Start capturing from `id`
    ///
    /// With the ALSA backend `id` is an ALSA device name; empty selects the
    /// configured device.
    pub async fn start(&self, id: &str) -> Result<()> {
        let pipeline = AudioSendPipeline::microphone(
            &self.audio.conditioner,
            &self.audio.opus,
            self.speaking.clone(),
            self.gain.clone(),
            self.sink.clone(),
            self.stats.clone(),
        )?;

        match self.config.backend {
            MicrophoneBackend::Helper => self.start_helper(id, pipeline).await?,
            MicrophoneBackend::Alsa => {
                let device = if id.is_empty() { self.config.device.as_str() } else { id };
                self.start_device(device, pipeline).await?
            }
        }
        self.start_timer();
        Ok(())
    }

    async fn start_helper(&self, id: &str, mut pipeline: AudioSendPipeline) -> Result<()> {
        let args = HelperArgs::microphone(id, &self.config);
        let channel_stats = self.channel_stats.clone();
        self.helper
            .start(
                &args,
                |mut stdout, _| {
                    // Unused for audio-only capture; keep the pipe from filling
                    let _ = io::copy(&mut stdout, &mut io::sink());
                },
                move |stderr, cancel| {
                    pump_channel(stderr, SourceKind::Microphone, channel_stats, &cancel, |packet| {
                        pipeline.push_packet(&packet)
                    })
                },
            )
            .await
    }

    async fn start_device(&self, device: &str, mut pipeline: AudioSendPipeline) -> Result<()> {
        let mut guard = self.device.lock().await;
        if guard.as_ref().map(|c| !c.handle.is_finished()).unwrap_or(false) {
            return Err(AppError::InvalidState(
                "microphone capture already running".to_string(),
            ));
        }

        let status = self.helper.status().clone();
        status.set(CaptureState::Starting, None);

        let name = device.to_string();
        let opened = tokio::task::spawn_blocking(move || open_pcm(&name, Direction::Capture))
            .await
            .map_err(|e| AppError::Internal(format!("Device open task failed: {}", e)))
            .and_then(|r| r);
        let opened = match opened {
            Ok(opened) => opened,
            Err(e) => {
                let err = AppError::capture_unavailable(SourceKind::Microphone, e.to_string());
                status.set(CaptureState::Unavailable, Some(err.to_string()));
                return Err(err);
            }
        };

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let loop_status = status.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let result = capture_loop(&opened, &stop_flag, |rate, channels, samples| {
                pipeline.push_i16(rate, channels, samples)
            });
            match result {
                Ok(()) => loop_status.set(CaptureState::Stopped, None),
                Err(e) => {
                    warn!("Microphone capture failed: {}", e);
                    loop_status.set(CaptureState::Stopped, Some(e.to_string()));
                }
            }
        });

        status.advance(CaptureState::Starting, CaptureState::Running);
        info!("Microphone capture started on ALSA device {}", device);
        *guard = Some(DeviceCapture { stop, handle });
        Ok(())
    }

    fn start_timer(&self) {
        let mut timer = self.timer.lock();
        if timer.is_none() {
            let cancel = CancellationToken::new();
            self.speaking.spawn_timer(cancel.clone());
            *timer = Some(cancel);
        }
    }

    pub async fn stop(&self) {
        self.helper.stop().await;

        let device = self.device.lock().await.take();
        if let Some(capture) = device {
            capture.stop.store(true, Ordering::SeqCst);
            let _ = capture.handle.await;
        }

        if let Some(cancel) = self.timer.lock().take() {
            cancel.cancel();
        }
        // Nothing can be heard once capture is gone
        self.speaking.reset();
    }

    pub async fn wait(&self) {
        self.helper.wait().await;
    }

    pub fn state(&self) -> CaptureState {
        self.helper.state()
    }

    /// Input volume, clamped to [0, 3] by the conditioner
    pub fn set_input_gain(&self, gain: f32) {
        self.gain.set(gain);
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking.is_speaking()
    }

    pub fn stats(&self) -> &AudioPipelineStats {
        &self.stats
    }

    pub fn skipped_bytes(&self) -> u64 {
        self.channel_stats.skipped_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::channel::encode;
    use crate::capture::tests::{fake_helper, CollectingMediaSink};
    use crate::webrtc::stream::StreamKind;

    #[tokio::test]
    async fn test_helper_microphone_sends_conditioned_audio() {
        // 40ms of a loud square wave as one legacy packet
        let samples: Vec<u8> = (0..1920u32)
            .flat_map(|i| {
                let v: i16 = if (i / 24) % 2 == 0 { 9000 } else { -9000 };
                let b = v.to_le_bytes();
                [b[0], b[1], b[0], b[1]]
            })
            .collect();
        let packet = encode::legacy_audio(1920, 0, &samples);
        let escaped: String = packet.iter().map(|b| format!("\\{:03o}", b)).collect();

        let dir = tempfile::tempdir().unwrap();
        let helper = fake_helper(
            dir.path(),
            &format!(
                "[ \"$1 $2\" = \"--microphone mic-7\" ] || exit 9\necho ignored\nprintf '{}' >&2\n",
                escaped
            ),
        );
        let capture = CaptureConfig {
            helper_path: helper.to_string_lossy().into_owned(),
            ..Default::default()
        };
        let sink = Arc::new(CollectingMediaSink::default());
        let mic = MicrophoneSource::new(&capture, &AudioConfig::default(), sink.clone(), None);

        mic.start("mic-7").await.unwrap();
        mic.wait().await;
        assert!(mic.is_speaking());
        mic.stop().await;

        assert_eq!(mic.state(), CaptureState::Stopped);
        assert_eq!(mic.stats().frames_sent(), 2);
        assert!(sink.audio.lock().iter().all(|(k, _)| *k == StreamKind::MicAudio));
        assert!(!mic.is_speaking());
    }

    #[tokio::test]
    async fn test_alsa_backend_missing_device() {
        let capture = CaptureConfig {
            microphone: MicrophoneConfig {
                backend: MicrophoneBackend::Alsa,
                device: "confab_no_such_device".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        let mic = MicrophoneSource::new(
            &capture,
            &AudioConfig::default(),
            Arc::new(CollectingMediaSink::default()),
            None,
        );
        let err = mic.start("").await.unwrap_err();
        assert!(matches!(err, AppError::CaptureUnavailable { .. }));
        assert_eq!(mic.state(), CaptureState::Unavailable);
    }
}
