//! Screen, window and application capture through the helper
//!
//! Video arrives on stdout like the camera. With `capture_audio` enabled the
//! helper also interleaves system audio packets into stderr, which are sent
//! unconditioned on the screen-audio stream.

use std::sync::Arc;

use tracing::debug;

use super::args::{CaptureTarget, HelperArgs};
use super::channel::ChannelStats;
use super::helper_io::{pump_channel, pump_video, VideoPumpStats};
use super::pipeline::{AudioPipelineStats, AudioSendPipeline};
use super::session::{CaptureState, SourceKind};
use super::source::HelperSource;
use super::MediaSink;
use crate::config::{CaptureConfig, OpusSettings, ScreenSourceConfig};
use crate::error::Result;
use crate::events::EventBus;
use crate::webrtc::stream::StreamKind;

pub struct ScreenSource {
    helper: HelperSource,
    config: ScreenSourceConfig,
    opus: OpusSettings,
    sink: Arc<dyn MediaSink>,
    video_stats: Arc<VideoPumpStats>,
    audio_stats: Arc<AudioPipelineStats>,
    channel_stats: Arc<ChannelStats>,
}

impl ScreenSource {
    pub fn new(
        config: &CaptureConfig,
        opus: &OpusSettings,
        sink: Arc<dyn MediaSink>,
        events: Option<Arc<EventBus>>,
    ) -> Self {
        Self {
            helper: HelperSource::new(SourceKind::Screen, config, events),
            config: config.screen.clone(),
            opus: opus.clone(),
            sink,
            video_stats: Arc::new(VideoPumpStats::default()),
            audio_stats: Arc::new(AudioPipelineStats::default()),
            channel_stats: Arc::new(ChannelStats::default()),
        }
    }

    /// Share a display, window or application
    pub async fn start(&self, target: CaptureTarget) -> Result<()> {
        let args = HelperArgs::screen(target, &self.config)?;
        let mut pipeline = if args.audio {
            Some(AudioSendPipeline::screen_audio(
                &self.opus,
                self.sink.clone(),
                self.audio_stats.clone(),
            )?)
        } else {
            None
        };
        self.sink.set_frame_rate(StreamKind::ScreenVideo, self.config.fps);

        let sink = self.sink.clone();
        let video_stats = self.video_stats.clone();
        let channel_stats = self.channel_stats.clone();
        self.helper
            .start(
                &args,
                move |stdout, cancel| {
                    pump_video(stdout, StreamKind::ScreenVideo, &*sink, &video_stats, &cancel)
                },
                move |stderr, cancel| {
                    pump_channel(stderr, SourceKind::Screen, channel_stats, &cancel, |packet| {
                        match pipeline.as_mut() {
                            Some(pipeline) => pipeline.push_packet(&packet),
                            None => debug!("Dropping screen audio packet, audio capture disabled"),
                        }
                    })
                },
            )
            .await
    }

    pub async fn stop(&self) {
        self.helper.stop().await;
    }

    pub async fn wait(&self) {
        self.helper.wait().await;
    }

    pub fn state(&self) -> CaptureState {
        self.helper.state()
    }

    pub fn video_stats(&self) -> &VideoPumpStats {
        &self.video_stats
    }

    pub fn audio_stats(&self) -> &AudioPipelineStats {
        &self.audio_stats
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

    /// Shell printf command emitting `bytes` on stderr
    fn printf_stderr(bytes: &[u8]) -> String {
        let escaped: String = bytes.iter().map(|b| format!("\\{:03o}", b)).collect();
        format!("printf '{}' >&2\n", escaped)
    }

    #[tokio::test]
    async fn test_screen_audio_sent_on_screen_audio_stream() {
        let mut aux = encode::legacy_audio(960, 0, &vec![0u8; 960 * 4]);
        aux.extend(encode::log(2, "slow frame"));

        let dir = tempfile::tempdir().unwrap();
        let helper = fake_helper(
            dir.path(),
            &format!(
                "[ \"$1\" = \"--display\" ] || exit 9\nprintf '\\000\\000\\000\\002\\145\\210'\n{}",
                printf_stderr(&aux)
            ),
        );
        let config = CaptureConfig {
            helper_path: helper.to_string_lossy().into_owned(),
            ..Default::default()
        };
        let sink = Arc::new(CollectingMediaSink::default());
        let screen = ScreenSource::new(&config, &OpusSettings::default(), sink.clone(), None);

        screen.start(CaptureTarget::Display("0".into())).await.unwrap();
        screen.wait().await;
        screen.stop().await;

        assert_eq!(screen.state(), CaptureState::Stopped);
        assert_eq!(screen.video_stats().units(), 1);
        assert_eq!(screen.audio_stats().frames_sent(), 1);
        assert_eq!(sink.audio.lock()[0].0, StreamKind::ScreenAudio);
        assert_eq!(sink.units.lock()[0].0, StreamKind::ScreenVideo);
        assert_eq!(*sink.frame_rates.lock(), vec![(StreamKind::ScreenVideo, 30)]);
    }

    #[tokio::test]
    async fn test_rejects_camera_target() {
        let screen = ScreenSource::new(
            &CaptureConfig::default(),
            &OpusSettings::default(),
            Arc::new(CollectingMediaSink::default()),
            None,
        );
        assert!(screen.start(CaptureTarget::Camera("0".into())).await.is_err());
        assert_eq!(screen.state(), CaptureState::Idle);
    }
}
