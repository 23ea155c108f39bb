//! Camera capture through the helper

use std::sync::Arc;

use super::args::HelperArgs;
use super::channel::ChannelStats;
use super::helper_io::{pump_channel, pump_video, VideoPumpStats};
use super::session::{CaptureState, SourceKind};
use super::source::HelperSource;
use super::MediaSink;
use crate::config::{CaptureConfig, VideoSourceConfig};
use crate::error::Result;
use crate::events::EventBus;
use crate::webrtc::stream::StreamKind;

pub struct CameraSource {
    helper: HelperSource,
    config: VideoSourceConfig,
    sink: Arc<dyn MediaSink>,
    video_stats: Arc<VideoPumpStats>,
    channel_stats: Arc<ChannelStats>,
}

impl CameraSource {
    pub fn new(config: &CaptureConfig, sink: Arc<dyn MediaSink>, events: Option<Arc<EventBus>>) -> Self {
        Self {
            helper: HelperSource::new(SourceKind::Camera, config, events),
            config: config.camera.clone(),
            sink,
            video_stats: Arc::new(VideoPumpStats::default()),
            channel_stats: Arc::new(ChannelStats::default()),
        }
    }

    pub async fn start(&self, camera_id: &str) -> Result<()> {
        let args = HelperArgs::camera(camera_id, &self.config);
        self.sink.set_frame_rate(StreamKind::CameraVideo, self.config.fps);

        let sink = self.sink.clone();
        let video_stats = self.video_stats.clone();
        let channel_stats = self.channel_stats.clone();
        self.helper
            .start(
                &args,
                move |stdout, cancel| {
                    pump_video(stdout, StreamKind::CameraVideo, &*sink, &video_stats, &cancel)
                },
                move |stderr, cancel| {
                    pump_channel(stderr, SourceKind::Camera, channel_stats, &cancel, |_| {})
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

    /// Bytes of helper diagnostics output that were not valid packets
    pub fn skipped_bytes(&self) -> u64 {
        self.channel_stats.skipped_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::tests::{fake_helper, CollectingMediaSink};
    use crate::events::MediaEvent;

    // SPS, PPS, IDR then one P slice, each with a 4-byte length prefix
    const H264_STREAM: &str = r"printf '\000\000\000\004\147\102\000\037\000\000\000\004\150\316\074\200\000\000\000\004\145\210\204\000\000\000\000\003\101\232\002'";

    #[tokio::test]
    async fn test_camera_helper_exit_reported_once() {
        let dir = tempfile::tempdir().unwrap();
        let helper = fake_helper(
            dir.path(),
            &format!(
                "[ \"$1\" = \"--camera\" ] || exit 9\n{}\nprintf 'MLOG\\005\\000\\000\\000\\001hello' >&2\n",
                H264_STREAM
            ),
        );
        let config = CaptureConfig {
            helper_path: helper.to_string_lossy().into_owned(),
            ..Default::default()
        };
        let sink = Arc::new(CollectingMediaSink::default());
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe();
        let camera = CameraSource::new(&config, sink.clone(), Some(bus));

        camera.start("/dev/video0").await.unwrap();
        camera.wait().await;
        camera.stop().await;

        assert_eq!(camera.state(), CaptureState::Stopped);
        assert_eq!(camera.video_stats().units(), 2);
        assert_eq!(camera.video_stats().keyframes(), 1);
        assert_eq!(camera.skipped_bytes(), 0);
        assert_eq!(sink.units.lock().len(), 2);
        assert_eq!(*sink.frame_rates.lock(), vec![(StreamKind::CameraVideo, 15)]);

        let mut stopped = 0;
        while let Ok(event) = rx.try_recv() {
            if let MediaEvent::CaptureStateChanged { state: CaptureState::Stopped, reason, .. } = event {
                assert!(reason.is_some());
                stopped += 1;
            }
        }
        assert_eq!(stopped, 1);
    }

    #[tokio::test]
    async fn test_camera_stop_and_restart() {
        let dir = tempfile::tempdir().unwrap();
        let helper = fake_helper(dir.path(), "exec sleep 30\n");
        let config = CaptureConfig {
            helper_path: helper.to_string_lossy().into_owned(),
            ..Default::default()
        };
        let camera = CameraSource::new(&config, Arc::new(CollectingMediaSink::default()), None);

        camera.start("0").await.unwrap();
        assert_eq!(camera.state(), CaptureState::Running);
        assert!(camera.start("0").await.is_err());

        camera.stop().await;
        assert_eq!(camera.state(), CaptureState::Stopped);

        camera.start("0").await.unwrap();
        assert_eq!(camera.state(), CaptureState::Running);
        camera.stop().await;
    }
}
