//! Media engine
//!
//! Owns one relay session and everything attached to it: the three capture
//! sources send through the session's multiplexer, and inbound media flows
//! from the session's demultiplexer into Opus decoding, the playback mixer and
//! an optional video callback.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::audio::{AudioPlayback, DecoderBank, PlaybackMixer};
use crate::capture::{
    CameraSource, CaptureState, CaptureTarget, MediaSink, MicrophoneSource, ScreenSource, SourceKind,
};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::events::EventBus;
use crate::utils::LogThrottler;
use crate::warn_throttled;
use crate::webrtc::identity::{ParticipantId, StreamIdentityTable};
use crate::webrtc::multiplexer::{InboundAudio, InboundVideo, MediaHandler};
use crate::webrtc::session::{RelaySession, SessionState};
use crate::webrtc::signaling::{ClientMessage, RelayMessage};
use crate::webrtc::stream::StreamKind;

/// Consumer of reassembled remote video
pub type VideoCallback = Arc<dyn Fn(InboundVideo) + Send + Sync>;

/// Receive-side statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiveStats {
    pub video_frames: u64,
    pub audio_frames: u64,
    pub decode_errors: u64,
    /// Screen audio frames skipped before decoding
    pub screen_audio_skipped: u64,
}

/// Inbound media handler: decode, mix, forward video
struct InboundMedia {
    identities: Arc<StreamIdentityTable>,
    decoders: Mutex<DecoderBank>,
    mixer: Arc<PlaybackMixer>,
    on_video: RwLock<Option<VideoCallback>>,
    video_frames: AtomicU64,
    audio_frames: AtomicU64,
    decode_errors: AtomicU64,
    screen_audio_skipped: AtomicU64,
    throttler: LogThrottler,
}

impl InboundMedia {
    fn new(identities: Arc<StreamIdentityTable>, mixer: Arc<PlaybackMixer>) -> Self {
        Self {
            identities,
            decoders: Mutex::new(DecoderBank::new()),
            mixer,
            on_video: RwLock::new(None),
            video_frames: AtomicU64::new(0),
            audio_frames: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            screen_audio_skipped: AtomicU64::new(0),
            throttler: LogThrottler::default(),
        }
    }

    fn stats(&self) -> ReceiveStats {
        ReceiveStats {
            video_frames: self.video_frames.load(Ordering::Relaxed),
            audio_frames: self.audio_frames.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            screen_audio_skipped: self.screen_audio_skipped.load(Ordering::Relaxed),
        }
    }
}

impl MediaHandler for InboundMedia {
    fn on_video(&self, frame: InboundVideo) {
        self.video_frames.fetch_add(1, Ordering::Relaxed);
        let callback = self.on_video.read().clone();
        match callback {
            Some(callback) => callback(frame),
            None => debug!(
                "Remote {} frame from {} ({} bytes), no video consumer",
                frame.kind,
                frame.identity,
                frame.unit.payload_len()
            ),
        }
    }

    fn on_audio(&self, frame: InboundAudio) {
        // The mixer would discard it anyway; skip the decode
        if frame.kind == StreamKind::ScreenAudio && !self.identities.is_screen_selected(&frame.identity) {
            self.screen_audio_skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let decoded = self
            .decoders
            .lock()
            .decode(frame.ssrc, frame.sequence, &frame.payload);
        match decoded {
            Ok(pcm) => {
                self.audio_frames.fetch_add(1, Ordering::Relaxed);
                self.mixer.push(frame.ssrc, frame.kind, &frame.identity, &pcm);
            }
            Err(e) => {
                self.decode_errors.fetch_add(1, Ordering::Relaxed);
                warn_throttled!(
                    self.throttler,
                    &format!("decode-{}", frame.ssrc),
                    "Opus decode failed for ssrc {}: {}",
                    frame.ssrc,
                    e
                );
            }
        }
    }

    fn on_stream_ended(&self, ssrc: u32) {
        self.decoders.lock().remove(ssrc);
        self.mixer.remove_stream(ssrc);
        debug!("Dropped receive state for ended ssrc {}", ssrc);
    }
}

/// Everything one participant needs for a call
pub struct MediaEngine {
    events: Arc<EventBus>,
    identities: Arc<StreamIdentityTable>,
    session: RelaySession,
    inbound: Arc<InboundMedia>,
    mixer: Arc<PlaybackMixer>,
    playback: AudioPlayback,
    camera: CameraSource,
    screen: ScreenSource,
    microphone: MicrophoneSource,
}

impl MediaEngine {
    /// Build the engine. No helper is spawned and no audio device is opened
    /// until the corresponding start call.
    pub async fn new(config: &EngineConfig, events: Arc<EventBus>) -> Result<Self> {
        let identities = Arc::new(StreamIdentityTable::with_events(events.clone()));
        let mixer = Arc::new(PlaybackMixer::new(
            identities.clone(),
            config.audio.mixer_max_buffer_ms,
        ));
        let inbound = Arc::new(InboundMedia::new(identities.clone(), mixer.clone()));

        let session = RelaySession::new(
            &config.relay,
            identities.clone(),
            inbound.clone(),
            events.clone(),
        )
        .await?;

        let sink: Arc<dyn MediaSink> = session.multiplexer().clone();
        let camera = CameraSource::new(&config.capture, sink.clone(), Some(events.clone()));
        let screen = ScreenSource::new(
            &config.capture,
            &config.audio.opus,
            sink.clone(),
            Some(events.clone()),
        );
        let microphone =
            MicrophoneSource::new(&config.capture, &config.audio, sink, Some(events.clone()));

        let playback = AudioPlayback::new(config.audio.playback_device.clone(), mixer.clone());

        info!("Media engine created");
        Ok(Self {
            events,
            identities,
            session,
            inbound,
            mixer,
            playback,
            camera,
            screen,
            microphone,
        })
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn session(&self) -> &RelaySession {
        &self.session
    }

    pub fn relay_state(&self) -> SessionState {
        self.session.state()
    }

    /// Feed one relay signaling message; returns the reply to send back
    pub async fn handle_relay_message(&self, message: RelayMessage) -> Result<Option<ClientMessage>> {
        self.session.handle_relay_message(message).await
    }

    /// Deliver remote video frames to `callback` instead of dropping them
    pub fn set_video_callback(&self, callback: VideoCallback) {
        *self.inbound.on_video.write() = Some(callback);
    }

    pub fn clear_video_callback(&self) {
        *self.inbound.on_video.write() = None;
    }

    pub async fn start_camera(&self, camera_id: &str) -> Result<()> {
        self.camera.start(camera_id).await
    }

    pub async fn stop_camera(&self) {
        self.camera.stop().await;
    }

    pub async fn start_screen(&self, target: CaptureTarget) -> Result<()> {
        self.screen.start(target).await
    }

    pub async fn stop_screen(&self) {
        self.screen.stop().await;
    }

    pub async fn start_microphone(&self, id: &str) -> Result<()> {
        self.microphone.start(id).await
    }

    pub async fn stop_microphone(&self) {
        self.microphone.stop().await;
    }

    pub fn capture_state(&self, kind: SourceKind) -> CaptureState {
        match kind {
            SourceKind::Camera => self.camera.state(),
            SourceKind::Screen => self.screen.state(),
            SourceKind::Microphone => self.microphone.state(),
        }
    }

    pub fn camera(&self) -> &CameraSource {
        &self.camera
    }

    pub fn screen(&self) -> &ScreenSource {
        &self.screen
    }

    pub fn microphone(&self) -> &MicrophoneSource {
        &self.microphone
    }

    pub fn set_input_gain(&self, gain: f32) {
        self.microphone.set_input_gain(gain);
    }

    pub fn is_speaking(&self) -> bool {
        self.microphone.is_speaking()
    }

    /// Set a remote participant's playback volume; returns the clamped value
    pub fn set_volume(&self, participant: ParticipantId, gain: f32) -> f32 {
        self.mixer.set_volume(participant, gain)
    }

    pub fn volume(&self, participant: &ParticipantId) -> f32 {
        self.mixer.volume(participant)
    }

    /// Watch `participant`'s screen share, or nobody's
    pub fn select_screen(&self, participant: Option<ParticipantId>) {
        self.identities.select_screen(participant);
    }

    pub fn selected_screen(&self) -> Option<ParticipantId> {
        self.identities.selected_screen()
    }

    pub fn mixer(&self) -> &Arc<PlaybackMixer> {
        &self.mixer
    }

    pub fn receive_stats(&self) -> ReceiveStats {
        self.inbound.stats()
    }

    /// Start local playback of the mixed remote audio
    pub fn start_playback(&self) {
        self.playback.start();
    }

    pub async fn stop_playback(&self) {
        self.playback.stop().await;
    }

    /// Stop capture, close the relay session, then stop playback
    pub async fn shutdown(&self) {
        info!("Shutting down media engine");
        tokio::join!(self.camera.stop(), self.screen.stop(), self.microphone.stop());

        if self.session.state() != SessionState::Closed {
            if let Err(e) = self.session.close().await {
                warn!("Failed to close relay session: {}", e);
            }
        }

        self.playback.stop().await;
        info!("Media engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{OpusApplication, OpusEncoder};
    use crate::config::OpusSettings;
    use crate::video::nal::AccessUnit;
    use crate::webrtc::identity::{Identity, SsrcMapping};
    use bytes::Bytes;

    fn silence_frame(encoder: &mut OpusEncoder) -> Bytes {
        encoder.encode(&[0i16; 1920]).unwrap()
    }

    fn audio(ssrc: u32, kind: StreamKind, identity: Identity, sequence: u16, payload: Bytes) -> InboundAudio {
        InboundAudio {
            ssrc,
            kind,
            identity,
            timestamp: sequence as u32 * 960,
            sequence,
            payload,
        }
    }

    #[test]
    fn test_inbound_audio_decoded_into_mixer() {
        let identities = Arc::new(StreamIdentityTable::new());
        let mixer = Arc::new(PlaybackMixer::new(identities.clone(), 200));
        let inbound = InboundMedia::new(identities, mixer.clone());
        let mut encoder = OpusEncoder::new(&OpusSettings::default(), OpusApplication::Voip).unwrap();

        let payload = silence_frame(&mut encoder);
        inbound.on_audio(audio(5, StreamKind::MicAudio, Identity::Unknown, 1, payload));

        assert_eq!(inbound.stats().audio_frames, 1);
        assert_eq!(mixer.queued_samples(5), 1920);
    }

    #[test]
    fn test_unselected_screen_audio_not_decoded() {
        let identities = Arc::new(StreamIdentityTable::new());
        identities.apply(SsrcMapping {
            ssrc: 9,
            participant: ParticipantId::new("ana"),
            kind: None,
        });
        let mixer = Arc::new(PlaybackMixer::new(identities.clone(), 200));
        let inbound = InboundMedia::new(identities.clone(), mixer.clone());
        let mut encoder = OpusEncoder::new(&OpusSettings::default(), OpusApplication::Audio).unwrap();
        let ana = Identity::Known(ParticipantId::new("ana"));

        inbound.on_audio(audio(9, StreamKind::ScreenAudio, ana.clone(), 1, silence_frame(&mut encoder)));
        assert_eq!(inbound.stats().screen_audio_skipped, 1);
        assert_eq!(mixer.queued_samples(9), 0);

        identities.select_screen(Some(ParticipantId::new("ana")));
        inbound.on_audio(audio(9, StreamKind::ScreenAudio, ana, 2, silence_frame(&mut encoder)));
        assert_eq!(inbound.stats().audio_frames, 1);
        assert_eq!(mixer.queued_samples(9), 1920);
    }

    #[test]
    fn test_ended_stream_releases_decoder_and_queue() {
        let identities = Arc::new(StreamIdentityTable::new());
        let mixer = Arc::new(PlaybackMixer::new(identities.clone(), 200));
        let inbound = InboundMedia::new(identities, mixer.clone());
        let mut encoder = OpusEncoder::new(&OpusSettings::default(), OpusApplication::Voip).unwrap();

        inbound.on_audio(audio(5, StreamKind::MicAudio, Identity::Unknown, 1, silence_frame(&mut encoder)));
        inbound.on_audio(audio(6, StreamKind::MicAudio, Identity::Unknown, 1, silence_frame(&mut encoder)));
        assert_eq!(inbound.decoders.lock().len(), 2);

        inbound.on_stream_ended(5);
        assert_eq!(inbound.decoders.lock().len(), 1);
        assert_eq!(mixer.queued_samples(5), 0);
        assert_eq!(mixer.queued_samples(6), 1920);
    }

    #[test]
    fn test_corrupt_audio_counted() {
        let identities = Arc::new(StreamIdentityTable::new());
        let mixer = Arc::new(PlaybackMixer::new(identities.clone(), 200));
        let inbound = InboundMedia::new(identities, mixer.clone());

        // TOC byte announcing a code-3 packet with no frame count
        inbound.on_audio(audio(3, StreamKind::MicAudio, Identity::Unknown, 1, Bytes::from_static(&[0x03])));
        assert_eq!(inbound.stats().decode_errors, 1);
        assert_eq!(mixer.queued_samples(3), 0);
    }

    #[test]
    fn test_video_goes_to_callback() {
        let identities = Arc::new(StreamIdentityTable::new());
        let mixer = Arc::new(PlaybackMixer::new(identities.clone(), 200));
        let inbound = InboundMedia::new(identities, mixer);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let frame = InboundVideo {
            ssrc: 4,
            kind: StreamKind::CameraVideo,
            identity: Identity::Unknown,
            timestamp: 3000,
            unit: AccessUnit::from_nals([&[0x65u8, 0x88][..]]),
        };
        inbound.on_video(frame.clone());

        let sink = seen.clone();
        *inbound.on_video.write() = Some(Arc::new(move |f: InboundVideo| sink.lock().push(f.ssrc)));
        inbound.on_video(frame);

        assert_eq!(inbound.stats().video_frames, 2);
        assert_eq!(*seen.lock(), vec![4]);
    }

    #[tokio::test]
    async fn test_engine_lifecycle() {
        let events = Arc::new(EventBus::new());
        let mut rx = events.subscribe();
        let mut config = EngineConfig::default();
        config.capture.helper_path = "/nonexistent/confab-capture".to_string();
        let engine = MediaEngine::new(&config, events).await.unwrap();

        assert_eq!(engine.relay_state(), SessionState::New);
        assert_eq!(engine.capture_state(SourceKind::Camera), CaptureState::Idle);

        let err = engine.start_camera("0").await.unwrap_err();
        assert!(matches!(err, crate::error::AppError::CaptureUnavailable { .. }));
        assert_eq!(engine.capture_state(SourceKind::Camera), CaptureState::Unavailable);

        assert_eq!(engine.set_volume(ParticipantId::new("bo"), 7.0), 3.0);
        assert_eq!(engine.volume(&ParticipantId::new("bo")), 3.0);

        engine.select_screen(Some(ParticipantId::new("bo")));
        assert_eq!(engine.selected_screen(), Some(ParticipantId::new("bo")));

        engine.shutdown().await;
        assert_eq!(engine.relay_state(), SessionState::Closed);

        let mut saw_selection = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, crate::events::MediaEvent::ScreenSelectionChanged { .. }) {
                saw_selection = true;
            }
        }
        assert!(saw_selection);
    }
}
