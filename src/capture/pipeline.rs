//! Outbound audio path shared by the microphone and screen sources
//!
//! Captured PCM -> 20ms engine blocks -> (microphone only) conditioning and
//! voice activity -> Opus -> relay stream.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::trace;

use super::channel::AudioPacket;
use super::pcm::{PcmFormat, PcmNormalizer};
use super::MediaSink;
use crate::audio::{AudioConditioner, OpusApplication, OpusEncoder, SpeakingDetector};
use crate::config::{ConditionerConfig, OpusSettings};
use crate::error::Result;
use crate::utils::LogThrottler;
use crate::webrtc::stream::StreamKind;
use crate::{debug_throttled, warn_throttled};

/// User input gain shared with the capture thread
#[derive(Debug, Clone)]
pub struct InputGain(Arc<AtomicU32>);

impl Default for InputGain {
    fn default() -> Self {
        Self(Arc::new(AtomicU32::new(1.0f32.to_bits())))
    }
}

impl InputGain {
    pub fn set(&self, gain: f32) {
        self.0.store(gain.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Audio path counters
#[derive(Debug, Default)]
pub struct AudioPipelineStats {
    frames_sent: AtomicU64,
    send_errors: AtomicU64,
    unsupported_packets: AtomicU64,
}

impl AudioPipelineStats {
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn send_errors(&self) -> u64 {
        self.send_errors.load(Ordering::Relaxed)
    }

    pub fn unsupported_packets(&self) -> u64 {
        self.unsupported_packets.load(Ordering::Relaxed)
    }
}

struct Conditioning {
    conditioner: AudioConditioner,
    speaking: SpeakingDetector,
    gain: InputGain,
}

pub struct AudioSendPipeline {
    stream: StreamKind,
    normalizer: PcmNormalizer,
    conditioning: Option<Conditioning>,
    encoder: OpusEncoder,
    sink: Arc<dyn MediaSink>,
    stats: Arc<AudioPipelineStats>,
    throttler: LogThrottler,
}

impl AudioSendPipeline {
    /// Microphone path: conditioned, voice-optimized
    pub fn microphone(
        conditioner: &ConditionerConfig,
        opus: &OpusSettings,
        speaking: SpeakingDetector,
        gain: InputGain,
        sink: Arc<dyn MediaSink>,
        stats: Arc<AudioPipelineStats>,
    ) -> Result<Self> {
        Ok(Self {
            stream: StreamKind::MicAudio,
            normalizer: PcmNormalizer::new(),
            conditioning: Some(Conditioning {
                conditioner: AudioConditioner::new(conditioner.clone()),
                speaking,
                gain,
            }),
            encoder: OpusEncoder::new(opus, OpusApplication::Voip)?,
            sink,
            stats,
            throttler: LogThrottler::default(),
        })
    }

    /// Shared system audio: passed through unconditioned
    pub fn screen_audio(
        opus: &OpusSettings,
        sink: Arc<dyn MediaSink>,
        stats: Arc<AudioPipelineStats>,
    ) -> Result<Self> {
        Ok(Self {
            stream: StreamKind::ScreenAudio,
            normalizer: PcmNormalizer::new(),
            conditioning: None,
            encoder: OpusEncoder::new(opus, OpusApplication::Audio)?,
            sink,
            stats,
            throttler: LogThrottler::default(),
        })
    }

    /// Feed one helper audio packet
    pub fn push_packet(&mut self, packet: &AudioPacket) {
        let Some(format) = PcmFormat::from_header(&packet.header) else {
            self.stats.unsupported_packets.fetch_add(1, Ordering::Relaxed);
            debug_throttled!(
                self.throttler,
                "format",
                "Unsupported audio format: {} bits, {} ch, float={}",
                packet.header.bits_per_sample,
                packet.header.channels,
                packet.header.is_float
            );
            return;
        };
        let blocks = self.normalizer.push_bytes(format, &packet.samples);
        self.send_blocks(blocks);
    }

    /// Feed interleaved samples from a local device
    pub fn push_i16(&mut self, sample_rate: u32, channels: u8, samples: &[i16]) {
        let blocks = self.normalizer.push_i16(sample_rate, channels, samples);
        self.send_blocks(blocks);
    }

    fn send_blocks(&mut self, blocks: Vec<Vec<i16>>) {
        for mut block in blocks {
            if let Some(c) = self.conditioning.as_mut() {
                c.conditioner.set_user_gain(c.gain.get());
                let analysis = c.conditioner.process(&mut block);
                c.speaking.observe(analysis.voice_active);
            }

            let frame = match self.encoder.encode(&block) {
                Ok(frame) => frame,
                Err(e) => {
                    warn_throttled!(self.throttler, "encode", "{} encode failed: {}", self.stream, e);
                    continue;
                }
            };

            match self.sink.send_audio_frame(self.stream, frame) {
                Ok(()) => {
                    self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                    trace!(stream = %self.stream, "Sent audio frame");
                }
                Err(e) => {
                    self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                    warn_throttled!(self.throttler, "send", "Failed to send {} frame: {}", self.stream, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::channel::MediaPacketHeader;
    use crate::capture::tests::CollectingMediaSink;
    use bytes::Bytes;
    use std::time::Duration;

    fn tone_packet(frames: u32) -> AudioPacket {
        let samples: Vec<u8> = (0..frames * 2)
            .flat_map(|i| ((((i / 2) as f32 * 0.06).sin() * 6000.0) as i16).to_le_bytes())
            .collect();
        AudioPacket {
            header: MediaPacketHeader::legacy(frames, 0),
            samples: Bytes::from(samples),
        }
    }

    #[test]
    fn test_microphone_path_sends_and_marks_speaking() {
        let sink = Arc::new(CollectingMediaSink::default());
        let stats = Arc::new(AudioPipelineStats::default());
        let speaking = SpeakingDetector::new(Duration::from_millis(200));
        let mut pipeline = AudioSendPipeline::microphone(
            &ConditionerConfig::default(),
            &OpusSettings::default(),
            speaking.clone(),
            InputGain::default(),
            sink.clone(),
            stats.clone(),
        )
        .unwrap();

        pipeline.push_packet(&tone_packet(480));
        assert_eq!(stats.frames_sent(), 0);
        pipeline.push_packet(&tone_packet(1500));
        assert_eq!(stats.frames_sent(), 2);
        assert!(speaking.is_speaking());

        let frames = sink.audio.lock();
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|(kind, _)| *kind == StreamKind::MicAudio));
    }

    #[test]
    fn test_muted_input_is_not_speaking() {
        let sink = Arc::new(CollectingMediaSink::default());
        let speaking = SpeakingDetector::new(Duration::from_millis(200));
        let gain = InputGain::default();
        gain.set(0.0);
        let mut pipeline = AudioSendPipeline::microphone(
            &ConditionerConfig::default(),
            &OpusSettings::default(),
            speaking.clone(),
            gain,
            sink.clone(),
            Arc::new(AudioPipelineStats::default()),
        )
        .unwrap();

        pipeline.push_i16(48000, 2, &vec![8000i16; 1920]);
        assert_eq!(sink.audio.lock().len(), 1);
        assert!(!speaking.is_speaking());
    }

    #[test]
    fn test_screen_audio_path() {
        let sink = Arc::new(CollectingMediaSink::default());
        let stats = Arc::new(AudioPipelineStats::default());
        let mut pipeline =
            AudioSendPipeline::screen_audio(&OpusSettings::default(), sink.clone(), stats.clone())
                .unwrap();

        pipeline.push_packet(&tone_packet(960));
        let mut bad = tone_packet(10);
        bad.header.bits_per_sample = 8;
        pipeline.push_packet(&bad);

        assert_eq!(stats.frames_sent(), 1);
        assert_eq!(stats.unsupported_packets(), 1);
        assert_eq!(sink.audio.lock()[0].0, StreamKind::ScreenAudio);
    }

    #[test]
    fn test_send_errors_counted() {
        let sink = Arc::new(CollectingMediaSink::failing());
        let stats = Arc::new(AudioPipelineStats::default());
        let mut pipeline =
            AudioSendPipeline::screen_audio(&OpusSettings::default(), sink, stats.clone()).unwrap();
        pipeline.push_i16(48000, 1, &vec![0i16; 960]);
        assert_eq!(stats.send_errors(), 1);
        assert_eq!(stats.frames_sent(), 0);
    }
}
