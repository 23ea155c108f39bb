//! Opus encoder for outbound audio streams

use audiopus::coder::GenericCtl;
use audiopus::{coder::Encoder, Application, Bitrate, Channels, SampleRate};
use bytes::Bytes;
use tracing::{info, trace};

use super::{CHANNELS, FRAME_SAMPLES, SAMPLE_RATE};
use crate::config::OpusSettings;
use crate::error::{AppError, Result};

/// Largest packet libopus can emit for one frame
const MAX_PACKET_SIZE: usize = 4000;

/// Opus application mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpusApplication {
    /// Microphone speech
    Voip,
    /// Shared system audio
    Audio,
}

impl From<OpusApplication> for Application {
    fn from(app: OpusApplication) -> Self {
        match app {
            OpusApplication::Voip => Application::Voip,
            OpusApplication::Audio => Application::Audio,
        }
    }
}

/// Encoder statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncoderStats {
    pub frames_encoded: u64,
    pub bytes_output: u64,
}

/// Opus encoder fixed at 48 kHz stereo, 20ms frames
pub struct OpusEncoder {
    encoder: Encoder,
    output_buffer: Vec<u8>,
    stats: EncoderStats,
}

impl OpusEncoder {
    pub fn new(settings: &OpusSettings, application: OpusApplication) -> Result<Self> {
        let mut encoder = Encoder::new(SampleRate::Hz48000, Channels::Stereo, application.into())
            .map_err(|e| {
                AppError::AudioError(format!("Failed to create Opus encoder: {:?}", e))
            })?;

        encoder
            .set_bitrate(Bitrate::BitsPerSecond(settings.bitrate as i32))
            .map_err(|e| AppError::AudioError(format!("Failed to set bitrate: {:?}", e)))?;

        if settings.fec {
            encoder
                .set_inband_fec(true)
                .map_err(|e| AppError::AudioError(format!("Failed to enable FEC: {:?}", e)))?;
        }

        info!(
            "Opus encoder created: {}Hz {}ch {}bps ({:?})",
            SAMPLE_RATE, CHANNELS, settings.bitrate, application
        );

        Ok(Self {
            encoder,
            output_buffer: vec![0u8; MAX_PACKET_SIZE],
            stats: EncoderStats::default(),
        })
    }

    /// Encode one 20ms block of interleaved stereo samples
    pub fn encode(&mut self, pcm: &[i16]) -> Result<Bytes> {
        if pcm.len() != FRAME_SAMPLES * CHANNELS {
            return Err(AppError::AudioError(format!(
                "Opus frame must be {} samples, got {}",
                FRAME_SAMPLES * CHANNELS,
                pcm.len()
            )));
        }

        let encoded_len = self
            .encoder
            .encode(pcm, &mut self.output_buffer)
            .map_err(|e| AppError::AudioError(format!("Opus encode failed: {:?}", e)))?;

        self.stats.frames_encoded += 1;
        self.stats.bytes_output += encoded_len as u64;
        trace!("Encoded {} samples to {} bytes Opus", pcm.len(), encoded_len);

        Ok(Bytes::copy_from_slice(&self.output_buffer[..encoded_len]))
    }

    /// Encode a block held as native-endian PCM bytes
    pub fn encode_bytes(&mut self, pcm: &[u8]) -> Result<Bytes> {
        // Zero-copy when the buffer happens to be aligned
        match bytemuck::try_cast_slice::<u8, i16>(pcm) {
            Ok(samples) => self.encode(samples),
            Err(_) => {
                let samples: Vec<i16> = pcm
                    .chunks_exact(2)
                    .map(|b| i16::from_ne_bytes([b[0], b[1]]))
                    .collect();
                self.encode(&samples)
            }
        }
    }

    pub fn stats(&self) -> EncoderStats {
        self.stats
    }

    pub fn reset(&mut self) -> Result<()> {
        self.encoder
            .reset_state()
            .map_err(|e| AppError::AudioError(format!("Failed to reset encoder: {:?}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_encoder() {
        let settings = OpusSettings::default();
        assert!(OpusEncoder::new(&settings, OpusApplication::Voip).is_ok());
        assert!(OpusEncoder::new(&settings, OpusApplication::Audio).is_ok());
    }

    #[test]
    fn test_encode_silence() {
        let mut encoder = OpusEncoder::new(&OpusSettings::default(), OpusApplication::Voip).unwrap();
        let silence = vec![0i16; FRAME_SAMPLES * CHANNELS];
        let packet = encoder.encode(&silence).unwrap();
        assert!(!packet.is_empty());
        assert!(packet.len() < silence.len() * 2);
        assert_eq!(encoder.stats().frames_encoded, 1);
    }

    #[test]
    fn test_rejects_wrong_frame_size() {
        let mut encoder = OpusEncoder::new(&OpusSettings::default(), OpusApplication::Voip).unwrap();
        assert!(encoder.encode(&[0i16; 480]).is_err());
        assert_eq!(encoder.stats().frames_encoded, 0);
    }

    #[test]
    fn test_encode_bytes_any_alignment() {
        let mut encoder = OpusEncoder::new(&OpusSettings::default(), OpusApplication::Audio).unwrap();
        let buffer = vec![0u8; FRAME_SAMPLES * CHANNELS * 2 + 1];
        assert!(encoder.encode_bytes(&buffer[..buffer.len() - 1]).is_ok());
        assert!(encoder.encode_bytes(&buffer[1..]).is_ok());
        assert_eq!(encoder.stats().frames_encoded, 2);
    }
}
