//! Opus decoding of inbound audio, one decoder per SSRC

use std::collections::HashMap;

use audiopus::{coder::Decoder, Channels, SampleRate};
use tracing::debug;

use super::{CHANNELS, FRAME_SAMPLES};
use crate::error::{AppError, Result};

/// Longest frame Opus allows (120ms at 48 kHz)
const MAX_FRAME_SAMPLES: usize = 5760;

/// Opus decoder producing 48 kHz interleaved stereo
pub struct OpusDecoder {
    decoder: Decoder,
    buffer: Vec<i16>,
}

impl OpusDecoder {
    pub fn new() -> Result<Self> {
        let decoder = Decoder::new(SampleRate::Hz48000, Channels::Stereo).map_err(|e| {
            AppError::AudioError(format!("Failed to create Opus decoder: {:?}", e))
        })?;
        Ok(Self {
            decoder,
            buffer: vec![0i16; MAX_FRAME_SAMPLES * CHANNELS],
        })
    }

    pub fn decode(&mut self, payload: &[u8]) -> Result<Vec<i16>> {
        let samples = self
            .decoder
            .decode(Some(payload), &mut self.buffer[..], false)
            .map_err(|e| AppError::AudioError(format!("Opus decode failed: {:?}", e)))?;
        Ok(self.buffer[..samples * CHANNELS].to_vec())
    }

    /// Synthesize one frame for a lost packet
    pub fn conceal(&mut self) -> Result<Vec<i16>> {
        let samples = self
            .decoder
            .decode(None::<&[u8]>, &mut self.buffer[..FRAME_SAMPLES * CHANNELS], false)
            .map_err(|e| AppError::AudioError(format!("Opus concealment failed: {:?}", e)))?;
        Ok(self.buffer[..samples * CHANNELS].to_vec())
    }
}

/// Decoders keyed by SSRC with loss concealment on sequence gaps
#[derive(Default)]
pub struct DecoderBank {
    decoders: HashMap<u32, StreamDecoder>,
}

struct StreamDecoder {
    decoder: OpusDecoder,
    last_sequence: Option<u16>,
}

impl DecoderBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `payload`, prepending concealment frames for up to two lost packets
    pub fn decode(&mut self, ssrc: u32, sequence: u16, payload: &[u8]) -> Result<Vec<i16>> {
        let stream = match self.decoders.entry(ssrc) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                debug!(ssrc, "Creating Opus decoder");
                entry.insert(StreamDecoder {
                    decoder: OpusDecoder::new()?,
                    last_sequence: None,
                })
            }
        };

        let mut pcm = Vec::new();
        if let Some(last) = stream.last_sequence {
            let lost = sequence.wrapping_sub(last).wrapping_sub(1);
            // Large jumps are reordering or a restart, not loss
            if (1..=2).contains(&lost) {
                for _ in 0..lost {
                    pcm.extend(stream.decoder.conceal()?);
                }
            }
        }
        stream.last_sequence = Some(sequence);
        pcm.extend(stream.decoder.decode(payload)?);
        Ok(pcm)
    }

    pub fn remove(&mut self, ssrc: u32) {
        self.decoders.remove(&ssrc);
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}
