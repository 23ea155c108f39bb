//! Normalization of captured PCM to the engine's frame format
//!
//! Everything downstream of capture works on 20ms blocks of 48 kHz
//! interleaved stereo i16. Helpers and local devices deliver whatever they
//! negotiated, so samples are converted, upmixed and linearly resampled here
//! with state carried across packets.

use crate::audio::{CHANNELS, FRAME_SAMPLES, SAMPLE_RATE};
use crate::capture::channel::MediaPacketHeader;

/// Interleaved samples per output block
const BLOCK_LEN: usize = FRAME_SAMPLES * CHANNELS;

/// Sample encoding of incoming PCM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleEncoding {
    I16,
    I32,
    F32,
}

impl SampleEncoding {
    pub fn bytes(self) -> usize {
        match self {
            SampleEncoding::I16 => 2,
            SampleEncoding::I32 | SampleEncoding::F32 => 4,
        }
    }
}

/// Layout of a PCM payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub encoding: SampleEncoding,
    pub channels: u8,
    pub sample_rate: u32,
}

impl PcmFormat {
    pub const ENGINE: PcmFormat = PcmFormat {
        encoding: SampleEncoding::I16,
        channels: 2,
        sample_rate: SAMPLE_RATE,
    };

    /// Format described by an audio packet header, if supported
    pub fn from_header(header: &MediaPacketHeader) -> Option<Self> {
        let encoding = match (header.bits_per_sample, header.is_float) {
            (16, false) => SampleEncoding::I16,
            (32, false) => SampleEncoding::I32,
            (32, true) => SampleEncoding::F32,
            _ => return None,
        };
        if !(1..=2).contains(&header.channels) || header.sample_rate == 0 {
            return None;
        }
        Some(Self {
            encoding,
            channels: header.channels,
            sample_rate: header.sample_rate,
        })
    }

    fn frame_bytes(&self) -> usize {
        self.encoding.bytes() * self.channels as usize
    }
}

/// Stateful converter from arbitrary PCM to 20ms engine blocks
#[derive(Debug, Default)]
pub struct PcmNormalizer {
    input_rate: u32,
    /// Read position relative to `previous`, in input frames
    position: f64,
    previous: Option<[f32; 2]>,
    pending: Vec<i16>,
}

impl PcmNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convert a little-endian payload; returns every block completed by it
    pub fn push_bytes(&mut self, format: PcmFormat, data: &[u8]) -> Vec<Vec<i16>> {
        let frames = data.chunks_exact(format.frame_bytes()).map(|frame| {
            let sample = |idx: usize| decode_sample(format.encoding, frame, idx);
            let left = sample(0);
            let right = if format.channels == 2 { sample(1) } else { left };
            [left, right]
        });
        self.push_frames(format.sample_rate, frames)
    }

    /// Convert interleaved i16 samples (local device path)
    pub fn push_i16(&mut self, sample_rate: u32, channels: u8, samples: &[i16]) -> Vec<Vec<i16>> {
        let channels = channels.clamp(1, 2) as usize;
        let frames = samples.chunks_exact(channels).map(|frame| {
            let left = frame[0] as f32;
            let right = if channels == 2 { frame[1] as f32 } else { left };
            [left, right]
        });
        self.push_frames(sample_rate, frames)
    }

    /// Samples waiting for the next block to fill
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn push_frames<I>(&mut self, sample_rate: u32, frames: I) -> Vec<Vec<i16>>
    where
        I: Iterator<Item = [f32; 2]>,
    {
        if sample_rate != self.input_rate {
            self.input_rate = sample_rate;
            self.position = 0.0;
            self.previous = None;
        }

        if sample_rate == SAMPLE_RATE {
            for [l, r] in frames {
                self.pending.push(to_i16(l));
                self.pending.push(to_i16(r));
            }
        } else {
            self.resample(sample_rate, frames);
        }

        let complete = self.pending.len() / BLOCK_LEN;
        let mut blocks = Vec::with_capacity(complete);
        for chunk in self.pending.chunks_exact(BLOCK_LEN) {
            blocks.push(chunk.to_vec());
        }
        self.pending.drain(..complete * BLOCK_LEN);
        blocks
    }

    fn resample<I>(&mut self, sample_rate: u32, frames: I)
    where
        I: Iterator<Item = [f32; 2]>,
    {
        let step = sample_rate as f64 / SAMPLE_RATE as f64;
        let mut input: Vec<[f32; 2]> = self.previous.into_iter().collect();
        input.extend(frames);
        if input.len() < 2 {
            self.previous = input.last().copied();
            return;
        }

        let mut t = self.position;
        while t + 1.0 < input.len() as f64 {
            let idx = t as usize;
            let frac = (t - idx as f64) as f32;
            let (a, b) = (input[idx], input[idx + 1]);
            self.pending.push(to_i16(a[0] + (b[0] - a[0]) * frac));
            self.pending.push(to_i16(a[1] + (b[1] - a[1]) * frac));
            t += step;
        }

        self.position = t - (input.len() - 1) as f64;
        self.previous = input.last().copied();
    }
}

/// One sample on the i16 scale
fn decode_sample(encoding: SampleEncoding, frame: &[u8], channel: usize) -> f32 {
    let width = encoding.bytes();
    let b = &frame[channel * width..(channel + 1) * width];
    match encoding {
        SampleEncoding::I16 => i16::from_le_bytes([b[0], b[1]]) as f32,
        SampleEncoding::I32 => (i32::from_le_bytes([b[0], b[1], b[2], b[3]]) >> 16) as f32,
        SampleEncoding::F32 => {
            let value = f32::from_le_bytes([b[0], b[1], b[2], b[3]]);
            if value.is_finite() {
                value.clamp(-1.0, 1.0) * 32767.0
            } else {
                0.0
            }
        }
    }
}

fn to_i16(value: f32) -> i16 {
    value.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn i16_bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn test_format_from_header() {
        let legacy = MediaPacketHeader::legacy(960, 0);
        assert_eq!(PcmFormat::from_header(&legacy), Some(PcmFormat::ENGINE));

        let mut header = legacy;
        header.bits_per_sample = 24;
        assert_eq!(PcmFormat::from_header(&header), None);

        header.bits_per_sample = 32;
        header.is_float = true;
        header.channels = 1;
        let format = PcmFormat::from_header(&header).unwrap();
        assert_eq!(format.encoding, SampleEncoding::F32);
        assert_eq!(format.channels, 1);
    }

    #[test]
    fn test_passthrough_is_exact() {
        let samples: Vec<i16> = (0..BLOCK_LEN as i32).map(|i| (i * 7 - 5000) as i16).collect();
        let mut normalizer = PcmNormalizer::new();
        let blocks = normalizer.push_bytes(PcmFormat::ENGINE, &i16_bytes(&samples));
        assert_eq!(blocks, vec![samples]);
        assert_eq!(normalizer.pending(), 0);
    }

    #[test]
    fn test_chunks_across_packets() {
        let mut normalizer = PcmNormalizer::new();
        let half = vec![100i16; BLOCK_LEN / 2 + 2];
        assert!(normalizer.push_i16(48000, 2, &half).is_empty());
        let blocks = normalizer.push_i16(48000, 2, &half);
        assert_eq!(blocks.len(), 1);
        assert_eq!(normalizer.pending(), 4);
    }

    #[test]
    fn test_mono_float_upmix() {
        let format = PcmFormat {
            encoding: SampleEncoding::F32,
            channels: 1,
            sample_rate: 48000,
        };
        let data: Vec<u8> = std::iter::repeat(0.5f32)
            .take(FRAME_SAMPLES)
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let blocks = PcmNormalizer::new().push_bytes(format, &data);
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].iter().all(|&s| s == 16384));
    }

    #[test]
    fn test_i32_and_clipping() {
        let format = PcmFormat {
            encoding: SampleEncoding::I32,
            channels: 2,
            sample_rate: 48000,
        };
        let data: Vec<u8> = std::iter::repeat([i32::MAX, i32::MIN])
            .take(FRAME_SAMPLES)
            .flatten()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let blocks = PcmNormalizer::new().push_bytes(format, &data);
        assert_eq!(blocks[0][0], 32767);
        assert_eq!(blocks[0][1], -32768);
    }

    #[test]
    fn test_resample_frame_count() {
        // 1s at 44.1k becomes 1s at 48k, split over uneven packets
        let mut normalizer = PcmNormalizer::new();
        let mut produced = 0;
        let samples = vec![1000i16; 441 * 2];
        for _ in 0..100 {
            produced += normalizer.push_i16(44100, 2, &samples).len();
        }
        let total = produced * FRAME_SAMPLES + normalizer.pending() / 2;
        assert!((total as i64 - 48000).abs() <= 2, "total {}", total);
        assert_eq!(produced, 49);
    }

    #[test]
    fn test_resample_preserves_level() {
        let mut normalizer = PcmNormalizer::new();
        let blocks = normalizer.push_i16(16000, 1, &vec![-2000i16; 1000]);
        assert_eq!(blocks.len(), 3);
        assert!(blocks.iter().flatten().all(|&s| s == -2000));
    }

    #[test]
    fn test_rate_change_resets_state() {
        let mut normalizer = PcmNormalizer::new();
        normalizer.push_i16(44100, 2, &[500i16; 10]);
        let blocks = normalizer.push_i16(48000, 2, &vec![7i16; BLOCK_LEN]);
        // Pending samples from the old rate are kept, not re-timed
        assert_eq!(blocks.len(), 1);
    }
}
