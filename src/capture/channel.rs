//! Auxiliary channel decoder for capture helper processes
//!
//! Capture helpers multiplex three packet types onto their auxiliary output
//! (stderr): PCM audio, preview frames and log records. The stream carries no
//! OS-level framing, so the decoder scans a rolling 4-byte window for a magic
//! tag and resynchronises byte-by-byte whenever a header fails validation.
//!
//! Audio packet (current layout, 24 byte header, little-endian):
//! ```text
//! +--------+---+----+----+-----+-----------+-----------+-------------+
//! | "MCAP" | v |bits| ch |float|sampleCount|sampleRate |timestamp(ms)|
//! |  u32   |u8 | u8 | u8 | u8  |    u32    |    u32    |     u64     |
//! +--------+---+----+----+-----+-----------+-----------+-------------+
//! ```
//! The legacy layout (16 byte header) is `magic, sampleCount u32, timestamp
//! u64` with implicit 16-bit stereo at 48 kHz.
//!
//! Preview packet: `"MPRV", length u32, width u32, height u32, format u32,
//! timestamp u64, pixels`. Log packet: `"MLOG", length u32, severity u8, text`.

use bytes::{Buf, Bytes, BytesMut};
use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// "MCAP" read as a little-endian u32
pub const AUDIO_MAGIC: u32 = 0x4D43_4150;
/// "MPRV" read as a little-endian u32
pub const PREVIEW_MAGIC: u32 = 0x5652_504D;
/// "MLOG" read as a little-endian u32
pub const LOG_MAGIC: u32 = 0x474F_4C4D;

/// Current audio header version
pub const AUDIO_VERSION: u8 = 2;

const AUDIO_HEADER_LEN: usize = 24;
const LEGACY_AUDIO_HEADER_LEN: usize = 16;
const PREVIEW_HEADER_LEN: usize = 28;
const LOG_HEADER_LEN: usize = 9;

/// Upper bounds used to reject false magic matches
const MAX_AUDIO_FRAMES: u32 = 65_536;
const MAX_PREVIEW_BYTES: u32 = 64 * 1024 * 1024;
const MAX_LOG_BYTES: u32 = 64 * 1024;
const MIN_SAMPLE_RATE: u32 = 8_000;
const MAX_SAMPLE_RATE: u32 = 192_000;

const READ_CHUNK: usize = 16 * 1024;

/// Decoded audio packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaPacketHeader {
    pub magic: u32,
    pub version: u8,
    pub bits_per_sample: u8,
    pub channels: u8,
    pub is_float: bool,
    /// Number of sample frames (samples per channel)
    pub sample_count: u32,
    pub sample_rate: u32,
    /// Capture timestamp in milliseconds
    pub timestamp: u64,
}

impl MediaPacketHeader {
    /// Header implied by the legacy fixed format
    pub fn legacy(sample_count: u32, timestamp: u64) -> Self {
        Self {
            magic: AUDIO_MAGIC,
            version: 1,
            bits_per_sample: 16,
            channels: 2,
            is_float: false,
            sample_count,
            sample_rate: 48_000,
            timestamp,
        }
    }

    /// Size of the sample payload following the header
    pub fn payload_len(&self) -> usize {
        self.sample_count as usize * self.channels as usize * (self.bits_per_sample as usize / 8)
    }

    pub fn is_legacy(&self) -> bool {
        self.version < AUDIO_VERSION
    }

    /// Serialize in the current (v2) layout
    pub fn encode(&self) -> [u8; AUDIO_HEADER_LEN] {
        let mut out = [0u8; AUDIO_HEADER_LEN];
        out[0..4].copy_from_slice(&AUDIO_MAGIC.to_le_bytes());
        out[4] = self.version;
        out[5] = self.bits_per_sample;
        out[6] = self.channels;
        out[7] = self.is_float as u8;
        out[8..12].copy_from_slice(&self.sample_count.to_le_bytes());
        out[12..16].copy_from_slice(&self.sample_rate.to_le_bytes());
        out[16..24].copy_from_slice(&self.timestamp.to_le_bytes());
        out
    }
}

/// Audio packet: header plus interleaved little-endian samples
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPacket {
    pub header: MediaPacketHeader,
    pub samples: Bytes,
}

/// Preview pixel layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewFormat {
    Nv12,
    Bgra,
    Other(u32),
}

impl From<u32> for PreviewFormat {
    fn from(value: u32) -> Self {
        match value {
            0 => PreviewFormat::Nv12,
            1 => PreviewFormat::Bgra,
            other => PreviewFormat::Other(other),
        }
    }
}

/// Raw preview frame for local self-view
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewFrame {
    pub width: u32,
    pub height: u32,
    pub format: PreviewFormat,
    pub timestamp: u64,
    pub pixels: Bytes,
}

/// Helper log severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

impl From<u8> for LogSeverity {
    fn from(value: u8) -> Self {
        match value {
            0 => LogSeverity::Debug,
            1 => LogSeverity::Info,
            2 => LogSeverity::Warning,
            _ => LogSeverity::Error,
        }
    }
}

/// Log line emitted by a helper
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub severity: LogSeverity,
    pub message: String,
}

/// One decoded auxiliary-channel packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelPacket {
    Audio(AudioPacket),
    Preview(PreviewFrame),
    Log(LogRecord),
}

/// Shared diagnostic counters, readable while the decoder runs on its own thread
#[derive(Debug, Default)]
pub struct ChannelStats {
    skipped_bytes: AtomicU64,
    packets: AtomicU64,
}

impl ChannelStats {
    /// Bytes discarded while searching for a valid header
    pub fn skipped_bytes(&self) -> u64 {
        self.skipped_bytes.load(Ordering::Relaxed)
    }

    /// Packets decoded so far
    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }
}

/// Outcome of trying to parse at the current buffer position
enum Parse {
    Packet(ChannelPacket, usize),
    /// Header did not validate, skip one byte
    Reject,
    /// Need at least this many buffered bytes
    NeedMore(usize),
}

/// Self-resynchronising decoder over a blocking byte stream
pub struct ChannelDecoder<R> {
    reader: R,
    buffer: BytesMut,
    eof: bool,
    read_error: Option<std::io::Error>,
    stats: Arc<ChannelStats>,
}

impl<R: Read> ChannelDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self::with_stats(reader, Arc::new(ChannelStats::default()))
    }

    pub fn with_stats(reader: R, stats: Arc<ChannelStats>) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(READ_CHUNK),
            eof: false,
            read_error: None,
            stats,
        }
    }

    /// Shared counter handle
    pub fn stats(&self) -> Arc<ChannelStats> {
        self.stats.clone()
    }

    /// Skipped-byte counter
    pub fn skipped_bytes(&self) -> u64 {
        self.stats.skipped_bytes()
    }

    /// Read error that ended iteration, if any
    pub fn take_error(&mut self) -> Option<std::io::Error> {
        self.read_error.take()
    }

    /// Read the next packet.
    ///
    /// Returns `Ok(None)` at end of stream; trailing bytes that never formed
    /// a packet are counted as skipped. I/O errors other than `Interrupted`
    /// are returned to the caller.
    pub fn next_packet(&mut self) -> std::io::Result<Option<ChannelPacket>> {
        loop {
            if self.buffer.len() < 4 && !self.fill(4)? {
                self.discard_tail();
                return Ok(None);
            }

            match self.try_parse() {
                Parse::Packet(packet, consumed) => {
                    self.buffer.advance(consumed);
                    self.stats.packets.fetch_add(1, Ordering::Relaxed);
                    return Ok(Some(packet));
                }
                Parse::Reject => self.skip_one(),
                Parse::NeedMore(needed) => {
                    if !self.fill(needed)? {
                        // Stream ended inside a candidate packet; treat the
                        // magic as noise and rescan what is left.
                        self.skip_one();
                    }
                }
            }
        }
    }

    fn skip_one(&mut self) {
        self.buffer.advance(1);
        self.stats.skipped_bytes.fetch_add(1, Ordering::Relaxed);
    }

    fn discard_tail(&mut self) {
        let remaining = self.buffer.len() as u64;
        if remaining > 0 {
            self.stats
                .skipped_bytes
                .fetch_add(remaining, Ordering::Relaxed);
            self.buffer.clear();
        }
    }

    /// Read until at least `needed` bytes are buffered. Returns false on EOF.
    fn fill(&mut self, needed: usize) -> std::io::Result<bool> {
        let mut chunk = [0u8; READ_CHUNK];
        while self.buffer.len() < needed {
            if self.eof {
                return Ok(false);
            }
            match self.reader.read(&mut chunk) {
                Ok(0) => self.eof = true,
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    fn try_parse(&self) -> Parse {
        let buf = &self.buffer[..];
        match read_u32(buf, 0) {
            AUDIO_MAGIC => parse_audio(buf),
            PREVIEW_MAGIC => parse_preview(buf),
            LOG_MAGIC => parse_log(buf),
            _ => Parse::Reject,
        }
    }
}

/// Iteration stops at end of stream or at the first read error; the error
/// is logged and kept for [`ChannelDecoder::take_error`].
impl<R: Read> Iterator for ChannelDecoder<R> {
    type Item = ChannelPacket;

    fn next(&mut self) -> Option<Self::Item> {
        if self.read_error.is_some() {
            return None;
        }
        match self.next_packet() {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Auxiliary channel read failed: {}", e);
                self.read_error = Some(e);
                None
            }
        }
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(raw)
}

/// Header-byte heuristic: the current layout has a version byte of 2
/// followed by plausible format fields. Any other shape is read as legacy.
/// Some legacy sample counts collide with this pattern; that ambiguity is
/// inherent to the wire format.
fn looks_like_current(buf: &[u8]) -> bool {
    let version = buf[4];
    let bits = buf[5];
    let channels = buf[6];
    let is_float = buf[7];
    version == AUDIO_VERSION
        && matches!((bits, is_float), (16, 0) | (32, 0) | (32, 1))
        && matches!(channels, 1 | 2)
}

fn parse_audio(buf: &[u8]) -> Parse {
    if buf.len() < LEGACY_AUDIO_HEADER_LEN {
        return Parse::NeedMore(LEGACY_AUDIO_HEADER_LEN);
    }

    let (header, header_len) = if looks_like_current(buf) {
        if buf.len() < AUDIO_HEADER_LEN {
            return Parse::NeedMore(AUDIO_HEADER_LEN);
        }
        let header = MediaPacketHeader {
            magic: AUDIO_MAGIC,
            version: buf[4],
            bits_per_sample: buf[5],
            channels: buf[6],
            is_float: buf[7] == 1,
            sample_count: read_u32(buf, 8),
            sample_rate: read_u32(buf, 12),
            timestamp: read_u64(buf, 16),
        };
        if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&header.sample_rate) {
            return Parse::Reject;
        }
        (header, AUDIO_HEADER_LEN)
    } else {
        (
            MediaPacketHeader::legacy(read_u32(buf, 4), read_u64(buf, 8)),
            LEGACY_AUDIO_HEADER_LEN,
        )
    };

    if header.sample_count == 0 || header.sample_count > MAX_AUDIO_FRAMES {
        return Parse::Reject;
    }

    let total = header_len + header.payload_len();
    if buf.len() < total {
        return Parse::NeedMore(total);
    }

    Parse::Packet(
        ChannelPacket::Audio(AudioPacket {
            header,
            samples: Bytes::copy_from_slice(&buf[header_len..total]),
        }),
        total,
    )
}

fn parse_preview(buf: &[u8]) -> Parse {
    if buf.len() < PREVIEW_HEADER_LEN {
        return Parse::NeedMore(PREVIEW_HEADER_LEN);
    }
    let length = read_u32(buf, 4);
    let width = read_u32(buf, 8);
    let height = read_u32(buf, 12);
    if length == 0 || length > MAX_PREVIEW_BYTES || width == 0 || height == 0 {
        return Parse::Reject;
    }

    let total = PREVIEW_HEADER_LEN + length as usize;
    if buf.len() < total {
        return Parse::NeedMore(total);
    }

    Parse::Packet(
        ChannelPacket::Preview(PreviewFrame {
            width,
            height,
            format: PreviewFormat::from(read_u32(buf, 16)),
            timestamp: read_u64(buf, 20),
            pixels: Bytes::copy_from_slice(&buf[PREVIEW_HEADER_LEN..total]),
        }),
        total,
    )
}

fn parse_log(buf: &[u8]) -> Parse {
    if buf.len() < LOG_HEADER_LEN {
        return Parse::NeedMore(LOG_HEADER_LEN);
    }
    let length = read_u32(buf, 4);
    if length > MAX_LOG_BYTES {
        return Parse::Reject;
    }

    let total = LOG_HEADER_LEN + length as usize;
    if buf.len() < total {
        return Parse::NeedMore(total);
    }

    Parse::Packet(
        ChannelPacket::Log(LogRecord {
            severity: LogSeverity::from(buf[8]),
            message: String::from_utf8_lossy(&buf[LOG_HEADER_LEN..total]).into_owned(),
        }),
        total,
    )
}

/// Packet writers, used by tests and by tooling that records helper output
pub mod encode {
    use super::*;

    pub fn audio(header: &MediaPacketHeader, samples: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(AUDIO_HEADER_LEN + samples.len());
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(samples);
        out
    }

    pub fn legacy_audio(sample_count: u32, timestamp: u64, samples: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(LEGACY_AUDIO_HEADER_LEN + samples.len());
        out.extend_from_slice(&AUDIO_MAGIC.to_le_bytes());
        out.extend_from_slice(&sample_count.to_le_bytes());
        out.extend_from_slice(&timestamp.to_le_bytes());
        out.extend_from_slice(samples);
        out
    }

    pub fn preview(width: u32, height: u32, format: u32, timestamp: u64, pixels: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(PREVIEW_HEADER_LEN + pixels.len());
        out.extend_from_slice(&PREVIEW_MAGIC.to_le_bytes());
        out.extend_from_slice(&(pixels.len() as u32).to_le_bytes());
        out.extend_from_slice(&width.to_le_bytes());
        out.extend_from_slice(&height.to_le_bytes());
        out.extend_from_slice(&format.to_le_bytes());
        out.extend_from_slice(&timestamp.to_le_bytes());
        out.extend_from_slice(pixels);
        out
    }

    pub fn log(severity: u8, message: &str) -> Vec<u8> {
        let text = message.as_bytes();
        let mut out = Vec::with_capacity(LOG_HEADER_LEN + text.len());
        out.extend_from_slice(&LOG_MAGIC.to_le_bytes());
        out.extend_from_slice(&(text.len() as u32).to_le_bytes());
        out.push(severity);
        out.extend_from_slice(text);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    fn stereo_header(sample_count: u32, timestamp: u64) -> MediaPacketHeader {
        MediaPacketHeader {
            magic: AUDIO_MAGIC,
            version: AUDIO_VERSION,
            bits_per_sample: 16,
            channels: 2,
            is_float: false,
            sample_count,
            sample_rate: 48_000,
            timestamp,
        }
    }

    /// Reader that hands out at most `step` bytes per call
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        step: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
            let n = self.step.min(out.len()).min(self.data.len() - self.pos);
            out[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn test_magic_values_spell_tags() {
        assert_eq!(&AUDIO_MAGIC.to_be_bytes(), b"MCAP");
        assert_eq!(&PREVIEW_MAGIC.to_le_bytes(), b"MPRV");
        assert_eq!(&LOG_MAGIC.to_le_bytes(), b"MLOG");
    }

    #[test]
    fn test_decode_current_audio() {
        let samples = vec![7u8; 4 * 480];
        let stream = encode::audio(&stereo_header(480, 1234), &samples);
        let mut decoder = ChannelDecoder::new(Cursor::new(stream));

        match decoder.next_packet().unwrap() {
            Some(ChannelPacket::Audio(packet)) => {
                assert_eq!(packet.header.sample_count, 480);
                assert_eq!(packet.header.timestamp, 1234);
                assert!(!packet.header.is_legacy());
                assert_eq!(packet.samples.len(), samples.len());
            }
            other => panic!("Expected audio packet, got {:?}", other),
        }
        assert!(decoder.next_packet().unwrap().is_none());
        assert_eq!(decoder.skipped_bytes(), 0);
    }

    #[test]
    fn test_decode_legacy_audio() {
        let samples = vec![1u8; 4 * 960];
        let stream = encode::legacy_audio(960, 99, &samples);
        let mut decoder = ChannelDecoder::new(Cursor::new(stream));

        match decoder.next_packet().unwrap() {
            Some(ChannelPacket::Audio(packet)) => {
                assert!(packet.header.is_legacy());
                assert_eq!(packet.header.channels, 2);
                assert_eq!(packet.header.sample_rate, 48_000);
                assert_eq!(packet.header.timestamp, 99);
                assert_eq!(packet.samples.len(), samples.len());
            }
            other => panic!("Expected legacy audio packet, got {:?}", other),
        }
    }

    #[test]
    fn test_preview_and_log_packets() {
        let mut stream = encode::preview(4, 2, 0, 77, &[9u8; 12]);
        stream.extend(encode::log(2, "encoder fell back to software"));
        let packets: Vec<_> = ChannelDecoder::new(Cursor::new(stream)).collect();

        assert_eq!(packets.len(), 2);
        match &packets[0] {
            ChannelPacket::Preview(frame) => {
                assert_eq!((frame.width, frame.height), (4, 2));
                assert_eq!(frame.format, PreviewFormat::Nv12);
                assert_eq!(frame.timestamp, 77);
                assert_eq!(frame.pixels.len(), 12);
            }
            other => panic!("Expected preview, got {:?}", other),
        }
        assert_eq!(
            packets[1],
            ChannelPacket::Log(LogRecord {
                severity: LogSeverity::Warning,
                message: "encoder fell back to software".to_string(),
            })
        );
    }

    #[test]
    fn test_resync_after_noise() {
        let mut stream = b"garbage!".to_vec();
        stream.extend(encode::log(1, "hello"));
        stream.extend([0xAA, 0xBB, 0xCC]);
        stream.extend(encode::log(3, "bye"));

        let mut decoder = ChannelDecoder::new(Cursor::new(stream));
        let packets: Vec<_> = (&mut decoder).collect();
        assert_eq!(packets.len(), 2);
        assert_eq!(decoder.skipped_bytes(), 11);
    }

    #[test]
    fn test_false_magic_is_skipped() {
        // Preview magic with a zero length never validates
        let mut stream = PREVIEW_MAGIC.to_le_bytes().to_vec();
        stream.extend([0u8; 24]);
        stream.extend(encode::log(0, "ok"));

        let mut decoder = ChannelDecoder::new(Cursor::new(stream));
        let packets: Vec<_> = (&mut decoder).collect();
        assert_eq!(packets.len(), 1);
        assert_eq!(decoder.skipped_bytes(), 28);
    }

    #[test]
    fn test_packets_split_across_reads() {
        let mut data = encode::audio(&stereo_header(256, 5), &[3u8; 1024]);
        data.extend(encode::log(1, "split"));
        let reader = Trickle { data, pos: 0, step: 7 };

        let packets: Vec<_> = ChannelDecoder::new(reader).collect();
        assert_eq!(packets.len(), 2);
    }

    struct FailAfter {
        data: Cursor<Vec<u8>>,
    }

    impl Read for FailAfter {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.data.read(buf)? {
                0 => Err(std::io::Error::new(ErrorKind::BrokenPipe, "helper went away")),
                n => Ok(n),
            }
        }
    }

    #[test]
    fn test_iterator_keeps_read_error() {
        let reader = FailAfter {
            data: Cursor::new(encode::log(1, "before")),
        };
        let mut decoder = ChannelDecoder::new(reader);
        let packets: Vec<_> = (&mut decoder).collect();
        assert_eq!(packets.len(), 1);
        let err = decoder.take_error().unwrap();
        assert_eq!(err.kind(), ErrorKind::BrokenPipe);
        assert!(decoder.take_error().is_none());
    }

    #[test]
    fn test_truncated_packet_ends_cleanly() {
        let mut stream = encode::audio(&stereo_header(480, 0), &[0u8; 4 * 480]);
        stream.truncate(100);
        let mut decoder = ChannelDecoder::new(Cursor::new(stream));
        assert!(decoder.next_packet().unwrap().is_none());
        assert_eq!(decoder.skipped_bytes(), 100);
    }

    fn packet_strategy() -> impl Strategy<Value = Vec<u8>> {
        prop_oneof![
            (1u32..64, any::<u64>()).prop_map(|(count, ts)| {
                encode::audio(&stereo_header(count, ts), &vec![0x11; count as usize * 4])
            }),
            (1u32..8, 1u32..8, any::<u64>()).prop_map(|(w, h, ts)| {
                encode::preview(w, h, 1, ts, &vec![0x22; (w * h * 4) as usize])
            }),
            "[a-z ]{0,40}".prop_map(|text| encode::log(1, &text)),
        ]
    }

    // Noise never contains 'M' or 'P', so no magic tag can form inside it
    // or across its boundary with a packet.
    fn noise_strategy() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(
            any::<u8>().prop_filter("no tag bytes", |b| *b != b'M' && *b != b'P'),
            0..16,
        )
    }

    proptest! {
        #[test]
        fn prop_noise_interleaved_packets(
            items in prop::collection::vec((noise_strategy(), packet_strategy()), 0..12),
            tail in noise_strategy(),
        ) {
            let mut stream = Vec::new();
            let mut expected = Vec::new();
            let mut noise_len = 0u64;
            for (noise, packet) in &items {
                noise_len += noise.len() as u64;
                stream.extend_from_slice(noise);
                stream.extend_from_slice(packet);
                expected.push(packet.clone());
            }
            noise_len += tail.len() as u64;
            stream.extend_from_slice(&tail);

            let mut decoder = ChannelDecoder::new(Cursor::new(stream));
            let mut decoded = 0usize;
            while let Some(packet) = decoder.next_packet().unwrap() {
                let reencoded = match packet {
                    ChannelPacket::Audio(a) => encode::audio(&a.header, &a.samples),
                    ChannelPacket::Preview(p) => encode::preview(
                        p.width, p.height, 1, p.timestamp, &p.pixels,
                    ),
                    ChannelPacket::Log(l) => encode::log(1, &l.message),
                };
                prop_assert_eq!(&reencoded, &expected[decoded]);
                decoded += 1;
            }
            prop_assert_eq!(decoded, expected.len());
            prop_assert_eq!(decoder.skipped_bytes(), noise_len);
        }
    }
}
