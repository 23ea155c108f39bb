//! H.264 NAL unit stream handling
//!
//! Capture helpers write AVCC-style NAL units to stdout: a 4-byte big-endian
//! length followed by the NAL payload. This module turns that stream into
//! Annex B access units (one frame each) for the RTP send path.

use bytes::{BufMut, Bytes, BytesMut};
use std::io::{ErrorKind, Read};
use std::ops::Range;

/// Annex B start code prepended to every accumulated NAL
pub const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Largest NAL unit accepted from a helper
const MAX_NAL_SIZE: usize = 16 * 1024 * 1024;

/// H.264 NAL unit types used by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalType {
    NonIdrSlice,
    IdrSlice,
    Sei,
    Sps,
    Pps,
    AccessUnitDelimiter,
    Other(u8),
}

impl NalType {
    /// Classify from the first NAL byte (low 5 bits)
    pub fn from_header(byte: u8) -> Self {
        match byte & 0x1F {
            1 => NalType::NonIdrSlice,
            5 => NalType::IdrSlice,
            6 => NalType::Sei,
            7 => NalType::Sps,
            8 => NalType::Pps,
            9 => NalType::AccessUnitDelimiter,
            other => NalType::Other(other),
        }
    }

    pub fn is_slice(&self) -> bool {
        matches!(self, NalType::NonIdrSlice | NalType::IdrSlice)
    }
}

/// One encoded video frame: start-code delimited NAL units
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessUnit {
    data: Bytes,
    nals: Vec<Range<usize>>,
    /// Contains an IDR slice
    pub keyframe: bool,
}

impl AccessUnit {
    /// Build from raw NAL payloads (no start codes)
    pub fn from_nals<I, T>(nals: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        let mut builder = AccessUnitBuilder::default();
        for nal in nals {
            builder.push(nal.as_ref());
        }
        builder.finish()
    }

    /// Annex B bytes of the whole unit
    pub fn annex_b(&self) -> &[u8] {
        &self.data
    }

    /// Cheap clone of the Annex B bytes
    pub fn annex_b_bytes(&self) -> Bytes {
        self.data.clone()
    }

    /// NAL payloads without start codes, in order
    pub fn nal_units(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.nals.iter().map(move |range| &self.data[range.clone()])
    }

    pub fn nal_count(&self) -> usize {
        self.nals.len()
    }

    pub fn has_nal_type(&self, nal_type: NalType) -> bool {
        self.nal_units()
            .any(|nal| !nal.is_empty() && NalType::from_header(nal[0]) == nal_type)
    }

    /// Total payload size excluding start codes
    pub fn payload_len(&self) -> usize {
        self.nals.iter().map(|r| r.len()).sum()
    }

    /// Copy of this unit with the given parameter sets placed first
    pub fn with_parameter_sets(&self, sps: &[u8], pps: &[u8]) -> Self {
        let mut builder = AccessUnitBuilder::default();
        builder.push(sps);
        builder.push(pps);
        for nal in self.nal_units() {
            builder.push(nal);
        }
        builder.finish()
    }
}

#[derive(Default)]
struct AccessUnitBuilder {
    data: BytesMut,
    nals: Vec<Range<usize>>,
    keyframe: bool,
}

impl AccessUnitBuilder {
    fn push(&mut self, nal: &[u8]) {
        self.data.put_slice(&START_CODE);
        let start = self.data.len();
        self.data.put_slice(nal);
        self.nals.push(start..self.data.len());
        if nal
            .first()
            .is_some_and(|b| NalType::from_header(*b) == NalType::IdrSlice)
        {
            self.keyframe = true;
        }
    }

    fn is_empty(&self) -> bool {
        self.nals.is_empty()
    }

    fn finish(&mut self) -> AccessUnit {
        AccessUnit {
            data: std::mem::take(&mut self.data).freeze(),
            nals: std::mem::take(&mut self.nals),
            keyframe: std::mem::take(&mut self.keyframe),
        }
    }
}

/// Most recent SPS/PPS seen on a stream
#[derive(Debug, Clone, Default)]
pub struct ParameterSets {
    pub sps: Option<Bytes>,
    pub pps: Option<Bytes>,
}

impl ParameterSets {
    /// Remember any SPS/PPS carried by `nal`
    pub fn observe(&mut self, nal: &[u8]) {
        match nal.first().map(|b| NalType::from_header(*b)) {
            Some(NalType::Sps) => self.sps = Some(Bytes::copy_from_slice(nal)),
            Some(NalType::Pps) => self.pps = Some(Bytes::copy_from_slice(nal)),
            _ => {}
        }
    }

    pub fn is_complete(&self) -> bool {
        self.sps.is_some() && self.pps.is_some()
    }

    /// Prepend cached parameter sets to a keyframe that lacks them
    pub fn complete_keyframe(&self, unit: AccessUnit) -> AccessUnit {
        if !unit.keyframe || unit.has_nal_type(NalType::Sps) {
            return unit;
        }
        match (&self.sps, &self.pps) {
            (Some(sps), Some(pps)) => unit.with_parameter_sets(sps, pps),
            _ => unit,
        }
    }
}

/// Groups NAL units into access units.
///
/// A unit opens at SPS, and a second SPS with data pending flushes the
/// previous unit. Every slice flushes the unit it was appended to.
#[derive(Default)]
pub struct NalUnitCodec {
    pending: AccessUnitBuilder,
    params: ParameterSets,
}

impl NalUnitCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one NAL payload; returns the access unit it completes, if any
    pub fn push(&mut self, nal: &[u8]) -> Option<AccessUnit> {
        let Some(&header) = nal.first() else {
            return None;
        };
        let nal_type = NalType::from_header(header);
        self.params.observe(nal);

        let mut flushed = None;
        if nal_type == NalType::Sps && !self.pending.is_empty() {
            flushed = Some(self.pending.finish());
        }

        self.pending.push(nal);

        if nal_type.is_slice() {
            return Some(self.pending.finish());
        }
        flushed
    }

    /// Emit whatever is pending (end of stream)
    pub fn flush(&mut self) -> Option<AccessUnit> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.pending.finish())
        }
    }

    /// Parameter sets seen so far
    pub fn parameter_sets(&self) -> &ParameterSets {
        &self.params
    }
}

/// Reads length-prefixed NAL units from a blocking stream
pub struct NalReader<R> {
    reader: R,
}

impl<R: Read> NalReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Next NAL payload, or `None` at a clean end of stream.
    ///
    /// A stream that ends mid-unit is treated as ended. Oversized length
    /// prefixes mean the stream lost framing and are reported as
    /// `InvalidData`.
    pub fn next_nal(&mut self) -> std::io::Result<Option<Bytes>> {
        let mut prefix = [0u8; 4];
        if !read_full(&mut self.reader, &mut prefix)? {
            return Ok(None);
        }
        let len = u32::from_be_bytes(prefix) as usize;
        if len > MAX_NAL_SIZE {
            return Err(std::io::Error::new(
                ErrorKind::InvalidData,
                format!("NAL length {} exceeds limit", len),
            ));
        }
        let mut nal = vec![0u8; len];
        if !read_full(&mut self.reader, &mut nal)? {
            return Ok(None);
        }
        Ok(Some(Bytes::from(nal)))
    }
}

/// Fill `buf` completely. Returns false if the stream ended first.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Ok(false),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

/// Encode NAL payloads in the helper's length-prefixed format
pub fn encode_length_prefixed<I, T>(nals: I) -> Vec<u8>
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    let mut out = Vec::new();
    for nal in nals {
        let nal = nal.as_ref();
        out.extend_from_slice(&(nal.len() as u32).to_be_bytes());
        out.extend_from_slice(nal);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const SPS: &[u8] = &[0x67, 0x42, 0x00, 0x1f];
    const PPS: &[u8] = &[0x68, 0xce, 0x3c, 0x80];
    const IDR: &[u8] = &[0x65, 0x88, 0x84, 0x00];
    const P_SLICE: &[u8] = &[0x41, 0x9a, 0x02];
    const SEI: &[u8] = &[0x06, 0x05, 0x01];

    fn decode_all(stream: Vec<u8>) -> Vec<AccessUnit> {
        let mut reader = NalReader::new(Cursor::new(stream));
        let mut codec = NalUnitCodec::new();
        let mut units = Vec::new();
        while let Some(nal) = reader.next_nal().unwrap() {
            if let Some(unit) = codec.push(&nal) {
                units.push(unit);
            }
        }
        units.extend(codec.flush());
        units
    }

    #[test]
    fn test_nal_type_classification() {
        assert_eq!(NalType::from_header(0x67), NalType::Sps);
        assert_eq!(NalType::from_header(0x68), NalType::Pps);
        assert_eq!(NalType::from_header(0x65), NalType::IdrSlice);
        assert_eq!(NalType::from_header(0x41), NalType::NonIdrSlice);
        assert!(NalType::from_header(0x25).is_slice());
    }

    #[test]
    fn test_keyframe_then_delta() {
        let units = decode_all(encode_length_prefixed([SPS, PPS, IDR, P_SLICE]));
        assert_eq!(units.len(), 2);

        assert!(units[0].keyframe);
        assert_eq!(units[0].nal_count(), 3);
        let mut expected = Vec::new();
        for nal in [SPS, PPS, IDR] {
            expected.extend_from_slice(&START_CODE);
            expected.extend_from_slice(nal);
        }
        assert_eq!(units[0].annex_b(), expected.as_slice());

        assert!(!units[1].keyframe);
        assert_eq!(units[1].nal_units().collect::<Vec<_>>(), vec![P_SLICE]);
    }

    #[test]
    fn test_sps_flushes_pending_data() {
        let mut codec = NalUnitCodec::new();
        assert!(codec.push(SEI).is_none());
        let flushed = codec.push(SPS).expect("SPS should flush pending SEI");
        assert_eq!(flushed.nal_units().collect::<Vec<_>>(), vec![SEI]);
        assert!(codec.push(PPS).is_none());
        let unit = codec.push(IDR).unwrap();
        assert_eq!(unit.nal_count(), 3);
    }

    #[test]
    fn test_parameter_sets_cached() {
        let mut codec = NalUnitCodec::new();
        codec.push(SPS);
        codec.push(PPS);
        codec.push(IDR);
        let params = codec.parameter_sets();
        assert!(params.is_complete());
        assert_eq!(params.sps.as_deref(), Some(SPS));
        assert_eq!(params.pps.as_deref(), Some(PPS));
    }

    #[test]
    fn test_keyframe_gets_parameter_sets() {
        let mut params = ParameterSets::default();
        params.observe(SPS);
        params.observe(PPS);

        let bare = AccessUnit::from_nals([IDR]);
        let completed = params.complete_keyframe(bare);
        assert_eq!(completed.nal_units().collect::<Vec<_>>(), vec![SPS, PPS, IDR]);

        let delta = AccessUnit::from_nals([P_SLICE]);
        assert_eq!(params.complete_keyframe(delta.clone()), delta);
    }

    #[test]
    fn test_truncated_stream_ends() {
        let mut stream = encode_length_prefixed([SPS, IDR]);
        stream.truncate(stream.len() - 2);
        let mut reader = NalReader::new(Cursor::new(stream));
        assert!(reader.next_nal().unwrap().is_some());
        assert!(reader.next_nal().unwrap().is_none());
    }

    #[test]
    fn test_oversized_length_rejected() {
        let stream = 0xFFFF_FFFFu32.to_be_bytes().to_vec();
        let mut reader = NalReader::new(Cursor::new(stream));
        let err = reader.next_nal().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }
}
