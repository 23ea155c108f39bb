//! H.264 RTP depacketization for one SSRC
//!
//! Rebuilds access units from single-NAL, STAP-A and FU-A packets. A unit
//! is handed out only when its marker packet arrives intact. When the
//! timestamp moves on before a marker was seen, the unfinished unit is
//! abandoned and counted as dropped. A sequence gap taints whichever unit
//! the next packet belongs to, including one that is just starting, since
//! the lost packets may have been its leading NAL units.

use bytes::{BufMut, Bytes, BytesMut};
use rtp::packet::Packet;
use tracing::trace;

use super::fragmenter::FU_A_TYPE;
use crate::video::nal::AccessUnit;

const STAP_A_TYPE: u8 = 24;

/// Reassembly counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblyStats {
    pub packets: u64,
    pub units_completed: u64,
    /// Units abandoned because of loss, a missing marker or a bad fragment
    pub units_dropped: u64,
}

/// Per-SSRC reassembly state
#[derive(Debug, Default)]
pub struct H264Reassembler {
    timestamp: Option<u32>,
    expected_sequence: Option<u16>,
    nals: Vec<Bytes>,
    fragment: Option<BytesMut>,
    corrupt: bool,
    stats: ReassemblyStats,
}

impl H264Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> ReassemblyStats {
        self.stats
    }

    /// Feed one packet in arrival order; returns a unit when one completes
    pub fn push(&mut self, packet: &Packet) -> Option<AccessUnit> {
        self.stats.packets += 1;
        let header = &packet.header;

        if self.timestamp.is_some_and(|ts| ts != header.timestamp) {
            trace!(
                "Timestamp changed {} -> {} without marker, abandoning unit",
                self.timestamp.unwrap_or_default(),
                header.timestamp
            );
            self.abandon();
        }

        if let Some(expected) = self.expected_sequence {
            if expected != header.sequence_number {
                trace!(
                    "Sequence gap: expected {}, got {}",
                    expected,
                    header.sequence_number
                );
                self.corrupt = true;
            }
        }
        self.expected_sequence = Some(header.sequence_number.wrapping_add(1));
        self.timestamp = Some(header.timestamp);

        self.depacketize(&packet.payload);

        if header.marker {
            return self.complete();
        }
        None
    }

    fn has_pending(&self) -> bool {
        !self.nals.is_empty() || self.fragment.is_some() || self.corrupt
    }

    fn depacketize(&mut self, payload: &[u8]) {
        let Some(&first) = payload.first() else {
            return;
        };

        match first & 0x1F {
            FU_A_TYPE => self.push_fragment(payload),
            STAP_A_TYPE => self.push_aggregate(&payload[1..]),
            0 | 25..=31 => {
                // Reserved or unsupported aggregation types
                self.corrupt = true;
            }
            _ => {
                if self.fragment.take().is_some() {
                    self.corrupt = true;
                }
                self.nals.push(Bytes::copy_from_slice(payload));
            }
        }
    }

    fn push_fragment(&mut self, payload: &[u8]) {
        if payload.len() < 2 {
            self.corrupt = true;
            return;
        }
        let indicator = payload[0];
        let fu_header = payload[1];
        let data = &payload[2..];
        let start = fu_header & 0x80 != 0;
        let end = fu_header & 0x40 != 0;

        if start {
            if self.fragment.is_some() {
                self.corrupt = true;
            }
            let mut buf = BytesMut::with_capacity(1 + data.len());
            buf.put_u8((indicator & 0xE0) | (fu_header & 0x1F));
            buf.put_slice(data);
            self.fragment = Some(buf);
        } else {
            match self.fragment.as_mut() {
                Some(buf) => buf.put_slice(data),
                None => {
                    // Middle or end without a start
                    self.corrupt = true;
                    return;
                }
            }
        }

        if end {
            if let Some(buf) = self.fragment.take() {
                self.nals.push(buf.freeze());
            }
        }
    }

    fn push_aggregate(&mut self, mut body: &[u8]) {
        while body.len() >= 2 {
            let size = u16::from_be_bytes([body[0], body[1]]) as usize;
            body = &body[2..];
            if size == 0 || size > body.len() {
                self.corrupt = true;
                return;
            }
            self.nals.push(Bytes::copy_from_slice(&body[..size]));
            body = &body[size..];
        }
        if !body.is_empty() {
            self.corrupt = true;
        }
    }

    fn complete(&mut self) -> Option<AccessUnit> {
        let intact = !self.corrupt && self.fragment.is_none() && !self.nals.is_empty();
        let nals = std::mem::take(&mut self.nals);
        self.reset_unit();

        if intact {
            self.stats.units_completed += 1;
            Some(AccessUnit::from_nals(nals))
        } else {
            self.stats.units_dropped += 1;
            None
        }
    }

    fn abandon(&mut self) {
        if self.has_pending() {
            self.stats.units_dropped += 1;
        }
        self.nals.clear();
        self.reset_unit();
    }

    fn reset_unit(&mut self) {
        self.timestamp = None;
        self.fragment = None;
        self.corrupt = false;
    }
}
