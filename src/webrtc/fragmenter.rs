//! H.264 RTP packetization (RFC 6184)
//!
//! NAL units that fit the payload limit go out as single-NAL packets.
//! Larger ones are split into FU-A fragments:
//! ```text
//! +---------------+---------------+
//! |0|1|2|3|4|5|6|7|0|1|2|3|4|5|6|7|
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |F|NRI|  Type=28|S|E|R|  Type   |
//! +---------------+---------------+
//!   FU indicator     FU header
//! ```
//! The marker bit is set on the last packet of the last NAL of an access
//! unit, and every packet of a unit shares one timestamp.

use bytes::{BufMut, Bytes, BytesMut};
use rtp::header::Header;
use rtp::packet::Packet;

use super::stream::StreamSlot;
use crate::video::nal::AccessUnit;

/// FU-A NAL type
pub const FU_A_TYPE: u8 = 28;

/// FU indicator + FU header
pub const FU_A_HEADER_SIZE: usize = 2;

const FU_START: u8 = 0x80;
const FU_END: u8 = 0x40;

/// Splits access units into RTP packets
#[derive(Debug, Clone, Copy)]
pub struct H264Fragmenter {
    max_payload: usize,
}

impl H264Fragmenter {
    /// `max_payload` must leave room for the FU-A header plus one byte
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload: max_payload.max(FU_A_HEADER_SIZE + 1),
        }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// RTP payloads for one NAL unit
    pub fn payloads(&self, nal: &[u8]) -> Vec<Bytes> {
        if nal.is_empty() {
            return Vec::new();
        }
        if nal.len() <= self.max_payload {
            return vec![Bytes::copy_from_slice(nal)];
        }

        let header = nal[0];
        let indicator = (header & 0xE0) | FU_A_TYPE;
        let nal_type = header & 0x1F;
        let body = &nal[1..];
        let chunk_size = self.max_payload - FU_A_HEADER_SIZE;

        let chunk_count = body.len().div_ceil(chunk_size);
        let mut payloads = Vec::with_capacity(chunk_count);
        for (i, chunk) in body.chunks(chunk_size).enumerate() {
            let mut fu_header = nal_type;
            if i == 0 {
                fu_header |= FU_START;
            }
            if i + 1 == chunk_count {
                fu_header |= FU_END;
            }

            let mut payload = BytesMut::with_capacity(FU_A_HEADER_SIZE + chunk.len());
            payload.put_u8(indicator);
            payload.put_u8(fu_header);
            payload.put_slice(chunk);
            payloads.push(payload.freeze());
        }
        payloads
    }

    /// Packetize one access unit on `slot`.
    ///
    /// All packets carry the slot's current timestamp; the slot clock then
    /// advances by `frame_ticks`.
    pub fn packetize(
        &self,
        unit: &AccessUnit,
        slot: &mut StreamSlot,
        frame_ticks: u32,
    ) -> Vec<Packet> {
        let payloads: Vec<Bytes> = unit
            .nal_units()
            .flat_map(|nal| self.payloads(nal))
            .collect();

        let timestamp = slot.timestamp();
        let last = payloads.len().saturating_sub(1);
        let packets: Vec<Packet> = payloads
            .into_iter()
            .enumerate()
            .map(|(i, payload)| Packet {
                header: Header {
                    version: 2,
                    marker: i == last,
                    payload_type: slot.payload_type,
                    sequence_number: slot.next_sequence(),
                    timestamp,
                    ssrc: slot.ssrc,
                    ..Default::default()
                },
                payload,
            })
            .collect();

        slot.advance(frame_ticks);
        slot.stats.units_sent += 1;
        slot.stats.packets_sent += packets.len() as u64;
        slot.stats.bytes_sent += packets.iter().map(|p| p.payload.len() as u64).sum::<u64>();
        if unit.keyframe {
            slot.stats.keyframes_sent += 1;
        }
        packets
    }
}
