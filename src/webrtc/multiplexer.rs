//! Stream multiplexing over one relay session
//!
//! Send side: up to four producer threads (mic, screen audio, camera,
//! screen) call in concurrently. Each logical stream has its own slot lock,
//! so producers never contend with each other; packetization runs
//! synchronously on the caller's thread and the finished packets go to a
//! [`PacketSink`].
//!
//! Receive side: packets are classified purely by payload type, video is
//! reassembled per SSRC, and completed media is handed to a
//! [`MediaHandler`] together with whatever identity the SSRC currently maps
//! to.

use bytes::Bytes;
use parking_lot::Mutex;
use rtp::header::Header;
use rtp::packet::Packet;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use super::fragmenter::H264Fragmenter;
use super::identity::{Identity, ScreenDecision, StreamIdentityTable};
use super::reassembler::{H264Reassembler, ReassemblyStats};
use super::stream::{PayloadTypeMap, StreamKind, StreamSendStats, StreamSlot, AUDIO_FRAME_SAMPLES};
use crate::error::{AppError, Result};
use crate::utils::LogThrottler;
use crate::video::nal::{AccessUnit, ParameterSets};
use crate::warn_throttled;

/// Destination for outbound RTP packets
pub trait PacketSink: Send + Sync {
    fn send_packet(&self, kind: StreamKind, packet: Packet) -> Result<()>;
}

/// Default video frame rate until a source reports its own
const DEFAULT_FPS: u32 = 30;

struct SendState {
    slot: StreamSlot,
    params: ParameterSets,
    frame_ticks: u32,
}

/// Send-side slot owner
pub struct StreamMultiplexer {
    states: [Mutex<SendState>; 4],
    fragmenter: H264Fragmenter,
    sink: Arc<dyn PacketSink>,
    throttler: LogThrottler,
}

fn slot_index(kind: StreamKind) -> usize {
    match kind {
        StreamKind::MicAudio => 0,
        StreamKind::ScreenAudio => 1,
        StreamKind::CameraVideo => 2,
        StreamKind::ScreenVideo => 3,
    }
}

impl StreamMultiplexer {
    /// Allocate one slot per stream kind with random SSRCs
    pub fn new(payload_types: PayloadTypeMap, max_payload: usize, sink: Arc<dyn PacketSink>) -> Self {
        Self::with_slots(
            StreamKind::ALL.map(|kind| StreamSlot::new(kind, payload_types.payload_type(kind))),
            max_payload,
            sink,
        )
    }

    /// Use pre-built slots (ordered as [`StreamKind::ALL`])
    pub fn with_slots(slots: [StreamSlot; 4], max_payload: usize, sink: Arc<dyn PacketSink>) -> Self {
        Self {
            states: slots.map(|slot| {
                Mutex::new(SendState {
                    slot,
                    params: ParameterSets::default(),
                    frame_ticks: StreamSlot::frame_ticks(DEFAULT_FPS),
                })
            }),
            fragmenter: H264Fragmenter::new(max_payload),
            sink,
            throttler: LogThrottler::default(),
        }
    }

    /// Set the frame duration used to advance a video stream's clock
    pub fn set_frame_rate(&self, kind: StreamKind, fps: u32) {
        self.states[slot_index(kind)].lock().frame_ticks = StreamSlot::frame_ticks(fps);
    }

    pub fn ssrc(&self, kind: StreamKind) -> u32 {
        self.states[slot_index(kind)].lock().slot.ssrc
    }

    pub fn payload_type(&self, kind: StreamKind) -> u8 {
        self.states[slot_index(kind)].lock().slot.payload_type
    }

    pub fn stats(&self, kind: StreamKind) -> StreamSendStats {
        self.states[slot_index(kind)].lock().slot.stats
    }

    /// Fragment and send one access unit. Returns the packet count.
    ///
    /// A keyframe without SPS/PPS gets the stream's cached parameter sets.
    pub fn send_access_unit(&self, kind: StreamKind, unit: AccessUnit) -> Result<usize> {
        if !kind.is_video() {
            return Err(AppError::InvalidState(format!(
                "Access unit sent on audio stream {}",
                kind
            )));
        }

        let packets = {
            let mut state = self.states[slot_index(kind)].lock();
            for nal in unit.nal_units() {
                state.params.observe(nal);
            }
            let unit = state.params.complete_keyframe(unit);
            let frame_ticks = state.frame_ticks;
            self.fragmenter.packetize(&unit, &mut state.slot, frame_ticks)
        };

        let count = packets.len();
        trace!("{}: {} packets", kind, count);
        self.dispatch(kind, packets);
        Ok(count)
    }

    /// Send one encoded 20ms audio frame
    pub fn send_audio_frame(&self, kind: StreamKind, frame: Bytes) -> Result<()> {
        if kind.is_video() {
            return Err(AppError::InvalidState(format!(
                "Audio frame sent on video stream {}",
                kind
            )));
        }

        let packet = {
            let mut state = self.states[slot_index(kind)].lock();
            let slot = &mut state.slot;
            let packet = Packet {
                header: Header {
                    version: 2,
                    marker: false,
                    payload_type: slot.payload_type,
                    sequence_number: slot.next_sequence(),
                    timestamp: slot.timestamp(),
                    ssrc: slot.ssrc,
                    ..Default::default()
                },
                payload: frame,
            };
            slot.advance(AUDIO_FRAME_SAMPLES);
            slot.stats.units_sent += 1;
            slot.stats.packets_sent += 1;
            slot.stats.bytes_sent += packet.payload.len() as u64;
            packet
        };

        self.dispatch(kind, vec![packet]);
        Ok(())
    }

    fn dispatch(&self, kind: StreamKind, packets: Vec<Packet>) {
        for packet in packets {
            if let Err(e) = self.sink.send_packet(kind, packet) {
                warn_throttled!(self.throttler, kind.track_id(), "Failed to send {} packet: {}", kind, e);
                return;
            }
        }
    }
}

/// Reassembled inbound video frame
#[derive(Debug, Clone)]
pub struct InboundVideo {
    pub ssrc: u32,
    pub kind: StreamKind,
    pub identity: Identity,
    pub timestamp: u32,
    pub unit: AccessUnit,
}

/// Inbound encoded audio frame
#[derive(Debug, Clone)]
pub struct InboundAudio {
    pub ssrc: u32,
    pub kind: StreamKind,
    pub identity: Identity,
    pub timestamp: u32,
    pub sequence: u16,
    pub payload: Bytes,
}

/// Consumer of inbound media
pub trait MediaHandler: Send + Sync {
    fn on_video(&self, frame: InboundVideo);
    fn on_audio(&self, frame: InboundAudio);

    /// The track carrying `ssrc` ended; drop any per-stream state
    fn on_stream_ended(&self, _ssrc: u32) {}
}

/// What happened to one inbound packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Completed a video access unit that was delivered
    VideoDelivered,
    /// Buffered in the reassembler (or dropped as part of an incomplete unit)
    VideoPending,
    AudioDelivered,
    /// Payload type not in the table
    UnknownPayloadType,
    /// Screen video from a participant nobody is watching
    ScreenDiscarded,
}

/// Per-SSRC receive counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboundStats {
    pub kind: StreamKind,
    pub packets: u64,
    pub reassembly: ReassemblyStats,
}

struct InboundStream {
    kind: StreamKind,
    packets: u64,
    reassembler: H264Reassembler,
}

impl InboundStream {
    fn new(kind: StreamKind) -> Self {
        Self {
            kind,
            packets: 0,
            reassembler: H264Reassembler::new(),
        }
    }
}

/// Receive-side demultiplexer
pub struct ReceiveDemux {
    payload_types: PayloadTypeMap,
    identities: Arc<StreamIdentityTable>,
    handler: Arc<dyn MediaHandler>,
    streams: Mutex<HashMap<u32, Arc<Mutex<InboundStream>>>>,
    /// The one screen-video SSRC without a known owner allowed through
    unresolved_screen: Mutex<Option<u32>>,
    unknown_payload_types: AtomicU64,
    screen_discarded: AtomicU64,
}

impl ReceiveDemux {
    pub fn new(
        payload_types: PayloadTypeMap,
        identities: Arc<StreamIdentityTable>,
        handler: Arc<dyn MediaHandler>,
    ) -> Self {
        Self {
            payload_types,
            identities,
            handler,
            streams: Mutex::new(HashMap::new()),
            unresolved_screen: Mutex::new(None),
            unknown_payload_types: AtomicU64::new(0),
            screen_discarded: AtomicU64::new(0),
        }
    }

    pub fn identities(&self) -> &Arc<StreamIdentityTable> {
        &self.identities
    }

    /// Handle one inbound packet on the caller's thread
    pub fn handle_packet(&self, packet: &Packet) -> Disposition {
        let ssrc = packet.header.ssrc;
        let Some(kind) = self.payload_types.kind_for(packet.header.payload_type) else {
            let n = self.unknown_payload_types.fetch_add(1, Ordering::Relaxed);
            if n == 0 {
                debug!(
                    "Dropping packet with unknown payload type {} (ssrc {})",
                    packet.header.payload_type, ssrc
                );
            }
            return Disposition::UnknownPayloadType;
        };

        let identity = if kind == StreamKind::ScreenVideo {
            let (identity, decision) = self.identities.screen_decision(ssrc);
            if !self.admit_screen(ssrc, decision) {
                self.discard_screen(ssrc);
                return Disposition::ScreenDiscarded;
            }
            identity
        } else {
            self.identities.resolve(ssrc)
        };

        let stream = self.stream(ssrc, kind);

        if !kind.is_video() {
            stream.lock().packets += 1;
            self.handler.on_audio(InboundAudio {
                ssrc,
                kind,
                identity,
                timestamp: packet.header.timestamp,
                sequence: packet.header.sequence_number,
                payload: packet.payload.clone(),
            });
            return Disposition::AudioDelivered;
        }

        let unit = {
            let mut stream = stream.lock();
            stream.packets += 1;
            stream.reassembler.push(packet)
        };

        match unit {
            Some(unit) => {
                self.handler.on_video(InboundVideo {
                    ssrc,
                    kind,
                    identity,
                    timestamp: packet.header.timestamp,
                    unit,
                });
                Disposition::VideoDelivered
            }
            None => Disposition::VideoPending,
        }
    }

    fn stream(&self, ssrc: u32, kind: StreamKind) -> Arc<Mutex<InboundStream>> {
        let mut streams = self.streams.lock();
        let stream = streams
            .entry(ssrc)
            .or_insert_with(|| Arc::new(Mutex::new(InboundStream::new(kind))))
            .clone();
        drop(streams);

        {
            let mut guard = stream.lock();
            if guard.kind != kind {
                debug!("SSRC {} changed kind {} -> {}", ssrc, guard.kind, kind);
                *guard = InboundStream::new(kind);
            }
        }
        stream
    }

    /// At most one screen stream renders: the selected owner's, or a single
    /// stream whose owner is not known yet.
    fn admit_screen(&self, ssrc: u32, decision: ScreenDecision) -> bool {
        let mut claim = self.unresolved_screen.lock();
        match decision {
            ScreenDecision::Unresolved => match *claim {
                Some(owner) if owner != ssrc => false,
                _ => {
                    *claim = Some(ssrc);
                    true
                }
            },
            resolved => {
                if *claim == Some(ssrc) {
                    *claim = None;
                }
                resolved == ScreenDecision::Selected
            }
        }
    }

    fn discard_screen(&self, ssrc: u32) {
        self.screen_discarded.fetch_add(1, Ordering::Relaxed);
        // Stale fragments must not leak into the unit that follows a later
        // selection, so the reassembler starts over.
        if let Some(stream) = self.streams.lock().remove(&ssrc) {
            trace!("Reset reassembly for unselected screen ssrc {}", ssrc);
            drop(stream);
        }
    }

    /// Forget an SSRC (track ended)
    pub fn remove_ssrc(&self, ssrc: u32) {
        self.streams.lock().remove(&ssrc);
        {
            let mut claim = self.unresolved_screen.lock();
            if *claim == Some(ssrc) {
                *claim = None;
            }
        }
        self.handler.on_stream_ended(ssrc);
    }

    pub fn stream_stats(&self, ssrc: u32) -> Option<InboundStats> {
        let stream = self.streams.lock().get(&ssrc).cloned()?;
        let stream = stream.lock();
        Some(InboundStats {
            kind: stream.kind,
            packets: stream.packets,
            reassembly: stream.reassembler.stats(),
        })
    }

    pub fn unknown_payload_types(&self) -> u64 {
        self.unknown_payload_types.load(Ordering::Relaxed)
    }

    pub fn screen_discarded(&self) -> u64 {
        self.screen_discarded.load(Ordering::Relaxed)
    }
}
