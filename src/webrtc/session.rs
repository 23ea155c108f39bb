//! Relay session
//!
//! One WebRTC peer connection to the relay carries all four logical
//! streams. The relay sends the offer; this side answers with its tracks and
//! gathered candidates. Lifecycle:
//!
//! ```text
//! New --offer--> Negotiating --connected--> Connected
//!                     |                        |
//!                     +--failure--> Failed <---+---disconnect--> Disconnected
//!                                     |                               |
//!                                     +-----------> Closed <----------+
//! ```
//!
//! `Failed` and `Disconnected` are not retried here. The owner tears the
//! session down and negotiates a fresh one.

use bytes::Bytes;
use parking_lot::Mutex;
use rtp::packet::Packet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_remote::TrackRemote;

use super::config::ice_servers;
use super::identity::StreamIdentityTable;
use super::multiplexer::{MediaHandler, PacketSink, ReceiveDemux, StreamMultiplexer};
use super::signaling::{ClientMessage, IceCandidate, RelayMessage, SdpAnswer, SdpOffer};
use super::stream::{PayloadTypeMap, StreamKind, StreamSlot, AUDIO_CLOCK_RATE, VIDEO_CLOCK_RATE};
use crate::config::RelayConfig;
use crate::error::{AppError, Result};
use crate::events::{EventBus, MediaEvent};
use crate::video::nal::AccessUnit;

/// Stream id shared by all local tracks
const STREAM_ID: &str = "confab";

/// Outbound packets buffered per track before the producer starts dropping
const TRACK_QUEUE_DEPTH: usize = 512;

const H264_FMTP: &str = "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";
const OPUS_FMTP: &str = "minptime=10;useinbandfec=1";

/// Relay session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    New,
    Negotiating,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::New => write!(f, "new"),
            SessionState::Negotiating => write!(f, "negotiating"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Failed => write!(f, "failed"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// Inputs to the session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    OfferReceived,
    TransportConnected,
    TransportDisconnected,
    TransportFailed,
    NegotiationFailed,
    Close,
}

impl SessionState {
    /// Next state, or `None` when `event` does not apply in this state
    pub fn transition(self, event: SessionEvent) -> Option<SessionState> {
        use SessionEvent as E;
        use SessionState as S;

        match (self, event) {
            (S::Closed, _) => None,
            (_, E::Close) => Some(S::Closed),
            (S::New, E::OfferReceived) => Some(S::Negotiating),
            (S::Negotiating, E::TransportConnected) => Some(S::Connected),
            (S::Negotiating, E::NegotiationFailed | E::TransportFailed) => Some(S::Failed),
            (S::Connected, E::TransportDisconnected) => Some(S::Disconnected),
            (S::Connected | S::Disconnected, E::TransportFailed) => Some(S::Failed),
            _ => None,
        }
    }

    /// Owner must tear down and renegotiate
    pub fn needs_renegotiation(&self) -> bool {
        matches!(self, SessionState::Disconnected | SessionState::Failed)
    }
}

/// Packet sink feeding the per-track writer tasks
struct TrackSink {
    queues: HashMap<StreamKind, mpsc::Sender<Packet>>,
}

impl PacketSink for TrackSink {
    fn send_packet(&self, kind: StreamKind, packet: Packet) -> Result<()> {
        let queue = self
            .queues
            .get(&kind)
            .ok_or_else(|| AppError::WebRtcError(format!("No track for {}", kind)))?;
        queue.try_send(packet).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                AppError::WebRtcError(format!("{} send queue full", kind))
            }
            mpsc::error::TrySendError::Closed(_) => {
                AppError::WebRtcError(format!("{} track closed", kind))
            }
        })
    }
}

/// Shared state-machine handle used from peer connection callbacks
#[derive(Clone)]
struct StateCell {
    tx: Arc<watch::Sender<SessionState>>,
    events: Arc<EventBus>,
}

impl StateCell {
    /// Apply an event; returns the new state if it changed
    fn apply(&self, event: SessionEvent) -> Option<SessionState> {
        let mut next = None;
        self.tx.send_if_modified(|state| match state.transition(event) {
            Some(to) if to != *state => {
                debug!("Relay session {} -> {} ({:?})", state, to, event);
                *state = to;
                next = Some(to);
                true
            }
            _ => false,
        });

        if let Some(state) = next {
            info!("Relay session state: {}", state);
            self.events.publish(MediaEvent::RelayStateChanged { state });
        }
        next
    }

    fn get(&self) -> SessionState {
        *self.tx.borrow()
    }
}

/// The single transport session to the relay
pub struct RelaySession {
    pc: Arc<RTCPeerConnection>,
    multiplexer: Arc<StreamMultiplexer>,
    demux: Arc<ReceiveDemux>,
    state: StateCell,
    candidates: Arc<Mutex<Vec<IceCandidate>>>,
    gathering_timeout: Duration,
    cancel: CancellationToken,
}

impl RelaySession {
    /// Create the peer connection, register codecs and add the four local
    /// tracks. No network activity happens until an offer is handled.
    pub async fn new(
        config: &RelayConfig,
        identities: Arc<StreamIdentityTable>,
        handler: Arc<dyn MediaHandler>,
        events: Arc<EventBus>,
    ) -> Result<Self> {
        let payload_types = PayloadTypeMap::new(config.payload_types);

        let mut media_engine = MediaEngine::default();
        for kind in StreamKind::ALL {
            let codec_type = if kind.is_video() {
                RTPCodecType::Video
            } else {
                RTPCodecType::Audio
            };
            media_engine
                .register_codec(
                    RTCRtpCodecParameters {
                        capability: codec_capability(kind),
                        payload_type: payload_types.payload_type(kind),
                        ..Default::default()
                    },
                    codec_type,
                )
                .map_err(|e| {
                    AppError::WebRtcError(format!("Failed to register {} codec: {}", kind, e))
                })?;
        }

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            AppError::WebRtcError(format!("Failed to register interceptors: {}", e))
        })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers(&config.stun_servers, &config.turn_servers),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            AppError::WebRtcError(format!("Failed to create peer connection: {}", e))
        })?);

        let cancel = CancellationToken::new();
        let mut queues = HashMap::new();
        let mut slots = Vec::with_capacity(StreamKind::ALL.len());

        for kind in StreamKind::ALL {
            let track = Arc::new(TrackLocalStaticRTP::new(
                codec_capability(kind),
                kind.track_id().to_string(),
                STREAM_ID.to_string(),
            ));
            let sender = pc.add_track(track.clone()).await.map_err(|e| {
                AppError::WebRtcError(format!("Failed to add {} track: {}", kind, e))
            })?;

            // The sender's SSRC is what the relay sees on the wire
            let params = sender.get_parameters().await;
            let ssrc = params
                .encodings
                .first()
                .map(|e| e.ssrc)
                .unwrap_or_else(rand::random);
            slots.push(StreamSlot::with_initial(
                kind,
                payload_types.payload_type(kind),
                ssrc,
                rand::random(),
                rand::random(),
            ));
            debug!("Local {} track ssrc={}", kind, ssrc);

            // Drain RTCP so interceptors keep working
            let rtcp_cancel = cancel.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                loop {
                    tokio::select! {
                        _ = rtcp_cancel.cancelled() => break,
                        result = sender.read(&mut buf) => {
                            if result.is_err() {
                                break;
                            }
                        }
                    }
                }
            });

            let (tx, rx) = mpsc::channel(TRACK_QUEUE_DEPTH);
            queues.insert(kind, tx);
            tokio::spawn(track_writer(kind, track, rx, cancel.clone()));
        }

        let slots: [StreamSlot; 4] = slots
            .try_into()
            .map_err(|_| AppError::Internal("Stream slot allocation failed".to_string()))?;
        let multiplexer = Arc::new(StreamMultiplexer::with_slots(
            slots,
            config.max_payload_size,
            Arc::new(TrackSink { queues }),
        ));
        let demux = Arc::new(ReceiveDemux::new(payload_types, identities, handler));

        let (state_tx, _) = watch::channel(SessionState::New);
        let session = Self {
            pc,
            multiplexer,
            demux,
            state: StateCell {
                tx: Arc::new(state_tx),
                events,
            },
            candidates: Arc::new(Mutex::new(Vec::new())),
            gathering_timeout: Duration::from_millis(config.ice_gathering_timeout_ms),
            cancel,
        };
        session.setup_event_handlers();

        Ok(session)
    }

    fn setup_event_handlers(&self) {
        let state = self.state.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let state = state.clone();
                Box::pin(async move {
                    let event = match s {
                        RTCPeerConnectionState::Connected => SessionEvent::TransportConnected,
                        RTCPeerConnectionState::Disconnected => SessionEvent::TransportDisconnected,
                        RTCPeerConnectionState::Failed => SessionEvent::TransportFailed,
                        RTCPeerConnectionState::Closed => SessionEvent::Close,
                        other => {
                            trace!("Peer connection state {:?}", other);
                            return;
                        }
                    };
                    if state.apply(event).is_none() {
                        debug!("Ignoring {:?} in state {}", event, state.get());
                    }
                })
            }));

        let candidates = self.candidates.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let candidates = candidates.clone();
                Box::pin(async move {
                    let Some(c) = candidate else {
                        return;
                    };
                    match c.to_json() {
                        Ok(init) => {
                            debug!("ICE candidate: {}", init.candidate);
                            candidates.lock().push(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            });
                        }
                        Err(e) => warn!("Failed to serialize ICE candidate: {}", e),
                    }
                })
            }));

        let demux = self.demux.clone();
        let cancel = self.cancel.clone();
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _| {
                let demux = demux.clone();
                let cancel = cancel.clone();
                Box::pin(async move {
                    info!(
                        "Inbound track ssrc={} codec={} pt={}",
                        track.ssrc(),
                        track.codec().capability.mime_type,
                        track.payload_type()
                    );
                    tokio::spawn(track_reader(track, demux, cancel));
                })
            },
        ));
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Subscribe to state changes
    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.state.tx.subscribe()
    }

    pub fn multiplexer(&self) -> &Arc<StreamMultiplexer> {
        &self.multiplexer
    }

    pub fn demux(&self) -> &Arc<ReceiveDemux> {
        &self.demux
    }

    /// Answer the relay's offer.
    ///
    /// Waits up to the gathering timeout for local candidates. Any failure
    /// here moves the session to `Failed`; a new session is required.
    pub async fn handle_offer(&self, offer: SdpOffer) -> Result<SdpAnswer> {
        let current = self.state.get();
        if self.state.apply(SessionEvent::OfferReceived).is_none() {
            return Err(AppError::InvalidState(format!(
                "Offer received in state {}",
                current
            )));
        }

        match self.negotiate(offer).await {
            Ok(answer) => Ok(answer),
            Err(e) => {
                warn!("Negotiation failed: {}", e);
                self.state.apply(SessionEvent::NegotiationFailed);
                Err(match e {
                    AppError::NegotiationFailed(_) => e,
                    other => AppError::NegotiationFailed(other.to_string()),
                })
            }
        }
    }

    async fn negotiate(&self, offer: SdpOffer) -> Result<SdpAnswer> {
        offer.validate()?;

        let sdp = RTCSessionDescription::offer(offer.sdp)
            .map_err(|e| AppError::NegotiationFailed(format!("Invalid SDP offer: {}", e)))?;
        self.pc.set_remote_description(sdp).await.map_err(|e| {
            AppError::NegotiationFailed(format!("Failed to set remote description: {}", e))
        })?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| AppError::NegotiationFailed(format!("Failed to create answer: {}", e)))?;

        let mut gathering = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(answer).await.map_err(|e| {
            AppError::NegotiationFailed(format!("Failed to set local description: {}", e))
        })?;

        if tokio::time::timeout(self.gathering_timeout, gathering.recv())
            .await
            .is_err()
        {
            debug!(
                "ICE gathering still running after {:?}, answering with partial candidates",
                self.gathering_timeout
            );
        }

        let candidates = self.candidates.lock().clone();
        if candidates.is_empty() {
            return Err(AppError::NegotiationFailed(
                "No reachable candidates gathered".to_string(),
            ));
        }

        let local = self.pc.local_description().await.ok_or_else(|| {
            AppError::NegotiationFailed("Local description unavailable".to_string())
        })?;

        info!("Answering relay offer with {} candidates", candidates.len());
        Ok(SdpAnswer::with_candidates(local.sdp, candidates))
    }

    /// Add a trickled relay candidate
    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to add ICE candidate: {}", e)))
    }

    /// Dispatch one relay signaling message. Returns the reply, if any.
    pub async fn handle_relay_message(&self, message: RelayMessage) -> Result<Option<ClientMessage>> {
        match message {
            RelayMessage::Offer(offer) => {
                let answer = self.handle_offer(offer).await?;
                Ok(Some(ClientMessage::Answer(answer)))
            }
            RelayMessage::Candidate(candidate) => {
                self.add_ice_candidate(candidate).await?;
                Ok(None)
            }
            RelayMessage::SsrcMapping(mapping) => {
                self.demux.identities().apply(mapping);
                Ok(None)
            }
            RelayMessage::SsrcMappings { mappings } => {
                let changed = self.demux.identities().apply_batch(mappings);
                debug!("Applied {} SSRC mappings from batch", changed);
                Ok(None)
            }
            RelayMessage::ParticipantLeft { participant } => {
                let removed = self.demux.identities().remove_participant(&participant);
                debug!("Participant {} left, {} routes removed", participant, removed);
                Ok(None)
            }
            RelayMessage::Close => {
                self.close().await?;
                Ok(None)
            }
        }
    }

    /// Send one access unit on a video stream (called from capture threads)
    pub fn send_access_unit(&self, kind: StreamKind, unit: AccessUnit) -> Result<usize> {
        self.multiplexer.send_access_unit(kind, unit)
    }

    /// Send one encoded audio frame (called from capture threads)
    pub fn send_audio_frame(&self, kind: StreamKind, frame: Bytes) -> Result<()> {
        self.multiplexer.send_audio_frame(kind, frame)
    }

    /// Close the peer connection and stop all track tasks
    pub async fn close(&self) -> Result<()> {
        self.state.apply(SessionEvent::Close);
        self.cancel.cancel();
        self.pc
            .close()
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to close peer connection: {}", e)))?;
        info!("Relay session closed");
        Ok(())
    }
}

fn codec_capability(kind: StreamKind) -> RTCRtpCodecCapability {
    if kind.is_video() {
        RTCRtpCodecCapability {
            mime_type: kind.mime_type().to_string(),
            clock_rate: VIDEO_CLOCK_RATE,
            channels: 0,
            sdp_fmtp_line: H264_FMTP.to_string(),
            rtcp_feedback: vec![],
        }
    } else {
        RTCRtpCodecCapability {
            mime_type: kind.mime_type().to_string(),
            clock_rate: AUDIO_CLOCK_RATE,
            channels: 2,
            sdp_fmtp_line: OPUS_FMTP.to_string(),
            rtcp_feedback: vec![],
        }
    }
}

/// Forward queued packets to the local track until cancelled
async fn track_writer(
    kind: StreamKind,
    track: Arc<TrackLocalStaticRTP>,
    mut rx: mpsc::Receiver<Packet>,
    cancel: CancellationToken,
) {
    let mut errors = 0u64;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            packet = rx.recv() => {
                let Some(packet) = packet else { break };
                if let Err(e) = track.write_rtp(&packet).await {
                    errors += 1;
                    if errors == 1 || errors % 500 == 0 {
                        debug!("{} write_rtp failed ({} total): {}", kind, errors, e);
                    }
                }
            }
        }
    }
    debug!("{} track writer stopped", kind);
}

/// Read RTP from one inbound track into the demultiplexer
async fn track_reader(track: Arc<TrackRemote>, demux: Arc<ReceiveDemux>, cancel: CancellationToken) {
    let ssrc = track.ssrc();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = track.read_rtp() => {
                match result {
                    Ok((packet, _)) => {
                        demux.handle_packet(&packet);
                    }
                    Err(e) => {
                        debug!("Inbound track {} ended: {}", ssrc, e);
                        break;
                    }
                }
            }
        }
    }
    demux.remove_ssrc(ssrc);
}
