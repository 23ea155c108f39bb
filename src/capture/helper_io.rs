//! Blocking pumps for helper output streams
//!
//! stdout carries length-prefixed H.264 (video helpers) and stderr carries
//! the tagged channel stream. Both pumps run on the blocking pool inside a
//! [`CaptureSession`](super::session::CaptureSession) and return at EOF.

use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::channel::{AudioPacket, ChannelDecoder, ChannelPacket, ChannelStats, LogRecord, LogSeverity};
use super::session::SourceKind;
use super::MediaSink;
use crate::utils::LogThrottler;
use crate::video::nal::{NalReader, NalUnitCodec};
use crate::webrtc::stream::StreamKind;
use crate::warn_throttled;

/// Video pump counters
#[derive(Debug, Default)]
pub struct VideoPumpStats {
    units: AtomicU64,
    keyframes: AtomicU64,
    send_errors: AtomicU64,
}

impl VideoPumpStats {
    pub fn units(&self) -> u64 {
        self.units.load(Ordering::Relaxed)
    }

    pub fn keyframes(&self) -> u64 {
        self.keyframes.load(Ordering::Relaxed)
    }

    pub fn send_errors(&self) -> u64 {
        self.send_errors.load(Ordering::Relaxed)
    }
}

/// Re-emit a helper log line through tracing
pub fn log_helper_record(kind: SourceKind, record: &LogRecord) {
    let source = kind.as_str();
    let message = record.message.trim_end();
    match record.severity {
        LogSeverity::Debug => debug!(source, "{}", message),
        LogSeverity::Info => tracing::info!(source, "{}", message),
        LogSeverity::Warning => warn!(source, "{}", message),
        LogSeverity::Error => tracing::error!(source, "{}", message),
    }
}

/// Turn a length-prefixed NAL stream into access units and send them
pub fn pump_video<R: Read>(
    reader: R,
    stream: StreamKind,
    sink: &dyn MediaSink,
    stats: &VideoPumpStats,
    cancel: &CancellationToken,
) {
    let mut nals = NalReader::new(reader);
    let mut codec = NalUnitCodec::new();
    let throttler = LogThrottler::default();

    while !cancel.is_cancelled() {
        let nal = match nals.next_nal() {
            Ok(Some(nal)) => nal,
            Ok(None) => break,
            Err(e) => {
                warn!("{} stream read failed: {}", stream, e);
                break;
            }
        };

        let Some(unit) = codec.push(&nal) else {
            continue;
        };
        let keyframe = unit.keyframe;
        match sink.send_access_unit(stream, unit) {
            Ok(packets) => {
                stats.units.fetch_add(1, Ordering::Relaxed);
                if keyframe {
                    stats.keyframes.fetch_add(1, Ordering::Relaxed);
                }
                trace!(%stream, packets, keyframe, "Sent access unit");
            }
            Err(e) => {
                stats.send_errors.fetch_add(1, Ordering::Relaxed);
                warn_throttled!(throttler, "send", "Failed to send {} access unit: {}", stream, e);
            }
        }
    }

    // Whatever is still pending has no slice and is not a frame
    debug!("{} video pump finished after {} units", stream, stats.units());
}

/// Decode the tagged channel stream, handing audio to `on_audio`
///
/// Log records are re-emitted; preview frames are counted and dropped.
pub fn pump_channel<R: Read, F: FnMut(AudioPacket)>(
    reader: R,
    kind: SourceKind,
    stats: Arc<ChannelStats>,
    cancel: &CancellationToken,
    mut on_audio: F,
) {
    let mut decoder = ChannelDecoder::with_stats(reader, stats);
    let mut previews = 0u64;

    while !cancel.is_cancelled() {
        match decoder.next_packet() {
            Ok(Some(ChannelPacket::Audio(packet))) => on_audio(packet),
            Ok(Some(ChannelPacket::Preview(frame))) => {
                previews += 1;
                trace!(source = kind.as_str(), width = frame.width, height = frame.height, "Preview frame");
            }
            Ok(Some(ChannelPacket::Log(record))) => log_helper_record(kind, &record),
            Ok(None) => break,
            Err(e) => {
                debug!("{} channel read failed: {}", kind, e);
                break;
            }
        }
    }

    debug!(
        previews,
        skipped = decoder.skipped_bytes(),
        "{} channel pump finished",
        kind
    );
}
