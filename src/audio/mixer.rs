//! Playback mixer for inbound audio
//!
//! Decoded PCM is queued per SSRC. Each 20ms tick pulls one block from every
//! queue, scales it by the participant's volume and sums into an i32
//! accumulator that is clamped back to i16. Screen audio only reaches the
//! output while its participant's share is the selected one.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{CHANNELS, FRAME_SAMPLES, SAMPLE_RATE};
use crate::webrtc::identity::{Identity, ParticipantId, StreamIdentityTable};
use crate::webrtc::stream::StreamKind;

pub const MIN_VOLUME: f32 = 0.0;
pub const MAX_VOLUME: f32 = 3.0;
pub const DEFAULT_VOLUME: f32 = 1.0;

/// Interleaved samples in one mixed block
pub const BLOCK_LEN: usize = FRAME_SAMPLES * CHANNELS;

/// Per-participant playback gain
#[derive(Debug, Clone, Default)]
pub struct VolumeSettings {
    gains: HashMap<ParticipantId, f32>,
}

impl VolumeSettings {
    /// Set a participant's gain, clamped to [0, 3]; returns the stored value
    pub fn set(&mut self, participant: ParticipantId, gain: f32) -> f32 {
        let gain = if gain.is_finite() {
            gain.clamp(MIN_VOLUME, MAX_VOLUME)
        } else {
            DEFAULT_VOLUME
        };
        self.gains.insert(participant, gain);
        gain
    }

    pub fn get(&self, participant: &ParticipantId) -> f32 {
        self.gains.get(participant).copied().unwrap_or(DEFAULT_VOLUME)
    }

    pub fn reset(&mut self, participant: &ParticipantId) {
        self.gains.remove(participant);
    }
}

/// Mixer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MixerStats {
    pub blocks_mixed: u64,
    /// Samples dropped because a queue exceeded its cap
    pub overflow_samples: u64,
    /// Screen-audio samples discarded while unselected
    pub screen_discarded_samples: u64,
}

struct StreamQueue {
    kind: StreamKind,
    samples: VecDeque<i16>,
}

#[derive(Default)]
struct MixerState {
    queues: HashMap<u32, StreamQueue>,
    volumes: VolumeSettings,
    stats: MixerStats,
}

pub struct PlaybackMixer {
    identities: Arc<StreamIdentityTable>,
    max_queued: usize,
    state: Mutex<MixerState>,
}

impl PlaybackMixer {
    pub fn new(identities: Arc<StreamIdentityTable>, max_buffer_ms: u32) -> Self {
        let frames = (SAMPLE_RATE as usize * max_buffer_ms as usize / 1000).max(FRAME_SAMPLES);
        Self {
            identities,
            max_queued: frames * CHANNELS,
            state: Mutex::new(MixerState::default()),
        }
    }

    pub fn set_volume(&self, participant: ParticipantId, gain: f32) -> f32 {
        let stored = self.state.lock().volumes.set(participant.clone(), gain);
        debug!("Volume for {} set to {:.2}", participant, stored);
        stored
    }

    pub fn volume(&self, participant: &ParticipantId) -> f32 {
        self.state.lock().volumes.get(participant)
    }

    /// Queue decoded interleaved stereo PCM
    ///
    /// Returns false if the samples were discarded (unselected screen audio).
    pub fn push(&self, ssrc: u32, kind: StreamKind, identity: &Identity, pcm: &[i16]) -> bool {
        if kind == StreamKind::ScreenAudio && !self.identities.is_screen_selected(identity) {
            self.state.lock().stats.screen_discarded_samples += pcm.len() as u64;
            return false;
        }

        let mut state = self.state.lock();
        let queue = state.queues.entry(ssrc).or_insert_with(|| StreamQueue {
            kind,
            samples: VecDeque::with_capacity(BLOCK_LEN * 4),
        });
        queue.samples.extend(pcm.iter().copied());

        // Keep the newest audio; latency beats completeness here
        let excess = queue.samples.len().saturating_sub(self.max_queued);
        if excess > 0 {
            let excess = excess + excess % CHANNELS;
            queue.samples.drain(..excess.min(queue.samples.len()));
            state.stats.overflow_samples += excess as u64;
            trace!(ssrc, excess, "Mixer queue overflow");
        }
        true
    }

    /// Produce the next 20ms output block
    pub fn mix_block(&self) -> Vec<i16> {
        let mut acc = [0i32; BLOCK_LEN];
        let mut state = self.state.lock();
        let MixerState {
            queues,
            volumes,
            stats,
        } = &mut *state;

        for (&ssrc, queue) in queues.iter_mut() {
            let take = queue.samples.len().min(BLOCK_LEN);
            if take == 0 {
                continue;
            }
            let identity = self.identities.resolve(ssrc);

            if queue.kind == StreamKind::ScreenAudio && !self.identities.is_screen_selected(&identity)
            {
                queue.samples.drain(..take);
                stats.screen_discarded_samples += take as u64;
                continue;
            }

            let gain = identity
                .participant()
                .map(|p| volumes.get(p))
                .unwrap_or(DEFAULT_VOLUME);
            for (slot, sample) in acc.iter_mut().zip(queue.samples.drain(..take)) {
                *slot += (sample as f32 * gain) as i32;
            }
        }
        stats.blocks_mixed += 1;

        acc.iter()
            .map(|&s| s.clamp(i16::MIN as i32, i16::MAX as i32) as i16)
            .collect()
    }

    /// Drop the queue of a stream that ended
    pub fn remove_stream(&self, ssrc: u32) {
        self.state.lock().queues.remove(&ssrc);
    }

    pub fn queued_samples(&self, ssrc: u32) -> usize {
        self.state
            .lock()
            .queues
            .get(&ssrc)
            .map(|q| q.samples.len())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> MixerStats {
        self.state.lock().stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webrtc::identity::SsrcMapping;

    fn table_with(mappings: &[(u32, &str, StreamKind)]) -> Arc<StreamIdentityTable> {
        let table = Arc::new(StreamIdentityTable::new());
        for (ssrc, who, kind) in mappings {
            table.apply(SsrcMapping {
                ssrc: *ssrc,
                participant: ParticipantId::new(*who),
                kind: Some(*kind),
            });
        }
        table
    }

    fn constant(value: i16) -> Vec<i16> {
        vec![value; BLOCK_LEN]
    }

    #[test]
    fn test_volume_bounds() {
        let mut volumes = VolumeSettings::default();
        let alice = ParticipantId::new("alice");
        assert_eq!(volumes.get(&alice), 1.0);
        assert_eq!(volumes.set(alice.clone(), 5.0), 3.0);
        assert_eq!(volumes.set(alice.clone(), -2.0), 0.0);
        assert_eq!(volumes.set(alice.clone(), f32::INFINITY), 1.0);
        volumes.set(alice.clone(), 0.5);
        volumes.reset(&alice);
        assert_eq!(volumes.get(&alice), 1.0);
    }

    #[test]
    fn test_sum_scale_and_clamp() {
        let table = table_with(&[
            (1, "alice", StreamKind::MicAudio),
            (2, "bob", StreamKind::MicAudio),
        ]);
        let mixer = PlaybackMixer::new(table, 200);
        mixer.set_volume(ParticipantId::new("bob"), 2.0);

        let alice = Identity::Known(ParticipantId::new("alice"));
        let bob = Identity::Known(ParticipantId::new("bob"));
        mixer.push(1, StreamKind::MicAudio, &alice, &constant(1000));
        mixer.push(2, StreamKind::MicAudio, &bob, &constant(500));
        let block = mixer.mix_block();
        assert_eq!(block.len(), BLOCK_LEN);
        assert!(block.iter().all(|&s| s == 2000));

        mixer.push(1, StreamKind::MicAudio, &alice, &constant(30000));
        mixer.push(2, StreamKind::MicAudio, &bob, &constant(30000));
        assert!(mixer.mix_block().iter().all(|&s| s == i16::MAX));

        // Underrun yields silence
        assert!(mixer.mix_block().iter().all(|&s| s == 0));
    }

    #[test]
    fn test_unknown_identity_mixed_at_unity() {
        let mixer = PlaybackMixer::new(Arc::new(StreamIdentityTable::new()), 200);
        assert!(mixer.push(9, StreamKind::MicAudio, &Identity::Unknown, &constant(1234)));
        assert!(mixer.mix_block().iter().all(|&s| s == 1234));
    }

    #[test]
    fn test_queue_cap_keeps_newest() {
        let mixer = PlaybackMixer::new(Arc::new(StreamIdentityTable::new()), 40);
        for value in 1..=5 {
            mixer.push(1, StreamKind::MicAudio, &Identity::Unknown, &constant(value));
        }
        assert_eq!(mixer.queued_samples(1), 2 * BLOCK_LEN);
        assert_eq!(mixer.stats().overflow_samples, 3 * BLOCK_LEN as u64);
        assert!(mixer.mix_block().iter().all(|&s| s == 4));
        assert!(mixer.mix_block().iter().all(|&s| s == 5));
    }

    #[test]
    fn test_screen_audio_mixed_only_when_selected() {
        let table = table_with(&[(5, "carol", StreamKind::ScreenAudio)]);
        let mixer = PlaybackMixer::new(table.clone(), 200);
        let carol = Identity::Known(ParticipantId::new("carol"));

        assert!(!mixer.push(5, StreamKind::ScreenAudio, &carol, &constant(700)));
        assert!(mixer.mix_block().iter().all(|&s| s == 0));
        assert_eq!(mixer.stats().screen_discarded_samples, BLOCK_LEN as u64);

        table.select_screen(Some(ParticipantId::new("carol")));
        assert!(mixer.push(5, StreamKind::ScreenAudio, &carol, &constant(700)));
        assert!(mixer.mix_block().iter().all(|&s| s == 700));

        // Deselecting discards what is already queued
        mixer.push(5, StreamKind::ScreenAudio, &carol, &constant(700));
        table.select_screen(None);
        assert!(mixer.mix_block().iter().all(|&s| s == 0));
        assert_eq!(mixer.queued_samples(5), 0);
    }

    #[test]
    fn test_remove_stream() {
        let mixer = PlaybackMixer::new(Arc::new(StreamIdentityTable::new()), 200);
        mixer.push(3, StreamKind::MicAudio, &Identity::Unknown, &constant(1));
        mixer.remove_stream(3);
        assert_eq!(mixer.queued_samples(3), 0);
    }
}
