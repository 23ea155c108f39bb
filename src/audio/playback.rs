//! ALSA playback of the mixed output
//!
//! The loop writes one mixed block per period; `writei` blocking on a full
//! device buffer paces it at 20ms. The mix is never resampled, so a device
//! that will not run at 48kHz is refused.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use alsa::pcm::{State, IO};
use alsa::Direction;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::device::{is_xrun, open_pcm};
use super::mixer::PlaybackMixer;
use super::SAMPLE_RATE;
use crate::error::{AppError, Result};

/// Background playback of a [`PlaybackMixer`]
pub struct AudioPlayback {
    device: String,
    mixer: Arc<PlaybackMixer>,
    stop_flag: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AudioPlayback {
    pub fn new(device: impl Into<String>, mixer: Arc<PlaybackMixer>) -> Self {
        Self {
            device: device.into(),
            mixer,
            stop_flag: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }

        info!("Starting audio playback on {}", self.device);
        self.stop_flag.store(false, Ordering::SeqCst);
        let device = self.device.clone();
        let mixer = self.mixer.clone();
        let stop_flag = self.stop_flag.clone();

        *handle = Some(tokio::task::spawn_blocking(move || {
            if let Err(e) = playback_loop(&device, &mixer, &stop_flag) {
                error!("Audio playback stopped: {}", e);
            }
        }));
    }

    pub async fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
            info!("Audio playback stopped");
        }
    }
}

fn playback_loop(device: &str, mixer: &PlaybackMixer, stop: &AtomicBool) -> Result<()> {
    let opened = open_pcm(device, Direction::Playback)?;
    check_rate(device, opened.sample_rate)?;
    let pcm = &opened.pcm;
    let mut underruns = 0u64;

    while !stop.load(Ordering::Relaxed) {
        let block = mixer.mix_block();
        let block = if opened.channels == 1 {
            block
                .chunks_exact(2)
                .map(|f| ((f[0] as i32 + f[1] as i32) / 2) as i16)
                .collect()
        } else {
            block
        };

        if pcm.state() == State::XRun {
            underruns += 1;
            warn!(underruns, "Playback underrun, recovering");
            let _ = pcm.prepare();
        }

        let io: IO<i16> = pcm
            .io_i16()
            .map_err(|e| AppError::AudioError(format!("Failed to get PCM IO: {}", e)))?;
        match io.writei(&block) {
            Ok(_) => {}
            Err(e) if is_xrun(&e) => {
                underruns += 1;
                let _ = pcm.prepare();
            }
            Err(e) => {
                return Err(AppError::AudioError(format!(
                    "Playback write failed on {}: {}",
                    device, e
                )));
            }
        }
    }

    let _ = pcm.drain();
    debug!(underruns, "Playback loop on {} exited", device);
    Ok(())
}

fn check_rate(device: &str, rate: u32) -> Result<()> {
    if rate != SAMPLE_RATE {
        warn!(
            "Playback device {} settled on {} Hz instead of {} Hz, refusing it",
            device, rate, SAMPLE_RATE
        );
        return Err(AppError::AudioError(format!(
            "Playback device {} does not support {} Hz (got {} Hz)",
            device, SAMPLE_RATE, rate
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webrtc::identity::StreamIdentityTable;

    #[test]
    fn test_device_rate_must_match_mix() {
        assert!(check_rate("default", 48_000).is_ok());
        let err = check_rate("hw:1", 44_100).unwrap_err();
        assert!(err.to_string().contains("44100"));
    }

    #[tokio::test]
    async fn test_missing_device_ends_task() {
        let mixer = Arc::new(PlaybackMixer::new(Arc::new(StreamIdentityTable::new()), 200));
        let playback = AudioPlayback::new("confab_no_such_device", mixer);
        playback.start();
        playback.stop().await;
        assert!(!playback.is_running());
    }
}
