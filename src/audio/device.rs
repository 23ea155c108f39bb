//! Local ALSA devices
//!
//! The microphone can be captured directly from ALSA instead of through the
//! capture helper. Opening and configuring a PCM is shared with the playback
//! loop.

use std::sync::atomic::{AtomicBool, Ordering};

use alsa::pcm::{Access, Format, Frames, HwParams, State, IO};
use alsa::{Direction, ValueOr, PCM};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::{CHANNELS, FRAME_SAMPLES, SAMPLE_RATE};
use crate::error::{AppError, Result};

/// Buffer size requested from ALSA (frames)
const BUFFER_FRAMES: Frames = 4 * FRAME_SAMPLES as Frames;

/// Capture device found on the system
#[derive(Debug, Clone, Serialize)]
pub struct AudioDeviceInfo {
    /// ALSA name ("default" or "hw:C,D")
    pub name: String,
    pub description: String,
}

/// PCM opened at the engine rate, with the parameters ALSA settled on
pub struct OpenedPcm {
    pub pcm: PCM,
    pub device: String,
    pub sample_rate: u32,
    pub channels: u8,
}

/// Open `device` for 16-bit interleaved I/O near 48 kHz stereo
///
/// Devices that refuse stereo are retried in mono.
pub fn open_pcm(device: &str, direction: Direction) -> Result<OpenedPcm> {
    let pcm = PCM::new(device, direction, false).map_err(|e| {
        AppError::AudioError(format!("Failed to open audio device {}: {}", device, e))
    })?;

    let channels = {
        let hwp = HwParams::any(&pcm)
            .map_err(|e| AppError::AudioError(format!("Failed to get HwParams: {}", e)))?;

        let channels = if hwp.set_channels(CHANNELS as u32).is_ok() {
            CHANNELS as u8
        } else {
            hwp.set_channels(1)
                .map_err(|e| AppError::AudioError(format!("Failed to set channels: {}", e)))?;
            1
        };

        hwp.set_rate(SAMPLE_RATE, ValueOr::Nearest)
            .map_err(|e| AppError::AudioError(format!("Failed to set sample rate: {}", e)))?;
        hwp.set_format(Format::s16())
            .map_err(|e| AppError::AudioError(format!("Failed to set format: {}", e)))?;
        hwp.set_access(Access::RWInterleaved)
            .map_err(|e| AppError::AudioError(format!("Failed to set access: {}", e)))?;
        hwp.set_buffer_size_near(BUFFER_FRAMES)
            .map_err(|e| AppError::AudioError(format!("Failed to set buffer size: {}", e)))?;
        hwp.set_period_size_near(FRAME_SAMPLES as Frames, ValueOr::Nearest)
            .map_err(|e| AppError::AudioError(format!("Failed to set period size: {}", e)))?;

        pcm.hw_params(&hwp)
            .map_err(|e| AppError::AudioError(format!("Failed to apply hw params: {}", e)))?;
        channels
    };

    let sample_rate = pcm
        .hw_params_current()
        .and_then(|h| h.get_rate())
        .unwrap_or(SAMPLE_RATE);

    pcm.prepare()
        .map_err(|e| AppError::AudioError(format!("Failed to prepare PCM: {}", e)))?;

    info!(
        "ALSA {:?} device {} configured: {}Hz {}ch",
        direction, device, sample_rate, channels
    );

    Ok(OpenedPcm {
        pcm,
        device: device.to_string(),
        sample_rate,
        channels,
    })
}

/// True for the EPIPE error ALSA reports on xrun
pub(crate) fn is_xrun(err: &alsa::Error) -> bool {
    let desc = err.to_string();
    desc.contains("EPIPE") || desc.contains("Broken pipe")
}

/// Blocking capture loop for a local microphone opened with [`open_pcm`]
///
/// Calls `on_samples(rate, channels, samples)` for every period read until
/// `stop` is raised. Buffer overruns are recovered in place.
pub fn capture_loop<F>(opened: &OpenedPcm, stop: &AtomicBool, mut on_samples: F) -> Result<()>
where
    F: FnMut(u32, u8, &[i16]),
{
    let pcm = &opened.pcm;
    let device = opened.device.as_str();
    let mut buffer = vec![0i16; FRAME_SAMPLES * opened.channels as usize];
    let mut overruns = 0u64;

    while !stop.load(Ordering::Relaxed) {
        match pcm.state() {
            State::XRun => {
                overruns += 1;
                warn!(overruns, "Microphone buffer overrun, recovering");
                let _ = pcm.prepare();
                continue;
            }
            State::Suspended => {
                warn!("Microphone device suspended, recovering");
                let _ = pcm.resume();
                continue;
            }
            _ => {}
        }

        // io_i16 rather than a checked/mmap variant: USB devices rarely support mmap
        let io: IO<i16> = pcm
            .io_i16()
            .map_err(|e| AppError::AudioError(format!("Failed to get PCM IO: {}", e)))?;

        match io.readi(&mut buffer) {
            Ok(0) => continue,
            Ok(frames) => {
                let len = frames * opened.channels as usize;
                on_samples(opened.sample_rate, opened.channels, &buffer[..len]);
            }
            Err(e) if is_xrun(&e) => {
                overruns += 1;
                warn!(overruns, "Microphone buffer overrun");
                let _ = pcm.prepare();
            }
            Err(e) => {
                error!("Microphone read error: {}", e);
                return Err(AppError::AudioError(format!(
                    "Microphone read failed on {}: {}",
                    device, e
                )));
            }
        }
    }

    debug!("Microphone capture loop on {} exited", device);
    Ok(())
}

/// Capture devices that can be opened right now
pub fn list_capture_devices() -> Vec<AudioDeviceInfo> {
    let mut devices = Vec::new();

    if PCM::new("default", Direction::Capture, false).is_ok() {
        devices.push(AudioDeviceInfo {
            name: "default".to_string(),
            description: "Default Audio Device".to_string(),
        });
    }

    for card in alsa::card::Iter::new().filter_map(|c| c.ok()) {
        let card_index = card.get_index();
        let card_name = card
            .get_longname()
            .or_else(|_| card.get_name())
            .unwrap_or_else(|_| "Unknown".to_string());

        for device_index in 0..8 {
            let name = format!("hw:{},{}", card_index, device_index);
            if PCM::new(&name, Direction::Capture, false).is_ok() {
                devices.push(AudioDeviceInfo {
                    name,
                    description: format!("{} - Device {}", card_name, device_index),
                });
            }
        }
    }

    debug!("Found {} ALSA capture devices", devices.len());
    devices
}
