//! Microphone conditioning: automatic gain control and noise gate
//!
//! Runs once per 20ms block on the capture thread. The AGC steers block RMS
//! towards a target, reacting quickly when it has to turn down and slowly
//! when it turns up so quiet passages do not pump. After gain and a soft
//! knee, the block RMS is compared against the gate threshold; gated blocks
//! are zeroed and reported as voice-inactive.

use crate::config::ConditionerConfig;

/// Magnitude above which the soft knee compresses
const KNEE_START: f32 = 30_000.0;
/// Fraction of the excess above the knee that is kept
const KNEE_RATIO: f32 = 0.1;

const MAX_USER_GAIN: f32 = 3.0;

/// Result of conditioning one block
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockAnalysis {
    /// RMS of the input block (i16 scale)
    pub input_rms: f32,
    /// RMS after gain and knee, normalized to [0, 1], before gating
    pub normalized_rms: f32,
    /// AGC gain after this block
    pub agc_gain: f32,
    /// Block passed the gate
    pub voice_active: bool,
}

/// Per-stream AGC and gate state
#[derive(Debug, Clone)]
pub struct AudioConditioner {
    config: ConditionerConfig,
    agc_gain: f32,
    user_gain: f32,
}

impl AudioConditioner {
    pub fn new(config: ConditionerConfig) -> Self {
        let agc_gain = config.min_gain;
        Self {
            config,
            agc_gain,
            user_gain: 1.0,
        }
    }

    pub fn agc_gain(&self) -> f32 {
        self.agc_gain
    }

    pub fn user_gain(&self) -> f32 {
        self.user_gain
    }

    /// Input volume chosen by the user, clamped to [0, 3]
    pub fn set_user_gain(&mut self, gain: f32) {
        self.user_gain = if gain.is_finite() {
            gain.clamp(0.0, MAX_USER_GAIN)
        } else {
            1.0
        };
    }

    /// Condition `block` in place (interleaved i16)
    pub fn process(&mut self, block: &mut [i16]) -> BlockAnalysis {
        let input_rms = rms(block);
        self.update_agc(input_rms);

        let total_gain = self.config.baseline_gain * self.agc_gain * self.user_gain;
        for sample in block.iter_mut() {
            *sample = apply_gain(*sample, total_gain);
        }

        let normalized_rms = rms(block) / 32768.0;
        let voice_active = normalized_rms >= self.config.gate_threshold;
        if !voice_active {
            block.fill(0);
        }

        BlockAnalysis {
            input_rms,
            normalized_rms,
            agc_gain: self.agc_gain,
            voice_active,
        }
    }

    fn update_agc(&mut self, input_rms: f32) {
        // Near-silent blocks would drive target/rms towards infinity
        if input_rms < self.config.silence_rms {
            return;
        }

        let desired = (self.config.target_rms / input_rms)
            .clamp(self.config.min_gain, self.config.max_gain);
        let rate = if desired < self.agc_gain {
            self.config.attack
        } else {
            self.config.release
        };
        self.agc_gain += (desired - self.agc_gain) * rate;
        self.agc_gain = self
            .agc_gain
            .clamp(self.config.min_gain, self.config.max_gain);
    }
}

/// RMS of interleaved i16 samples on the i16 scale
pub fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / samples.len() as f64).sqrt() as f32
}

fn apply_gain(sample: i16, gain: f32) -> i16 {
    let value = sample as f32 * gain;
    let magnitude = value.abs();
    let shaped = if magnitude > KNEE_START {
        (KNEE_START + (magnitude - KNEE_START) * KNEE_RATIO).copysign(value)
    } else {
        value
    };
    shaped.round().clamp(-32767.0, 32767.0) as i16
}
