//! In-place cleanup of 10ms audio sub-chunks: pre-amplification, noise
//! suppression, automatic gain and voice-activity detection.
//!
//! The chunk fed to [`AudioProcessor::process_chunk`] must be a multiple of
//! 10ms and at most 80ms; the per-sub-chunk VAD bits are packed into one
//! byte, most significant bit first.

use webrtc_vad::{SampleRate, Vad, VadMode};

use crate::error::{Result, VozError};
use crate::SUBCHUNK_SIZE;

pub const MAX_NOISE_LEVEL: u8 = 4;
pub const MAX_AUTOGAIN: u8 = 31;
const MAX_SUBCHUNKS: usize = 8;

/// Knobs for the DSP chain. Values outside the valid ranges are clamped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DspConfig {
    pub preamp: f32,
    pub noise_level: u8,
    pub autogain: u8,
    pub vad: bool,
}

impl Default for DspConfig {
    fn default() -> Self {
        Self {
            preamp: 1.0,
            noise_level: 0,
            autogain: 0,
            vad: false,
        }
    }
}

impl DspConfig {
    pub fn clamped(mut self) -> Self {
        self.noise_level = self.noise_level.min(MAX_NOISE_LEVEL);
        self.autogain = self.autogain.min(MAX_AUTOGAIN);
        self
    }

    /// Whether any stage of the chain is active.
    pub fn wanted(&self) -> bool {
        self.noise_level > 0 || self.autogain > 0 || self.preamp != 1.0 || self.vad
    }
}

/// Smoothed noise-floor gate. Tracks the minimum sub-chunk RMS and
/// attenuates sub-chunks close to it; the level selects how hard.
struct NoiseGate {
    floor: f32,
    attenuation: f32,
    snr_gate: f32,
}

impl NoiseGate {
    fn new(level: u8) -> Self {
        // level 1..=4 maps to -6/-12/-18/-24 dB of attenuation
        let attenuation = 10f32.powf(-(level as f32) * 6.0 / 20.0);
        Self {
            floor: 200.0,
            attenuation,
            snr_gate: 2.0,
        }
    }

    fn filter(&mut self, sub: &mut [i16], rms: f32) {
        if rms < self.floor {
            self.floor = rms.max(1.0);
        } else {
            // rise slowly so pauses in speech keep the floor honest
            self.floor = (self.floor * 1.01).min(rms);
        }
        if rms < self.floor * self.snr_gate {
            for s in sub.iter_mut() {
                *s = (*s as f32 * self.attenuation) as i16;
            }
        }
    }
}

/// RMS-window automatic gain, running sum over a sliding window so the
/// per-sub-chunk update is O(1).
struct AutoGain {
    target_rms: f32,
    window: [f32; Self::WINDOW],
    write_pos: usize,
    running_sum: f32,
    gain: f32,
}

impl AutoGain {
    const WINDOW: usize = 30; // 300ms of sub-chunk RMS history
    const MIN_GAIN: f32 = 0.1;
    const MAX_GAIN: f32 = 30.0;

    fn new(level: u8) -> Self {
        // level is a target in -dBFS, the way the reference gain control
        // takes it: higher level, quieter target.
        let target_rms = 32767.0 * 10f32.powf(-(level as f32) / 20.0);
        Self {
            target_rms,
            window: [0.0; Self::WINDOW],
            write_pos: 0,
            running_sum: 0.0,
            gain: 1.0,
        }
    }

    fn filter(&mut self, sub: &mut [i16], rms: f32) {
        if rms == 0.0 {
            return;
        }
        let old = self.window[self.write_pos];
        self.window[self.write_pos] = rms;
        self.write_pos = (self.write_pos + 1) % Self::WINDOW;
        self.running_sum += rms - old;

        let mean_rms = self.running_sum / Self::WINDOW as f32;
        if mean_rms <= 0.0 {
            return;
        }
        let wanted = (self.target_rms / mean_rms).clamp(Self::MIN_GAIN, Self::MAX_GAIN);
        // first-order smoothing keeps the gain from pumping between sub-chunks
        self.gain += 0.1 * (wanted - self.gain);
        if (self.gain - 1.0).abs() > f32::EPSILON {
            for s in sub.iter_mut() {
                *s = (*s as f32 * self.gain).clamp(-32768.0, 32767.0) as i16;
            }
        }
    }
}

fn rms(sub: &[i16]) -> f32 {
    let sum_sq: f64 = sub.iter().map(|&s| (s as f64) * (s as f64)).sum();
    ((sum_sq / sub.len() as f64) as f32).sqrt()
}

/// The per-chunk DSP chain. Created only when [`DspConfig::wanted`] holds.
pub struct AudioProcessor {
    preamp: f32,
    noise: Option<NoiseGate>,
    autogain: Option<AutoGain>,
    vad: Option<Vad>,
}

impl AudioProcessor {
    pub fn from_config(cfg: &DspConfig) -> Option<Self> {
        let cfg = cfg.clamped();
        if !cfg.wanted() {
            return None;
        }
        let vad = cfg
            .vad
            .then(|| Vad::new_with_rate_and_mode(SampleRate::Rate16kHz, VadMode::Aggressive));
        Some(Self {
            preamp: cfg.preamp,
            noise: (cfg.noise_level > 0).then(|| NoiseGate::new(cfg.noise_level)),
            autogain: (cfg.autogain > 0).then(|| AutoGain::new(cfg.autogain)),
            vad,
        })
    }

    /// Process a chunk in place and return the packed VAD byte
    /// (`res = (res << 1) | vad_i` per sub-chunk). Zero when VAD is off.
    pub fn process_chunk(&mut self, samples: &mut [i16]) -> Result<u8> {
        if samples.is_empty() || samples.len() % SUBCHUNK_SIZE != 0 {
            return Err(VozError::Config(format!(
                "chunk of {} samples is not a multiple of 10ms",
                samples.len()
            )));
        }
        let nsub = samples.len() / SUBCHUNK_SIZE;
        if nsub > MAX_SUBCHUNKS {
            return Err(VozError::Config(format!(
                "chunk of {} sub-chunks exceeds the {}-bit VAD byte",
                nsub, MAX_SUBCHUNKS
            )));
        }

        let mut res: u8 = 0;
        for sub in samples.chunks_mut(SUBCHUNK_SIZE) {
            if self.preamp != 1.0 {
                for s in sub.iter_mut() {
                    *s = (*s as f32 * self.preamp).clamp(-32768.0, 32767.0) as i16;
                }
            }
            let level = rms(sub);
            if let Some(noise) = self.noise.as_mut() {
                noise.filter(sub, level);
            }
            if let Some(agc) = self.autogain.as_mut() {
                agc.filter(sub, level);
            }
            let voiced = match self.vad.as_mut() {
                Some(vad) => vad.is_voice_segment(sub).unwrap_or(false),
                None => false,
            };
            res = (res << 1) | voiced as u8;
        }
        Ok(res)
    }
}
