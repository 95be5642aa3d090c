use std::f64::consts::TAU;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::constants::{clamp_frequency, MASTER_VOLUME, NUM_CHANNELS};
use crate::render::{AudioRender, ErrorCounter, GuardedRender};
use crate::signal::{soft_clip_block, LinearRamp};
use crate::state::{lock, ChannelBank, ChannelEvent};
use crate::TubeError;

/// Fraction of the remaining distance covered per block.
const GLIDE_RATE: f64 = 0.05;
/// Smallest per-block glide step in Hz; guarantees the glide terminates.
const MIN_GLIDE_STEP: f64 = 0.1;
/// Volume and mute changes fade over this many samples.
const VOLUME_FADE_SAMPLES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OscillatorState {
    pub current_frequency: f64,
    pub target_frequency: f64,
    /// Radians in [0, 2π).
    pub phase: f64,
    pub volume: f64,
    pub muted: bool,
}

impl Default for OscillatorState {
    fn default() -> Self {
        Self {
            current_frequency: 440.0,
            target_frequency: 440.0,
            phase: 0.0,
            volume: 1.0,
            muted: true,
        }
    }
}

/// Next block's frequency when gliding from `current` toward `target`.
pub fn glide_step(current: f64, target: f64) -> f64 {
    let distance = target - current;
    if distance.abs() <= MIN_GLIDE_STEP {
        return target;
    }
    let step = distance * GLIDE_RATE;
    if step.abs() < MIN_GLIDE_STEP {
        current + MIN_GLIDE_STEP.copysign(distance)
    } else {
        current + step
    }
}

pub struct ToneSynth {
    sample_rate: u32,
    oscillators: Mutex<[OscillatorState; NUM_CHANNELS]>,
    errors: ErrorCounter,
}

impl ToneSynth {
    pub fn new(sample_rate: u32) -> Result<Self, TubeError> {
        if sample_rate == 0 {
            return Err(TubeError::InvalidParameter {
                name: "sample_rate",
                value: 0.0,
            });
        }
        Ok(Self {
            sample_rate,
            oscillators: Mutex::new([OscillatorState::default(); NUM_CHANNELS]),
            errors: ErrorCounter::new(),
        })
    }

    /// Start with the bank's current state, already settled.
    pub fn from_bank(sample_rate: u32, bank: &ChannelBank) -> Result<Self, TubeError> {
        let synth = Self::new(sample_rate)?;
        {
            let mut oscs = lock(&synth.oscillators);
            for (osc, ch) in oscs.iter_mut().zip(bank.snapshot()) {
                osc.current_frequency = ch.frequency;
                osc.target_frequency = ch.frequency;
                osc.volume = ch.volume;
                osc.muted = ch.mute;
            }
        }
        Ok(synth)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Schedule a glide to `freq` (clamped). Returns whether the target
    /// actually changed.
    pub fn set_frequency(&self, channel: usize, freq: f64) -> Result<bool, TubeError> {
        check_channel(channel)?;
        let freq = clamp_frequency(freq);
        let mut oscs = lock(&self.oscillators);
        if oscs[channel].target_frequency == freq {
            return Ok(false);
        }
        oscs[channel].target_frequency = freq;
        Ok(true)
    }

    /// The renderer fades to the new level over a few milliseconds.
    pub fn set_volume(&self, channel: usize, volume: f64, muted: bool) -> Result<(), TubeError> {
        check_channel(channel)?;
        let mut oscs = lock(&self.oscillators);
        oscs[channel].volume = if volume.is_finite() { volume.clamp(0.0, 1.0) } else { 0.0 };
        oscs[channel].muted = muted;
        Ok(())
    }

    pub fn apply_event(&self, event: &ChannelEvent) -> Result<(), TubeError> {
        self.set_frequency(event.channel, event.state.frequency)?;
        self.set_volume(event.channel, event.state.volume, event.state.mute)
    }

    /// Push every channel of the bank into the oscillators.
    pub fn sync_from_bank(&self, bank: &ChannelBank) {
        let channels = bank.snapshot();
        let mut oscs = lock(&self.oscillators);
        for (osc, ch) in oscs.iter_mut().zip(channels) {
            osc.target_frequency = ch.frequency;
            osc.volume = ch.volume;
            osc.muted = ch.mute;
        }
        debug!("synth resynced from channel bank");
    }

    pub fn oscillator(&self, channel: usize) -> Result<OscillatorState, TubeError> {
        check_channel(channel)?;
        Ok(lock(&self.oscillators)[channel])
    }

    pub fn snapshot(&self) -> [OscillatorState; NUM_CHANNELS] {
        *lock(&self.oscillators)
    }

    /// Blocks that failed and were replaced by silence.
    pub fn error_count(&self) -> u64 {
        self.errors.get()
    }

    pub fn renderer(self: &Arc<Self>) -> SynthRenderer {
        SynthRenderer {
            synth: Arc::clone(self),
            gains: std::array::from_fn(|_| LinearRamp::new(0.0, VOLUME_FADE_SAMPLES)),
        }
    }

    /// The renderer behind the callback guard, counting into this synth.
    pub fn guarded_renderer(self: &Arc<Self>) -> GuardedRender<SynthRenderer> {
        GuardedRender::with_counter("synth", self.renderer(), self.errors.clone())
    }
}

fn check_channel(channel: usize) -> Result<(), TubeError> {
    if channel < NUM_CHANNELS {
        Ok(())
    } else {
        Err(TubeError::ChannelOutOfRange {
            channel,
            count: NUM_CHANNELS,
        })
    }
}

pub struct SynthRenderer {
    synth: Arc<ToneSynth>,
    /// Per-channel output gain, owned by the audio thread.
    gains: [LinearRamp; NUM_CHANNELS],
}

impl AudioRender for SynthRenderer {
    fn render(&mut self, out: &mut [f32]) -> Result<(), TubeError> {
        out.fill(0.0);
        if out.is_empty() {
            return Ok(());
        }
        let mut oscs = self.synth.snapshot();
        let sample_period = 1.0 / self.synth.sample_rate as f64;
        let frames = out.len() as f64;

        for (osc, gain) in oscs.iter_mut().zip(self.gains.iter_mut()) {
            gain.set_target(if osc.muted { 0.0 } else { osc.volume * MASTER_VOLUME });
            if gain.is_settled() && gain.value() == 0.0 {
                // Silent: jump straight to the target, nothing to glide.
                osc.current_frequency = osc.target_frequency;
                continue;
            }

            let start = osc.current_frequency;
            let end = glide_step(start, osc.target_frequency);
            let mut phase = osc.phase;
            for (i, sample) in out.iter_mut().enumerate() {
                *sample += (gain.next_value() * phase.sin()) as f32;
                let freq = start + (end - start) * (i + 1) as f64 / frames;
                phase += TAU * freq * sample_period;
                if phase >= TAU {
                    phase -= TAU;
                }
            }
            osc.phase = phase;
            osc.current_frequency = end;
        }

        soft_clip_block(out);

        // Targets may have moved while we rendered; only write back what
        // the renderer owns.
        let mut shared = lock(&self.synth.oscillators);
        for (dst, src) in shared.iter_mut().zip(oscs.iter()) {
            dst.phase = src.phase;
            dst.current_frequency = src.current_frequency;
        }
        Ok(())
    }
}
