use std::f64::consts::TAU;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use ringbuf::traits::Producer;
use ringbuf::HeapProd;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{MASTER_VOLUME, SOFT_CLIP_THRESHOLD};
use crate::render::{AudioRender, ErrorCounter, GuardedRender, RetireQueue};
use crate::signal::{clip_sample, cubic_shaper, soft_clip, LinearRamp};
use crate::{TubeError, TubeParams};

/// Voices preallocated per table so typical updates never reallocate.
const VOICE_CAPACITY: usize = 32;
const GAIN_RAMP_SAMPLES: usize = 256;
/// Superseded sets a renderer can hand back before control code collects.
const RETIRE_CAPACITY: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PressureRenderConfig {
    /// Gain of the `y + g·y³` colour term.
    pub nonlinearity: f64,
    /// Listening points as fractions of the tube length.
    pub monitor_positions: Vec<f64>,
    /// Crossfade length for live updates, milliseconds.
    pub crossfade_ms: f64,
    /// Tone emitted when no frequencies are active.
    pub diagnostic_frequency: f64,
    pub diagnostic_level: f64,
}

impl Default for PressureRenderConfig {
    fn default() -> Self {
        Self {
            nonlinearity: 0.1,
            monitor_positions: vec![0.25, 0.5, 0.75],
            crossfade_ms: 50.0,
            diagnostic_frequency: 220.0,
            diagnostic_level: 0.3,
        }
    }
}

/// What the renderer should currently be playing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActiveSet {
    pub pairs: Vec<(f64, f64)>,
    pub params: TubeParams,
}

/// Shared handle between the pressure model and its renderers.
pub struct PressureSource {
    active: ArcSwap<ActiveSet>,
    /// User volume in [0, 1] as `f64` bits.
    volume: AtomicU64,
    errors: ErrorCounter,
    retired: RetireQueue<Arc<ActiveSet>>,
}

impl PressureSource {
    pub fn new(params: TubeParams) -> Self {
        Self {
            active: ArcSwap::from_pointee(ActiveSet {
                pairs: Vec::new(),
                params,
            }),
            volume: AtomicU64::new(1.0f64.to_bits()),
            errors: ErrorCounter::new(),
            retired: RetireQueue::new(),
        }
    }

    pub fn active(&self) -> Arc<ActiveSet> {
        self.active.load_full()
    }

    /// Publish a new frequency set; the renderer fades over to it.
    pub fn set_active(&self, pairs: Vec<(f64, f64)>) {
        self.retired.collect();
        debug!(count = pairs.len(), "pressure frequencies published");
        self.active.rcu(|cur| ActiveSet {
            pairs: pairs.clone(),
            params: cur.params.clone(),
        });
    }

    pub fn set_params(&self, params: TubeParams) {
        self.retired.collect();
        self.active.rcu(|cur| ActiveSet {
            pairs: cur.pairs.clone(),
            params: params.clone(),
        });
    }

    pub fn set_volume(&self, volume: f64) {
        let v = if volume.is_finite() { volume.clamp(0.0, 1.0) } else { 0.0 };
        self.volume.store(v.to_bits(), Ordering::Relaxed);
    }

    pub fn volume(&self) -> f64 {
        f64::from_bits(self.volume.load(Ordering::Relaxed))
    }

    pub fn error_count(&self) -> u64 {
        self.errors.get()
    }

    pub fn renderer(
        self: &Arc<Self>,
        sample_rate: u32,
        config: PressureRenderConfig,
    ) -> PressureRenderer {
        let retire = self.retired.producer(RETIRE_CAPACITY);
        PressureRenderer::new(Arc::clone(self), sample_rate, config, retire)
    }

    pub fn guarded_renderer(
        self: &Arc<Self>,
        sample_rate: u32,
        config: PressureRenderConfig,
    ) -> GuardedRender<PressureRenderer> {
        GuardedRender::with_counter(
            "pressure",
            self.renderer(sample_rate, config),
            self.errors.clone(),
        )
    }
}

#[derive(Debug, Clone, Copy)]
struct Voice {
    omega: f64,
    /// `amplitude · mean over monitors of cos(k·x)·exp(-d·x·f/f_ref)`.
    envelope: f64,
}

pub struct PressureRenderer {
    source: Arc<PressureSource>,
    config: PressureRenderConfig,
    sample_rate: f64,
    /// Samples rendered since start; time is `frame / sample_rate`.
    frame: u64,
    seen: Arc<ActiveSet>,
    retire: HeapProd<Arc<ActiveSet>>,
    current: Vec<Voice>,
    previous: Vec<Voice>,
    /// 0 → 1 while fading from `previous` to `current`.
    fade: LinearRamp,
    gain: LinearRamp,
}

impl PressureRenderer {
    fn new(
        source: Arc<PressureSource>,
        sample_rate: u32,
        config: PressureRenderConfig,
        retire: HeapProd<Arc<ActiveSet>>,
    ) -> Self {
        let sample_rate = sample_rate.max(1) as f64;
        let fade_len = ((config.crossfade_ms.max(0.0) / 1000.0) * sample_rate).round() as usize;
        let seen = source.active();
        let mut current = Vec::with_capacity(VOICE_CAPACITY);
        build_voices(&seen, &config, &mut current);
        let gain = LinearRamp::new(source.volume() * MASTER_VOLUME, GAIN_RAMP_SAMPLES);
        Self {
            source,
            config,
            sample_rate,
            frame: 0,
            seen,
            retire,
            current,
            previous: Vec::with_capacity(VOICE_CAPACITY),
            fade: LinearRamp::new(1.0, fade_len),
            gain,
        }
    }

    pub fn time(&self) -> f64 {
        self.frame as f64 / self.sample_rate
    }

    pub fn is_fading(&self) -> bool {
        !self.fade.is_settled()
    }

    /// Start fading to a newly published set. Deferred while a fade is
    /// still running so the mix never jumps.
    fn pick_up_updates(&mut self) {
        if self.is_fading() {
            return;
        }
        let latest = self.source.active.load();
        if Arc::ptr_eq(&*latest, &self.seen) {
            return;
        }
        let old = std::mem::replace(&mut self.seen, Arc::clone(&*latest));
        // A full ring means control code has stopped collecting; the set is
        // then freed here.
        let _ = self.retire.try_push(old);
        std::mem::swap(&mut self.current, &mut self.previous);
        build_voices(&self.seen, &self.config, &mut self.current);
        self.fade.reset(0.0);
        self.fade.set_target(1.0);
    }
}

fn build_voices(set: &ActiveSet, config: &PressureRenderConfig, out: &mut Vec<Voice>) {
    out.clear();
    if set.pairs.is_empty() {
        out.push(Voice {
            omega: TAU * config.diagnostic_frequency,
            envelope: config.diagnostic_level,
        });
        return;
    }

    let p = set.params.sanitized();
    let c = p.speed_of_sound;
    let length = p.tube_length;
    let reference = c / (4.0 * length);
    let monitors = config.monitor_positions.len().max(1) as f64;

    for &(freq, amplitude) in set.pairs.iter().take(VOICE_CAPACITY) {
        let omega = TAU * freq;
        let k = omega / c;
        let weighted: f64 = config
            .monitor_positions
            .iter()
            .map(|fraction| {
                let x = fraction * length;
                (k * x).cos() * (-p.damping_coefficient * x * freq / reference).exp()
            })
            .sum();
        out.push(Voice {
            omega,
            envelope: amplitude * weighted / monitors,
        });
    }
}

#[inline]
fn sum_voices(voices: &[Voice], t: f64) -> f64 {
    voices.iter().map(|v| v.envelope * (v.omega * t).sin()).sum()
}

impl AudioRender for PressureRenderer {
    fn render(&mut self, out: &mut [f32]) -> Result<(), TubeError> {
        self.pick_up_updates();
        self.gain.set_target(self.source.volume() * MASTER_VOLUME);

        let g = self.config.nonlinearity;
        for (i, sample) in out.iter_mut().enumerate() {
            let t = (self.frame + i as u64) as f64 / self.sample_rate;
            let mut y = sum_voices(&self.current, t);
            if !self.fade.is_settled() {
                let x = self.fade.next_value();
                y = x * y + (1.0 - x) * sum_voices(&self.previous, t);
            }
            // Saturate the raw mix first: eight coherent voices can sum
            // well past 1 and the cubic term would blow that up.
            let y = cubic_shaper(soft_clip(y, 1.0), g) * self.gain.next_value();
            *sample = clip_sample(y, SOFT_CLIP_THRESHOLD);
        }
        self.frame += out.len() as u64;
        Ok(())
    }
}
