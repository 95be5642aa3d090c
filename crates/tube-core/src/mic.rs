use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use biquad::{Biquad, Coefficients, DirectForm2Transposed, ToHertz};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::constants::{AMPLITUDE, MASTER_VOLUME, SOFT_CLIP_THRESHOLD};
use crate::render::{should_log, AudioRender, ErrorCounter, GuardedRender, RetireQueue};
use crate::signal::{clip_sample, db_to_linear, linear_to_db};
use crate::TubeError;

/// Q of the two sections of a 4th-order Butterworth low-pass.
const BUTTERWORTH_Q: [f32; 2] = [0.541_196_1, 1.306_563];
/// Smoothing of the applied compressor gain, per sample.
const GAIN_SMOOTHING: f64 = 0.1;
/// Level meter smoothing per block.
const METER_SMOOTHING: f64 = 0.3;
const METER_FLOOR_DB: f64 = -100.0;
const RETIRE_CAPACITY: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressorSettings {
    pub enabled: bool,
    pub threshold_db: f64,
    /// Input:output slope above the threshold, at least 1.
    pub ratio: f64,
    /// Envelope attack, seconds.
    pub attack: f64,
    /// Envelope release, seconds.
    pub release: f64,
    pub makeup_db: f64,
    /// Width of the soft knee around the threshold, dB.
    pub knee_db: f64,
}

impl Default for CompressorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_db: -30.0,
            ratio: 4.0,
            attack: 0.005,
            release: 0.100,
            makeup_db: 12.0,
            knee_db: 6.0,
        }
    }
}

impl CompressorSettings {
    /// Static curve: dB of gain reduction for an envelope level in dB.
    pub fn gain_reduction_db(&self, level_db: f64) -> f64 {
        let slope = 1.0 - 1.0 / self.ratio.max(1.0);
        let over = level_db - self.threshold_db;
        let knee = self.knee_db.max(0.0);
        if 2.0 * over < -knee {
            0.0
        } else if 2.0 * over > knee || knee == 0.0 {
            slope * over
        } else {
            slope * (over + knee / 2.0).powi(2) / (2.0 * knee)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MicConfig {
    /// Input device name; `None` means the host default.
    pub device: Option<String>,
    pub volume: f64,
    pub cutoff_hz: f64,
    /// Ring capacity in samples.
    pub buffer_size: usize,
    pub compressor: CompressorSettings,
}

impl Default for MicConfig {
    fn default() -> Self {
        Self {
            device: None,
            volume: AMPLITUDE,
            cutoff_hz: 1000.0,
            buffer_size: 8192,
            compressor: CompressorSettings::default(),
        }
    }
}

/// Feed-forward compressor with an attack/release envelope follower.
#[derive(Debug, Clone)]
pub struct Compressor {
    settings: CompressorSettings,
    sample_rate: f64,
    attack_coef: f64,
    release_coef: f64,
    makeup: f64,
    envelope: f64,
    gain: f64,
}

impl Compressor {
    pub fn new(settings: CompressorSettings, sample_rate: u32) -> Self {
        let mut c = Self {
            settings: CompressorSettings::default(),
            sample_rate: sample_rate.max(1) as f64,
            attack_coef: 0.0,
            release_coef: 0.0,
            makeup: 1.0,
            envelope: 0.0,
            gain: 1.0,
        };
        c.configure(settings);
        c
    }

    /// Swap settings without resetting the envelope.
    pub fn configure(&mut self, settings: CompressorSettings) {
        let coef = |seconds: f64| (-1.0 / (self.sample_rate * seconds.max(1e-5))).exp();
        self.attack_coef = coef(settings.attack);
        self.release_coef = coef(settings.release);
        self.makeup = db_to_linear(settings.makeup_db);
        self.settings = settings;
    }

    pub fn settings(&self) -> &CompressorSettings {
        &self.settings
    }

    #[inline]
    pub fn process(&mut self, x: f64) -> f64 {
        if !self.settings.enabled {
            return x;
        }
        let level = x.abs();
        let coef = if level > self.envelope {
            self.attack_coef
        } else {
            self.release_coef
        };
        self.envelope = coef * self.envelope + (1.0 - coef) * level;

        let reduction = self.settings.gain_reduction_db(linear_to_db(self.envelope));
        let target = db_to_linear(-reduction) * self.makeup;
        self.gain += GAIN_SMOOTHING * (target - self.gain);
        x * self.gain
    }
}

/// Shared controls and meter for the passthrough.
pub struct MicPassthrough {
    sample_rate: u32,
    config: MicConfig,
    compressor: ArcSwap<CompressorSettings>,
    retired: RetireQueue<Arc<CompressorSettings>>,
    volume: AtomicU64,
    level_db: AtomicU64,
    errors: ErrorCounter,
    underruns: ErrorCounter,
}

impl MicPassthrough {
    pub fn new(sample_rate: u32, config: MicConfig) -> Result<Self, TubeError> {
        let nyquist = sample_rate as f64 / 2.0;
        if !(config.cutoff_hz > 0.0 && config.cutoff_hz < nyquist) {
            return Err(TubeError::InvalidParameter {
                name: "cutoff_hz",
                value: config.cutoff_hz,
            });
        }
        Ok(Self {
            sample_rate,
            compressor: ArcSwap::from_pointee(config.compressor.clone()),
            retired: RetireQueue::new(),
            volume: AtomicU64::new(config.volume.clamp(0.0, 1.0).to_bits()),
            level_db: AtomicU64::new(METER_FLOOR_DB.to_bits()),
            errors: ErrorCounter::new(),
            underruns: ErrorCounter::new(),
            config,
        })
    }

    pub fn config(&self) -> &MicConfig {
        &self.config
    }

    pub fn set_volume(&self, volume: f64) {
        let v = if volume.is_finite() { volume.clamp(0.0, 1.0) } else { 0.0 };
        self.volume.store(v.to_bits(), Ordering::Relaxed);
        info!(volume = v, "microphone volume set");
    }

    pub fn volume(&self) -> f64 {
        f64::from_bits(self.volume.load(Ordering::Relaxed))
    }

    pub fn set_compression(&self, settings: CompressorSettings) {
        info!(
            enabled = settings.enabled,
            threshold_db = settings.threshold_db,
            ratio = settings.ratio,
            makeup_db = settings.makeup_db,
            "microphone compressor configured"
        );
        self.retired.collect();
        self.compressor.store(Arc::new(settings));
    }

    pub fn compression(&self) -> CompressorSettings {
        (**self.compressor.load()).clone()
    }

    /// Smoothed RMS level of the processed signal, dB.
    pub fn level_db(&self) -> f64 {
        f64::from_bits(self.level_db.load(Ordering::Relaxed))
    }

    pub fn error_count(&self) -> u64 {
        self.errors.get()
    }

    /// Blocks that were short of captured samples.
    pub fn underrun_count(&self) -> u64 {
        self.underruns.get()
    }

    /// Create a fresh capture/render pair joined by a new ring buffer.
    pub fn open(self: &Arc<Self>) -> Result<(MicCapture, MicRenderer), TubeError> {
        let ring = HeapRb::<f32>::new(self.config.buffer_size.max(1));
        let (producer, consumer) = ring.split();

        let fs = (self.sample_rate as f32).hz();
        let f0 = (self.config.cutoff_hz as f32).hz();
        let mut filters = Vec::with_capacity(BUTTERWORTH_Q.len());
        for q in BUTTERWORTH_Q {
            let coeffs = Coefficients::<f32>::from_params(biquad::Type::LowPass, fs, f0, q)
                .map_err(|_| TubeError::InvalidParameter {
                    name: "cutoff_hz",
                    value: self.config.cutoff_hz,
                })?;
            filters.push(DirectForm2Transposed::<f32>::new(coeffs));
        }

        let settings = self.compressor.load_full();
        debug!(capacity = self.config.buffer_size, "microphone ring opened");
        Ok((
            MicCapture {
                producer,
                dropped: 0,
            },
            MicRenderer {
                shared: Arc::clone(self),
                consumer,
                filters,
                compressor: Compressor::new((*settings).clone(), self.sample_rate),
                settings,
                retire: self.retired.producer(RETIRE_CAPACITY),
            },
        ))
    }

    pub fn guarded(renderer: MicRenderer) -> GuardedRender<MicRenderer> {
        let errors = renderer.shared.errors.clone();
        GuardedRender::with_counter("mic", renderer, errors)
    }
}

/// Producer half, owned by the input stream callback.
pub struct MicCapture {
    producer: HeapProd<f32>,
    dropped: u64,
}

impl MicCapture {
    /// Push captured mono samples; returns how many fit. Overflow is
    /// dropped so the input callback never waits.
    pub fn push(&mut self, samples: &[f32]) -> usize {
        let written = self.producer.push_slice(samples);
        if written < samples.len() {
            self.dropped += (samples.len() - written) as u64;
        }
        written
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Consumer half, owned by the output stream callback.
pub struct MicRenderer {
    shared: Arc<MicPassthrough>,
    consumer: HeapCons<f32>,
    filters: Vec<DirectForm2Transposed<f32>>,
    compressor: Compressor,
    settings: Arc<CompressorSettings>,
    retire: HeapProd<Arc<CompressorSettings>>,
}

impl MicRenderer {
    pub fn buffered(&self) -> usize {
        self.consumer.occupied_len()
    }
}

impl AudioRender for MicRenderer {
    fn render(&mut self, out: &mut [f32]) -> Result<(), TubeError> {
        let latest = self.shared.compressor.load();
        if !Arc::ptr_eq(&*latest, &self.settings) {
            let old = std::mem::replace(&mut self.settings, Arc::clone(&*latest));
            let _ = self.retire.try_push(old);
            self.compressor.configure((*self.settings).clone());
        }

        let read = self.consumer.pop_slice(out);
        if read < out.len() {
            out[read..].fill(0.0);
            let count = self.shared.underruns.bump();
            if should_log(count) {
                debug!(count, missing = out.len() - read, "microphone underrun");
            }
        }

        let gain = self.shared.volume() * MASTER_VOLUME;
        let mut energy = 0.0;
        for sample in out.iter_mut() {
            let mut x = *sample;
            for filter in self.filters.iter_mut() {
                x = filter.run(x);
            }
            let y = self.compressor.process(x as f64);
            energy += y * y;
            *sample = clip_sample(y * gain, SOFT_CLIP_THRESHOLD);
        }

        if !out.is_empty() {
            let rms = (energy / out.len() as f64).sqrt();
            let block_db = linear_to_db(rms).max(METER_FLOOR_DB);
            let prev = self.shared.level_db();
            let level = prev + METER_SMOOTHING * (block_db - prev);
            self.shared.level_db.store(level.to_bits(), Ordering::Relaxed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::TAU;

    fn sine(freq: f64, amp: f64, n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| (amp * (TAU * freq * i as f64 / 44_100.0).sin()) as f32)
            .collect()
    }

    fn rms(x: &[f32]) -> f64 {
        (x.iter().map(|v| (*v as f64).powi(2)).sum::<f64>() / x.len() as f64).sqrt()
    }

    fn passthrough(compress: bool) -> Arc<MicPassthrough> {
        let config = MicConfig {
            volume: 1.0,
            buffer_size: 1 << 16,
            compressor: CompressorSettings {
                enabled: compress,
                ..CompressorSettings::default()
            },
            ..MicConfig::default()
        };
        Arc::new(MicPassthrough::new(44_100, config).unwrap())
    }

    /// Push `input` and render it back in one block; returns the steady
    /// second half.
    fn run(mic: &Arc<MicPassthrough>, input: &[f32]) -> Vec<f32> {
        let (mut capture, mut renderer) = mic.open().unwrap();
        assert_eq!(capture.push(input), input.len());
        let mut out = vec![0.0f32; input.len()];
        renderer.render(&mut out).unwrap();
        out[input.len() / 2..].to_vec()
    }

    #[test]
    fn test_lowpass_attenuates_highs() {
        let mic = passthrough(false);
        let low = run(&mic, &sine(200.0, 0.1, 8192));
        let high = run(&mic, &sine(5000.0, 0.1, 8192));
        let ratio_db = 20.0 * (rms(&high) / rms(&low)).log10();
        // 4th order: ~-56 dB at 5 kHz for a 1 kHz corner.
        assert!(ratio_db < -40.0, "5 kHz only {ratio_db:.1} dB down");
    }

    #[test]
    fn test_gain_curve() {
        let s = CompressorSettings::default();
        assert_eq!(s.gain_reduction_db(-60.0), 0.0);
        // 10 dB over at 4:1 loses 7.5 dB.
        assert!((s.gain_reduction_db(-20.0) - 7.5).abs() < 1e-12);
        // Continuous at both knee edges.
        let lo = s.gain_reduction_db(-33.0);
        let hi = s.gain_reduction_db(-27.0);
        assert!(lo.abs() < 1e-12, "lo {lo}");
        assert!((hi - 0.75 * 3.0).abs() < 1e-12, "hi {hi}");
    }

    #[test]
    fn test_output_slope_above_knee_is_one_over_ratio() {
        let s = CompressorSettings::default();
        let out = |level: f64| level - s.gain_reduction_db(level);
        let slope = (out(-10.0) - out(-20.0)) / 10.0;
        assert!((slope - 1.0 / s.ratio).abs() < 1e-12, "slope {slope}");
    }

    #[test]
    fn test_compressor_narrows_dynamics() {
        let settings = CompressorSettings {
            makeup_db: 0.0,
            ..CompressorSettings::default()
        };
        let mut quiet = Compressor::new(settings.clone(), 44_100);
        let mut loud = Compressor::new(settings, 44_100);
        let q: Vec<f32> = sine(200.0, 0.01, 8192)
            .iter()
            .map(|x| quiet.process(*x as f64) as f32)
            .collect();
        let l: Vec<f32> = sine(200.0, 0.5, 8192)
            .iter()
            .map(|x| loud.process(*x as f64) as f32)
            .collect();
        let in_db = 20.0 * (0.5f64 / 0.01).log10();
        let out_db = 20.0 * (rms(&l[4096..]) / rms(&q[4096..])).log10();
        assert!(out_db < in_db - 10.0, "in {in_db:.1} dB, out {out_db:.1} dB");
    }

    #[test]
    fn test_underrun_is_silent_and_counted() {
        let mic = passthrough(true);
        let (_capture, mut renderer) = mic.open().unwrap();
        let mut out = vec![1.0f32; 256];
        renderer.render(&mut out).unwrap();
        assert!(out.iter().all(|s| *s == 0.0));
        assert_eq!(mic.underrun_count(), 1);
    }

    #[test]
    fn test_ring_overflow_drops() {
        let config = MicConfig {
            buffer_size: 100,
            ..MicConfig::default()
        };
        let mic = Arc::new(MicPassthrough::new(44_100, config).unwrap());
        let (mut capture, renderer) = mic.open().unwrap();
        assert_eq!(capture.push(&[0.1; 150]), 100);
        assert_eq!(capture.dropped(), 50);
        assert_eq!(renderer.buffered(), 100);
    }

    #[test]
    fn test_level_meter_and_live_settings() {
        let mic = passthrough(true);
        assert_eq!(mic.level_db(), METER_FLOOR_DB);
        let (mut capture, mut renderer) = mic.open().unwrap();
        capture.push(&sine(300.0, 0.2, 8192));
        let mut block = [0.0f32; 512];
        for _ in 0..16 {
            renderer.render(&mut block).unwrap();
        }
        assert!(mic.level_db() > -40.0, "level {}", mic.level_db());

        mic.set_compression(CompressorSettings {
            ratio: 8.0,
            ..CompressorSettings::default()
        });
        assert_eq!(mic.compression().ratio, 8.0);
        mic.set_volume(2.0);
        assert_eq!(mic.volume(), 1.0);
    }

    #[test]
    fn test_rejects_cutoff_above_nyquist() {
        let config = MicConfig {
            cutoff_hz: 30_000.0,
            ..MicConfig::default()
        };
        assert!(MicPassthrough::new(44_100, config).is_err());
    }

    #[test]
    fn test_replaced_settings_are_freed_by_control_side() {
        let mic = passthrough(true);
        let (_capture, mut renderer) = mic.open().unwrap();
        let first = Arc::clone(&renderer.settings);

        mic.set_compression(CompressorSettings {
            ratio: 2.0,
            ..CompressorSettings::default()
        });
        let mut block = [0.0f32; 64];
        renderer.render(&mut block).unwrap();
        assert_eq!(renderer.settings.ratio, 2.0);
        // Still parked in the return ring.
        assert_eq!(Arc::strong_count(&first), 2);

        mic.set_compression(CompressorSettings::default());
        assert_eq!(Arc::strong_count(&first), 1);
    }
}
