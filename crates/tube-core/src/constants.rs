/// Output sample rate in Hz.
pub const SAMPLE_RATE: u32 = 44_100;
/// Frames per audio callback block (~46 ms at 44.1 kHz).
pub const BLOCK_SIZE: usize = 2048;
/// Number of externally controlled synth channels.
pub const NUM_CHANNELS: usize = 8;

/// Default per-channel volume.
pub const AMPLITUDE: f64 = 0.1;
/// Master gain applied on top of every source volume.
pub const MASTER_VOLUME: f64 = 0.8;
/// Soft-clip threshold θ in `tanh(x/θ)·θ`.
pub const SOFT_CLIP_THRESHOLD: f64 = 0.8;

/// Audible range any synth frequency is clamped into.
pub const MIN_FREQUENCY: f64 = 1.0;
pub const MAX_FREQUENCY: f64 = 20_000.0;

/// Shortest tube the models will accept, in metres.
pub const MIN_TUBE_LENGTH: f64 = 0.01;

/// Cross-sectional area from diameter (both in metres).
pub fn area_from_diameter(diameter: f64) -> f64 {
    std::f64::consts::PI * (diameter / 2.0).powi(2)
}

/// Clamp a frequency into the audible range used by the synth.
pub fn clamp_frequency(freq: f64) -> f64 {
    if freq.is_nan() {
        return MIN_FREQUENCY;
    }
    freq.clamp(MIN_FREQUENCY, MAX_FREQUENCY)
}
