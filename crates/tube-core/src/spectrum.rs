use std::f64::consts::PI;

use realfft::RealFftPlanner;
use tracing::warn;

/// Smallest analysis window worth transforming.
const MIN_FFT_SIZE: usize = 64;
/// Peaks quieter than this fraction of the loudest bin are ignored.
const PEAK_FLOOR: f64 = 0.05;

/// Hann-windowed magnitude spectrum of the first `fft_size` samples.
///
/// `fft_size` is the largest power of two that fits in `samples`; returns
/// the `fft_size / 2 + 1` bin magnitudes, or nothing for short input.
pub fn magnitude_spectrum(samples: &[f32]) -> (usize, Vec<f64>) {
    if samples.len() < MIN_FFT_SIZE {
        return (0, Vec::new());
    }
    let fft_size = 1usize << (usize::BITS - 1 - samples.len().leading_zeros());

    let mut planner = RealFftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(fft_size);

    let mut input: Vec<f64> = samples[..fft_size]
        .iter()
        .enumerate()
        .map(|(i, &s)| {
            let window = 0.5 * (1.0 - (2.0 * PI * i as f64 / fft_size as f64).cos());
            s as f64 * window
        })
        .collect();
    let mut spectrum = fft.make_output_vec();

    if let Err(e) = fft.process(&mut input, &mut spectrum) {
        warn!(error = %e, "forward FFT failed");
        return (0, Vec::new());
    }

    // Hann coherent gain is 0.5; scale so a full-scale sine reads ~1.
    let norm = 4.0 / fft_size as f64;
    (fft_size, spectrum.iter().map(|c| c.norm() * norm).collect())
}

/// The `count` strongest spectral peaks as `(frequency Hz, magnitude)`,
/// loudest first, with parabolic interpolation between bins.
pub fn dominant_frequencies(samples: &[f32], sample_rate: u32, count: usize) -> Vec<(f64, f64)> {
    let (fft_size, mags) = magnitude_spectrum(samples);
    if mags.len() < 3 {
        return Vec::new();
    }
    let loudest = mags.iter().cloned().fold(0.0, f64::max);
    if loudest <= 0.0 {
        return Vec::new();
    }
    let bin_hz = sample_rate as f64 / fft_size as f64;

    let mut peaks: Vec<(f64, f64)> = (1..mags.len() - 1)
        .filter(|&k| mags[k] > mags[k - 1] && mags[k] >= mags[k + 1] && mags[k] > loudest * PEAK_FLOOR)
        .map(|k| {
            let (a, b, c) = (mags[k - 1], mags[k], mags[k + 1]);
            let denom = a - 2.0 * b + c;
            let delta = if denom.abs() > 1e-12 { 0.5 * (a - c) / denom } else { 0.0 };
            ((k as f64 + delta) * bin_hz, b)
        })
        .collect();
    peaks.sort_by(|x, y| y.1.total_cmp(&x.1));
    peaks.truncate(count);
    peaks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f64, amp: f64, n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| (amp * (2.0 * PI * freq * i as f64 / 44_100.0).sin()) as f32)
            .collect()
    }

    #[test]
    fn test_single_tone_peak() {
        let samples = sine(440.0, 0.5, 16_384);
        let peaks = dominant_frequencies(&samples, 44_100, 3);
        assert!(!peaks.is_empty());
        assert!((peaks[0].0 - 440.0).abs() < 3.0, "peak at {} Hz", peaks[0].0);
        assert!((peaks[0].1 - 0.5).abs() < 0.1, "magnitude {}", peaks[0].1);
    }

    #[test]
    fn test_two_tones_ordered_by_level() {
        let a = sine(300.0, 0.2, 16_384);
        let b = sine(1000.0, 0.6, 16_384);
        let mix: Vec<f32> = a.iter().zip(&b).map(|(x, y)| x + y).collect();
        let peaks = dominant_frequencies(&mix, 44_100, 2);
        assert_eq!(peaks.len(), 2);
        assert!((peaks[0].0 - 1000.0).abs() < 3.0, "{peaks:?}");
        assert!((peaks[1].0 - 300.0).abs() < 3.0, "{peaks:?}");
    }

    #[test]
    fn test_short_or_silent_input() {
        assert!(dominant_frequencies(&[0.1; 10], 44_100, 1).is_empty());
        assert!(dominant_frequencies(&[0.0; 4096], 44_100, 1).is_empty());
    }
}
