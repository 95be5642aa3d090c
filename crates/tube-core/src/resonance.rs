use crate::network::TubeNetwork;
use crate::TubeParams;

/// Grid steps per fundamental spacing when scanning for resonances.
const SCAN_STEPS_PER_HARMONIC: f64 = 64.0;
const BISECTION_ITERATIONS: usize = 60;

/// Closed-closed harmonic series `n·c/(2L)`, n = 1..=count.
pub fn harmonic_series(c: f64, length: f64, count: usize) -> Vec<f64> {
    let f1 = c / (2.0 * length);
    (1..=count).map(|n| n as f64 * f1).collect()
}

/// Odd quarter-wave frequencies `(2n+1)·c/(4L)`, n = 0..count.
///
/// This is the basis the modal decomposition projects targets onto.
pub fn quarter_wave_modes(c: f64, length: f64, count: usize) -> Vec<f64> {
    (0..count)
        .map(|n| (2 * n + 1) as f64 * c / (4.0 * length))
        .collect()
}

/// The `count` lowest resonances of the tube's T-network.
///
/// Sweeps Im(T₂₁) on a grid finer than the harmonic spacing and bisects
/// every sign change. With no side hole this reproduces
/// [`harmonic_series`]; a hole adds a low Helmholtz-like mode and pulls up
/// the modes with a pressure antinode at the hole.
pub fn resonant_frequencies(params: &TubeParams, count: usize) -> Vec<f64> {
    let p = params.sanitized();
    let network = TubeNetwork::from_params(&p);
    let f1 = p.speed_of_sound / (2.0 * p.tube_length);
    let step = f1 / SCAN_STEPS_PER_HARMONIC;
    let f_limit = f1 * (count as f64 + 2.0) * 2.0;

    let response = |f: f64| network.closed_end_velocity(f).im;

    let mut found = Vec::with_capacity(count);
    let mut lo = step * 0.5;
    let mut lo_val = response(lo);
    while found.len() < count && lo < f_limit {
        let hi = lo + step;
        let hi_val = response(hi);
        if lo_val * hi_val < 0.0 {
            found.push(bisect(&response, lo, hi, lo_val));
        }
        lo = hi;
        lo_val = hi_val;
    }
    found
}

/// Resonances for the fallback path: the network scan, or the analytic
/// series when the scan comes up short.
pub fn fallback_frequencies(params: &TubeParams, count: usize) -> Vec<f64> {
    let found = resonant_frequencies(params, count);
    if found.len() == count {
        return found;
    }
    let p = params.sanitized();
    harmonic_series(p.speed_of_sound, p.tube_length, count)
}

fn bisect(f: &impl Fn(f64) -> f64, mut lo: f64, mut hi: f64, mut lo_val: f64) -> f64 {
    for _ in 0..BISECTION_ITERATIONS {
        let mid = 0.5 * (lo + hi);
        let mid_val = f(mid);
        if mid_val == 0.0 {
            return mid;
        }
        if lo_val * mid_val < 0.0 {
            hi = mid;
        } else {
            lo = mid;
            lo_val = mid_val;
        }
    }
    0.5 * (lo + hi)
}
