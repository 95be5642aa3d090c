//! Reflection-sum pressure model of the closed-closed tube.
//!
//! At each position the pressure is an incident wave `cos(kx)` plus
//! `reflection_count` image waves, each damped by `exp(-(d/q)·path)`. The
//! r-th reflection travels `2nL - x` (odd r) or `2nL + x` (even r) with
//! `n = ceil(r/2)`; both end caps reflect with coefficient +1.
//!
//! Values are signed so that several frequencies superpose linearly. Use
//! [`magnitude_profile`] only for single-frequency display.

use std::f64::consts::PI;

use crate::TubeParams;

/// Scale of the hole impedance perturbation.
const HOLE_EFFECT_SCALE: f64 = 0.3;
/// Standing-wave enhancement per reflection, normalised to 5 reflections.
const STANDING_WAVE_GAIN: f64 = 0.3;

/// Pressure model bound to a fixed position grid.
///
/// Path lengths and their damping weights do not depend on frequency, so
/// they are computed once here and reused for every frequency row.
#[derive(Debug, Clone)]
pub struct TNetworkModel {
    params: TubeParams,
    positions: Vec<f64>,
    /// `positions.len() × terms` path lengths, row per position.
    paths: Vec<f64>,
    /// `exp(-(d/q)·path)` for each entry of `paths`.
    weights: Vec<f64>,
    terms: usize,
}

impl TNetworkModel {
    pub fn new(params: &TubeParams, positions: &[f64]) -> Self {
        let params = params.sanitized();
        let terms = params.reflection_count as usize + 1;
        let effective_damping = params.damping_coefficient / params.q_factor;
        let length = params.tube_length;

        let mut paths = Vec::with_capacity(positions.len() * terms);
        for &x in positions {
            paths.push(x);
            for r in 1..terms {
                let n = r.div_ceil(2) as f64;
                paths.push(if r % 2 == 1 {
                    2.0 * n * length - x
                } else {
                    2.0 * n * length + x
                });
            }
        }
        let weights = paths
            .iter()
            .map(|path| (-effective_damping * path).exp())
            .collect();

        Self {
            params,
            positions: positions.to_vec(),
            paths,
            weights,
            terms,
        }
    }

    pub fn params(&self) -> &TubeParams {
        &self.params
    }

    pub fn positions(&self) -> &[f64] {
        &self.positions
    }

    /// Signed pressure at every grid position for one frequency.
    pub fn signed_pressures(&self, frequency: f64, out: &mut [f64]) {
        debug_assert_eq!(out.len(), self.positions.len());
        let p = &self.params;
        let k = 2.0 * PI * frequency / p.speed_of_sound;

        let standing = if p.reflection_count > 2 {
            1.0 + STANDING_WAVE_GAIN
                * (k * p.tube_length).sin().abs()
                * (p.reflection_count as f64 / 5.0)
        } else {
            1.0
        };

        // z0 / Z_hole with Z_hole = z0·k·(h/2)·(1 + end correction).
        let hole_effect = if p.hole_size > 0.0 && k > 0.0 {
            HOLE_EFFECT_SCALE / (k * (p.hole_size / 2.0) * (1.0 + p.hole_end_correction))
        } else {
            0.0
        };

        for (i, (slot, &x)) in out.iter_mut().zip(&self.positions).enumerate() {
            let row = i * self.terms..(i + 1) * self.terms;
            let mut sum: f64 = self.paths[row.clone()]
                .iter()
                .zip(&self.weights[row])
                .map(|(path, w)| w * (k * path).cos())
                .sum();
            sum *= standing;
            if hole_effect != 0.0 {
                sum *= 1.0 + hole_effect * (k * x).sin();
            }
            *slot = sum;
        }
    }

    pub fn pressures(&self, frequency: f64) -> Vec<f64> {
        let mut out = vec![0.0; self.positions.len()];
        self.signed_pressures(frequency, &mut out);
        out
    }
}

/// Display-only rectified profile. Never feed this back into a solver.
pub fn magnitude_profile(signed: &[f64]) -> Vec<f64> {
    signed.iter().map(|v| v.abs()).collect()
}

/// Scale `values` so the largest magnitude is 1; returns the old peak.
///
/// An all-zero vector is left untouched.
pub fn normalize_peak(values: &mut [f64]) -> f64 {
    let peak = values.iter().fold(0.0f64, |m, v| m.max(v.abs()));
    if peak > 0.0 {
        for v in values.iter_mut() {
            *v /= peak;
        }
    }
    peak
}
