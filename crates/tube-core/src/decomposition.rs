//! Ridge-regularized projection of a target profile onto the tube modes.
//!
//! The response basis and the factorization of its normal matrix depend
//! only on the tube physics and the mode count, so they are cached and
//! reused across targets; each solve only pays for `Pᵀg` and two
//! triangular substitutions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::acoustics::{normalize_peak, TNetworkModel};
use crate::constants::NUM_CHANNELS;
use crate::linalg::{gram_regularized, mat_vec, solve_general, transpose_mul, Cholesky};
use crate::pressure_matrix::profile_error;
use crate::resonance::quarter_wave_modes;
use crate::state::{lock, ChangeOrigin, ChannelBank, ChannelUpdate};
use crate::{PhysicsKey, TubeError, TubeParams};

pub const DEFAULT_LAMBDA: f64 = 1e-6;
/// Amplitudes at or below this are not worth a channel.
pub const SIGNIFICANT_AMPLITUDE: f64 = 0.01;

/// Result of one decomposition. Replaced wholesale, never patched.
#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    pub frequencies: Vec<f64>,
    /// Clipped to [0, 1], one per frequency.
    pub amplitudes: Vec<f64>,
    pub target_profile: Vec<f64>,
    /// `P·a` with the clipped amplitudes.
    pub achieved_profile: Vec<f64>,
    /// Mean squared error of achieved vs. target.
    pub error: f64,
    /// `||P·a − g||`.
    pub residual_norm: f64,
}

impl Solution {
    pub fn pairs(&self) -> Vec<(f64, f64)> {
        self.frequencies
            .iter()
            .copied()
            .zip(self.amplitudes.iter().copied())
            .collect()
    }

    /// Pairs above [`SIGNIFICANT_AMPLITUDE`], loudest first, at most `limit`.
    pub fn strongest(&self, limit: usize) -> Vec<(f64, f64)> {
        let mut pairs: Vec<(f64, f64)> = self
            .pairs()
            .into_iter()
            .filter(|(_, a)| *a > SIGNIFICANT_AMPLITUDE)
            .collect();
        pairs.sort_by(|a, b| b.1.total_cmp(&a.1));
        pairs.truncate(limit);
        pairs
    }
}

#[derive(Debug)]
enum Factorization {
    Cholesky(Cholesky),
    /// The normal matrix itself, solved by elimination on each call.
    General(Vec<f64>),
}

/// Normalized response matrix for one physics key and mode count.
#[derive(Debug)]
struct ResponseBasis {
    key: PhysicsKey,
    modes: usize,
    frequencies: Vec<f64>,
    /// Row-major `positions × modes`.
    matrix: Vec<f64>,
    positions: usize,
    factor: Factorization,
}

impl ResponseBasis {
    fn build(params: &TubeParams, positions: usize, modes: usize, lambda: f64) -> Self {
        let safe = params.sanitized();
        let grid = safe.positions(positions);
        let model = TNetworkModel::new(&safe, &grid);
        let frequencies = quarter_wave_modes(safe.speed_of_sound, safe.tube_length, modes);

        let mut matrix = vec![0.0; positions * modes];
        let mut column = vec![0.0; positions];
        for (m, &freq) in frequencies.iter().enumerate() {
            model.signed_pressures(freq, &mut column);
            normalize_peak(&mut column);
            for (r, v) in column.iter().enumerate() {
                matrix[r * modes + m] = *v;
            }
        }

        let normal = gram_regularized(&matrix, positions, modes, lambda);
        let factor = match Cholesky::factor(&normal, modes) {
            Ok(ch) => Factorization::Cholesky(ch),
            Err(_) => {
                warn!(modes, "normal matrix not positive definite, using elimination");
                Factorization::General(normal)
            }
        };

        Self {
            key: params.physics_key(positions),
            modes,
            frequencies,
            matrix,
            positions,
            factor,
        }
    }

    fn solve_normal(&self, rhs: &[f64]) -> Result<Vec<f64>, TubeError> {
        match &self.factor {
            Factorization::Cholesky(ch) => ch.solve(rhs),
            Factorization::General(normal) => solve_general(normal, rhs, self.modes),
        }
    }
}

pub struct ModalDecomposition {
    lambda: f64,
    basis: Mutex<Option<Arc<ResponseBasis>>>,
    builds: AtomicUsize,
}

impl Default for ModalDecomposition {
    fn default() -> Self {
        Self::new(DEFAULT_LAMBDA)
    }
}

impl ModalDecomposition {
    pub fn new(lambda: f64) -> Self {
        Self {
            lambda: lambda.max(0.0),
            basis: Mutex::new(None),
            builds: AtomicUsize::new(0),
        }
    }

    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    /// How many times the response basis has been (re)built.
    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::Relaxed)
    }

    pub fn invalidate(&self) {
        *lock(&self.basis) = None;
    }

    fn basis(&self, params: &TubeParams, positions: usize, modes: usize) -> Arc<ResponseBasis> {
        let key = params.physics_key(positions);
        if let Some(b) = lock(&self.basis)
            .as_ref()
            .filter(|b| b.key == key && b.modes == modes)
        {
            return b.clone();
        }

        // Built without the lock held; a racing build just wins the slot.
        let built = Arc::new(ResponseBasis::build(params, positions, modes, self.lambda));
        self.builds.fetch_add(1, Ordering::Relaxed);
        debug!(positions, modes, "decomposition basis built");
        *lock(&self.basis) = Some(built.clone());
        built
    }

    /// Decompose `target` (sampled on `target.len()` evenly spaced
    /// positions) into `num_modes` quarter-wave modes.
    pub fn solve(
        &self,
        params: &TubeParams,
        target: &[f64],
        num_modes: usize,
    ) -> Result<Solution, TubeError> {
        if target.is_empty() || num_modes == 0 {
            return Err(TubeError::EmptyTarget);
        }
        if target.len() < 2 {
            return Err(TubeError::DimensionMismatch {
                expected: 2,
                found: target.len(),
            });
        }

        let basis = self.basis(params, target.len(), num_modes);
        let rhs = transpose_mul(&basis.matrix, basis.positions, basis.modes, target);
        let raw = basis.solve_normal(&rhs)?;
        if raw.iter().any(|a| !a.is_finite()) {
            return Err(TubeError::SingularSystem);
        }

        let amplitudes: Vec<f64> = raw.iter().map(|a| a.clamp(0.0, 1.0)).collect();
        let achieved = mat_vec(&basis.matrix, basis.positions, basis.modes, &amplitudes);
        let residual_norm = achieved
            .iter()
            .zip(target)
            .map(|(a, g)| (a - g) * (a - g))
            .sum::<f64>()
            .sqrt();

        Ok(Solution {
            frequencies: basis.frequencies.clone(),
            amplitudes,
            target_profile: target.to_vec(),
            error: profile_error(&achieved, target),
            achieved_profile: achieved,
            residual_norm,
        })
    }
}

/// Write up to eight significant pairs into the channel bank, loudest on
/// channel 0, and mute the rest. Returns the number of channels used.
pub fn apply_to_channels(pairs: &[(f64, f64)], bank: &ChannelBank) -> Result<usize, TubeError> {
    let mut selected: Vec<(f64, f64)> = pairs
        .iter()
        .copied()
        .filter(|(_, a)| *a > SIGNIFICANT_AMPLITUDE)
        .collect();
    selected.sort_by(|a, b| b.1.total_cmp(&a.1));
    selected.truncate(NUM_CHANNELS);

    for (channel, &(frequency, amplitude)) in selected.iter().enumerate() {
        bank.set_from(
            ChangeOrigin::Solver,
            channel,
            ChannelUpdate {
                frequency: Some(frequency),
                volume: Some(amplitude.min(1.0)),
                mute: Some(false),
            },
        )?;
    }
    for channel in selected.len()..NUM_CHANNELS {
        bank.set_from(ChangeOrigin::Solver, channel, ChannelUpdate::mute(true))?;
    }
    info!(applied = selected.len(), "solution applied to channels");
    Ok(selected.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basis_columns(params: &TubeParams, positions: usize, modes: usize) -> Vec<Vec<f64>> {
        let b = ResponseBasis::build(params, positions, modes, DEFAULT_LAMBDA);
        (0..modes)
            .map(|m| (0..positions).map(|r| b.matrix[r * modes + m]).collect())
            .collect()
    }

    #[test]
    fn test_columns_have_unit_peak() {
        let cols = basis_columns(&TubeParams::default(), 10, 6);
        for (m, col) in cols.iter().enumerate() {
            let peak = col.iter().fold(0.0f64, |a, v| a.max(v.abs()));
            assert!((peak - 1.0).abs() < 1e-12, "mode {m} peak {peak}");
        }
    }

    #[test]
    fn test_round_trip_recovers_known_modes() {
        for hole in [0.0, 0.002] {
            let params = TubeParams {
                hole_size: hole,
                ..TubeParams::default()
            };
            let cols = basis_columns(&params, 10, 4);
            let target: Vec<f64> = (0..10).map(|r| 0.8 * cols[1][r] + 0.5 * cols[3][r]).collect();

            let dec = ModalDecomposition::default();
            let sol = dec.solve(&params, &target, 4).unwrap();

            let expected = [0.0, 0.8, 0.0, 0.5];
            for (a, e) in sol.amplitudes.iter().zip(expected) {
                assert!((a - e).abs() < 1e-3, "hole {hole}: amplitudes {:?}", sol.amplitudes);
            }
            assert!(sol.residual_norm < 0.05, "residual {}", sol.residual_norm);
            assert!(sol.error < 1e-4);
            assert!((sol.frequencies[1] - 257.25).abs() < 1e-9);
            assert!((sol.frequencies[3] - 600.25).abs() < 1e-9);

            let top = sol.strongest(8);
            assert_eq!(top.len(), 2);
            assert!((top[0].0 - 257.25).abs() < 1e-9);
        }
    }

    #[test]
    fn test_amplitudes_are_clipped() {
        let params = TubeParams::default();
        let target: Vec<f64> = (0..10)
            .map(|i| {
                let x = i as f64 / 9.0;
                (-(x - 0.5).powi(2) / 0.08).exp()
            })
            .collect();
        let sol = ModalDecomposition::default().solve(&params, &target, 12).unwrap();
        assert_eq!(sol.amplitudes.len(), 12);
        assert!(sol.amplitudes.iter().all(|a| (0.0..=1.0).contains(a)));
        assert!(sol.amplitudes.iter().any(|a| *a > SIGNIFICANT_AMPLITUDE));
    }

    #[test]
    fn test_basis_cache_reuse_and_invalidation() {
        let dec = ModalDecomposition::default();
        let params = TubeParams::default();
        let a = vec![1.0; 10];
        let b: Vec<f64> = (0..10).map(|i| i as f64 / 9.0).collect();

        dec.solve(&params, &a, 8).unwrap();
        dec.solve(&params, &b, 8).unwrap();
        assert_eq!(dec.build_count(), 1, "target change must reuse the basis");

        let longer = TubeParams {
            tube_length: 1.3,
            ..params.clone()
        };
        dec.solve(&longer, &a, 8).unwrap();
        assert_eq!(dec.build_count(), 2);

        dec.solve(&longer, &a, 10).unwrap();
        assert_eq!(dec.build_count(), 3, "mode count is part of the key");

        dec.invalidate();
        dec.solve(&longer, &a, 10).unwrap();
        assert_eq!(dec.build_count(), 4);
    }

    #[test]
    fn test_singular_system_is_reported() {
        // Two positions: every column is ±1 at x = 0 and ~0 at x = L, so
        // without regularization the normal matrix has rank 1.
        let dec = ModalDecomposition::new(0.0);
        let err = dec.solve(&TubeParams::default(), &[1.0, 0.0], 3).unwrap_err();
        assert_eq!(err, TubeError::SingularSystem);
    }

    #[test]
    fn test_empty_target() {
        let dec = ModalDecomposition::default();
        assert_eq!(
            dec.solve(&TubeParams::default(), &[], 4).unwrap_err(),
            TubeError::EmptyTarget
        );
    }

    #[test]
    fn test_apply_to_channels() {
        let bank = ChannelBank::new();
        let pairs = [
            (100.0, 0.2),
            (200.0, 0.9),
            (300.0, 0.005),
            (400.0, 0.0),
            (500.0, 0.5),
        ];
        let applied = apply_to_channels(&pairs, &bank).unwrap();
        assert_eq!(applied, 3);

        let snap = bank.snapshot();
        assert_eq!((snap[0].frequency, snap[0].volume, snap[0].mute), (200.0, 0.9, false));
        assert_eq!((snap[1].frequency, snap[1].volume), (500.0, 0.5));
        assert_eq!((snap[2].frequency, snap[2].volume), (100.0, 0.2));
        assert!(snap[3..].iter().all(|c| c.mute));
    }

    #[test]
    fn test_apply_caps_at_channel_count() {
        let bank = ChannelBank::new();
        let pairs: Vec<(f64, f64)> = (0..12).map(|i| (100.0 + i as f64, 0.05 * (i + 1) as f64)).collect();
        assert_eq!(apply_to_channels(&pairs, &bank).unwrap(), NUM_CHANNELS);
        // Loudest (index 11, amplitude 0.6) first.
        assert_eq!(bank.get(0).unwrap().frequency, 111.0);
        assert!(bank.snapshot().iter().all(|c| !c.mute));
    }
}
