use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::acoustics::{normalize_peak, TNetworkModel};
use crate::state::lock;
use crate::{PhysicsKey, TubeError, TubeParams};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatrixConfig {
    /// Lowest grid frequency in Hz.
    pub min_frequency: f64,
    /// Highest grid frequency in Hz.
    pub max_frequency: f64,
    /// Grid spacing in Hz.
    pub resolution: f64,
    /// Sample positions along the tube, ends included.
    pub position_count: usize,
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self {
            min_frequency: 20.0,
            max_frequency: 500.0,
            resolution: 2.0,
            position_count: 10,
        }
    }
}

impl MatrixConfig {
    pub fn validate(&self) -> Result<(), TubeError> {
        if !(self.resolution.is_finite() && self.resolution > 0.0) {
            return Err(TubeError::InvalidParameter {
                name: "resolution",
                value: self.resolution,
            });
        }
        if !(self.min_frequency.is_finite() && self.min_frequency >= 0.0) {
            return Err(TubeError::InvalidParameter {
                name: "min_frequency",
                value: self.min_frequency,
            });
        }
        if !(self.max_frequency.is_finite() && self.max_frequency > self.min_frequency) {
            return Err(TubeError::InvalidParameter {
                name: "max_frequency",
                value: self.max_frequency,
            });
        }
        if self.position_count < 2 {
            return Err(TubeError::InvalidParameter {
                name: "position_count",
                value: self.position_count as f64,
            });
        }
        Ok(())
    }

    /// Number of frequency rows: the grid never overshoots `max_frequency`.
    pub fn row_count(&self) -> usize {
        ((self.max_frequency - self.min_frequency) / self.resolution + 1e-9).floor() as usize + 1
    }
}

#[derive(Debug, Clone)]
pub struct PressureMatrix {
    key: PhysicsKey,
    config: MatrixConfig,
    positions: Vec<f64>,
    /// Row-major, one row of `positions.len()` values per grid frequency.
    values: Vec<f64>,
    rows: usize,
}

impl PressureMatrix {
    /// Evaluate the T-network model on every grid frequency.
    ///
    /// Out-of-range tube parameters are clamped (and logged) rather than
    /// rejected; only an unusable grid is an error.
    pub fn generate(params: &TubeParams, config: &MatrixConfig) -> Result<Self, TubeError> {
        config.validate()?;
        let safe = params.sanitized();
        let positions = safe.positions(config.position_count);
        let model = TNetworkModel::new(&safe, &positions);
        let rows = config.row_count();
        let cols = positions.len();

        let mut values = vec![0.0; rows * cols];
        for (i, row) in values.chunks_exact_mut(cols).enumerate() {
            let freq = config.min_frequency + i as f64 * config.resolution;
            model.signed_pressures(freq, row);
        }

        debug!(rows, cols, "pressure matrix generated");
        Ok(Self {
            key: params.physics_key(config.position_count),
            config: config.clone(),
            positions,
            values,
            rows,
        })
    }

    pub fn key(&self) -> PhysicsKey {
        self.key
    }

    pub fn config(&self) -> &MatrixConfig {
        &self.config
    }

    pub fn positions(&self) -> &[f64] {
        &self.positions
    }

    pub fn position_count(&self) -> usize {
        self.positions.len()
    }

    pub fn row_count(&self) -> usize {
        self.rows
    }

    pub fn frequency_at(&self, row: usize) -> f64 {
        self.config.min_frequency + row as f64 * self.config.resolution
    }

    pub fn row(&self, row: usize) -> &[f64] {
        let cols = self.positions.len();
        &self.values[row * cols..(row + 1) * cols]
    }

    /// Response at `frequency`, written into `out`.
    ///
    /// Grid hits copy the stored row exactly, frequencies between rows are
    /// linearly interpolated and anything outside the grid clamps to the
    /// edge row.
    pub fn lookup(&self, frequency: f64, out: &mut [f64]) {
        debug_assert_eq!(out.len(), self.positions.len());
        let last = self.rows - 1;
        let pos = (frequency - self.config.min_frequency) / self.config.resolution;

        if pos.is_nan() || pos <= 0.0 {
            out.copy_from_slice(self.row(0));
            return;
        }
        if pos >= last as f64 {
            out.copy_from_slice(self.row(last));
            return;
        }

        let i = pos.floor() as usize;
        let frac = pos - i as f64;
        if frac == 0.0 {
            out.copy_from_slice(self.row(i));
            return;
        }
        let (lo, hi) = (self.row(i), self.row(i + 1));
        for ((o, a), b) in out.iter_mut().zip(lo).zip(hi) {
            *o = a + frac * (b - a);
        }
    }

    pub fn lookup_row(&self, frequency: f64) -> Vec<f64> {
        let mut out = vec![0.0; self.positions.len()];
        self.lookup(frequency, &mut out);
        out
    }

    /// Amplitude-weighted sum of the responses of `pairs`, normalized to a
    /// peak magnitude of 1. An empty set yields all zeros.
    pub fn combine(&self, pairs: &[(f64, f64)]) -> Vec<f64> {
        let cols = self.positions.len();
        let mut total = vec![0.0; cols];
        let mut scratch = vec![0.0; cols];
        for &(freq, amp) in pairs {
            self.lookup(freq, &mut scratch);
            for (t, s) in total.iter_mut().zip(&scratch) {
                *t += amp * s;
            }
        }
        normalize_peak(&mut total);
        total
    }
}

/// Mean squared error between two equally long profiles.
pub fn profile_error(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() {
        return 0.0;
    }
    let sum: f64 = a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum();
    sum / a.len() as f64
}

/// Lock-free published matrix, rebuilt only when the physics key changes.
///
/// Readers call [`PressureMatrixCache::current`] or
/// [`PressureMatrixCache::get_or_build`] and keep the returned `Arc` for as
/// long as they need it; a rebuild never mutates a published matrix.
pub struct PressureMatrixCache {
    config: MatrixConfig,
    current: ArcSwapOption<PressureMatrix>,
    build_lock: Mutex<()>,
    generation: AtomicU64,
    builds: AtomicUsize,
}

impl PressureMatrixCache {
    pub fn new(config: MatrixConfig) -> Self {
        Self {
            config,
            current: ArcSwapOption::empty(),
            build_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            builds: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &MatrixConfig {
        &self.config
    }

    pub fn current(&self) -> Option<Arc<PressureMatrix>> {
        self.current.load_full()
    }

    /// The published matrix for `params`, generating it first if needed.
    pub fn get_or_build(&self, params: &TubeParams) -> Result<Arc<PressureMatrix>, TubeError> {
        let key = params.physics_key(self.config.position_count);
        if let Some(m) = self.current.load_full().filter(|m| m.key == key) {
            return Ok(m);
        }

        let _guard = lock(&self.build_lock);
        // Another thread may have built it while we waited.
        if let Some(m) = self.current.load_full().filter(|m| m.key == key) {
            return Ok(m);
        }

        let matrix = Arc::new(PressureMatrix::generate(params, &self.config)?);
        self.builds.fetch_add(1, Ordering::Relaxed);
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.current.store(Some(matrix.clone()));
        info!(
            generation,
            rows = matrix.row_count(),
            positions = matrix.position_count(),
            "pressure matrix published"
        );
        Ok(matrix)
    }

    /// Drop the published matrix; the next request regenerates it.
    pub fn invalidate(&self) {
        self.current.store(None);
    }

    /// Bumped on every publish.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::Relaxed)
    }
}
