pub mod acoustics;
pub mod backend;
pub mod constants;
pub mod decomposition;
pub mod elements;
pub mod error;
pub mod linalg;
pub mod mic;
pub mod network;
pub mod pressure_matrix;
pub mod pressure_model;
pub mod pressure_source;
pub mod render;
pub mod resonance;
pub mod router;
pub mod signal;
pub mod spectrum;
pub mod state;
pub mod synth;
pub mod targets;
pub mod transfer_matrix;
pub mod worker;

pub use error::TubeError;

use serde::{Deserialize, Serialize};
use tracing::warn;

// ---------------------------------------------------------------------------
// Shared interface types
// ---------------------------------------------------------------------------

/// Physical parameters of the closed-closed tube.
///
/// Everything except `propane_pressure` affects the acoustics; changing any
/// of those invalidates the pressure matrix and decomposition caches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TubeParams {
    /// Speed of sound in the tube gas, m/s.
    pub speed_of_sound: f64,
    /// Tube length in metres.
    pub tube_length: f64,
    /// Inner diameter in metres.
    pub tube_diameter: f64,
    /// Wall/gas damping coefficient, 1/m before Q weighting.
    pub damping_coefficient: f64,
    /// Side hole diameter in metres (0 = no holes).
    pub hole_size: f64,
    /// Number of end reflections summed by the pressure model.
    pub reflection_count: u32,
    /// Resonance sharpness; effective damping is `damping / q`.
    pub q_factor: f64,
    /// Gas density in kg/m³.
    pub gas_density: f64,
    /// End correction factor applied to the hole length.
    pub hole_end_correction: f64,
    /// Supply pressure; carried for display only.
    pub propane_pressure: f64,
}

impl Default for TubeParams {
    fn default() -> Self {
        Self {
            speed_of_sound: 343.0,
            tube_length: 1.0,
            tube_diameter: 0.05,    // 50 mm
            damping_coefficient: 0.5,
            hole_size: 0.002,       // 2 mm
            reflection_count: 3,
            q_factor: 5.0,
            gas_density: 1.9,       // propane at room temperature
            hole_end_correction: 0.6,
            propane_pressure: 1.0,
        }
    }
}

impl TubeParams {
    /// Return a copy clamped into the ranges the models can evaluate.
    ///
    /// A zero or negative length would divide by zero in the mode formulas,
    /// so it is raised to [`constants::MIN_TUBE_LENGTH`] and logged.
    pub fn sanitized(&self) -> Self {
        let mut p = self.clone();
        clamp_min(&mut p.tube_length, constants::MIN_TUBE_LENGTH, "tube_length");
        clamp_min(&mut p.speed_of_sound, 1.0, "speed_of_sound");
        clamp_min(&mut p.tube_diameter, 1e-4, "tube_diameter");
        clamp_min(&mut p.q_factor, 1e-3, "q_factor");
        clamp_min(&mut p.damping_coefficient, 0.0, "damping_coefficient");
        clamp_min(&mut p.hole_size, 0.0, "hole_size");
        clamp_min(&mut p.gas_density, 1e-3, "gas_density");
        clamp_min(&mut p.hole_end_correction, 0.0, "hole_end_correction");
        p
    }

    /// Key over every physics-affecting field plus the position count.
    pub fn physics_key(&self, position_count: usize) -> PhysicsKey {
        PhysicsKey {
            bits: [
                self.speed_of_sound.to_bits(),
                self.tube_length.to_bits(),
                self.tube_diameter.to_bits(),
                self.damping_coefficient.to_bits(),
                self.hole_size.to_bits(),
                self.q_factor.to_bits(),
                self.gas_density.to_bits(),
                self.hole_end_correction.to_bits(),
            ],
            reflection_count: self.reflection_count,
            position_count,
        }
    }

    /// Evenly spaced sample positions from 0 to the tube length.
    pub fn positions(&self, count: usize) -> Vec<f64> {
        let count = count.max(2);
        let step = self.tube_length / (count - 1) as f64;
        (0..count).map(|i| i as f64 * step).collect()
    }
}

fn clamp_min(value: &mut f64, min: f64, name: &'static str) {
    if !value.is_finite() || *value < min {
        warn!(parameter = name, value = *value, clamped = min, "tube parameter out of range");
        *value = min;
    }
}

/// Bit-exact cache key for physics-dependent precomputation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysicsKey {
    bits: [u64; 8],
    reflection_count: u32,
    position_count: usize,
}

impl PhysicsKey {
    pub fn position_count(&self) -> usize {
        self.position_count
    }
}

/// Trait for acoustic elements that can produce a 2×2 transfer matrix
/// at a given angular frequency.
pub trait AcousticElement: Send + Sync {
    /// Compute the 2×2 transfer matrix at angular frequency `omega` (rad/s)
    /// with speed of sound `c` (m/s) and gas density `rho` (kg/m³).
    fn transfer_matrix(&self, omega: f64, c: f64, rho: f64) -> transfer_matrix::TransferMatrix;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitized_clamps_zero_length() {
        let params = TubeParams {
            tube_length: 0.0,
            q_factor: -1.0,
            ..TubeParams::default()
        };
        let safe = params.sanitized();
        assert_eq!(safe.tube_length, constants::MIN_TUBE_LENGTH);
        assert!(safe.q_factor > 0.0);
        assert_eq!(safe.speed_of_sound, params.speed_of_sound);
    }

    #[test]
    fn test_physics_key_ignores_propane_pressure() {
        let a = TubeParams::default();
        let b = TubeParams {
            propane_pressure: 3.0,
            ..TubeParams::default()
        };
        assert_eq!(a.physics_key(8), b.physics_key(8));
    }

    #[test]
    fn test_physics_key_tracks_length_and_positions() {
        let a = TubeParams::default();
        let b = TubeParams {
            tube_length: 1.2,
            ..TubeParams::default()
        };
        assert_ne!(a.physics_key(8), b.physics_key(8));
        assert_ne!(a.physics_key(8), a.physics_key(10));
    }

    #[test]
    fn test_positions_span_tube() {
        let p = TubeParams::default().positions(8);
        assert_eq!(p.len(), 8);
        assert_eq!(p[0], 0.0);
        assert!((p[7] - 1.0).abs() < 1e-12);
    }
}
