use crate::constants::area_from_diameter;
use crate::transfer_matrix::TransferMatrix;
use crate::AcousticElement;
use num_complex::Complex64;

/// A straight cylindrical duct.
#[derive(Debug, Clone)]
pub struct StraightDuct {
    /// Length in metres.
    pub length: f64,
    /// Inner diameter in metres.
    pub diameter: f64,
}

impl StraightDuct {
    pub fn new(length: f64, diameter: f64) -> Self {
        Self { length, diameter }
    }

    /// Cross-sectional area in m².
    pub fn area(&self) -> f64 {
        area_from_diameter(self.diameter)
    }

    /// Characteristic impedance Z = ρc/S.
    pub fn impedance(&self, c: f64, rho: f64) -> f64 {
        rho * c / self.area()
    }
}

impl AcousticElement for StraightDuct {
    fn transfer_matrix(&self, omega: f64, c: f64, rho: f64) -> TransferMatrix {
        let k = omega / c;
        let z = self.impedance(c, rho);
        let kl = k * self.length;

        let cos_kl = Complex64::new(kl.cos(), 0.0);
        let sin_kl = Complex64::new(kl.sin(), 0.0);
        let j = Complex64::new(0.0, 1.0);

        TransferMatrix::new(
            cos_kl,
            j * Complex64::new(z, 0.0) * sin_kl,
            j * Complex64::new(1.0 / z, 0.0) * sin_kl,
            cos_kl,
        )
    }
}

/// A small open side hole in the tube wall, modelled as a shunt inertance.
///
/// The gas plug in the hole has effective length `(d/2)·(1 + end_correction)`,
/// giving `Z_h = jωρ·l_eff / S_h`.
#[derive(Debug, Clone)]
pub struct SideHole {
    /// Hole diameter in metres.
    pub diameter: f64,
    pub end_correction: f64,
}

impl SideHole {
    pub fn new(diameter: f64, end_correction: f64) -> Self {
        Self {
            diameter,
            end_correction,
        }
    }

    pub fn effective_length(&self) -> f64 {
        (self.diameter / 2.0) * (1.0 + self.end_correction)
    }

    /// Acoustic impedance of the hole at angular frequency `omega`.
    pub fn impedance(&self, omega: f64, rho: f64) -> Complex64 {
        let area = area_from_diameter(self.diameter);
        Complex64::new(0.0, omega * rho * self.effective_length() / area)
    }
}

impl AcousticElement for SideHole {
    fn transfer_matrix(&self, omega: f64, _c: f64, rho: f64) -> TransferMatrix {
        if self.diameter <= 0.0 || omega <= 0.0 {
            // Closed hole, or DC where the inertance vanishes and the
            // admittance is unbounded; a rigid wall is the useful limit.
            return TransferMatrix::identity();
        }
        TransferMatrix::shunt(self.impedance(omega, rho).inv())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    #[test]
    fn test_half_wave_duct() {
        // At half wavelength, kL = π: cos(kL) = -1 and sin(kL) = 0, so the
        // duct inverts pressure and passes no velocity from a rigid end.
        let c = 343.0;
        let rho = 1.9;
        let length = 1.0;
        let freq = c / (2.0 * length);

        let duct = StraightDuct::new(length, 0.05);
        let t = duct.transfer_matrix(2.0 * PI * freq, c, rho);

        assert!((t.a.re + 1.0).abs() < 1e-12, "T11 = {}", t.a);
        assert!(t.c.norm() < 1e-12, "T21 should be ~0 at half wave");
    }

    #[test]
    fn test_side_hole_is_inertive() {
        let hole = SideHole::new(0.002, 0.6);
        let z100 = hole.impedance(2.0 * PI * 100.0, 1.9);
        let z200 = hole.impedance(2.0 * PI * 200.0, 1.9);
        assert_eq!(z100.re, 0.0);
        assert!(z100.im > 0.0);
        // Inertance: impedance doubles with frequency.
        assert!((z200.im / z100.im - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_closed_hole_is_identity() {
        let hole = SideHole::new(0.0, 0.6);
        let t = hole.transfer_matrix(2.0 * PI * 300.0, 343.0, 1.9);
        assert!((t.c).norm() < 1e-15);
        assert!((t.a - Complex64::new(1.0, 0.0)).norm() < 1e-15);
    }
}
