use crate::elements::{SideHole, StraightDuct};
use crate::transfer_matrix::TransferMatrix;
use crate::{AcousticElement, TubeParams};
use num_complex::Complex64;
use std::f64::consts::PI;

/// An ordered chain of acoustic elements between two rigid end caps.
///
/// [`TubeNetwork::from_params`] builds the T-network: half the tube, the
/// lumped side hole, then the other half.
pub struct TubeNetwork {
    elements: Vec<Box<dyn AcousticElement>>,
    /// Speed of sound in m/s.
    pub c: f64,
    /// Gas density in kg/m³.
    pub rho: f64,
}

impl TubeNetwork {
    /// Create a network from a custom list of elements.
    pub fn new(elements: Vec<Box<dyn AcousticElement>>, c: f64, rho: f64) -> Self {
        Self { elements, c, rho }
    }

    pub fn from_params(params: &TubeParams) -> Self {
        let p = params.sanitized();
        let half = p.tube_length / 2.0;
        let mut elements: Vec<Box<dyn AcousticElement>> =
            vec![Box::new(StraightDuct::new(half, p.tube_diameter))];
        if p.hole_size > 0.0 {
            elements.push(Box::new(SideHole::new(p.hole_size, p.hole_end_correction)));
        }
        elements.push(Box::new(StraightDuct::new(half, p.tube_diameter)));
        Self::new(elements, p.speed_of_sound, p.gas_density)
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Compute the total transfer matrix at angular frequency `omega`.
    pub fn total_transfer_matrix(&self, omega: f64) -> TransferMatrix {
        let mut total = TransferMatrix::identity();
        for elem in &self.elements {
            let t = elem.transfer_matrix(omega, self.c, self.rho);
            total = total.chain(&t);
        }
        total
    }

    /// T₂₁ of the whole chain at `freq` Hz; zero at closed-closed resonances.
    pub fn closed_end_velocity(&self, freq: f64) -> Complex64 {
        self.total_transfer_matrix(2.0 * PI * freq).closed_end_velocity()
    }
}
