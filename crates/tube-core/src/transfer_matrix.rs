use num_complex::Complex64;

/// A 2×2 complex transfer matrix relating pressure and volume velocity on
/// either side of an acoustic element.
///
/// ```text
/// [p_out]   [a  b] [p_in ]
/// [U_out] = [c  d] [U_in ]
/// ```
#[derive(Debug, Clone, Copy)]
pub struct TransferMatrix {
    pub a: Complex64,
    pub b: Complex64,
    pub c: Complex64,
    pub d: Complex64,
}

impl TransferMatrix {
    pub fn new(a: Complex64, b: Complex64, c: Complex64, d: Complex64) -> Self {
        Self { a, b, c, d }
    }

    /// Identity matrix (no-op element).
    pub fn identity() -> Self {
        Self {
            a: Complex64::new(1.0, 0.0),
            b: Complex64::new(0.0, 0.0),
            c: Complex64::new(0.0, 0.0),
            d: Complex64::new(1.0, 0.0),
        }
    }

    /// Shunt element with admittance `y` (a side branch to ambient).
    pub fn shunt(y: Complex64) -> Self {
        Self {
            c: y,
            ..Self::identity()
        }
    }

    /// Chain (multiply) this matrix with another: self · other.
    pub fn chain(&self, other: &TransferMatrix) -> TransferMatrix {
        TransferMatrix {
            a: self.a * other.a + self.b * other.c,
            b: self.a * other.b + self.b * other.d,
            c: self.c * other.a + self.d * other.c,
            d: self.c * other.b + self.d * other.d,
        }
    }

    pub fn determinant(&self) -> Complex64 {
        self.a * self.d - self.b * self.c
    }

    /// Far-end volume velocity per unit pressure when the near end is rigid.
    ///
    /// With `U_in = 0`, `U_out = c · p_in`; a closed-closed tube resonates
    /// exactly where this vanishes.
    pub fn closed_end_velocity(&self) -> Complex64 {
        self.c
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_chain() {
        let id = TransferMatrix::identity();
        let m = TransferMatrix::new(
            Complex64::new(1.0, 0.5),
            Complex64::new(0.0, 1.0),
            Complex64::new(0.0, -1.0),
            Complex64::new(1.0, 0.5),
        );
        let result = id.chain(&m);
        assert!((result.a - m.a).norm() < 1e-12);
        assert!((result.b - m.b).norm() < 1e-12);
        assert!((result.c - m.c).norm() < 1e-12);
        assert!((result.d - m.d).norm() < 1e-12);
    }

    #[test]
    fn test_shunt_is_reciprocal() {
        let m = TransferMatrix::shunt(Complex64::new(0.0, -3.0e-6));
        let det = m.determinant();
        assert!((det - Complex64::new(1.0, 0.0)).norm() < 1e-12, "det = {det}");
    }

    #[test]
    fn test_chained_ducts_stay_reciprocal() {
        // A lossless duct has det = cos²(kL) + sin²(kL) = 1, and so does
        // any product of such matrices.
        let duct = |kl: f64, z: f64| {
            let j = Complex64::new(0.0, 1.0);
            TransferMatrix::new(
                Complex64::new(kl.cos(), 0.0),
                j * z * kl.sin(),
                j * (1.0 / z) * kl.sin(),
                Complex64::new(kl.cos(), 0.0),
            )
        };
        let m = duct(0.7, 250.0)
            .chain(&TransferMatrix::shunt(Complex64::new(0.0, 0.01)))
            .chain(&duct(1.3, 250.0));
        let det = m.determinant();
        assert!((det - Complex64::new(1.0, 0.0)).norm() < 1e-9, "det = {det}");
    }
}
