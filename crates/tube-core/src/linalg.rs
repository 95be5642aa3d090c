use crate::TubeError;

/// Pivots smaller than this are treated as zero.
const PIVOT_EPSILON: f64 = 1e-14;

/// Lower-triangular Cholesky factor `L` with `A = L·Lᵀ`.
#[derive(Debug, Clone)]
pub struct Cholesky {
    n: usize,
    l: Vec<f64>,
}

impl Cholesky {
    /// Factor a symmetric positive-definite matrix.
    ///
    /// Fails with [`TubeError::SingularSystem`] if a diagonal entry is not
    /// comfortably positive.
    pub fn factor(a: &[f64], n: usize) -> Result<Self, TubeError> {
        check_square(a, n)?;
        let mut l = vec![0.0; n * n];
        for i in 0..n {
            for j in 0..=i {
                let mut sum = a[i * n + j];
                for k in 0..j {
                    sum -= l[i * n + k] * l[j * n + k];
                }
                if i == j {
                    if !(sum > PIVOT_EPSILON) {
                        return Err(TubeError::SingularSystem);
                    }
                    l[i * n + i] = sum.sqrt();
                } else {
                    l[i * n + j] = sum / l[j * n + j];
                }
            }
        }
        Ok(Self { n, l })
    }

    pub fn dim(&self) -> usize {
        self.n
    }

    /// Solve `A·x = b` by forward then back substitution.
    pub fn solve(&self, b: &[f64]) -> Result<Vec<f64>, TubeError> {
        let n = self.n;
        if b.len() != n {
            return Err(TubeError::DimensionMismatch {
                expected: n,
                found: b.len(),
            });
        }
        let l = &self.l;

        let mut y = vec![0.0; n];
        for i in 0..n {
            let mut sum = b[i];
            for k in 0..i {
                sum -= l[i * n + k] * y[k];
            }
            y[i] = sum / l[i * n + i];
        }

        let mut x = vec![0.0; n];
        for i in (0..n).rev() {
            let mut sum = y[i];
            for k in (i + 1)..n {
                sum -= l[k * n + i] * x[k];
            }
            x[i] = sum / l[i * n + i];
        }
        Ok(x)
    }
}

/// Solve `A·x = b` by Gaussian elimination with partial pivoting.
pub fn solve_general(a: &[f64], b: &[f64], n: usize) -> Result<Vec<f64>, TubeError> {
    check_square(a, n)?;
    if b.len() != n {
        return Err(TubeError::DimensionMismatch {
            expected: n,
            found: b.len(),
        });
    }

    let w = n + 1;
    let mut aug = vec![0.0; n * w];
    for i in 0..n {
        aug[i * w..i * w + n].copy_from_slice(&a[i * n..(i + 1) * n]);
        aug[i * w + n] = b[i];
    }

    let scale = a.iter().fold(0.0f64, |m, v| m.max(v.abs())).max(1.0);
    for col in 0..n {
        let mut max_val = aug[col * w + col].abs();
        let mut max_row = col;
        for row in (col + 1)..n {
            let v = aug[row * w + col].abs();
            if v > max_val {
                max_val = v;
                max_row = row;
            }
        }
        if !(max_val > PIVOT_EPSILON * scale) {
            return Err(TubeError::SingularSystem);
        }
        if max_row != col {
            for j in 0..w {
                aug.swap(col * w + j, max_row * w + j);
            }
        }

        let pivot = aug[col * w + col];
        for row in (col + 1)..n {
            let factor = aug[row * w + col] / pivot;
            if factor != 0.0 {
                for j in col..w {
                    aug[row * w + j] -= factor * aug[col * w + j];
                }
            }
        }
    }

    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        let mut sum = aug[i * w + n];
        for k in (i + 1)..n {
            sum -= aug[i * w + k] * x[k];
        }
        x[i] = sum / aug[i * w + i];
    }
    Ok(x)
}

/// `AᵀA + λI` for a row-major `rows × cols` matrix `A`.
pub fn gram_regularized(a: &[f64], rows: usize, cols: usize, lambda: f64) -> Vec<f64> {
    let mut g = vec![0.0; cols * cols];
    for i in 0..cols {
        for j in i..cols {
            let mut sum = 0.0;
            for r in 0..rows {
                sum += a[r * cols + i] * a[r * cols + j];
            }
            g[i * cols + j] = sum;
            g[j * cols + i] = sum;
        }
        g[i * cols + i] += lambda;
    }
    g
}

/// `Aᵀb` for a row-major `rows × cols` matrix `A`.
pub fn transpose_mul(a: &[f64], rows: usize, cols: usize, b: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; cols];
    for r in 0..rows {
        let br = b[r];
        for (c, o) in out.iter_mut().enumerate() {
            *o += a[r * cols + c] * br;
        }
    }
    out
}

/// `A·x` for a row-major `rows × cols` matrix `A`.
pub fn mat_vec(a: &[f64], rows: usize, cols: usize, x: &[f64]) -> Vec<f64> {
    (0..rows)
        .map(|r| a[r * cols..(r + 1) * cols].iter().zip(x).map(|(m, v)| m * v).sum())
        .collect()
}

fn check_square(a: &[f64], n: usize) -> Result<(), TubeError> {
    if a.len() != n * n {
        return Err(TubeError::DimensionMismatch {
            expected: n * n,
            found: a.len(),
        });
    }
    Ok(())
}
