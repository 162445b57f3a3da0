//! Dense LU factorization with partial pivoting.
//!
//! The Jacobian and the reduced susceptance matrix are assembled sparse,
//! but the systems solved per island are small enough that a dense
//! factorization is the pragmatic choice. The factors support both the
//! plain solve `A x = b` (Newton steps) and the transposed solve
//! `Aᵀ x = b` (sensitivities of one variable to all targets).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LuError {
    #[error("singular matrix at column {0}")]
    Singular(usize),

    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// LU factors of an `n x n` matrix, row-major, with the row swaps applied
/// during factorization recorded as successive transpositions.
#[derive(Debug, Clone)]
pub struct LuFactors {
    n: usize,
    lu: Vec<f64>,
    pivots: Vec<usize>,
}

impl LuFactors {
    /// Factorize a row-major dense matrix with partial pivoting.
    pub fn factorize(matrix: &[f64], n: usize) -> Result<Self, LuError> {
        if matrix.len() != n * n {
            return Err(LuError::DimensionMismatch {
                expected: n * n,
                got: matrix.len(),
            });
        }
        let mut lu = matrix.to_vec();
        let mut pivots = vec![0usize; n];

        for k in 0..n {
            let mut max_val = lu[k * n + k].abs();
            let mut max_idx = k;
            for i in (k + 1)..n {
                let val = lu[i * n + k].abs();
                if val > max_val {
                    max_val = val;
                    max_idx = i;
                }
            }

            if max_val < 1e-14 {
                return Err(LuError::Singular(k));
            }

            pivots[k] = max_idx;
            if max_idx != k {
                for j in 0..n {
                    lu.swap(k * n + j, max_idx * n + j);
                }
            }

            let pivot = lu[k * n + k];
            for i in (k + 1)..n {
                let factor = lu[i * n + k] / pivot;
                lu[i * n + k] = factor;
                for j in (k + 1)..n {
                    lu[i * n + j] -= factor * lu[k * n + j];
                }
            }
        }

        Ok(Self { n, lu, pivots })
    }

    pub fn dim(&self) -> usize {
        self.n
    }

    /// Solve `A x = b` in place.
    pub fn solve_in_place(&self, b: &mut [f64]) -> Result<(), LuError> {
        let n = self.n;
        if b.len() != n {
            return Err(LuError::DimensionMismatch {
                expected: n,
                got: b.len(),
            });
        }

        for k in 0..n {
            if self.pivots[k] != k {
                b.swap(k, self.pivots[k]);
            }
        }

        // L y = Pb, unit diagonal
        for i in 1..n {
            for j in 0..i {
                b[i] -= self.lu[i * n + j] * b[j];
            }
        }

        // U x = y
        for i in (0..n).rev() {
            for j in (i + 1)..n {
                b[i] -= self.lu[i * n + j] * b[j];
            }
            b[i] /= self.lu[i * n + i];
        }

        Ok(())
    }

    /// Solve `Aᵀ x = b` in place.
    ///
    /// With `PA = LU` we have `Aᵀ = Uᵀ Lᵀ P`, so the solve runs Uᵀ forward
    /// (dividing by the diagonal), Lᵀ backward (unit diagonal), then undoes
    /// the recorded row transpositions in reverse order.
    pub fn solve_transposed_in_place(&self, b: &mut [f64]) -> Result<(), LuError> {
        let n = self.n;
        if b.len() != n {
            return Err(LuError::DimensionMismatch {
                expected: n,
                got: b.len(),
            });
        }

        // Uᵀ y = b
        for i in 0..n {
            for j in 0..i {
                b[i] -= self.lu[j * n + i] * b[j];
            }
            b[i] /= self.lu[i * n + i];
        }

        // Lᵀ z = y
        for i in (0..n).rev() {
            for j in (i + 1)..n {
                b[i] -= self.lu[j * n + i] * b[j];
            }
        }

        // x = Pᵀ z
        for k in (0..n).rev() {
            if self.pivots[k] != k {
                b.swap(k, self.pivots[k]);
            }
        }

        Ok(())
    }

    /// Convenience wrapper returning a fresh solution vector.
    pub fn solve(&self, b: &[f64]) -> Result<Vec<f64>, LuError> {
        let mut x = b.to_vec();
        self.solve_in_place(&mut x)?;
        Ok(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matvec(a: &[f64], x: &[f64], n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| (0..n).map(|j| a[i * n + j] * x[j]).sum())
            .collect()
    }

    fn matvec_t(a: &[f64], x: &[f64], n: usize) -> Vec<f64> {
        (0..n)
            .map(|j| (0..n).map(|i| a[i * n + j] * x[i]).sum())
            .collect()
    }

    // Unsymmetric test matrix that forces pivoting.
    const A: [f64; 9] = [0.0, 2.0, 1.0, 1.0, -1.0, 3.0, 4.0, 0.5, -2.0];

    #[test]
    fn test_solve_roundtrip() {
        let factors = LuFactors::factorize(&A, 3).unwrap();
        let x_true = [1.5, -0.5, 2.0];
        let b = matvec(&A, &x_true, 3);
        let x = factors.solve(&b).unwrap();
        for (xi, ti) in x.iter().zip(x_true.iter()) {
            assert!((xi - ti).abs() < 1e-12);
        }
    }

    #[test]
    fn test_transposed_solve_roundtrip() {
        let factors = LuFactors::factorize(&A, 3).unwrap();
        let x_true = [0.25, 3.0, -1.0];
        let mut b = matvec_t(&A, &x_true, 3);
        factors.solve_transposed_in_place(&mut b).unwrap();
        for (xi, ti) in b.iter().zip(x_true.iter()) {
            assert!((xi - ti).abs() < 1e-12);
        }
    }

    #[test]
    fn test_singular_matrix_rejected() {
        let singular = [1.0, 2.0, 2.0, 4.0];
        assert!(matches!(
            LuFactors::factorize(&singular, 2),
            Err(LuError::Singular(_))
        ));
    }

    #[test]
    fn test_dimension_mismatch() {
        let factors = LuFactors::factorize(&A, 3).unwrap();
        let mut short = vec![1.0, 2.0];
        assert!(matches!(
            factors.solve_in_place(&mut short),
            Err(LuError::DimensionMismatch { .. })
        ));
    }
}
