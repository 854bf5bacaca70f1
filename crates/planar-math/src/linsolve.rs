//! Singular-tolerant dense linear solver.
//!
//! Gaussian elimination with scaled partial pivoting and both row and
//! column interchange. When a pivot column degenerates the column is
//! rotated out of the way instead of failing, which lets the solver
//! produce a solution for singular matrices as long as the right-hand
//! side lies in the column space. Used by the contact force solver to
//! test and solve active-set sub-systems.

use crate::{DMat, TINY};
use thiserror::Error;

/// Looser tolerance for the post-elimination consistency check on
/// non-pivoted rows.
const CONSISTENT_TOL: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MatrixError {
    /// A row of the coefficient block is entirely (near-)zero, so no
    /// scale factor exists for it.
    #[error("matrix row {0} has no non-zero coefficients")]
    ZeroRow(usize),

    /// The right-hand side is not in the column space of the matrix:
    /// a non-pivoted row was left with a non-negligible entry.
    #[error("no solution: right-hand side inconsistent at row {0}")]
    Inconsistent(usize),
}

/// Solver for `n x (n+1)` augmented systems.
///
/// Owns the row/column permutation and scale buffers so repeated solves
/// do not reallocate. One instance must not be shared across threads.
#[derive(Debug, Default)]
pub struct MatrixSolver {
    nrow: Vec<usize>,
    ncol: Vec<usize>,
    scale: Vec<f64>,
}

impl MatrixSolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Row permutation from the most recent solve. `row_order()[k]` is the
    /// original index of the row used at pivot position `k`.
    pub fn row_order(&self) -> &[usize] {
        &self.nrow
    }

    /// Solve the augmented system `a`, where the last column holds `b`.
    ///
    /// On success `x[..n]` holds a solution. `a` is left in eliminated
    /// form under the recorded row/column permutation; copy first if the
    /// original matrix is still needed.
    pub fn solve(&mut self, a: &mut DMat, x: &mut [f64], zero_tol: f64) -> Result<(), MatrixError> {
        let n = a.nrows();
        assert_eq!(a.ncols(), n + 1, "expected an n x (n+1) augmented matrix");
        self.solve_block(a, n, x, zero_tol)
    }

    /// Like [`solve`](Self::solve) but operates on the top-left
    /// `n x (n+1)` block of a larger scratch matrix, so callers can pass
    /// a reusable arena directly.
    pub fn solve_block(
        &mut self,
        a: &mut DMat,
        n: usize,
        x: &mut [f64],
        zero_tol: f64,
    ) -> Result<(), MatrixError> {
        assert!(a.nrows() >= n && a.ncols() >= n + 1, "scratch too small");
        assert!(x.len() >= n, "solution vector too short");
        if n == 0 {
            return Ok(());
        }

        self.nrow.clear();
        self.nrow.extend(0..n);
        self.ncol.clear();
        self.ncol.extend(0..=n); // position n is the rhs column and never moves

        self.scale.clear();
        for i in 0..n {
            let mut s = 0.0_f64;
            for j in 0..n {
                s = s.max(a[(i, j)].abs());
            }
            if s < TINY {
                return Err(MatrixError::ZeroRow(i));
            }
            self.scale.push(s);
        }

        // Forward elimination. `r` is the current pivot position; columns
        // found degenerate at position r are rotated to the far end of the
        // coefficient columns, at most n-1-r times, before giving up.
        let mut r = 0;
        let mut col_swaps = 0;
        while r < n {
            let mut best = r;
            let mut best_val = -1.0_f64;
            for k in r..n {
                let v = a[(self.nrow[k], self.ncol[r])].abs() / self.scale[self.nrow[k]];
                if v > best_val {
                    best_val = v;
                    best = k;
                }
            }
            let piv = a[(self.nrow[best], self.ncol[r])];
            if piv.abs() < zero_tol {
                if col_swaps < n - 1 - r {
                    self.ncol[r..n].rotate_left(1);
                    col_swaps += 1;
                    continue;
                }
                // No pivotable column remains; rows r..n stay uneliminated.
                break;
            }
            col_swaps = 0;
            self.nrow.swap(r, best);

            for k in (r + 1)..n {
                let factor = a[(self.nrow[k], self.ncol[r])] / piv;
                if factor != 0.0 {
                    for j in (r + 1)..=n {
                        let col = self.ncol[j];
                        let sub = a[(self.nrow[r], col)] * factor;
                        a[(self.nrow[k], col)] -= sub;
                    }
                }
                a[(self.nrow[k], self.ncol[r])] = 0.0;
            }
            r += 1;
        }
        let pivots = r;

        // Non-pivoted rows must have a near-zero right-hand side, else b
        // is outside the column space.
        for k in pivots..n {
            if a[(self.nrow[k], self.ncol[n])].abs() > CONSISTENT_TOL {
                return Err(MatrixError::Inconsistent(self.nrow[k]));
            }
        }

        // Back substitution, right to left. Each row uses its left-most
        // non-negligible coefficient at or right of its pivot position;
        // columns never assigned are free variables and stay zero.
        for xi in x.iter_mut().take(n) {
            *xi = 0.0;
        }
        for rr in (0..pivots).rev() {
            let row = self.nrow[rr];
            let mut piv_pos = None;
            for j in rr..n {
                if a[(row, self.ncol[j])].abs() > zero_tol {
                    piv_pos = Some(j);
                    break;
                }
            }
            let Some(p) = piv_pos else { continue };
            let mut sum = a[(row, self.ncol[n])];
            for j in (p + 1)..n {
                sum -= a[(row, self.ncol[j])] * x[self.ncol[j]];
            }
            x[self.ncol[p]] = sum / a[(row, self.ncol[p])];
        }
        Ok(())
    }
}

/// Condition estimate for the `n x n` top-left block of `a`: the ratio
/// `min|diag| / max|diag|` of the diagonal after partial-pivoted
/// elimination, or 0 when a pivot vanishes outright. Destroys the block.
pub fn diagonal_ratio(a: &mut DMat, n: usize) -> f64 {
    assert!(a.nrows() >= n && a.ncols() >= n, "scratch too small");
    if n == 0 {
        return 1.0;
    }
    for c in 0..n {
        let mut best = c;
        let mut best_val = 0.0_f64;
        for k in c..n {
            let v = a[(k, c)].abs();
            if v > best_val {
                best_val = v;
                best = k;
            }
        }
        if best_val < TINY {
            return 0.0;
        }
        if best != c {
            for j in 0..n {
                let tmp = a[(c, j)];
                a[(c, j)] = a[(best, j)];
                a[(best, j)] = tmp;
            }
        }
        let piv = a[(c, c)];
        for k in (c + 1)..n {
            let factor = a[(k, c)] / piv;
            if factor != 0.0 {
                for j in (c + 1)..n {
                    let sub = a[(c, j)] * factor;
                    a[(k, j)] -= sub;
                }
            }
            a[(k, c)] = 0.0;
        }
    }
    let mut dmin = f64::INFINITY;
    let mut dmax = 0.0_f64;
    for i in 0..n {
        let d = a[(i, i)].abs();
        dmin = dmin.min(d);
        dmax = dmax.max(d);
    }
    if dmax <= 0.0 { 0.0 } else { dmin / dmax }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const ZT: f64 = 1e-10;

    fn augmented(rows: &[&[f64]]) -> DMat {
        let n = rows.len();
        let mut m = DMat::zeros(n, n + 1);
        for (i, r) in rows.iter().enumerate() {
            for (j, v) in r.iter().enumerate() {
                m[(i, j)] = *v;
            }
        }
        m
    }

    #[test]
    fn identity_system() {
        let mut a = augmented(&[&[1.0, 0.0, 3.0], &[0.0, 1.0, -4.0]]);
        let mut x = [0.0; 2];
        MatrixSolver::new().solve(&mut a, &mut x, ZT).unwrap();
        assert_relative_eq!(x[0], 3.0, epsilon = 1e-12);
        assert_relative_eq!(x[1], -4.0, epsilon = 1e-12);
    }

    #[test]
    fn requires_row_pivoting() {
        // Zero in the (0,0) position forces a row interchange.
        let mut a = augmented(&[&[0.0, 2.0, 4.0], &[3.0, 0.0, 6.0]]);
        let mut x = [0.0; 2];
        let mut solver = MatrixSolver::new();
        solver.solve(&mut a, &mut x, ZT).unwrap();
        assert_relative_eq!(x[0], 2.0, epsilon = 1e-12);
        assert_relative_eq!(x[1], 2.0, epsilon = 1e-12);
        // The second row was used for the first pivot.
        assert_eq!(solver.row_order(), &[1, 0]);
    }

    #[test]
    fn three_by_three() {
        // x = [1, -2, 3]
        let mut a = augmented(&[
            &[2.0, 1.0, -1.0, -3.0],
            &[-3.0, -1.0, 2.0, 5.0],
            &[-2.0, 1.0, 2.0, 2.0],
        ]);
        let mut x = [0.0; 3];
        MatrixSolver::new().solve(&mut a, &mut x, ZT).unwrap();
        assert_relative_eq!(x[0], 1.0, epsilon = 1e-10);
        assert_relative_eq!(x[1], -2.0, epsilon = 1e-10);
        assert_relative_eq!(x[2], 3.0, epsilon = 1e-10);
    }

    #[test]
    fn singular_but_consistent() {
        // Redundant rows, b in the column space: any x with x0 + x1 = 2.
        let mut a = augmented(&[&[1.0, 1.0, 2.0], &[1.0, 1.0, 2.0]]);
        let mut x = [0.0; 2];
        MatrixSolver::new().solve(&mut a, &mut x, ZT).unwrap();
        assert_relative_eq!(x[0] + x[1], 2.0, epsilon = 1e-10);
    }

    #[test]
    fn singular_and_inconsistent() {
        let mut a = augmented(&[&[1.0, 1.0, 2.0], &[1.0, 1.0, 3.0]]);
        let mut x = [0.0; 2];
        let err = MatrixSolver::new().solve(&mut a, &mut x, ZT).unwrap_err();
        assert!(matches!(err, MatrixError::Inconsistent(_)));
    }

    #[test]
    fn rank_one_three_by_three() {
        // Rank 1, consistent: every row demands x0 + 2 x1 + 3 x2 = 6.
        let mut a = augmented(&[
            &[1.0, 2.0, 3.0, 6.0],
            &[2.0, 4.0, 6.0, 12.0],
            &[3.0, 6.0, 9.0, 18.0],
        ]);
        let mut x = [0.0; 3];
        MatrixSolver::new().solve(&mut a, &mut x, ZT).unwrap();
        assert_relative_eq!(x[0] + 2.0 * x[1] + 3.0 * x[2], 6.0, epsilon = 1e-9);
    }

    #[test]
    fn zero_row_rejected() {
        let mut a = augmented(&[&[1.0, 2.0, 3.0], &[0.0, 0.0, 1.0]]);
        let mut x = [0.0; 2];
        let err = MatrixSolver::new().solve(&mut a, &mut x, ZT).unwrap_err();
        assert_eq!(err, MatrixError::ZeroRow(1));
    }

    #[test]
    fn block_solve_in_larger_scratch() {
        let mut scratch = DMat::zeros(8, 9);
        scratch[(0, 0)] = 4.0;
        scratch[(0, 1)] = 1.0;
        scratch[(0, 2)] = 9.0; // rhs at column n = 2
        scratch[(1, 0)] = 1.0;
        scratch[(1, 1)] = 3.0;
        scratch[(1, 2)] = 5.0;
        let mut x = [0.0; 2];
        MatrixSolver::new()
            .solve_block(&mut scratch, 2, &mut x, ZT)
            .unwrap();
        assert_relative_eq!(4.0 * x[0] + x[1], 9.0, epsilon = 1e-12);
        assert_relative_eq!(x[0] + 3.0 * x[1], 5.0, epsilon = 1e-12);
    }

    #[test]
    fn diagonal_ratio_well_conditioned() {
        let mut m = DMat::zeros(2, 2);
        m[(0, 0)] = 2.0;
        m[(1, 1)] = 1.0;
        let r = diagonal_ratio(&mut m, 2);
        assert_relative_eq!(r, 0.5, epsilon = 1e-12);
    }

    #[test]
    fn diagonal_ratio_singular() {
        let mut m = DMat::zeros(2, 2);
        m[(0, 0)] = 1.0;
        m[(0, 1)] = 1.0;
        m[(1, 0)] = 1.0;
        m[(1, 1)] = 1.0;
        assert!(diagonal_ratio(&mut m, 2) < 1e-12);
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_system(n: usize) -> impl Strategy<Value = (Vec<f64>, Vec<f64>)> {
        (
            prop::collection::vec(-5.0..5.0_f64, n * n),
            prop::collection::vec(-10.0..10.0_f64, n),
        )
    }

    proptest! {
        #[test]
        fn diagonally_dominant_residual_small((coeffs, b) in arb_system(4)) {
            let n = 4;
            let mut a = DMat::zeros(n, n + 1);
            for i in 0..n {
                for j in 0..n {
                    a[(i, j)] = coeffs[i * n + j];
                }
                // Force strict diagonal dominance so the system is regular.
                a[(i, i)] = 30.0 + coeffs[i * n + i];
                a[(i, n)] = b[i];
            }
            let orig = a.clone();
            let mut x = [0.0; 4];
            MatrixSolver::new().solve(&mut a, &mut x, 1e-10).unwrap();
            for i in 0..n {
                let mut r = -orig[(i, n)];
                for j in 0..n {
                    r += orig[(i, j)] * x[j];
                }
                prop_assert!(r.abs() < 1e-8, "residual {} at row {}", r, i);
            }
        }
    }
}
