//! External sparse-solver boundary.
//!
//! The actual Krylov solve is delegated to an external package. This crate
//! converts its 0-based row-partitioned stores into the 1-based
//! row/column/value form the solver consumes, keeps per-row column counts,
//! and drives the `create / set / assemble / solve / get` sequence through
//! the [`SparseBackend`] trait. [`DenseBackend`] is the in-tree reference
//! implementation used by tests; it handles the single-PE case where the
//! local range is the whole system.

use crate::error::SolverError;

/// Iteration report of a successful solve.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SolveStats {
    pub iterations: usize,
    pub residual: f64,
}

/// Distributed sparse linear solver, 1-based indexing on the wire.
pub trait SparseBackend {
    /// Declare the owned degree-of-freedom range `[lower, upper)`
    /// (0-based, already scaled by the component count).
    fn create(&mut self, lower: usize, upper: usize);

    /// Set matrix values: `ncols[k]` columns for the k-th owned row,
    /// `rows`/`cols` 1-based, `vals` in row-major order.
    fn set_lhs(&mut self, ncols: &[u32], rows: &[u32], cols: &[u32], vals: &[f64])
        -> Result<(), SolverError>;

    /// Set right-hand-side values for the given 1-based rows.
    fn set_rhs(&mut self, rows: &[u32], vals: &[f64]) -> Result<(), SolverError>;

    /// Set initial solution values for the given 1-based rows.
    fn set_sol(&mut self, rows: &[u32], vals: &[f64]) -> Result<(), SolverError>;

    /// Finalize the matrix after all `set` calls.
    fn assemble_lhs(&mut self) -> Result<(), SolverError>;
    /// Finalize the right-hand side after all `set` calls.
    fn assemble_rhs(&mut self) -> Result<(), SolverError>;
    /// Finalize the solution vector after all `set` calls.
    fn assemble_sol(&mut self) -> Result<(), SolverError>;

    /// Solve `A x = b`.
    fn solve(&mut self) -> Result<SolveStats, SolverError>;

    /// Read back solution values for the given 1-based rows.
    fn get_sol(&self, rows: &[u32], out: &mut [f64]) -> Result<(), SolverError>;
}

/// Dense direct solver over the full system (reference implementation).
#[derive(Clone, Debug, Default)]
pub struct DenseBackend {
    n: usize,
    a: Vec<f64>,
    b: Vec<f64>,
    x: Vec<f64>,
}

impl DenseBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_range(&self, rows: &[u32]) -> Result<(), SolverError> {
        for &r in rows {
            if r == 0 || r as usize > self.n {
                return Err(SolverError::Inconsistent {
                    what: "row index outside the created range",
                });
            }
        }
        Ok(())
    }
}

impl SparseBackend for DenseBackend {
    fn create(&mut self, lower: usize, upper: usize) {
        assert_eq!(lower, 0, "DenseBackend covers the whole system");
        self.n = upper;
        self.a = vec![0.0; self.n * self.n];
        self.b = vec![0.0; self.n];
        self.x = vec![0.0; self.n];
    }

    fn set_lhs(
        &mut self,
        ncols: &[u32],
        rows: &[u32],
        cols: &[u32],
        vals: &[f64],
    ) -> Result<(), SolverError> {
        if ncols.len() != rows.len() || cols.len() != vals.len() {
            return Err(SolverError::Inconsistent {
                what: "matrix buffer lengths disagree",
            });
        }
        self.check_range(rows)?;
        self.check_range(cols)?;
        let mut k = 0usize;
        for (i, &r) in rows.iter().enumerate() {
            for _ in 0..ncols[i] {
                let c = cols[k];
                self.a[(r as usize - 1) * self.n + (c as usize - 1)] = vals[k];
                k += 1;
            }
        }
        if k != vals.len() {
            return Err(SolverError::Inconsistent {
                what: "column counts do not cover the value buffer",
            });
        }
        Ok(())
    }

    fn set_rhs(&mut self, rows: &[u32], vals: &[f64]) -> Result<(), SolverError> {
        self.check_range(rows)?;
        for (&r, &v) in rows.iter().zip(vals) {
            self.b[r as usize - 1] = v;
        }
        Ok(())
    }

    fn set_sol(&mut self, rows: &[u32], vals: &[f64]) -> Result<(), SolverError> {
        self.check_range(rows)?;
        for (&r, &v) in rows.iter().zip(vals) {
            self.x[r as usize - 1] = v;
        }
        Ok(())
    }

    fn assemble_lhs(&mut self) -> Result<(), SolverError> {
        Ok(())
    }

    fn assemble_rhs(&mut self) -> Result<(), SolverError> {
        Ok(())
    }

    fn assemble_sol(&mut self) -> Result<(), SolverError> {
        Ok(())
    }

    fn solve(&mut self) -> Result<SolveStats, SolverError> {
        // Gaussian elimination with partial pivoting on a working copy.
        let n = self.n;
        let mut a = self.a.clone();
        let mut b = self.b.clone();
        for col in 0..n {
            let mut pivot = col;
            let mut best = a[col * n + col].abs();
            for r in col + 1..n {
                let cand = a[r * n + col].abs();
                if cand > best {
                    best = cand;
                    pivot = r;
                }
            }
            if best == 0.0 {
                return Err(SolverError::ZeroPivot { row: col + 1 });
            }
            if pivot != col {
                for c in 0..n {
                    a.swap(col * n + c, pivot * n + c);
                }
                b.swap(col, pivot);
            }
            for r in col + 1..n {
                let f = a[r * n + col] / a[col * n + col];
                if f == 0.0 {
                    continue;
                }
                for c in col..n {
                    a[r * n + c] -= f * a[col * n + c];
                }
                b[r] -= f * b[col];
            }
        }
        for r in (0..n).rev() {
            let mut s = b[r];
            for c in r + 1..n {
                s -= a[r * n + c] * self.x[c];
            }
            self.x[r] = s / a[r * n + r];
        }

        // Residual of the original system.
        let mut res = 0.0f64;
        for r in 0..n {
            let mut s = -self.b[r];
            for c in 0..n {
                s += self.a[r * n + c] * self.x[c];
            }
            res += s * s;
        }
        Ok(SolveStats {
            iterations: 1,
            residual: res.sqrt(),
        })
    }

    fn get_sol(&self, rows: &[u32], out: &mut [f64]) -> Result<(), SolverError> {
        self.check_range(rows)?;
        for (&r, o) in rows.iter().zip(out.iter_mut()) {
            *o = self.x[r as usize - 1];
        }
        Ok(())
    }
}
