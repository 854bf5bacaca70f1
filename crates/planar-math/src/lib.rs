//! Numeric primitives for the planar physics engine.
//!
//! Provides the dynamic vector/matrix aliases used throughout the
//! workspace and the singular-tolerant dense linear solver that backs
//! the contact force computation.

pub mod linsolve;

pub use linsolve::{MatrixError, MatrixSolver, diagonal_ratio};

use nalgebra as na;

/// Dynamic vector.
pub type DVec = na::DVector<f64>;
/// Dynamic matrix.
pub type DMat = na::DMatrix<f64>;

/// Values below this are treated as exactly zero by the solvers.
pub const TINY: f64 = 1e-14;
