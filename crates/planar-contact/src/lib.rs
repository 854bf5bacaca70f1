//! Contact force computation for the planar physics engine.
//!
//! Implements the Baraff-style pivoting algorithm: given the influence
//! matrix `A` and bias vector `b`, find contact forces `f >= 0` with
//! accelerations `a = A f + b >= 0` and `f · a = 0`, treating bilateral
//! joint constraints exactly (force of either sign, acceleration zero).

pub mod ordering;
pub mod solver;

pub use ordering::NextContactPolicy;
pub use solver::{ForceError, ForceSolver};
