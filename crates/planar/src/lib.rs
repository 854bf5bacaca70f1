//! planar — 2D rigid-body contact force and collision-advance engine.
//!
//! This is the umbrella crate re-exporting the core types from the
//! sub-crates: the singular-tolerant linear solver, the pivoting contact
//! force solver, and the collision-aware time-stepping controller.

pub use planar_advance::{AdvanceError, CollisionAdvance};
pub use planar_contact::{ForceError, ForceSolver, NextContactPolicy};
pub use planar_math::{self, DMat, DVec, MatrixError, MatrixSolver};
pub use planar_model::{AdvanceTotals, Collision, CollisionSim, OdeStepper};
