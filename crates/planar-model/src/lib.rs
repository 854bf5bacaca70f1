//! Shared types for the planar physics engine.
//!
//! `Collision` is the record produced by collision detection and consumed
//! by the advance controller; `CollisionSim` and `OdeStepper` are the
//! seams between the controller and the simulation it drives.

pub mod collision;
pub mod sim;

pub use collision::{AdvanceTotals, Collision};
pub use sim::{CollisionSim, OdeStepper};
