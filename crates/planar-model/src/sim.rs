//! Collaborator traits at the advance controller's boundary.

use crate::collision::{AdvanceTotals, Collision};

/// A simulation that the advance controller can drive.
///
/// The controller owns the simulation's mutable state for the duration of
/// one advance call: it saves and restores around every trial step, and no
/// other component may mutate state while an advance is in progress.
pub trait CollisionSim {
    /// Current simulation time.
    fn time(&self) -> f64;

    /// Snapshot the full mutable state. Overwrites any prior snapshot.
    fn save_state(&mut self);

    /// Restore the snapshot taken by the last `save_state`.
    fn restore_state(&mut self);

    /// Recompute derived geometry after a state change (restore or step).
    fn modify_objects(&mut self);

    /// Append all collisions found in the current state. `step_size` is
    /// the interval the caller is about to (or just did) integrate over,
    /// for impact-time estimation.
    fn find_collisions(&mut self, collisions: &mut Vec<Collision>, step_size: f64);

    /// Apply collision impulses for the given records, typically by
    /// invoking the contact force solver. Returns whether handling
    /// succeeded; impulse counts are added to `totals`.
    fn handle_collisions(&mut self, collisions: &mut [Collision], totals: &mut AdvanceTotals)
    -> bool;
}

/// One-step ODE integrator for a simulation's equations of motion.
///
/// `Err` carries the collisions detected mid-step when the integrator
/// itself lands in an illegal state; the caller is expected to restore and
/// retry with a smaller step.
pub trait OdeStepper<S: CollisionSim> {
    fn step(&mut self, sim: &mut S, step_size: f64) -> Result<(), Vec<Collision>>;
}
