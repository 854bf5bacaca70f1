//! Collision-aware time stepping.
//!
//! `CollisionAdvance` integrates a simulation forward, detects when a
//! step produced an illegal (penetrating) state, rolls back to the saved
//! pre-step state, localizes the time of impact by impact-time estimates
//! and bisection, and hands the touching collisions to the simulation for
//! impulse handling.

use planar_model::{AdvanceTotals, Collision, CollisionSim, OdeStepper};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum AdvanceError {
    /// The same collision could not be resolved by repeated bisection:
    /// numerical breakdown or a truly inconsistent constraint
    /// configuration. The enclosing simulation step must be aborted.
    #[error("stuck at time {time}: collision unresolved after {retries} retries")]
    Stuck { time: f64, retries: u32 },
}

/// Time-stepping controller that owns a simulation and its integrator
/// for the duration of each `advance` call.
pub struct CollisionAdvance<S: CollisionSim, O: OdeStepper<S>> {
    sim: S,
    stepper: O,
    /// Consecutive failed retries before the advance is declared stuck.
    pub max_stuck: u32,
    /// Gap magnitude within which bodies count as touching; beyond it
    /// (negative) the state is illegal.
    pub distance_tol: f64,
    /// Approach speeds at or below this are resting contacts, left to
    /// per-step contact forces rather than impulses.
    pub small_velocity: f64,
    totals: AdvanceTotals,
}

impl<S: CollisionSim, O: OdeStepper<S>> CollisionAdvance<S, O> {
    pub fn new(sim: S, stepper: O) -> Self {
        Self {
            sim,
            stepper,
            max_stuck: 30,
            distance_tol: 0.01,
            small_velocity: 1e-3,
            totals: AdvanceTotals::default(),
        }
    }

    pub fn sim(&self) -> &S {
        &self.sim
    }

    pub fn sim_mut(&mut self) -> &mut S {
        &mut self.sim
    }

    pub fn totals(&self) -> &AdvanceTotals {
        &self.totals
    }

    /// Advance the simulation by `total_step`, resolving any collisions
    /// that occur within the interval.
    pub fn advance(&mut self, total_step: f64) -> Result<(), AdvanceError> {
        if total_step <= 0.0 {
            return Ok(());
        }
        let t_end = self.sim.time() + total_step;
        let time_eps = 1e-14 * (1.0 + t_end.abs());
        let mut current_step = total_step;
        let mut binary_search = false;
        let mut stuck_count = 0_u32;
        let mut did_handle = false;
        let mut collisions: Vec<Collision> = Vec::new();

        loop {
            let remaining = t_end - self.sim.time();
            if remaining <= time_eps {
                break;
            }
            current_step = current_step.min(remaining);

            self.sim.save_state();
            let step_ok = match self.stepper.step(&mut self.sim, current_step) {
                Ok(()) => {
                    self.sim.modify_objects();
                    collisions.clear();
                    self.sim.find_collisions(&mut collisions, current_step);
                    true
                }
                Err(mid_step) => {
                    collisions = mid_step;
                    false
                }
            };
            if binary_search {
                self.totals.searches += 1;
            }

            let t_post = self.sim.time();
            for c in collisions.iter_mut() {
                c.detected_time = t_post;
                c.needs_handling =
                    c.velocity < -self.small_velocity && c.distance < self.distance_tol;
            }
            let any_handling = collisions.iter().any(|c| c.needs_handling);
            let any_penetrating = collisions
                .iter()
                .any(|c| c.needs_handling && c.is_penetrating(self.distance_tol));

            if step_ok && !any_handling {
                self.totals.steps += 1;
                if !binary_search {
                    // Creeping forward during a binary search is not
                    // progress at the stuck collision, so the retry count
                    // only resets on ordinary full steps.
                    stuck_count = 0;
                    current_step = t_end - self.sim.time();
                }
                continue;
            }

            if step_ok && !any_penetrating {
                // Touching and approaching: apply impulses at this state.
                self.totals.handle_calls += 1;
                if self.sim.handle_collisions(&mut collisions, &mut self.totals) {
                    debug!(time = t_post, "collisions handled");
                    did_handle = true;
                    self.totals.steps += 1;
                    stuck_count = 0;
                    binary_search = false;
                    current_step = t_end - self.sim.time();
                    continue;
                }
                warn!(time = t_post, "collision handling failed, forcing binary search");
                binary_search = true;
            }

            // Roll back and retry with a smaller sub-step.
            self.sim.restore_state();
            self.sim.modify_objects();
            self.totals.backups += 1;
            let now = self.sim.time();
            if binary_search {
                current_step *= 0.5;
            } else {
                let est = collisions
                    .iter()
                    .filter(|c| c.needs_handling)
                    .filter_map(|c| c.impact_estimate(c.detected_time))
                    .fold(f64::INFINITY, f64::min);
                if est > now + time_eps && est < now + current_step {
                    current_step = est - now;
                } else {
                    binary_search = true;
                    current_step *= 0.5;
                }
            }
            debug!(time = now, step = current_step, binary_search, "rolled back");
            stuck_count += 1;
            if stuck_count >= self.max_stuck {
                warn!(time = now, retries = stuck_count, "advance is stuck");
                return Err(AdvanceError::Stuck {
                    time: now,
                    retries: stuck_count,
                });
            }
        }

        // No impulse was applied anywhere in the interval: give bilateral
        // resting contacts one chance to absorb residual joint impulses.
        if !did_handle {
            collisions.clear();
            self.sim.find_collisions(&mut collisions, 0.0);
            if collisions.iter().any(|c| c.bilateral && c.contact) {
                debug!("running small-impulse cleanup pass");
                self.totals.handle_calls += 1;
                self.sim.handle_collisions(&mut collisions, &mut self.totals);
            }
        }
        Ok(())
    }
}
