//! Integration tests wiring the advance controller, an ODE stepper, and
//! the contact force solver together, the way a real simulation does.

use approx::assert_relative_eq;
use planar::{
    AdvanceTotals, Collision, CollisionAdvance, CollisionSim, DMat, ForceSolver, OdeStepper,
};

const GRAVITY: f64 = 10.0;

/// A ball falling under gravity onto a floor at y = 0. Collision response
/// computes the impulse through the contact force solver.
struct BallSim {
    y: f64,
    vy: f64,
    time: f64,
    saved: (f64, f64, f64),
    radius: f64,
    mass: f64,
    elasticity: f64,
    solver: ForceSolver,
    bounce_time: Option<f64>,
}

impl BallSim {
    fn new(y: f64) -> Self {
        Self {
            y,
            vy: 0.0,
            time: 0.0,
            saved: (y, 0.0, 0.0),
            radius: 0.5,
            mass: 2.0,
            elasticity: 1.0,
            solver: ForceSolver::new(0),
            bounce_time: None,
        }
    }

    fn gap(&self) -> f64 {
        self.y - self.radius
    }
}

impl CollisionSim for BallSim {
    fn time(&self) -> f64 {
        self.time
    }

    fn save_state(&mut self) {
        self.saved = (self.y, self.vy, self.time);
    }

    fn restore_state(&mut self) {
        (self.y, self.vy, self.time) = self.saved;
    }

    fn modify_objects(&mut self) {}

    fn find_collisions(&mut self, collisions: &mut Vec<Collision>, _step: f64) {
        collisions.push(Collision::new(self.gap(), self.vy, self.time));
    }

    fn handle_collisions(
        &mut self,
        collisions: &mut [Collision],
        totals: &mut AdvanceTotals,
    ) -> bool {
        for c in collisions.iter() {
            if !c.needs_handling {
                continue;
            }
            // One-contact impulse system: unit impulse changes the normal
            // velocity by 1/m, and the bias is the velocity to cancel
            // (approach velocity plus restitution).
            let mut a = DMat::zeros(1, 1);
            a[(0, 0)] = 1.0 / self.mass;
            let b = [(1.0 + self.elasticity) * c.velocity];
            let mut impulse = [0.0];
            if self
                .solver
                .solve(&a, &mut impulse, &b, &[false], Some(1e-8))
                .is_err()
            {
                return false;
            }
            if impulse[0] > 0.0 {
                self.vy += impulse[0] / self.mass;
                self.bounce_time.get_or_insert(self.time);
                totals.impulses += 1;
            }
        }
        true
    }
}

/// Semi-implicit Euler for the ball's equations of motion.
struct EulerStepper;

impl OdeStepper<BallSim> for EulerStepper {
    fn step(&mut self, sim: &mut BallSim, step_size: f64) -> Result<(), Vec<Collision>> {
        sim.vy -= GRAVITY * step_size;
        sim.y += sim.vy * step_size;
        sim.time += step_size;
        Ok(())
    }
}

#[test]
fn ball_bounces_at_the_closed_form_impact_time() {
    // Drop from gap 1.5: impact at t* = sqrt(2 * 1.5 / g).
    let expected_impact = (2.0 * 1.5 / GRAVITY).sqrt();
    let mut adv = CollisionAdvance::new(BallSim::new(2.0), EulerStepper);

    for _ in 0..100 {
        adv.advance(0.01).unwrap();
        assert!(
            adv.sim().gap() >= -adv.distance_tol,
            "penetrating at t={}: gap={}",
            adv.sim().time(),
            adv.sim().gap()
        );
    }

    assert_relative_eq!(adv.sim().time(), 1.0, epsilon = 1e-9);
    let bounce = adv.sim().bounce_time.expect("ball never bounced");
    assert!(
        (bounce - expected_impact).abs() < 0.05,
        "bounce at {bounce}, expected ~{expected_impact}"
    );
    assert!(adv.totals().impulses >= 1);
    // Fully elastic: the ball is on its way back up afterwards.
    assert!(adv.sim().vy > 0.0 || adv.sim().gap() > adv.distance_tol);
}

#[test]
fn single_advance_spanning_the_impact_resolves_it() {
    let mut adv = CollisionAdvance::new(BallSim::new(2.0), EulerStepper);
    adv.advance(1.0).unwrap();
    assert_relative_eq!(adv.sim().time(), 1.0, epsilon = 1e-9);
    assert!(adv.sim().gap() >= -adv.distance_tol);
    assert_eq!(adv.totals().impulses, 1);
    assert!(adv.totals().backups >= 1, "impact should force a rollback");
}
