//! Collision records and advance-session diagnostics.

/// One detected proximity event between a pair of bodies.
///
/// Created fresh each simulation step by the detection collaborator and
/// discarded once the step advances; the controller stamps and re-evaluates
/// it while localizing the time of impact.
#[derive(Debug, Clone)]
pub struct Collision {
    /// Gap between the bodies. Negative means penetrating.
    pub distance: f64,
    /// Normal approach velocity. Negative means the bodies are closing.
    pub velocity: f64,
    /// Simulation time at which this record was produced.
    pub detected_time: f64,
    /// Estimated time of impact, `NAN` when unknown.
    pub estimated_time: f64,
    /// Set by the controller when this collision must receive an impulse
    /// within the current step.
    pub needs_handling: bool,
    /// Bilateral (joint) constraint: may push or pull, never separates.
    pub bilateral: bool,
    /// Resting contact rather than a free-flight impact check.
    pub contact: bool,
}

impl Collision {
    /// New record with unknown impact time and unset flags.
    pub fn new(distance: f64, velocity: f64, detected_time: f64) -> Self {
        Self {
            distance,
            velocity,
            detected_time,
            estimated_time: f64::NAN,
            needs_handling: false,
            bilateral: false,
            contact: false,
        }
    }

    /// Whether the gap has closed beyond `depth_tol`.
    #[inline]
    pub fn is_penetrating(&self, depth_tol: f64) -> bool {
        self.distance < -depth_tol
    }

    /// Time-of-impact estimate: the detector's value when it supplied one,
    /// else a linear extrapolation of the gap along the approach velocity.
    /// For a penetrating record the extrapolation backdates to the moment
    /// the gap closed.
    pub fn impact_estimate(&self, now: f64) -> Option<f64> {
        if self.estimated_time.is_finite() {
            return Some(self.estimated_time);
        }
        if self.velocity < 0.0 {
            Some(now + self.distance / -self.velocity)
        } else {
            None
        }
    }
}

/// Running totals for one or more advance sessions.
///
/// The controller updates the stepping counters; the simulation's
/// `handle_collisions` adds every impulse it applies.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AdvanceTotals {
    /// Successful integration sub-steps.
    pub steps: usize,
    /// State rollbacks after an illegal or colliding step.
    pub backups: usize,
    /// Sub-steps taken while in binary-search mode.
    pub searches: usize,
    /// Calls into the simulation's collision handler.
    pub handle_calls: usize,
    /// Impulses applied by the simulation's collision handler.
    pub impulses: usize,
}

impl AdvanceTotals {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn impact_estimate_prefers_detector_value() {
        let mut c = Collision::new(1.0, -2.0, 0.0);
        c.estimated_time = 0.7;
        assert_relative_eq!(c.impact_estimate(0.0).unwrap(), 0.7);
    }

    #[test]
    fn impact_estimate_linear_fallback() {
        let c = Collision::new(1.0, -2.0, 3.0);
        assert_relative_eq!(c.impact_estimate(3.0).unwrap(), 3.5);
    }

    #[test]
    fn impact_estimate_none_when_separating() {
        let c = Collision::new(1.0, 0.5, 0.0);
        assert!(c.impact_estimate(0.0).is_none());
    }

    #[test]
    fn impact_estimate_backdates_penetration() {
        // Gap closed one second before this record was produced.
        let c = Collision::new(-1.0, -1.0, 2.0);
        assert_relative_eq!(c.impact_estimate(2.0).unwrap(), 1.0);
    }

    #[test]
    fn penetration_threshold() {
        let c = Collision::new(-0.02, -1.0, 0.0);
        assert!(c.is_penetrating(0.01));
        assert!(!c.is_penetrating(0.05));
    }
}
