//! Contact-ordering policies.
//!
//! The order in which contacts are driven to zero changes how often the
//! solver runs into singular active sets; no single order wins on every
//! configuration, so the policy is selectable. Joints always go first:
//! their bilateral constraints anchor the active set.

use rand::Rng;

use crate::solver::{ForceSolver, Tag};

/// Strategy for picking the next contact to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NextContactPolicy {
    /// Untreated joints first in random order, then the untreated contact
    /// with the most negative acceleration. Default.
    #[default]
    Hybrid,
    /// Untreated joints by largest acceleration magnitude, then the
    /// untreated contact with the most negative acceleration.
    MinAccel,
    /// Uniformly random among untreated joints, then among untreated
    /// contacts.
    Random,
    /// Caller-supplied fixed order, joints first.
    PreOrdered,
}

impl ForceSolver {
    /// Pick the next contact to drive, or `None` when the solve is done.
    ///
    /// All policies fall back to the worst deferred contact once nothing
    /// is untreated.
    pub(crate) fn next_contact(&mut self, joint: &[bool]) -> Option<usize> {
        let picked = match self.policy {
            NextContactPolicy::Hybrid => self
                .random_untreated(joint, true)
                .or_else(|| self.most_negative_untreated(joint)),
            NextContactPolicy::MinAccel => self
                .largest_accel_joint(joint)
                .or_else(|| self.most_negative_untreated(joint)),
            NextContactPolicy::Random => self
                .random_untreated(joint, true)
                .or_else(|| self.random_untreated(joint, false)),
            NextContactPolicy::PreOrdered => self.pre_ordered(joint),
        };
        picked.or_else(|| self.next_reject(joint))
    }

    /// Uniformly random untreated contact, restricted to joints when
    /// `joints_only`.
    fn random_untreated(&mut self, joint: &[bool], joints_only: bool) -> Option<usize> {
        let candidates: Vec<usize> = (0..self.n)
            .filter(|&i| self.tag[i] == Tag::Untreated && (!joints_only || joint[i]))
            .collect();
        if candidates.is_empty() {
            None
        } else {
            Some(candidates[self.rng.gen_range(0..candidates.len())])
        }
    }

    /// Untreated joint with the largest acceleration magnitude.
    fn largest_accel_joint(&self, joint: &[bool]) -> Option<usize> {
        let mut best = None;
        let mut best_mag = -1.0_f64;
        for i in 0..self.n {
            if self.tag[i] == Tag::Untreated && joint[i] && self.accel[i].abs() > best_mag {
                best_mag = self.accel[i].abs();
                best = Some(i);
            }
        }
        best
    }

    /// Untreated non-joint with the most negative acceleration.
    fn most_negative_untreated(&self, joint: &[bool]) -> Option<usize> {
        let mut best = None;
        let mut best_accel = f64::INFINITY;
        for i in 0..self.n {
            if self.tag[i] == Tag::Untreated && !joint[i] && self.accel[i] < best_accel {
                best_accel = self.accel[i];
                best = Some(i);
            }
        }
        best
    }

    /// First untreated contact in the caller-supplied order (index order
    /// when none was given), joints before non-joints.
    fn pre_ordered(&self, joint: &[bool]) -> Option<usize> {
        let in_order = |want_joint: bool| {
            if self.preorder.is_empty() {
                (0..self.n)
                    .find(|&i| self.tag[i] == Tag::Untreated && joint[i] == want_joint)
            } else {
                self.preorder
                    .iter()
                    .copied()
                    .find(|&i| self.tag[i] == Tag::Untreated && joint[i] == want_joint)
            }
        };
        in_order(true).or_else(|| in_order(false))
    }

    /// Worst deferred contact not already re-rejected, provided its
    /// acceleration magnitude is large enough to matter.
    fn next_reject(&self, joint: &[bool]) -> Option<usize> {
        let mut best = None;
        let mut best_score = self.reject_factor * self.small_accel;
        for &j in &self.rejected {
            if self.re_rejected.contains(&j) {
                continue;
            }
            let score = if joint[j] {
                self.accel[j].abs()
            } else {
                -self.accel[j]
            };
            if score > best_score {
                best_score = score;
                best = Some(j);
            }
        }
        best
    }
}
