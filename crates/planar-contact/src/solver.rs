//! The pivoting contact force solver.
//!
//! Contacts are partitioned into `C` (clamped: non-zero force, zero
//! acceleration), `NC` (not clamped: zero force, non-negative
//! acceleration) and `R` (deferred). One contact at a time is driven to
//! zero acceleration; the step that does so may flip other contacts
//! between `C` and `NC`, and contacts that would make the active
//! sub-matrix singular or that oscillate at a zero-size step are deferred
//! to `R` and revisited later.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use planar_math::{DMat, MatrixSolver, TINY, diagonal_ratio};
use rand::SeedableRng;
use rand::rngs::StdRng;
use thiserror::Error;
use tracing::{debug, warn};

use crate::ordering::NextContactPolicy;

#[derive(Debug, Error)]
pub enum ForceError {
    /// Mismatched input lengths or a non-square influence matrix.
    #[error("input contract violation: {0}")]
    BadInput(String),

    /// The algorithm terminated without finding forces satisfying the
    /// complementarity conditions (loop detected, sub-system unsolvable,
    /// or the post-condition check failed). The output vector holds the
    /// best effort found.
    #[error("no force solution found within tolerance")]
    NoSolution,

    /// Numerical contradiction while driving a contact: a huge step, or
    /// no limiting contact although the driven force is already
    /// significant. Not recoverable within this solve.
    #[error("numerical contradiction while driving contact {0}")]
    Fatal(usize),
}

/// Partition membership of one contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tag {
    Untreated,
    Clamped,
    NotClamped,
    Rejected,
}

/// Outcome of one `drive_to_zero` call.
enum Drive {
    Success,
    Deferred,
    SolveFailed,
    Fatal,
}

/// What limited the current step.
enum Limit {
    /// The driven contact's acceleration reached zero.
    Driving,
    /// A clamped contact's force reached zero.
    Clamped(usize),
    /// A not-clamped contact's acceleration reached zero.
    NotClamped(usize),
}

/// Iterative contact/impulse force solver.
///
/// Scratch buffers are reused across calls; one instance must not be
/// shared between threads. The PRNG used by the randomized ordering
/// policies is seeded explicitly so solves are reproducible.
pub struct ForceSolver {
    /// Accelerations and forces below this count as zero (`1e-10`).
    pub small_accel: f64,
    /// Active sub-matrix is treated as singular when the ratio of its
    /// smallest to largest eliminated diagonal falls below this (`2e-3`).
    pub singular_ratio: f64,
    /// A deferred contact is only revisited when its acceleration
    /// magnitude exceeds `reject_factor * small_accel` (`100`).
    pub reject_factor: f64,
    /// Steps larger than this indicate numerical breakdown (`1e5`).
    pub huge_step: f64,
    /// Per-contact budget of `C`/`NC` flips while driving one contact;
    /// a drive taking more than `max_flips_per_drive * n` steps is
    /// reported as [`ForceError::Fatal`] (`10`).
    pub max_flips_per_drive: usize,

    pub(crate) policy: NextContactPolicy,
    pub(crate) preorder: Vec<usize>,
    pub(crate) rng: StdRng,

    pub(crate) n: usize,
    pub(crate) accel: Vec<f64>,
    pub(crate) tag: Vec<Tag>,
    pub(crate) clamped: Vec<usize>,
    pub(crate) not_clamped: Vec<usize>,
    pub(crate) rejected: Vec<usize>,
    pub(crate) rejected_once: Vec<bool>,
    pub(crate) re_rejected: Vec<usize>,
    zero_steps: Vec<u8>,
    delta_f: Vec<f64>,
    delta_a: Vec<f64>,
    x: Vec<f64>,
    order: Vec<usize>,
    history: Vec<u64>,
    scratch: DMat,
    linsolver: MatrixSolver,
}

impl ForceSolver {
    pub fn new(seed: u64) -> Self {
        Self {
            small_accel: 1e-10,
            singular_ratio: 2e-3,
            reject_factor: 100.0,
            huge_step: 1e5,
            max_flips_per_drive: 10,
            policy: NextContactPolicy::default(),
            preorder: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
            n: 0,
            accel: Vec::new(),
            tag: Vec::new(),
            clamped: Vec::new(),
            not_clamped: Vec::new(),
            rejected: Vec::new(),
            rejected_once: Vec::new(),
            re_rejected: Vec::new(),
            zero_steps: Vec::new(),
            delta_f: Vec::new(),
            delta_a: Vec::new(),
            x: Vec::new(),
            order: Vec::new(),
            history: Vec::new(),
            scratch: DMat::zeros(0, 0),
            linsolver: MatrixSolver::new(),
        }
    }

    /// Select the contact-ordering policy. `preorder` is only consulted by
    /// [`NextContactPolicy::PreOrdered`]; when absent, index order is used.
    pub fn set_next_contact_policy(
        &mut self,
        policy: NextContactPolicy,
        preorder: Option<Vec<usize>>,
    ) {
        self.policy = policy;
        self.preorder = preorder.unwrap_or_default();
    }

    pub fn next_contact_policy(&self) -> NextContactPolicy {
        self.policy
    }

    /// Diagnostic trace: contacts in the order they were driven during the
    /// most recent solve.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Final accelerations `A f + b` from the most recent solve.
    pub fn accelerations(&self) -> &[f64] {
        &self.accel
    }

    /// Compute contact forces.
    ///
    /// `a` is the `n x n` influence matrix (`a[i][j]` = acceleration change
    /// at contact `i` per unit force at `j`), `b` the bias accelerations,
    /// `joint[i]` marks bilateral constraints. `f` is zeroed on entry and
    /// receives the result; on error it holds the best effort found, which
    /// callers may still validate and use.
    ///
    /// When `tolerance` is given, a final complementarity check is run and
    /// its violation reported as [`ForceError::NoSolution`].
    pub fn solve(
        &mut self,
        a: &DMat,
        f: &mut [f64],
        b: &[f64],
        joint: &[bool],
        tolerance: Option<f64>,
    ) -> Result<(), ForceError> {
        let n = b.len();
        if a.nrows() != n || a.ncols() != n {
            return Err(ForceError::BadInput(format!(
                "matrix is {}x{}, expected {n}x{n}",
                a.nrows(),
                a.ncols()
            )));
        }
        if f.len() != n || joint.len() != n {
            return Err(ForceError::BadInput(format!(
                "vector lengths f={} joint={} b={n}",
                f.len(),
                joint.len()
            )));
        }
        for fi in f.iter_mut() {
            *fi = 0.0;
        }
        self.reset(b);
        if n == 0 {
            return Ok(());
        }
        if n == 1 {
            return self.solve_single(a, f, b, joint, tolerance);
        }

        while let Some(d) = self.next_contact(joint) {
            // Every contact has a definite partition once nothing is
            // untreated; revisiting a (partition, driven contact) state
            // means the pivoting is cycling.
            if !self.tag.contains(&Tag::Untreated) && self.seen_state(d) {
                warn!(contact = d, "loop detected, aborting solve");
                return Err(ForceError::NoSolution);
            }
            self.untag(d);
            self.order.push(d);
            match self.drive_to_zero(a, f, joint, d) {
                Drive::Success => {
                    // Progress was made: previously re-rejected contacts
                    // get another chance.
                    self.re_rejected.clear();
                }
                Drive::Deferred => self.defer(d),
                Drive::SolveFailed => return Err(ForceError::NoSolution),
                Drive::Fatal => return Err(ForceError::Fatal(d)),
            }
        }

        if let Some(tol) = tolerance {
            self.check_complementarity(f, joint, tol)?;
        }
        Ok(())
    }

    /// Closed form for a single contact.
    fn solve_single(
        &mut self,
        a: &DMat,
        f: &mut [f64],
        b: &[f64],
        joint: &[bool],
        tolerance: Option<f64>,
    ) -> Result<(), ForceError> {
        self.order.push(0);
        if joint[0] || b[0] < 0.0 {
            let a00 = a[(0, 0)];
            if a00.abs() < TINY {
                return Err(ForceError::NoSolution);
            }
            f[0] = -b[0] / a00;
            self.accel[0] = b[0] + a00 * f[0];
        }
        if f[0].abs() > self.small_accel {
            self.tag[0] = Tag::Clamped;
            self.clamped.push(0);
        } else {
            self.tag[0] = Tag::NotClamped;
            self.not_clamped.push(0);
        }
        if let Some(tol) = tolerance {
            self.check_complementarity(f, joint, tol)?;
        }
        Ok(())
    }

    fn reset(&mut self, b: &[f64]) {
        let n = b.len();
        self.n = n;
        self.accel.clear();
        self.accel.extend_from_slice(b);
        self.tag.clear();
        self.tag.resize(n, Tag::Untreated);
        self.clamped.clear();
        self.not_clamped.clear();
        self.rejected.clear();
        self.rejected_once.clear();
        self.rejected_once.resize(n, false);
        self.re_rejected.clear();
        self.zero_steps.clear();
        self.zero_steps.resize(n, 0);
        self.delta_f.clear();
        self.delta_f.resize(n, 0.0);
        self.delta_a.clear();
        self.delta_a.resize(n, 0.0);
        self.x.clear();
        self.x.resize(n, 0.0);
        self.order.clear();
        self.history.clear();
    }

    /// Increase (or, for a joint, adjust) the force at `d` until its
    /// acceleration reaches zero, flipping limiting contacts between `C`
    /// and `NC` along the way.
    fn drive_to_zero(&mut self, a: &DMat, f: &mut [f64], joint: &[bool], d: usize) -> Drive {
        // Already satisfied: separating contact, or joint at rest.
        let satisfied = if joint[d] {
            self.accel[d].abs() <= self.small_accel
        } else {
            self.accel[d] >= -self.small_accel
        };
        if satisfied {
            self.place(f, d);
            return Drive::Success;
        }

        // Adding d to the active set must keep it non-singular. A contact
        // that was already deferred once is pushed through regardless; the
        // linear solver tolerates the singular system.
        if !self.rejected_once[d] && self.would_be_singular(a, d, None) {
            debug!(contact = d, "deferring: active set would become singular");
            return Drive::Deferred;
        }

        for z in self.zero_steps.iter_mut() {
            *z = 0;
        }
        let max_loops = self.max_flips_per_drive * self.n.max(4);
        let mut loops = 0;
        loop {
            loops += 1;
            if loops > max_loops {
                warn!(contact = d, loops, "drive did not terminate");
                return Drive::Fatal;
            }
            if !self.compute_deltas(a, d) {
                return Drive::SolveFailed;
            }
            let (step, limit) = self.max_step(f, joint, d);
            let Some(step) = step else {
                if f[d].abs() > self.small_accel {
                    warn!(
                        contact = d,
                        force = f[d],
                        "no limiting contact with significant force applied"
                    );
                    return Drive::Fatal;
                }
                return Drive::Deferred;
            };
            if step.abs() > self.huge_step {
                warn!(contact = d, step, "step size exploded");
                return Drive::Fatal;
            }

            for i in 0..self.n {
                self.accel[i] += step * self.delta_a[i];
            }
            f[d] += step;
            for k in 0..self.clamped.len() {
                let j = self.clamped[k];
                f[j] += step * self.delta_f[j];
            }

            match limit {
                Limit::Driving => {
                    self.accel[d] = 0.0;
                    break;
                }
                Limit::Clamped(j) => {
                    f[j] = 0.0;
                    self.untag(j);
                    if self.count_zero_step(j, step) {
                        self.defer(j);
                    } else {
                        self.tag[j] = Tag::NotClamped;
                        self.not_clamped.push(j);
                    }
                }
                Limit::NotClamped(j) => {
                    self.accel[j] = 0.0;
                    self.untag(j);
                    if self.count_zero_step(j, step) {
                        self.defer(j);
                    } else if self.would_be_singular(a, d, Some(j)) {
                        debug!(contact = j, "deferring mid-drive: would be singular");
                        self.defer(j);
                    } else {
                        self.tag[j] = Tag::Clamped;
                        self.clamped.push(j);
                    }
                }
            }
        }
        self.place(f, d);
        Drive::Success
    }

    /// Put `d` into `C` or `NC` according to its final force.
    fn place(&mut self, f: &[f64], d: usize) {
        if f[d].abs() > self.small_accel {
            self.tag[d] = Tag::Clamped;
            self.clamped.push(d);
        } else {
            self.tag[d] = Tag::NotClamped;
            self.not_clamped.push(d);
        }
    }

    /// Track zero-size C/NC flips of `j` within the current drive; the
    /// second one defers `j` to break the oscillation.
    fn count_zero_step(&mut self, j: usize, step: f64) -> bool {
        if step.abs() < TINY {
            self.zero_steps[j] += 1;
            if self.zero_steps[j] >= 2 {
                debug!(contact = j, "second zero-size flip, deferring");
                return true;
            }
        }
        false
    }

    /// Move `j` into `R`.
    fn defer(&mut self, j: usize) {
        if self.rejected_once[j] && !self.re_rejected.contains(&j) {
            self.re_rejected.push(j);
        }
        self.rejected_once[j] = true;
        self.tag[j] = Tag::Rejected;
        self.rejected.push(j);
    }

    /// Remove `j` from whichever partition set currently holds it.
    fn untag(&mut self, j: usize) {
        match self.tag[j] {
            Tag::Clamped => self.clamped.retain(|&k| k != j),
            Tag::NotClamped => self.not_clamped.retain(|&k| k != j),
            Tag::Rejected => self.rejected.retain(|&k| k != j),
            Tag::Untreated => {}
        }
        self.tag[j] = Tag::Untreated;
    }

    /// Would the active set `C ∪ {extra?} ∪ {d}` have a (near-)singular
    /// influence sub-matrix?
    fn would_be_singular(&mut self, a: &DMat, d: usize, extra: Option<usize>) -> bool {
        let k = self.clamped.len() + 1 + extra.is_some() as usize;
        self.ensure_scratch(k);
        // Borrow-friendly: gather the index list first.
        let mut idx = Vec::with_capacity(k);
        idx.extend_from_slice(&self.clamped);
        if let Some(j) = extra {
            idx.push(j);
        }
        idx.push(d);
        for (ri, &ci) in idx.iter().enumerate() {
            for (cj, &cjj) in idx.iter().enumerate() {
                self.scratch[(ri, cj)] = a[(ci, cjj)];
            }
        }
        let ratio = diagonal_ratio(&mut self.scratch, k);
        ratio < self.singular_ratio
    }

    /// Solve for the force direction: `delta_f[d] = 1`, clamped forces
    /// adjusted to keep their accelerations at zero, and the resulting
    /// acceleration change `delta_a = A · delta_f`.
    fn compute_deltas(&mut self, a: &DMat, d: usize) -> bool {
        let k = self.clamped.len();
        for df in self.delta_f.iter_mut() {
            *df = 0.0;
        }
        self.delta_f[d] = 1.0;
        if k > 0 {
            self.ensure_scratch(k);
            for (ri, &ci) in self.clamped.iter().enumerate() {
                for (cj, &cjj) in self.clamped.iter().enumerate() {
                    self.scratch[(ri, cj)] = a[(ci, cjj)];
                }
                self.scratch[(ri, k)] = -a[(ci, d)];
            }
            if let Err(err) =
                self.linsolver
                    .solve_block(&mut self.scratch, k, &mut self.x, self.small_accel)
            {
                warn!(%err, "active sub-system unsolvable");
                return false;
            }
            for (ri, &ci) in self.clamped.iter().enumerate() {
                self.delta_f[ci] = self.x[ri];
            }
        }
        for i in 0..self.n {
            let mut s = a[(i, d)];
            for &ci in &self.clamped {
                s += a[(i, ci)] * self.delta_f[ci];
            }
            self.delta_a[i] = s;
        }
        true
    }

    /// Largest step in `f[d]` before a complementarity condition would be
    /// violated. Joints never limit the step, except `d` itself.
    fn max_step(&self, f: &[f64], joint: &[bool], d: usize) -> (Option<f64>, Limit) {
        let dad = self.delta_a[d];
        let mut best: Option<f64> = None;
        let mut limit = Limit::Driving;
        let direction;
        if joint[d] {
            if dad.abs() < TINY {
                direction = if self.accel[d] > 0.0 { -1.0 } else { 1.0 };
            } else {
                let s = -self.accel[d] / dad;
                direction = if s < 0.0 { -1.0 } else { 1.0 };
                best = Some(s);
            }
        } else {
            direction = 1.0;
            if dad > 0.0 {
                best = Some(-self.accel[d] / dad);
            }
        }

        for &j in &self.clamped {
            if joint[j] {
                continue;
            }
            let dfj = self.delta_f[j];
            // Only a force pushed toward negative values can limit.
            if dfj * direction < -TINY {
                let s = -f[j] / dfj;
                if best.map_or(true, |b| s.abs() < b.abs()) {
                    best = Some(s);
                    limit = Limit::Clamped(j);
                }
            }
        }
        for &j in &self.not_clamped {
            if joint[j] {
                continue;
            }
            let daj = self.delta_a[j];
            // Only an acceleration pushed toward negative values can limit.
            if daj * direction < -TINY {
                let s = -self.accel[j] / daj;
                if best.map_or(true, |b| s.abs() < b.abs()) {
                    best = Some(s);
                    limit = Limit::NotClamped(j);
                }
            }
        }
        (best, limit)
    }

    /// Grow the scratch arena to hold a `k x (k+1)` augmented block.
    /// Growth is geometric and the arena never shrinks.
    fn ensure_scratch(&mut self, k: usize) {
        if self.scratch.nrows() < k {
            let mut cap = self.scratch.nrows().max(4);
            while cap < k {
                cap *= 2;
            }
            self.scratch = DMat::zeros(cap, cap + 1);
        }
    }

    /// Record the current (partition, driven contact) state; true when it
    /// was already visited during this solve.
    fn seen_state(&mut self, d: usize) -> bool {
        let key = self.state_key(d);
        if self.history.contains(&key) {
            return true;
        }
        self.history.push(key);
        false
    }

    fn state_key(&self, d: usize) -> u64 {
        let mut h = DefaultHasher::new();
        for t in &self.tag {
            (*t as u8).hash(&mut h);
        }
        d.hash(&mut h);
        h.finish()
    }

    fn check_complementarity(
        &self,
        f: &[f64],
        joint: &[bool],
        tol: f64,
    ) -> Result<(), ForceError> {
        for i in 0..self.n {
            let ai = self.accel[i];
            if joint[i] || f[i].abs() > self.small_accel {
                if ai.abs() > tol {
                    warn!(contact = i, accel = ai, "post-check: acceleration not zero");
                    return Err(ForceError::NoSolution);
                }
            } else if ai < -tol {
                warn!(contact = i, accel = ai, "post-check: negative acceleration");
                return Err(ForceError::NoSolution);
            }
        }
        Ok(())
    }
}
