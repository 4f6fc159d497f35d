//! Per-axis motion profiles: trapezoidal position plans and slewed
//! velocity plans.
//!
//! A position plan covers a fixed step count with a trapezoidal velocity
//! curve (degenerating to triangular when the distance is too short to
//! reach peak speed). A velocity plan slews the current speed toward a
//! signed target under an acceleration cap; the direction pin flips exactly
//! at the tick where the speed crosses zero.

/// The active profile of one axis. At most one per axis at any instant.
#[derive(Debug, Clone)]
pub enum Profile {
    Position(PositionPlan),
    Velocity(VelocityPlan),
}

// ─── Position plan ──────────────────────────────────────────────────

/// Result of advancing a position plan by one tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlanStep {
    /// Plan still running at the given speed [steps/s].
    Running(f64),
    /// Total time elapsed; the plan is complete.
    Expired,
}

/// Trapezoidal point-to-point plan in step space.
#[derive(Debug, Clone)]
pub struct PositionPlan {
    /// Step direction: +1 or −1.
    pub dir: i8,
    /// Authoritative position when the plan was installed.
    pub start_pos: i64,
    /// Total steps to emit (≥ 1).
    pub total_steps: u64,
    /// Steps emitted so far.
    pub done_steps: u64,
    /// Peak speed [steps/s] (reduced for triangular profiles).
    pub v_max: f64,
    /// Acceleration magnitude [steps/s²].
    pub a_max: f64,
    /// Ramp-up duration [s].
    pub t_accel: f64,
    /// Constant-speed duration [s].
    pub t_cruise: f64,
    /// Total duration: `2·t_accel + t_cruise`.
    pub t_total: f64,
    /// Time integrated so far [s].
    pub elapsed: f64,
    /// Speed commanded on the last tick [steps/s].
    pub current_v: f64,
}

impl PositionPlan {
    /// Plan a move of `delta_steps` (non-zero) from `start_pos`.
    ///
    /// Both `v_max` and `a_max` must be positive; magnitudes are taken.
    /// If the distance is shorter than a full accel+decel ramp the profile
    /// becomes triangular with a reduced peak.
    pub fn new(start_pos: i64, delta_steps: i64, v_max: f64, a_max: f64) -> Self {
        debug_assert!(delta_steps != 0);
        debug_assert!(v_max > 0.0 && a_max > 0.0);

        let dir: i8 = if delta_steps > 0 { 1 } else { -1 };
        let total_steps = delta_steps.unsigned_abs();
        let mut v_max = v_max.abs();
        let a_max = a_max.abs();

        let t_accel_full = v_max / a_max;
        let d_accel_full = 0.5 * a_max * t_accel_full * t_accel_full;

        let (t_accel, t_cruise) = if (total_steps as f64) < 2.0 * d_accel_full {
            // Triangular: peak speed the distance actually allows.
            let v_peak = (total_steps as f64 * a_max).sqrt();
            v_max = v_peak;
            (v_peak / a_max, 0.0)
        } else {
            (
                t_accel_full,
                (total_steps as f64 - 2.0 * d_accel_full) / v_max,
            )
        };

        Self {
            dir,
            start_pos,
            total_steps,
            done_steps: 0,
            v_max,
            a_max,
            t_accel,
            t_cruise,
            t_total: 2.0 * t_accel + t_cruise,
            elapsed: 0.0,
            current_v: 0.0,
        }
    }

    /// Advance plan time by `dt` and evaluate the velocity curve.
    pub fn advance(&mut self, dt: f64) -> PlanStep {
        self.elapsed += dt;
        let t = self.elapsed;

        if t >= self.t_total {
            self.current_v = 0.0;
            return PlanStep::Expired;
        }

        let v = if t < self.t_accel {
            self.a_max * t
        } else if t < self.t_accel + self.t_cruise {
            self.v_max
        } else {
            (self.v_max - self.a_max * (t - self.t_accel - self.t_cruise)).max(0.0)
        };

        let v = v.min(self.v_max);
        self.current_v = v;
        PlanStep::Running(v)
    }

    /// Signed acceleration for the current phase [steps/s²].
    pub fn accel_now(&self) -> f64 {
        let t = self.elapsed;
        if t < self.t_accel {
            self.a_max
        } else if t < self.t_accel + self.t_cruise {
            0.0
        } else if t < self.t_total {
            -self.a_max
        } else {
            0.0
        }
    }

    /// Absolute step position this plan ends at.
    #[inline]
    pub fn target_steps(&self) -> i64 {
        self.start_pos + self.dir as i64 * self.total_steps as i64
    }
}

// ─── Velocity plan ──────────────────────────────────────────────────

/// One tick of velocity-plan output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Slew {
    /// Speed magnitude for this tick [steps/s].
    pub v: f64,
    /// Direction sign the steps carry.
    pub dir: i8,
    /// Set on the tick where a pending reversal commits; the direction pin
    /// must be written before any step is asserted.
    pub flip_to: Option<i8>,
}

/// Velocity-controlled jog: slews the current speed toward a target under
/// an acceleration cap.
///
/// A signed retarget with the opposite sign does not flip the direction pin
/// immediately: the axis decelerates in its old direction, and the flip
/// commits exactly at the tick where the speed reaches zero.
#[derive(Debug, Clone)]
pub struct VelocityPlan {
    /// Electrical direction currently on the pin.
    dir: i8,
    /// Direction requested by the most recent retarget.
    pending_dir: i8,
    /// Target speed magnitude [steps/s].
    target_v: f64,
    /// Slew rate [steps/s²].
    accel: f64,
    /// Current speed magnitude [steps/s].
    current_v: f64,
}

impl VelocityPlan {
    /// Start a jog from standstill in the given direction.
    pub fn new(dir: i8, target_v: f64, accel: f64) -> Self {
        let dir = if dir >= 0 { 1 } else { -1 };
        Self {
            dir,
            pending_dir: dir,
            target_v: target_v.abs(),
            accel: accel.abs(),
            current_v: 0.0,
        }
    }

    /// Retarget in place with a signed speed.
    pub fn set_target(&mut self, v_signed: f64, accel: f64) {
        self.pending_dir = if v_signed >= 0.0 { 1 } else { -1 };
        self.target_v = v_signed.abs();
        self.accel = accel.abs();
    }

    /// Current speed magnitude [steps/s].
    #[inline]
    pub fn current_v(&self) -> f64 {
        self.current_v
    }

    /// Slew rate magnitude [steps/s²].
    #[inline]
    pub fn accel(&self) -> f64 {
        self.accel
    }

    /// Direction sign currently on the pin.
    #[inline]
    pub fn dir(&self) -> i8 {
        self.dir
    }

    /// True when stopped with a zero target.
    #[inline]
    pub fn is_settled(&self) -> bool {
        self.current_v == 0.0 && self.target_v == 0.0
    }

    /// Advance one tick: move the speed toward the effective goal.
    ///
    /// While a reversal is pending the goal is zero; at the zero crossing
    /// the new direction commits and is reported via `flip_to`.
    pub fn slew(&mut self, dt: f64) -> Slew {
        let goal = if self.pending_dir == self.dir {
            self.target_v
        } else {
            0.0
        };

        let dv = self.accel * dt;
        if (goal - self.current_v).abs() <= dv {
            self.current_v = goal;
        } else if goal > self.current_v {
            self.current_v += dv;
        } else {
            self.current_v -= dv;
        }

        let mut flip_to = None;
        if self.pending_dir != self.dir && self.current_v == 0.0 {
            self.dir = self.pending_dir;
            flip_to = Some(self.dir);
        }

        Slew {
            v: self.current_v,
            dir: self.dir,
            flip_to,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DT: f64 = 1.0 / 20_000.0;

    #[test]
    fn long_move_is_trapezoidal() {
        // v=1000 steps/s, a=1000 steps/s² → ramp distance 500; 2000 steps
        // leaves 1000 steps of cruise.
        let plan = PositionPlan::new(0, 2000, 1000.0, 1000.0);
        assert_eq!(plan.t_accel, 1.0);
        assert!((plan.t_cruise - 1.0).abs() < 1e-9);
        assert!((plan.t_total - 3.0).abs() < 1e-9);
        assert_eq!(plan.v_max, 1000.0);
    }

    #[test]
    fn short_move_is_triangular() {
        // 100 steps with a=1000 → peak √(100·1000) ≈ 316.2 steps/s.
        let plan = PositionPlan::new(0, 100, 1000.0, 1000.0);
        assert_eq!(plan.t_cruise, 0.0);
        assert!((plan.v_max - (100.0f64 * 1000.0).sqrt()).abs() < 1e-9);
        assert!((plan.t_total - 2.0 * plan.v_max / 1000.0).abs() < 1e-9);
    }

    #[test]
    fn boundary_distance_is_trapezoidal_with_zero_cruise() {
        // Exactly 2·dA_full = 1000 steps.
        let plan = PositionPlan::new(0, 1000, 1000.0, 1000.0);
        assert_eq!(plan.v_max, 1000.0);
        assert_eq!(plan.t_cruise, 0.0);
        assert_eq!(plan.t_accel, 1.0);
    }

    #[test]
    fn single_step_plan_is_degenerate_triangle() {
        let plan = PositionPlan::new(0, 1, 1000.0, 1000.0);
        assert_eq!(plan.total_steps, 1);
        assert_eq!(plan.t_cruise, 0.0);
        assert!(plan.t_total > 0.0);
    }

    #[test]
    fn negative_delta_sets_negative_direction() {
        let plan = PositionPlan::new(500, -300, 100.0, 100.0);
        assert_eq!(plan.dir, -1);
        assert_eq!(plan.total_steps, 300);
        assert_eq!(plan.target_steps(), 200);
    }

    #[test]
    fn velocity_curve_matches_phases() {
        let mut plan = PositionPlan::new(0, 2000, 1000.0, 1000.0);

        // Accel phase: v = a·t.
        match plan.advance(0.5) {
            PlanStep::Running(v) => assert!((v - 500.0).abs() < 1e-9),
            other => panic!("unexpected {other:?}"),
        }
        // Cruise phase.
        match plan.advance(1.0) {
            PlanStep::Running(v) => assert_eq!(v, 1000.0),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(plan.accel_now(), 0.0);
        // Decel phase: 0.5 s into decel → v = 1000 − 1000·0.5.
        match plan.advance(1.0) {
            PlanStep::Running(v) => assert!((v - 500.0).abs() < 1e-9),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(plan.accel_now(), -1000.0);
        // Past t_total.
        assert_eq!(plan.advance(1.0), PlanStep::Expired);
    }

    #[test]
    fn accel_phase_reports_positive_accel() {
        let mut plan = PositionPlan::new(0, 2000, 1000.0, 1000.0);
        plan.advance(0.1);
        assert_eq!(plan.accel_now(), 1000.0);
    }

    #[test]
    fn slew_is_rate_limited() {
        let mut vp = VelocityPlan::new(1, 1000.0, 500.0);
        let mut prev = 0.0;
        for _ in 0..100 {
            let out = vp.slew(DT);
            assert!(out.v - prev <= 500.0 * DT + 1e-12);
            prev = out.v;
        }
    }

    #[test]
    fn slew_reaches_and_holds_target() {
        let mut vp = VelocityPlan::new(1, 100.0, 1_000_000.0);
        let out = vp.slew(DT);
        assert_eq!(out.v, 100.0);
        // Holding: no change, no flip.
        let out = vp.slew(DT);
        assert_eq!(out.v, 100.0);
        assert_eq!(out.flip_to, None);
    }

    #[test]
    fn reversal_flips_exactly_at_zero() {
        let mut vp = VelocityPlan::new(1, 100.0, 1_000_000.0);
        vp.slew(DT); // at +100
        vp.set_target(-50.0, 1_000_000.0);

        // One tick to decelerate to zero; flip commits on that tick.
        let out = vp.slew(DT);
        assert_eq!(out.v, 0.0);
        assert_eq!(out.flip_to, Some(-1));
        assert_eq!(out.dir, -1);

        // Next tick accelerates the other way with no further flips.
        let out = vp.slew(DT);
        assert_eq!(out.v, 50.0);
        assert_eq!(out.flip_to, None);
    }

    #[test]
    fn reversal_decelerates_through_old_direction() {
        let mut vp = VelocityPlan::new(1, 100.0, 1_000_000.0);
        vp.slew(DT); // at +100
        vp.set_target(-100.0, 200.0);

        // Far from zero: still stepping in the old direction.
        let out = vp.slew(DT);
        assert_eq!(out.dir, 1);
        assert!(out.v > 0.0);
        assert!(out.v < 100.0);
        assert_eq!(out.flip_to, None);
    }

    #[test]
    fn settled_detection() {
        let mut vp = VelocityPlan::new(1, 100.0, 1_000_000.0);
        assert!(!vp.is_settled());
        vp.slew(DT);
        vp.set_target(0.0, 1_000_000.0);
        vp.slew(DT);
        assert!(vp.is_settled());
    }
}
