//! Motion controller: engineering units in, step-space plans out.
//!
//! Converts degrees / deg/s / deg/s² to steps using per-joint mechanical
//! factors cached from the config store, enforces soft limits on
//! point-to-point moves, and routes submissions to the step engine.
//!
//! The cache is read-through: any tunable write marks the joint dirty and
//! the next submission or query reloads it. Conversion:
//! `stepsPerPhysDeg = (stepsPerRev · gearboxRatio / 360) / positionFactor`,
//! user-space limits = configured limits minus the home offset.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::debug;

use arx_common::consts::JOINT_COUNT;
use arx_common::joint::{Tunable, JOINT_DEFAULTS};

use crate::safety::EstopFlag;
use crate::step::StepEngine;
use crate::storage::ConfigStore;

/// Submission rejections, mapped onto protocol error tags by the
/// dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MotionError {
    #[error("invalid joint")]
    InvalidJoint,
    #[error("emergency stop latched")]
    Estopped,
    #[error("target outside soft limits")]
    OutOfRange,
    #[error("non-positive speed or acceleration")]
    BadKinematics,
}

/// Cached per-joint conversion factors and limits.
#[derive(Debug, Clone, Copy)]
struct JointCache {
    dirty: bool,
    steps_per_phys_deg: f64,
    user_min: f64,
    user_max: f64,
    cfg_min: f64,
    cfg_max: f64,
    home_offset: f64,
}

impl Default for JointCache {
    fn default() -> Self {
        Self {
            dirty: true,
            steps_per_phys_deg: 1.0,
            user_min: 0.0,
            user_max: 0.0,
            cfg_min: 0.0,
            cfg_max: 0.0,
            home_offset: 0.0,
        }
    }
}

/// Unit translation and soft-limit enforcement in front of the engine.
pub struct MotionController {
    engine: Arc<StepEngine>,
    store: Arc<Mutex<ConfigStore>>,
    estop: EstopFlag,
    cache: [JointCache; JOINT_COUNT],
}

impl MotionController {
    pub fn new(engine: Arc<StepEngine>, store: Arc<Mutex<ConfigStore>>, estop: EstopFlag) -> Self {
        Self {
            engine,
            store,
            estop,
            cache: [JointCache::default(); JOINT_COUNT],
        }
    }

    fn store(&self) -> MutexGuard<'_, ConfigStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the shared estop latch is set.
    #[inline]
    pub fn is_estopped(&self) -> bool {
        self.estop.is_set()
    }

    fn check(joint: usize) -> Result<(), MotionError> {
        if joint < JOINT_COUNT {
            Ok(())
        } else {
            Err(MotionError::InvalidJoint)
        }
    }

    /// Reload the cache for one joint if a tunable changed.
    fn refresh(&mut self, joint: usize) {
        if !self.cache[joint].dirty {
            return;
        }
        let mech = &JOINT_DEFAULTS[joint];
        let store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        let factor = store.tunable(joint, Tunable::PositionFactor);
        let cfg_min = store.tunable(joint, Tunable::JointMin);
        let cfg_max = store.tunable(joint, Tunable::JointMax);
        let home_offset = store.tunable(joint, Tunable::HomeOffset);
        drop(store);

        let cache = &mut self.cache[joint];
        cache.steps_per_phys_deg =
            (f64::from(mech.steps_per_rev) * mech.gearbox_ratio / 360.0) / factor;
        cache.cfg_min = cfg_min;
        cache.cfg_max = cfg_max;
        cache.home_offset = home_offset;
        cache.user_min = cfg_min - home_offset;
        cache.user_max = cfg_max - home_offset;
        cache.dirty = false;
        debug!(
            joint,
            steps_per_deg = cache.steps_per_phys_deg,
            user_min = cache.user_min,
            user_max = cache.user_max,
            "joint cache refreshed"
        );
    }

    /// Invalidate one joint's cache after an external tunable write.
    pub fn mark_dirty(&mut self, joint: usize) {
        if joint < JOINT_COUNT {
            self.cache[joint].dirty = true;
        }
    }

    // ─── Submissions ────────────────────────────────────────────────

    /// Absolute point-to-point move in user-space degrees.
    pub fn move_to(
        &mut self,
        joint: usize,
        target_deg: f64,
        speed: f64,
        accel: f64,
        ignore_limits: bool,
    ) -> Result<(), MotionError> {
        Self::check(joint)?;
        if self.estop.is_set() {
            return Err(MotionError::Estopped);
        }
        if !(speed > 0.0 && accel > 0.0 && speed.is_finite() && accel.is_finite()) {
            return Err(MotionError::BadKinematics);
        }
        self.refresh(joint);
        let cache = self.cache[joint];
        if !ignore_limits && (target_deg < cache.user_min || target_deg > cache.user_max) {
            return Err(MotionError::OutOfRange);
        }

        let current = self.position(joint)?;
        let delta_deg = target_deg - current;
        let delta_steps = (delta_deg * cache.steps_per_phys_deg).round() as i64;
        if delta_steps == 0 {
            return Ok(());
        }
        self.engine
            .start_position(
                joint,
                delta_steps,
                speed.abs() * cache.steps_per_phys_deg,
                accel.abs() * cache.steps_per_phys_deg,
            )
            .map_err(|_| MotionError::InvalidJoint)
    }

    /// Independent per-axis moves; the aggregate result is the AND of the
    /// per-axis results.
    pub fn move_multiple(
        &mut self,
        joints: &[usize],
        targets: &[f64],
        speeds: &[f64],
        accels: &[f64],
        ignore_limits: bool,
    ) -> bool {
        let mut all_ok = true;
        for (i, &joint) in joints.iter().enumerate() {
            let ok = self
                .move_to(joint, targets[i], speeds[i], accels[i], ignore_limits)
                .is_ok();
            all_ok &= ok;
        }
        all_ok
    }

    /// Velocity jog with a signed target [deg/s].
    ///
    /// Retargets a running jog in place, so a sign reversal decelerates
    /// through zero instead of jumping.
    pub fn jog(&mut self, joint: usize, v_signed: f64, accel: f64) -> Result<(), MotionError> {
        Self::check(joint)?;
        if self.estop.is_set() {
            return Err(MotionError::Estopped);
        }
        if !(accel > 0.0 && accel.is_finite() && v_signed.is_finite()) {
            return Err(MotionError::BadKinematics);
        }
        self.refresh(joint);
        let k = self.cache[joint].steps_per_phys_deg;
        self.engine
            .set_jog_target(joint, v_signed * k, accel.abs() * k)
            .map_err(|_| MotionError::InvalidJoint)
    }

    /// One batch micro-slice: signed speeds and accel magnitudes for all
    /// axes, applied atomically with respect to the tick.
    pub fn feed_velocity_slice(&mut self, speeds: &[f64; JOINT_COUNT], accels: &[f64; JOINT_COUNT]) {
        if self.estop.is_set() {
            return;
        }
        let mut v = [0.0; JOINT_COUNT];
        let mut a = [0.0; JOINT_COUNT];
        for joint in 0..JOINT_COUNT {
            self.refresh(joint);
            let k = self.cache[joint].steps_per_phys_deg;
            v[joint] = speeds[joint] * k;
            a[joint] = accels[joint].abs() * k;
        }
        self.engine.set_all_jog_targets(&v, &a);
    }

    /// Ramp every axis toward zero velocity at the given rate [deg/s²].
    pub fn set_all_jog_zero(&mut self, accel: f64) {
        self.feed_velocity_slice(&[0.0; JOINT_COUNT], &[accel.abs(); JOINT_COUNT]);
    }

    /// Clear a velocity plan on one joint.
    pub fn stop_joint(&mut self, joint: usize) -> Result<(), MotionError> {
        Self::check(joint)?;
        self.engine.stop_jog(joint).map_err(|_| MotionError::InvalidJoint)
    }

    /// Clear every plan on every axis. Does not latch the safety state.
    pub fn stop_all(&self) {
        self.engine.emergency_stop();
    }

    /// Overwrite the authoritative position [deg].
    pub fn reset_position(&mut self, joint: usize, deg: f64) -> Result<(), MotionError> {
        Self::check(joint)?;
        self.refresh(joint);
        let steps = (deg * self.cache[joint].steps_per_phys_deg).round() as i64;
        self.engine
            .reset_position(joint, steps)
            .map_err(|_| MotionError::InvalidJoint)
    }

    // ─── Queries (degrees) ──────────────────────────────────────────

    pub fn position(&mut self, joint: usize) -> Result<f64, MotionError> {
        Self::check(joint)?;
        self.refresh(joint);
        let steps = self.engine.position(joint).map_err(|_| MotionError::InvalidJoint)?;
        Ok(steps as f64 / self.cache[joint].steps_per_phys_deg)
    }

    pub fn target(&mut self, joint: usize) -> Result<f64, MotionError> {
        Self::check(joint)?;
        self.refresh(joint);
        let steps = self
            .engine
            .target_steps(joint)
            .map_err(|_| MotionError::InvalidJoint)?;
        Ok(steps as f64 / self.cache[joint].steps_per_phys_deg)
    }

    pub fn speed(&mut self, joint: usize) -> Result<f64, MotionError> {
        Self::check(joint)?;
        self.refresh(joint);
        let v = self
            .engine
            .current_velocity(joint)
            .map_err(|_| MotionError::InvalidJoint)?;
        Ok(v / self.cache[joint].steps_per_phys_deg)
    }

    pub fn accel(&mut self, joint: usize) -> Result<f64, MotionError> {
        Self::check(joint)?;
        self.refresh(joint);
        let a = self
            .engine
            .current_accel(joint)
            .map_err(|_| MotionError::InvalidJoint)?;
        Ok(a / self.cache[joint].steps_per_phys_deg)
    }

    /// All joint positions [deg], for persistence.
    pub fn positions_snapshot(&mut self) -> [f64; JOINT_COUNT] {
        let mut out = [0.0; JOINT_COUNT];
        for (joint, slot) in out.iter_mut().enumerate() {
            *slot = self.position(joint).unwrap_or(0.0);
        }
        out
    }

    pub fn axis_idle(&mut self, joint: usize) -> Result<bool, MotionError> {
        Self::check(joint)?;
        self.engine.axis_idle(joint).map_err(|_| MotionError::InvalidJoint)
    }

    pub fn is_idle(&self) -> bool {
        self.engine.is_idle()
    }

    // ─── Tunables ───────────────────────────────────────────────────

    pub fn set_soft_limits(&mut self, joint: usize, min: f64, max: f64) -> Result<(), MotionError> {
        Self::check(joint)?;
        let mut store = self.store();
        store.set_tunable(joint, Tunable::JointMin, min);
        store.set_tunable(joint, Tunable::JointMax, max);
        drop(store);
        self.cache[joint].dirty = true;
        Ok(())
    }

    /// Raw configured limits (physical space, not user space).
    pub fn soft_limits(&mut self, joint: usize) -> Result<(f64, f64), MotionError> {
        Self::check(joint)?;
        let store = self.store();
        Ok((
            store.tunable(joint, Tunable::JointMin),
            store.tunable(joint, Tunable::JointMax),
        ))
    }

    pub fn set_max_speed(&mut self, joint: usize, v: f64) -> Result<(), MotionError> {
        Self::check(joint)?;
        self.store().set_tunable(joint, Tunable::MaxSpeed, v);
        self.cache[joint].dirty = true;
        Ok(())
    }

    pub fn max_speed(&mut self, joint: usize) -> Result<f64, MotionError> {
        Self::check(joint)?;
        Ok(self.store().tunable(joint, Tunable::MaxSpeed))
    }

    pub fn set_max_accel(&mut self, joint: usize, a: f64) -> Result<(), MotionError> {
        Self::check(joint)?;
        self.store().set_tunable(joint, Tunable::MaxAccel, a);
        self.cache[joint].dirty = true;
        Ok(())
    }

    pub fn max_accel(&mut self, joint: usize) -> Result<f64, MotionError> {
        Self::check(joint)?;
        Ok(self.store().tunable(joint, Tunable::MaxAccel))
    }

    pub fn set_home_offset(&mut self, joint: usize, deg: f64) -> Result<(), MotionError> {
        Self::check(joint)?;
        self.store().set_tunable(joint, Tunable::HomeOffset, deg);
        self.cache[joint].dirty = true;
        Ok(())
    }

    pub fn home_offset(&mut self, joint: usize) -> Result<f64, MotionError> {
        Self::check(joint)?;
        Ok(self.store().tunable(joint, Tunable::HomeOffset))
    }

    pub fn set_position_factor(&mut self, joint: usize, f: f64) -> Result<(), MotionError> {
        Self::check(joint)?;
        self.store().set_tunable(joint, Tunable::PositionFactor, f);
        self.cache[joint].dirty = true;
        Ok(())
    }

    pub fn position_factor(&mut self, joint: usize) -> Result<f64, MotionError> {
        Self::check(joint)?;
        Ok(self.store().tunable(joint, Tunable::PositionFactor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::SimBus;
    use crate::storage::{ConfigStore, MemNvs};

    fn rig() -> (MotionController, Arc<StepEngine>, EstopFlag) {
        let bus = Arc::new(SimBus::new());
        let engine = Arc::new(StepEngine::new(bus, 20_000, [false; JOINT_COUNT]));
        let store = Arc::new(Mutex::new(ConfigStore::open(Box::new(MemNvs::new())).unwrap()));
        let estop = EstopFlag::default();
        let motion = MotionController::new(engine.clone(), store, estop.clone());
        (motion, engine, estop)
    }

    fn settle(engine: &StepEngine) {
        for _ in 0..40_000_000u64 {
            if engine.is_idle() {
                return;
            }
            engine.tick();
        }
        panic!("engine did not settle");
    }

    #[test]
    fn move_converts_degrees_to_steps() {
        let (mut motion, engine, _) = rig();
        motion.move_to(0, 1.0, 10.0, 10.0, false).unwrap();
        settle(&engine);
        let pos = motion.position(0).unwrap();
        assert!((pos - 1.0).abs() < 0.01, "pos = {pos}");
    }

    #[test]
    fn soft_limits_reject_out_of_range_targets() {
        let (mut motion, _, _) = rig();
        // J1 defaults: min 0, max 180, offset 37 → user range −37..143.
        assert_eq!(
            motion.move_to(0, 150.0, 10.0, 10.0, false),
            Err(MotionError::OutOfRange)
        );
        assert_eq!(
            motion.move_to(0, -40.0, 10.0, 10.0, false),
            Err(MotionError::OutOfRange)
        );
        // Inside the user window is accepted.
        assert!(motion.move_to(0, 100.0, 10.0, 10.0, false).is_ok());
    }

    #[test]
    fn ignore_limits_bypasses_the_window() {
        let (mut motion, _, _) = rig();
        assert!(motion.move_to(0, 150.0, 10.0, 10.0, true).is_ok());
    }

    #[test]
    fn estop_blocks_submissions() {
        let (mut motion, _, estop) = rig();
        estop.set(true);
        assert_eq!(
            motion.move_to(0, 10.0, 10.0, 10.0, false),
            Err(MotionError::Estopped)
        );
        assert_eq!(motion.jog(0, 5.0, 10.0), Err(MotionError::Estopped));
        estop.set(false);
        assert!(motion.move_to(0, 10.0, 10.0, 10.0, false).is_ok());
    }

    #[test]
    fn invalid_joint_and_bad_kinematics_are_rejected() {
        let (mut motion, _, _) = rig();
        assert_eq!(
            motion.move_to(6, 1.0, 1.0, 1.0, false),
            Err(MotionError::InvalidJoint)
        );
        assert_eq!(
            motion.move_to(0, 1.0, 0.0, 1.0, false),
            Err(MotionError::BadKinematics)
        );
        assert_eq!(
            motion.move_to(0, 1.0, 1.0, f64::NAN, false),
            Err(MotionError::BadKinematics)
        );
    }

    #[test]
    fn move_multiple_is_the_and_of_results() {
        let (mut motion, _, _) = rig();
        let ok = motion.move_multiple(
            &[0, 1],
            &[10.0, 10.0],
            &[10.0, 10.0],
            &[10.0, 10.0],
            false,
        );
        assert!(ok);
        // Second target violates J1's limits → aggregate failure, but the
        // valid axis still moves.
        let ok = motion.move_multiple(
            &[1, 0],
            &[20.0, 999.0],
            &[10.0, 10.0],
            &[10.0, 10.0],
            false,
        );
        assert!(!ok);
    }

    #[test]
    fn position_factor_rescales_conversion() {
        let (mut motion, engine, _) = rig();
        motion.move_to(3, 1.0, 50.0, 100.0, true).unwrap();
        settle(&engine);
        let steps_before = engine.position(3).unwrap();

        // Doubling the factor halves steps-per-degree; the same physical
        // step count now reads as twice the angle.
        motion.set_position_factor(3, 2.0).unwrap();
        let pos = motion.position(3).unwrap();
        assert!((pos - 2.0).abs() < 0.01, "pos = {pos}");
        assert_eq!(engine.position(3).unwrap(), steps_before);
    }

    #[test]
    fn tunable_roundtrip_marks_cache_dirty() {
        let (mut motion, _, _) = rig();
        motion.set_soft_limits(1, -5.0, 95.0).unwrap();
        assert_eq!(motion.soft_limits(1).unwrap(), (-5.0, 95.0));
        motion.set_max_speed(1, 33.0).unwrap();
        assert_eq!(motion.max_speed(1).unwrap(), 33.0);
        motion.set_max_accel(1, 77.0).unwrap();
        assert_eq!(motion.max_accel(1).unwrap(), 77.0);
        motion.set_home_offset(1, 4.0).unwrap();
        assert_eq!(motion.home_offset(1).unwrap(), 4.0);

        // New offset shifts the user window: cfgMin −5 ⇒ user_min −9.
        assert_eq!(
            motion.move_to(1, -8.5, 10.0, 10.0, false),
            Ok(())
        );
        assert_eq!(
            motion.move_to(1, -10.0, 10.0, 10.0, false),
            Err(MotionError::OutOfRange)
        );
    }

    #[test]
    fn reset_position_roundtrips_degrees() {
        let (mut motion, _, _) = rig();
        motion.reset_position(2, 90.0).unwrap();
        let pos = motion.position(2).unwrap();
        assert!((pos - 90.0).abs() < 0.01);
    }

    #[test]
    fn zero_delta_move_is_a_noop_success() {
        let (mut motion, engine, _) = rig();
        motion.reset_position(0, 50.0).unwrap();
        assert!(motion.move_to(0, 50.0, 10.0, 10.0, false).is_ok());
        assert!(engine.is_idle());
    }

    #[test]
    fn jog_reversal_goes_through_zero_within_accel_bound() {
        let (mut motion, engine, _) = rig();
        let dt = engine.dt();
        // Joint 3 to +5 deg/s at 10 deg/s², reverse to −5: the speed must
        // never change faster than the 10 deg/s² cap, through the zero
        // crossing included.
        let bound = 10.0 * dt + 1e-6;

        motion.jog(2, 5.0, 10.0).unwrap();
        let mut prev = 0.0;
        for _ in 0..20_000 {
            engine.tick();
            let v = motion.speed(2).unwrap();
            assert!((v - prev).abs() <= bound, "Δv {} exceeds cap", v - prev);
            prev = v;
        }
        assert!((prev - 5.0).abs() < 1e-6, "speed = {prev}");

        motion.jog(2, -5.0, 10.0).unwrap();
        // Still decelerating in the old direction right after the call.
        engine.tick();
        let v = motion.speed(2).unwrap();
        assert!((v - prev).abs() <= bound);
        assert!(v > 0.0);
        prev = v;

        for _ in 0..30_000 {
            engine.tick();
            let v = motion.speed(2).unwrap();
            assert!((v - prev).abs() <= bound, "Δv {} exceeds cap", v - prev);
            prev = v;
        }
        // Back at full speed the other way.
        assert!((prev - 5.0).abs() < 1e-6, "speed = {prev}");
    }
}
