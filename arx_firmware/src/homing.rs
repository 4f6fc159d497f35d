//! Two-stage homing against the per-joint limit switches.
//!
//! One joint homes at a time. The sequence per job:
//!
//! 1. `FastApproach` — jog toward the switch (negative direction) at the
//!    clamped fast speed. On contact: zero to the configured minimum and
//!    command a position move away by the backoff angle.
//! 2. `Backoff` — wait for the move to finish, then require the switch to
//!    read clear for one full update (a one-shot latch that defeats a
//!    single debounced glitch) before starting the slow jog back in.
//! 3. `SlowApproach` — on contact: re-zero to the configured minimum,
//!    record the user-space limits, and move to the home offset.
//! 4. `FinalOffset` — when the move completes, re-zero to user-space 0 and
//!    publish the homed limits.
//!
//! Abort (operator or estop) cancels the active plan and returns to idle.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::{debug, info};

use arx_common::consts::JOINT_COUNT;
use arx_common::joint::Tunable;

use crate::io::IoBank;
use crate::motion::MotionController;
use crate::safety::EstopFlag;
use crate::storage::ConfigStore;

/// Degrees the axis retreats from the switch between the two approaches.
pub const BACKOFF_ANGLE: f64 = 5.0;

/// Why a homing request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HomingError {
    #[error("invalid joint")]
    InvalidJoint,
    #[error("a homing job is already active")]
    Busy,
    #[error("emergency stop latched")]
    Estopped,
}

/// Phase of the active homing job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HomingPhase {
    Idle,
    FastApproach,
    Backoff,
    SlowApproach,
    FinalOffset,
}

/// Published result of a completed job.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HomedLimits {
    pub joint: usize,
    /// User-space minimum [deg].
    pub min: f64,
    /// User-space maximum [deg].
    pub max: f64,
}

/// The homing state machine. Exactly one job at a time.
pub struct HomingController {
    store: Arc<Mutex<ConfigStore>>,
    estop: EstopFlag,
    phase: HomingPhase,
    joint: usize,
    fast: f64,
    slow: f64,
    /// Set once the switch has read clear after the backoff move.
    backoff_cleared: bool,
    min_pos: [f64; JOINT_COUNT],
    max_pos: [f64; JOINT_COUNT],
}

impl HomingController {
    pub fn new(store: Arc<Mutex<ConfigStore>>, estop: EstopFlag) -> Self {
        Self {
            store,
            estop,
            phase: HomingPhase::Idle,
            joint: 0,
            fast: 0.0,
            slow: 0.0,
            backoff_cleared: false,
            min_pos: [0.0; JOINT_COUNT],
            max_pos: [0.0; JOINT_COUNT],
        }
    }

    fn store(&self) -> MutexGuard<'_, ConfigStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    pub fn phase(&self) -> HomingPhase {
        self.phase
    }

    #[inline]
    pub fn is_homing(&self) -> bool {
        self.phase != HomingPhase::Idle
    }

    /// User-space minimum recorded by the last successful job.
    pub fn min_pos(&self, joint: usize) -> f64 {
        self.min_pos.get(joint).copied().unwrap_or(0.0)
    }

    /// User-space maximum recorded by the last successful job.
    pub fn max_pos(&self, joint: usize) -> f64 {
        self.max_pos.get(joint).copied().unwrap_or(0.0)
    }

    /// Begin homing one joint; speeds are clamped to the configured
    /// homing tunables.
    pub fn start(
        &mut self,
        joint: usize,
        req_fast: f64,
        req_slow: f64,
        motion: &mut MotionController,
    ) -> Result<(), HomingError> {
        if joint >= JOINT_COUNT {
            return Err(HomingError::InvalidJoint);
        }
        if self.phase != HomingPhase::Idle {
            return Err(HomingError::Busy);
        }
        if self.estop.is_set() {
            return Err(HomingError::Estopped);
        }

        let store = self.store();
        let cfg_fast = store.tunable(joint, Tunable::HomingSpeed);
        let cfg_slow = store.tunable(joint, Tunable::SlowHomingSpeed);
        drop(store);

        self.fast = req_fast.abs().min(cfg_fast);
        self.slow = req_slow.abs().min(cfg_slow);
        self.joint = joint;
        self.backoff_cleared = false;

        motion
            .jog(joint, -self.fast, self.fast * 2.0)
            .map_err(|_| HomingError::Estopped)?;
        self.phase = HomingPhase::FastApproach;
        info!(joint, fast = self.fast, slow = self.slow, "homing started");
        Ok(())
    }

    /// Cancel the active job and stop all motion.
    pub fn abort(&mut self, motion: &mut MotionController) {
        if self.phase != HomingPhase::Idle {
            info!(joint = self.joint, "homing aborted");
        }
        motion.stop_all();
        self.phase = HomingPhase::Idle;
    }

    /// One main-loop step of the state machine.
    ///
    /// Returns the homed limits when the job completes.
    pub fn update(&mut self, motion: &mut MotionController, io: &IoBank) -> Option<HomedLimits> {
        if self.phase == HomingPhase::Idle {
            return None;
        }
        if self.estop.is_set() {
            self.abort(motion);
            return None;
        }

        let joint = self.joint;
        let hit = io.limit_active(joint);

        let store = self.store();
        let cfg_min = store.tunable(joint, Tunable::JointMin);
        let cfg_max = store.tunable(joint, Tunable::JointMax);
        let cfg_offset = store.tunable(joint, Tunable::HomeOffset);
        drop(store);

        match self.phase {
            HomingPhase::FastApproach => {
                if hit {
                    let _ = motion.stop_joint(joint);
                    let _ = motion.reset_position(joint, cfg_min);
                    let _ = motion.move_to(
                        joint,
                        cfg_min + BACKOFF_ANGLE,
                        self.fast,
                        self.fast * 2.0,
                        true,
                    );
                    self.backoff_cleared = false;
                    self.phase = HomingPhase::Backoff;
                    debug!(joint, "switch hit, backing off");
                }
            }
            HomingPhase::Backoff => {
                if motion.axis_idle(joint).unwrap_or(true) {
                    if hit {
                        // A glitch re-asserted the switch: restart the latch.
                        self.backoff_cleared = false;
                    } else if !self.backoff_cleared {
                        self.backoff_cleared = true;
                    } else {
                        let _ = motion.jog(joint, -self.slow, self.slow * 10.0);
                        self.phase = HomingPhase::SlowApproach;
                        debug!(joint, "switch cleared, slow approach");
                    }
                }
            }
            HomingPhase::SlowApproach => {
                if hit {
                    let _ = motion.stop_joint(joint);
                    let _ = motion.reset_position(joint, cfg_min);
                    self.min_pos[joint] = cfg_min - cfg_offset;
                    self.max_pos[joint] = cfg_max - cfg_offset;
                    let _ = motion.move_to(joint, cfg_offset, self.fast, self.fast * 2.0, true);
                    self.phase = HomingPhase::FinalOffset;
                    debug!(joint, "re-zeroed, moving to home offset");
                }
            }
            HomingPhase::FinalOffset => {
                if motion.axis_idle(joint).unwrap_or(true) {
                    let _ = motion.reset_position(joint, 0.0);
                    self.phase = HomingPhase::Idle;
                    let limits = HomedLimits {
                        joint,
                        min: self.min_pos[joint],
                        max: self.max_pos[joint],
                    };
                    info!(joint, min = limits.min, max = limits.max, "homed");
                    return Some(limits);
                }
            }
            HomingPhase::Idle => {}
        }
        None
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::SimBus;
    use crate::step::StepEngine;
    use crate::storage::{ConfigStore, MemNvs};
    use arx_common::consts::LIMIT_INPUT_BASE;
    use std::time::Duration;
    use std::time::Instant;

    struct Rig {
        homing: HomingController,
        motion: MotionController,
        engine: Arc<StepEngine>,
        io: IoBank,
        bus: Arc<SimBus>,
        t: Instant,
    }

    fn rig() -> Rig {
        let bus = Arc::new(SimBus::new());
        let engine = Arc::new(StepEngine::new(bus.clone(), 20_000, [false; JOINT_COUNT]));
        let store = Arc::new(Mutex::new(ConfigStore::open(Box::new(MemNvs::new())).unwrap()));
        let estop = EstopFlag::default();
        let t = Instant::now();
        Rig {
            homing: HomingController::new(store.clone(), estop.clone()),
            motion: MotionController::new(engine.clone(), store, estop),
            engine,
            io: IoBank::new(bus.clone(), bus.clone(), t),
            bus,
            t,
        }
    }

    impl Rig {
        /// Advance the world: engine ticks, debounce time, one SM update.
        fn step(&mut self) -> Option<HomedLimits> {
            for _ in 0..200 {
                self.engine.tick();
            }
            self.t += Duration::from_millis(10);
            self.io.update(self.t);
            self.io.update(self.t); // settle debounce
            self.homing.update(&mut self.motion, &self.io)
        }

        fn set_limit(&mut self, joint: usize, active: bool) {
            self.bus.set_input(LIMIT_INPUT_BASE + joint, active);
        }

        fn run_until<F: Fn(&mut Rig) -> bool>(&mut self, cond: F, max: usize) {
            for _ in 0..max {
                if cond(self) {
                    return;
                }
                self.step();
            }
            panic!("condition not reached in {max} steps");
        }

        fn shared_estop(&self) -> EstopFlag {
            // The homing and motion controllers share one flag.
            self.homing.estop.clone()
        }
    }

    #[test]
    fn full_homing_sequence_publishes_user_limits() {
        let mut rig = rig();
        // J1 defaults: min 0, max 180, offset 37.
        rig.homing.start(0, 8.0, 3.0, &mut rig.motion).unwrap();
        assert_eq!(rig.homing.phase(), HomingPhase::FastApproach);

        // Jog runs negative until the switch trips.
        rig.run_until(|r| r.motion.position(0).unwrap() < -1.0, 10_000);
        rig.set_limit(0, true);
        rig.run_until(|r| r.homing.phase() == HomingPhase::Backoff, 50);

        // Position snapped to cfgMin at the switch.
        let pos = rig.motion.position(0).unwrap();
        assert!(pos >= 0.0 && pos < 1.0, "pos = {pos}");

        // Backoff move to +5°; switch clears partway out.
        rig.run_until(|r| r.motion.position(0).unwrap() > 2.0, 10_000);
        rig.set_limit(0, false);
        rig.run_until(|r| r.homing.phase() == HomingPhase::SlowApproach, 10_000);

        // Slow approach re-trips the switch.
        rig.run_until(|r| r.motion.position(0).unwrap() < 4.0, 10_000);
        rig.set_limit(0, true);
        rig.run_until(|r| r.homing.phase() == HomingPhase::FinalOffset, 50);

        // Final move to +37° physical, then user zero.
        rig.set_limit(0, false);
        let mut homed = None;
        for _ in 0..20_000 {
            homed = rig.step();
            if homed.is_some() {
                break;
            }
        }
        let homed = homed.expect("homing did not complete");
        assert_eq!(homed.joint, 0);
        assert!((homed.min - (-37.0)).abs() < 1e-9);
        assert!((homed.max - 143.0).abs() < 1e-9);

        assert_eq!(rig.homing.phase(), HomingPhase::Idle);
        let final_pos = rig.motion.position(0).unwrap();
        assert!(final_pos.abs() < 0.05, "final pos = {final_pos}");
        assert_eq!(rig.homing.min_pos(0), -37.0);
        assert_eq!(rig.homing.max_pos(0), 143.0);
    }

    #[test]
    fn backoff_glitch_resets_the_clear_latch() {
        let mut rig = rig();
        rig.homing.start(1, 5.0, 2.0, &mut rig.motion).unwrap();
        rig.run_until(|r| r.motion.position(1).unwrap() < -0.5, 10_000);
        rig.set_limit(1, true);
        rig.run_until(|r| r.homing.phase() == HomingPhase::Backoff, 50);

        // Finish the backoff move with the switch still reading active:
        // the slow approach must not start.
        rig.run_until(|r| r.motion.axis_idle(1).unwrap(), 20_000);
        rig.step();
        rig.step();
        assert_eq!(rig.homing.phase(), HomingPhase::Backoff);

        // One clear reading arms the latch, the next starts the jog.
        rig.set_limit(1, false);
        rig.run_until(|r| r.homing.phase() == HomingPhase::SlowApproach, 50);
    }

    #[test]
    fn only_one_job_at_a_time() {
        let mut rig = rig();
        rig.homing.start(0, 8.0, 3.0, &mut rig.motion).unwrap();
        assert_eq!(
            rig.homing.start(1, 8.0, 3.0, &mut rig.motion),
            Err(HomingError::Busy)
        );
    }

    #[test]
    fn invalid_joint_is_rejected() {
        let mut rig = rig();
        assert_eq!(
            rig.homing.start(JOINT_COUNT, 8.0, 3.0, &mut rig.motion),
            Err(HomingError::InvalidJoint)
        );
    }

    #[test]
    fn estop_blocks_start_and_aborts_updates() {
        let mut rig = rig();
        let flag = rig.shared_estop();
        flag.set(true);
        assert_eq!(
            rig.homing.start(0, 8.0, 3.0, &mut rig.motion),
            Err(HomingError::Estopped)
        );
        flag.set(false);
        rig.homing.start(0, 8.0, 3.0, &mut rig.motion).unwrap();
        flag.set(true);
        rig.step();
        assert_eq!(rig.homing.phase(), HomingPhase::Idle);
        assert!(rig.engine.is_idle());
    }

    #[test]
    fn requested_speeds_are_clamped_to_config() {
        let mut rig = rig();
        // J1 homingSpeed default is 8.0; request far more.
        rig.homing.start(0, 100.0, 50.0, &mut rig.motion).unwrap();
        assert!(rig.homing.fast <= 8.0);
        assert!(rig.homing.slow <= 3.0);
    }

    #[test]
    fn abort_returns_to_idle_and_stops_motion() {
        let mut rig = rig();
        rig.homing.start(0, 8.0, 3.0, &mut rig.motion).unwrap();
        rig.step();
        rig.homing.abort(&mut rig.motion);
        assert_eq!(rig.homing.phase(), HomingPhase::Idle);
        assert!(rig.engine.is_idle());
    }
}
