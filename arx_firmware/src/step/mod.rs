//! The step engine: fixed-rate pulse generation for all axes.
//!
//! [`StepEngine::tick`] runs in the tick context at the configured rate. It
//! owns the authoritative integer step position of every axis and services
//! the active per-axis [`Profile`] (position plan or velocity plan).
//! Submissions from the main context install profiles under the single
//! engine lock, so the tick observes either the old or the new plan, never
//! a half-installed one. Positions are `AtomicI64` and readable lock-free.
//!
//! Tick contract, in order:
//! 1. deassert step pins raised on the previous tick (one-tick pulses);
//! 2. per axis, evaluate the profile for this tick's speed and direction;
//! 3. write the direction pin before asserting any step when a reversal
//!    commits;
//! 4. assert step pins and integrate the authoritative positions.

pub mod plan;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use arx_common::consts::JOINT_COUNT;

use crate::hal::StepDirBus;
use plan::{PlanStep, PositionPlan, Profile, Slew, VelocityPlan};

/// Submission errors. The engine itself never fails at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StepError {
    #[error("invalid axis {0}")]
    InvalidAxis(usize),
}

/// Per-axis tick-context state.
#[derive(Debug, Default)]
struct AxisSlot {
    /// Active profile, if any.
    profile: Option<Profile>,
    /// Step pin was asserted on the previous tick.
    pulse_high: bool,
    /// Fractional-step accumulator in [0, 1).
    step_acc: f64,
}

/// Fixed-rate pulse generator for all six axes.
pub struct StepEngine {
    /// Tick period [s].
    dt: f64,
    bus: Arc<dyn StepDirBus>,
    /// Per-axis direction-pin polarity inversion.
    reversed: [bool; JOINT_COUNT],
    /// Authoritative step positions, written only by the tick context and
    /// `reset_position`.
    positions: [AtomicI64; JOINT_COUNT],
    slots: Mutex<[AxisSlot; JOINT_COUNT]>,
}

/// Electrical level for a direction sign under the axis polarity.
#[inline]
fn dir_level(dir: i8, reversed: bool) -> bool {
    (dir > 0) ^ reversed
}

impl StepEngine {
    /// Create an engine ticking at `tick_hz` against the given pin bus.
    pub fn new(bus: Arc<dyn StepDirBus>, tick_hz: u32, reversed: [bool; JOINT_COUNT]) -> Self {
        Self {
            dt: 1.0 / f64::from(tick_hz),
            bus,
            reversed,
            positions: [const { AtomicI64::new(0) }; JOINT_COUNT],
            slots: Mutex::new(Default::default()),
        }
    }

    /// Tick period [s].
    #[inline]
    pub fn dt(&self) -> f64 {
        self.dt
    }

    fn slots(&self) -> MutexGuard<'_, [AxisSlot; JOINT_COUNT]> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(axis: usize) -> Result<(), StepError> {
        if axis < JOINT_COUNT {
            Ok(())
        } else {
            Err(StepError::InvalidAxis(axis))
        }
    }

    // ─── Submission (main context) ──────────────────────────────────

    /// Install a trapezoidal position plan of `delta_steps`.
    ///
    /// Cancels any profile already active on the axis and writes the
    /// direction pin. A zero delta is a no-op success.
    pub fn start_position(
        &self,
        axis: usize,
        delta_steps: i64,
        v_steps: f64,
        a_steps: f64,
    ) -> Result<(), StepError> {
        Self::check(axis)?;
        if delta_steps == 0 {
            return Ok(());
        }
        debug_assert!(v_steps > 0.0 && a_steps > 0.0);

        let start_pos = self.positions[axis].load(Ordering::Relaxed);
        let plan = PositionPlan::new(start_pos, delta_steps, v_steps, a_steps);
        let level = dir_level(plan.dir, self.reversed[axis]);

        let mut slots = self.slots();
        slots[axis].profile = Some(Profile::Position(plan));
        slots[axis].step_acc = 0.0;
        self.bus.write_dir(axis, level);
        Ok(())
    }

    /// Start a velocity jog from standstill.
    pub fn start_jog(&self, axis: usize, dir: i8, v_steps: f64, a_steps: f64) -> Result<(), StepError> {
        Self::check(axis)?;
        let vp = VelocityPlan::new(dir, v_steps, a_steps);
        let level = dir_level(vp.dir(), self.reversed[axis]);

        let mut slots = self.slots();
        slots[axis].profile = Some(Profile::Velocity(vp));
        slots[axis].step_acc = 0.0;
        self.bus.write_dir(axis, level);
        Ok(())
    }

    /// Retarget a running velocity plan in place; promotes the axis to a
    /// fresh velocity plan (current speed zero) when none is active.
    ///
    /// A sign change does not touch the direction pin here — the flip
    /// commits in the tick at the zero crossing.
    pub fn set_jog_target(&self, axis: usize, v_signed: f64, a_steps: f64) -> Result<(), StepError> {
        Self::check(axis)?;
        let mut slots = self.slots();
        self.retarget_locked(&mut slots, axis, v_signed, a_steps);
        Ok(())
    }

    /// Retarget all axes in one critical section: the tick sees either all
    /// updates or none.
    pub fn set_all_jog_targets(&self, v_signed: &[f64; JOINT_COUNT], a_steps: &[f64; JOINT_COUNT]) {
        let mut slots = self.slots();
        for axis in 0..JOINT_COUNT {
            self.retarget_locked(&mut slots, axis, v_signed[axis], a_steps[axis]);
        }
    }

    fn retarget_locked(
        &self,
        slots: &mut [AxisSlot; JOINT_COUNT],
        axis: usize,
        v_signed: f64,
        a_steps: f64,
    ) {
        match slots[axis].profile {
            Some(Profile::Velocity(ref mut vp)) => vp.set_target(v_signed, a_steps),
            _ => {
                let dir: i8 = if v_signed >= 0.0 { 1 } else { -1 };
                let vp = VelocityPlan::new(dir, v_signed.abs(), a_steps);
                let level = dir_level(vp.dir(), self.reversed[axis]);
                slots[axis].profile = Some(Profile::Velocity(vp));
                slots[axis].step_acc = 0.0;
                self.bus.write_dir(axis, level);
            }
        }
    }

    /// Clear a velocity plan on one axis. Position plans are unaffected.
    pub fn stop_jog(&self, axis: usize) -> Result<(), StepError> {
        Self::check(axis)?;
        let mut slots = self.slots();
        if matches!(slots[axis].profile, Some(Profile::Velocity(_))) {
            slots[axis].profile = None;
        }
        Ok(())
    }

    /// Clear every profile on every axis immediately. Idempotent.
    pub fn emergency_stop(&self) {
        let mut slots = self.slots();
        for slot in slots.iter_mut() {
            slot.profile = None;
        }
    }

    /// Atomically overwrite the authoritative position of an axis.
    pub fn reset_position(&self, axis: usize, steps: i64) -> Result<(), StepError> {
        Self::check(axis)?;
        // Hold the slot lock so the write cannot interleave with a tick.
        let _slots = self.slots();
        self.positions[axis].store(steps, Ordering::Relaxed);
        Ok(())
    }

    // ─── Queries ────────────────────────────────────────────────────

    /// Authoritative step position.
    pub fn position(&self, axis: usize) -> Result<i64, StepError> {
        Self::check(axis)?;
        Ok(self.positions[axis].load(Ordering::Relaxed))
    }

    /// End position of the active position plan, or the current position.
    pub fn target_steps(&self, axis: usize) -> Result<i64, StepError> {
        Self::check(axis)?;
        let slots = self.slots();
        Ok(match slots[axis].profile {
            Some(Profile::Position(ref plan)) => plan.target_steps(),
            _ => self.positions[axis].load(Ordering::Relaxed),
        })
    }

    /// Speed magnitude commanded on the last tick [steps/s].
    pub fn current_velocity(&self, axis: usize) -> Result<f64, StepError> {
        Self::check(axis)?;
        let slots = self.slots();
        Ok(match slots[axis].profile {
            Some(Profile::Position(ref plan)) => plan.current_v,
            Some(Profile::Velocity(ref vp)) => vp.current_v(),
            None => 0.0,
        })
    }

    /// Acceleration of the current profile phase [steps/s²].
    pub fn current_accel(&self, axis: usize) -> Result<f64, StepError> {
        Self::check(axis)?;
        let slots = self.slots();
        Ok(match slots[axis].profile {
            Some(Profile::Position(ref plan)) => plan.accel_now(),
            Some(Profile::Velocity(ref vp)) => vp.accel(),
            None => 0.0,
        })
    }

    /// True when the axis has no profile with work remaining.
    pub fn axis_idle(&self, axis: usize) -> Result<bool, StepError> {
        Self::check(axis)?;
        let slots = self.slots();
        Ok(Self::slot_idle(&slots[axis]))
    }

    /// True when no axis has a profile with work remaining.
    pub fn is_idle(&self) -> bool {
        let slots = self.slots();
        slots.iter().all(Self::slot_idle)
    }

    fn slot_idle(slot: &AxisSlot) -> bool {
        match slot.profile {
            None => true,
            Some(Profile::Position(_)) => false,
            Some(Profile::Velocity(ref vp)) => vp.is_settled(),
        }
    }

    // ─── Tick (ISR context) ─────────────────────────────────────────

    /// One engine tick. Deterministic, lock-bounded, allocation-free.
    pub fn tick(&self) {
        let mut slots = self.slots();

        // 1. Close out the pulses raised last tick.
        for (axis, slot) in slots.iter_mut().enumerate() {
            if slot.pulse_high {
                self.bus.write_step(axis, false);
                slot.pulse_high = false;
            }
        }

        // 2. Integrate each axis.
        for (axis, slot) in slots.iter_mut().enumerate() {
            let mut pending: i64 = 0;
            let mut dir: i8 = 0;
            let mut clear = false;

            match slot.profile {
                Some(Profile::Position(ref mut plan)) => {
                    dir = plan.dir;
                    match plan.advance(self.dt) {
                        PlanStep::Running(v) => {
                            slot.step_acc += v * self.dt;
                            let mut n = slot.step_acc.floor() as i64;
                            slot.step_acc -= n as f64;
                            let remaining = (plan.total_steps - plan.done_steps) as i64;
                            if n >= remaining {
                                n = remaining;
                                clear = true;
                            }
                            plan.done_steps += n as u64;
                            pending = n;
                        }
                        PlanStep::Expired => {
                            // Flush the fractional residue so the net step
                            // count lands exactly on the planned total.
                            pending = (plan.total_steps - plan.done_steps) as i64;
                            plan.done_steps = plan.total_steps;
                            clear = true;
                        }
                    }
                }
                Some(Profile::Velocity(ref mut vp)) => {
                    let Slew { v, dir: d, flip_to } = vp.slew(self.dt);
                    if let Some(new_dir) = flip_to {
                        self.bus.write_dir(axis, dir_level(new_dir, self.reversed[axis]));
                    }
                    dir = d;
                    if v > 0.0 {
                        slot.step_acc += v * self.dt;
                        let n = slot.step_acc.floor() as i64;
                        slot.step_acc -= n as f64;
                        pending = n;
                    }
                }
                None => {}
            }

            if clear {
                slot.profile = None;
            }
            if pending > 0 {
                self.bus.write_step(axis, true);
                slot.pulse_high = true;
                self.positions[axis].fetch_add(dir as i64 * pending, Ordering::Relaxed);
            }
        }
    }
}
