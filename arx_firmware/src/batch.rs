//! Batch streamer: executes a host-planned multi-axis velocity trajectory.
//!
//! Three states: `IDLE → LOADING → EXECUTING → IDLE`. The host opens a
//! batch with a segment count and slice period, streams the segments, and
//! execution starts automatically once the last one lands. Each slice is
//! subdivided into `SUBDIVISIONS` micro-steps paced off the main loop; at
//! a segment boundary the per-axis velocity snaps to the planned slice-end
//! value so integration error cannot accumulate.
//!
//! Completion, abort, and estop all command every axis toward zero
//! velocity (smooth ramp) rather than clearing plans outright.

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info};

use arx_common::consts::{BATCH_MAX, JOINT_COUNT, SUBDIVISIONS};

use crate::motion::MotionController;

/// Acceleration used to park axes in velocity mode when a batch opens and
/// to ramp them back to zero when it ends [deg/s²].
pub const ZERO_RAMP_ACCEL: f64 = 100.0;

/// Streamer lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Idle,
    Loading,
    Executing,
}

/// Batch command rejections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BatchError {
    #[error("invalid segment count or slice period")]
    InvalidCountOrDt,
    #[error("emergency stop latched")]
    Estopped,
    #[error("more segments than announced")]
    TooMany,
    #[error("segment arrays must carry one entry per joint")]
    BadLength,
}

/// Result of accepting one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Segment stored; more expected.
    Loaded,
    /// That was the last one — execution has started.
    ExecStarted,
}

/// One slice: per-joint signed speeds [deg/s] and accelerations [deg/s²].
#[derive(Debug, Clone, Copy)]
struct Segment {
    speeds: [f64; JOINT_COUNT],
    accels: [f64; JOINT_COUNT],
}

/// The batch state machine. Paced by the cooperative main loop.
pub struct BatchStreamer {
    state: BatchState,
    expected: usize,
    segments: Vec<Segment>,
    /// Slice period [s].
    dt: f64,
    micro_period: Duration,
    cursor: usize,
    micro: u32,
    /// Per-axis velocity at the end of the previous slice.
    prev_v: [f64; JOINT_COUNT],
    /// Per-axis velocity increment per micro-step for the current slice.
    accel_per_micro: [f64; JOINT_COUNT],
    last_exec: Instant,
}

impl BatchStreamer {
    pub fn new(now: Instant) -> Self {
        Self {
            state: BatchState::Idle,
            expected: 0,
            segments: Vec::with_capacity(BATCH_MAX),
            dt: 0.0,
            micro_period: Duration::ZERO,
            cursor: 0,
            micro: 0,
            prev_v: [0.0; JOINT_COUNT],
            accel_per_micro: [0.0; JOINT_COUNT],
            last_exec: now,
        }
    }

    #[inline]
    pub fn state(&self) -> BatchState {
        self.state
    }

    /// Number of segments received so far.
    #[inline]
    pub fn loaded(&self) -> usize {
        self.segments.len()
    }

    /// Open a batch: `0 < count ≤ BATCH_MAX`, `dt > 0`.
    ///
    /// Puts every axis into velocity mode at zero so the subsequent slice
    /// updates retarget in place.
    pub fn begin(
        &mut self,
        count: usize,
        dt: f64,
        motion: &mut MotionController,
    ) -> Result<(), BatchError> {
        if count == 0 || count > BATCH_MAX || !(dt > 0.0) || !dt.is_finite() {
            return Err(BatchError::InvalidCountOrDt);
        }
        if motion.is_estopped() {
            return Err(BatchError::Estopped);
        }

        self.expected = count;
        self.dt = dt;
        self.micro_period = Duration::from_secs_f64(dt / f64::from(SUBDIVISIONS));
        self.segments.clear();
        self.cursor = 0;
        self.micro = 0;
        self.prev_v = [0.0; JOINT_COUNT];
        self.accel_per_micro = [0.0; JOINT_COUNT];
        self.state = BatchState::Loading;
        motion.set_all_jog_zero(ZERO_RAMP_ACCEL);
        info!(count, dt, "batch opened");
        Ok(())
    }

    /// Accept one segment while loading.
    pub fn load(
        &mut self,
        speeds: &[f64],
        accels: &[f64],
        now: Instant,
    ) -> Result<LoadOutcome, BatchError> {
        if self.segments.len() >= self.expected {
            return Err(BatchError::TooMany);
        }
        if speeds.len() != JOINT_COUNT || accels.len() != JOINT_COUNT {
            return Err(BatchError::BadLength);
        }

        let mut segment = Segment {
            speeds: [0.0; JOINT_COUNT],
            accels: [0.0; JOINT_COUNT],
        };
        segment.speeds.copy_from_slice(speeds);
        segment.accels.copy_from_slice(accels);
        self.segments.push(segment);

        if self.segments.len() == self.expected {
            self.state = BatchState::Executing;
            self.last_exec = now;
            info!(count = self.expected, "batch fully loaded, executing");
            Ok(LoadOutcome::ExecStarted)
        } else {
            Ok(LoadOutcome::Loaded)
        }
    }

    /// Host-requested abort: discard the batch and ramp every axis to zero.
    pub fn abort(&mut self, motion: &mut MotionController) {
        self.reset();
        motion.set_all_jog_zero(ZERO_RAMP_ACCEL);
        info!("batch aborted");
    }

    /// Estop path: returns true when a batch was actually killed so the
    /// runtime can emit the abort notification.
    pub fn estop_abort(&mut self, motion: &mut MotionController) -> bool {
        if self.state == BatchState::Idle {
            return false;
        }
        self.reset();
        motion.set_all_jog_zero(ZERO_RAMP_ACCEL);
        true
    }

    fn reset(&mut self) {
        self.state = BatchState::Idle;
        self.segments.clear();
        self.expected = 0;
        self.cursor = 0;
        self.micro = 0;
    }

    /// One execution step. Returns true when the batch just completed.
    ///
    /// No-op unless EXECUTING and a micro period has elapsed.
    pub fn poll(&mut self, now: Instant, motion: &mut MotionController) -> bool {
        if self.state != BatchState::Executing {
            return false;
        }
        if now.duration_since(self.last_exec) < self.micro_period {
            return false;
        }
        self.last_exec = now;

        if self.cursor >= self.segments.len() {
            self.reset();
            motion.set_all_jog_zero(ZERO_RAMP_ACCEL);
            info!("batch complete");
            return true;
        }

        let segment = self.segments[self.cursor];
        let dt_micro = self.dt / f64::from(SUBDIVISIONS);

        // First micro-step of a slice: derive the per-micro increment.
        if self.micro == 0 {
            for j in 0..JOINT_COUNT {
                self.accel_per_micro[j] = segment.accels[j] * self.dt / f64::from(SUBDIVISIONS);
            }
            debug!(cursor = self.cursor, "slice start");
        }

        // Ramp from the previous slice-end velocity in sub-increments; the
        // slice acceleration is the rate that covers one increment in one
        // micro period.
        let mut speeds = [0.0; JOINT_COUNT];
        let mut accels = [0.0; JOINT_COUNT];
        for j in 0..JOINT_COUNT {
            speeds[j] = self.prev_v[j] + self.accel_per_micro[j] * f64::from(self.micro + 1);
            accels[j] = self.accel_per_micro[j].abs() / dt_micro;
        }
        motion.feed_velocity_slice(&speeds, &accels);

        self.micro += 1;
        if self.micro >= SUBDIVISIONS {
            // Snap to the planned slice-end speed to kill integration drift.
            self.prev_v = segment.speeds;
            self.micro = 0;
            self.cursor += 1;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::SimBus;
    use crate::safety::EstopFlag;
    use crate::step::StepEngine;
    use crate::storage::{ConfigStore, MemNvs};
    use std::sync::{Arc, Mutex};

    struct Rig {
        batch: BatchStreamer,
        motion: MotionController,
        engine: Arc<StepEngine>,
        estop: EstopFlag,
        t: Instant,
    }

    fn rig() -> Rig {
        let bus = Arc::new(SimBus::new());
        let engine = Arc::new(StepEngine::new(bus, 20_000, [false; JOINT_COUNT]));
        let store = Arc::new(Mutex::new(ConfigStore::open(Box::new(MemNvs::new())).unwrap()));
        let estop = EstopFlag::default();
        let t = Instant::now();
        Rig {
            batch: BatchStreamer::new(t),
            motion: MotionController::new(engine.clone(), store, estop.clone()),
            engine,
            estop,
            t,
        }
    }

    impl Rig {
        /// Advance one micro period: engine ticks plus one poll.
        fn micro_step(&mut self, dt: f64) -> bool {
            let micro = Duration::from_secs_f64(dt / f64::from(SUBDIVISIONS));
            self.t += micro;
            // 20 kHz engine over one micro period.
            let ticks = (micro.as_secs_f64() * 20_000.0).ceil() as u64;
            for _ in 0..ticks {
                self.engine.tick();
            }
            self.batch.poll(self.t, &mut self.motion)
        }
    }

    const ZEROS: [f64; JOINT_COUNT] = [0.0; JOINT_COUNT];

    #[test]
    fn begin_validates_count_and_dt() {
        let mut rig = rig();
        assert_eq!(
            rig.batch.begin(0, 0.02, &mut rig.motion),
            Err(BatchError::InvalidCountOrDt)
        );
        assert_eq!(
            rig.batch.begin(BATCH_MAX + 1, 0.02, &mut rig.motion),
            Err(BatchError::InvalidCountOrDt)
        );
        assert_eq!(
            rig.batch.begin(3, 0.0, &mut rig.motion),
            Err(BatchError::InvalidCountOrDt)
        );
        assert_eq!(
            rig.batch.begin(3, -1.0, &mut rig.motion),
            Err(BatchError::InvalidCountOrDt)
        );
        assert!(rig.batch.begin(3, 0.02, &mut rig.motion).is_ok());
        assert_eq!(rig.batch.state(), BatchState::Loading);
    }

    #[test]
    fn begin_rejected_while_estopped() {
        let mut rig = rig();
        rig.estop.set(true);
        assert_eq!(
            rig.batch.begin(3, 0.02, &mut rig.motion),
            Err(BatchError::Estopped)
        );
    }

    #[test]
    fn bad_segment_length_is_rejected_without_advancing() {
        let mut rig = rig();
        rig.batch.begin(2, 0.02, &mut rig.motion).unwrap();
        assert_eq!(
            rig.batch.load(&[0.0; 3], &ZEROS, rig.t),
            Err(BatchError::BadLength)
        );
        assert_eq!(rig.batch.loaded(), 0);
        assert_eq!(rig.batch.state(), BatchState::Loading);
    }

    #[test]
    fn last_segment_starts_execution() {
        let mut rig = rig();
        rig.batch.begin(2, 0.02, &mut rig.motion).unwrap();
        assert_eq!(
            rig.batch.load(&ZEROS, &ZEROS, rig.t),
            Ok(LoadOutcome::Loaded)
        );
        assert_eq!(
            rig.batch.load(&ZEROS, &ZEROS, rig.t),
            Ok(LoadOutcome::ExecStarted)
        );
        assert_eq!(rig.batch.state(), BatchState::Executing);
        // A further segment is one too many.
        assert_eq!(rig.batch.load(&ZEROS, &ZEROS, rig.t), Err(BatchError::TooMany));
    }

    #[test]
    fn zero_velocity_batch_leaves_positions_unchanged() {
        let mut rig = rig();
        let dt = 0.02;
        rig.batch.begin(3, dt, &mut rig.motion).unwrap();
        for _ in 0..3 {
            rig.batch.load(&ZEROS, &ZEROS, rig.t).unwrap();
        }

        let mut completed = false;
        for _ in 0..(3 * SUBDIVISIONS + 2) {
            if rig.micro_step(dt) {
                completed = true;
                break;
            }
        }
        assert!(completed, "batch did not complete");
        assert_eq!(rig.batch.state(), BatchState::Idle);
        for j in 0..JOINT_COUNT {
            assert_eq!(rig.engine.position(j).unwrap(), 0, "axis {j}");
        }
    }

    #[test]
    fn ramp_segment_moves_the_axis() {
        let mut rig = rig();
        let dt = 0.02;
        // One slice ramping J1 from 0 to 10 deg/s (Δv/dt = 500 deg/s²).
        let mut speeds = ZEROS;
        let mut accels = ZEROS;
        speeds[0] = 10.0;
        accels[0] = 500.0;

        rig.batch.begin(1, dt, &mut rig.motion).unwrap();
        rig.batch.load(&speeds, &accels, rig.t).unwrap();

        let mut completed = false;
        for _ in 0..(SUBDIVISIONS + 2) {
            if rig.micro_step(dt) {
                completed = true;
                break;
            }
        }
        assert!(completed);
        assert!(rig.engine.position(0).unwrap() > 0, "axis should have advanced");
        // Other axes untouched.
        for j in 1..JOINT_COUNT {
            assert_eq!(rig.engine.position(j).unwrap(), 0);
        }
    }

    #[test]
    fn poll_respects_the_micro_period() {
        let mut rig = rig();
        rig.batch.begin(1, 0.02, &mut rig.motion).unwrap();
        rig.batch.load(&ZEROS, &ZEROS, rig.t).unwrap();
        // Immediately after ExecStarted no micro period has elapsed.
        assert!(!rig.batch.poll(rig.t, &mut rig.motion));
        assert_eq!(rig.batch.micro, 0);
    }

    #[test]
    fn abort_returns_to_idle() {
        let mut rig = rig();
        rig.batch.begin(5, 0.02, &mut rig.motion).unwrap();
        rig.batch.load(&ZEROS, &ZEROS, rig.t).unwrap();
        rig.batch.abort(&mut rig.motion);
        assert_eq!(rig.batch.state(), BatchState::Idle);
        assert_eq!(rig.batch.loaded(), 0);
    }

    #[test]
    fn estop_abort_only_fires_when_active() {
        let mut rig = rig();
        assert!(!rig.batch.estop_abort(&mut rig.motion));
        rig.batch.begin(2, 0.02, &mut rig.motion).unwrap();
        assert!(rig.batch.estop_abort(&mut rig.motion));
        assert_eq!(rig.batch.state(), BatchState::Idle);
    }
}
