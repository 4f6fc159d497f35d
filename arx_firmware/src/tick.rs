//! The fixed-rate tick thread driving the step engine.
//!
//! Stands in for the hardware timer interrupt: a dedicated thread invokes
//! [`StepEngine::tick`] at the configured rate. With the `rt` feature the
//! thread locks its pages, requests `SCHED_FIFO`, and paces itself with
//! `clock_nanosleep(TIMER_ABSTIME)` on `CLOCK_MONOTONIC` for drift-free
//! scheduling; without it a plain absolute-deadline `Instant` loop is used.
//!
//! A tick must complete within one period. Overruns are counted, not
//! fatal: the schedule re-anchors so the engine never tries to "catch up"
//! with a burst of back-to-back ticks.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::step::StepEngine;

/// RT priority requested for the tick thread (`rt` feature only).
pub const TICK_RT_PRIORITY: i32 = 80;

/// Shared counters for the tick thread.
#[derive(Debug, Default)]
pub struct TickStats {
    /// Ticks executed since spawn.
    pub ticks: AtomicU64,
    /// Periods missed (tick body or wakeup exceeded the period).
    pub overruns: AtomicU64,
}

/// Handle owning the tick thread; dropping it stops the thread.
pub struct TickRunner {
    stop: Arc<AtomicBool>,
    stats: Arc<TickStats>,
    handle: Option<JoinHandle<()>>,
}

impl TickRunner {
    /// Spawn the tick thread at `tick_hz`.
    pub fn spawn(engine: Arc<StepEngine>, tick_hz: u32) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(TickStats::default());
        let thread_stop = stop.clone();
        let thread_stats = stats.clone();

        let handle = std::thread::Builder::new()
            .name("arx-tick".to_string())
            .spawn(move || {
                rt_setup();
                info!(tick_hz, "tick thread running");
                run_loop(&engine, tick_hz, &thread_stop, &thread_stats);
            })
            .ok();
        if handle.is_none() {
            warn!("failed to spawn tick thread");
        }

        Self {
            stop,
            stats,
            handle,
        }
    }

    pub fn stats(&self) -> Arc<TickStats> {
        self.stats.clone()
    }
}

impl Drop for TickRunner {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Absolute-deadline loop shared by both pacing back ends.
fn run_loop(engine: &StepEngine, tick_hz: u32, stop: &AtomicBool, stats: &TickStats) {
    let period = Duration::from_secs_f64(1.0 / f64::from(tick_hz));
    let mut next = Instant::now() + period;

    while !stop.load(Ordering::Relaxed) {
        engine.tick();
        stats.ticks.fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        if now >= next {
            // Missed the deadline: re-anchor rather than bursting.
            stats.overruns.fetch_add(1, Ordering::Relaxed);
            next = now + period;
            continue;
        }
        sleep_until(next, now);
        next += period;
    }
}

#[cfg(feature = "rt")]
fn sleep_until(next: Instant, now: Instant) {
    use nix::sys::time::TimeSpec;
    use nix::time::{clock_gettime, clock_nanosleep, ClockId, ClockNanosleepFlags};

    // Translate the Instant deadline onto CLOCK_MONOTONIC.
    let remaining = next - now;
    if let Ok(current) = clock_gettime(ClockId::CLOCK_MONOTONIC) {
        let deadline = timespec_add_ns(current, remaining.as_nanos() as i64);
        let _ = clock_nanosleep(
            ClockId::CLOCK_MONOTONIC,
            ClockNanosleepFlags::TIMER_ABSTIME,
            &deadline,
        );
    } else {
        std::thread::sleep(remaining);
    }

    #[allow(clippy::missing_const_for_fn)]
    fn timespec_add_ns(ts: TimeSpec, ns: i64) -> TimeSpec {
        let mut secs = ts.tv_sec();
        let mut nanos = ts.tv_nsec() + ns;
        while nanos >= 1_000_000_000 {
            secs += 1;
            nanos -= 1_000_000_000;
        }
        TimeSpec::new(secs, nanos)
    }
}

#[cfg(not(feature = "rt"))]
fn sleep_until(next: Instant, now: Instant) {
    std::thread::sleep(next - now);
}

/// Lock pages and request SCHED_FIFO. No-ops without the `rt` feature.
#[cfg(feature = "rt")]
fn rt_setup() {
    use nix::sys::mman::{mlockall, MlockallFlags};

    if let Err(e) = mlockall(MlockallFlags::MCL_CURRENT | MlockallFlags::MCL_FUTURE) {
        warn!(error = %e, "mlockall failed, continuing without locked pages");
    }

    let param = libc::sched_param {
        sched_priority: TICK_RT_PRIORITY,
    };
    let ret = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if ret != 0 {
        warn!(
            error = %std::io::Error::last_os_error(),
            "SCHED_FIFO unavailable, running with the default scheduler"
        );
    }
}

#[cfg(not(feature = "rt"))]
fn rt_setup() {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::SimBus;
    use arx_common::consts::JOINT_COUNT;

    #[test]
    fn runner_ticks_and_stops_on_drop() {
        let bus = Arc::new(SimBus::new());
        let engine = Arc::new(StepEngine::new(bus, 5_000, [false; JOINT_COUNT]));
        let runner = TickRunner::spawn(engine.clone(), 5_000);
        let stats = runner.stats();

        std::thread::sleep(Duration::from_millis(50));
        drop(runner);
        let ticks = stats.ticks.load(Ordering::Relaxed);
        assert!(ticks > 0, "tick thread never ran");

        // Stopped: the count no longer advances.
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(stats.ticks.load(Ordering::Relaxed), ticks);
    }

    #[test]
    fn ticking_thread_drives_motion() {
        let bus = Arc::new(SimBus::new());
        let engine = Arc::new(StepEngine::new(bus, 20_000, [false; JOINT_COUNT]));
        let runner = TickRunner::spawn(engine.clone(), 20_000);

        engine.start_position(0, 200, 5_000.0, 100_000.0).unwrap();
        for _ in 0..200 {
            if engine.is_idle() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(engine.position(0).unwrap(), 200);
        drop(runner);
    }
}
