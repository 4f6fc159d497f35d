//! Hardware abstraction: pin buses for the step engine and the digital I/O
//! layer, plus the simulation implementation used by tests and bench runs.
//!
//! The tick context calls [`StepDirBus`] methods on every tick, so
//! implementations must be wait-free (&self, interior mutability only).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use arx_common::consts::{INPUT_COUNT, JOINT_COUNT, RELAY_COUNT};

/// Step and direction pin access for all axes.
///
/// Called from the tick context; must not block or allocate.
pub trait StepDirBus: Send + Sync {
    /// Drive the step pin of `axis` high or low.
    fn write_step(&self, axis: usize, high: bool);
    /// Drive the direction pin of `axis` high or low.
    fn write_dir(&self, axis: usize, high: bool);
}

/// Raw digital input levels (true = electrically high).
pub trait InputBus: Send + Sync {
    fn read(&self, idx: usize) -> bool;
}

/// Relay output drive.
pub trait OutputBus: Send + Sync {
    fn write(&self, idx: usize, high: bool);
}

// ─── Simulation bus ─────────────────────────────────────────────────

/// In-memory bus implementing all three pin interfaces.
///
/// Records rising step edges and direction writes so tests can assert on
/// pulse counts and direction-flip timing; inputs are settable from the
/// test side.
#[derive(Debug)]
pub struct SimBus {
    step_level: [AtomicBool; JOINT_COUNT],
    dir_level: [AtomicBool; JOINT_COUNT],
    pulses: [AtomicU64; JOINT_COUNT],
    dir_writes: [AtomicU64; JOINT_COUNT],
    inputs: [AtomicBool; INPUT_COUNT],
    outputs: [AtomicBool; RELAY_COUNT],
}

impl Default for SimBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBus {
    pub fn new() -> Self {
        Self {
            step_level: [const { AtomicBool::new(false) }; JOINT_COUNT],
            dir_level: [const { AtomicBool::new(false) }; JOINT_COUNT],
            pulses: [const { AtomicU64::new(0) }; JOINT_COUNT],
            dir_writes: [const { AtomicU64::new(0) }; JOINT_COUNT],
            inputs: [const { AtomicBool::new(false) }; INPUT_COUNT],
            outputs: [const { AtomicBool::new(false) }; RELAY_COUNT],
        }
    }

    /// Rising step edges seen on `axis` since construction.
    pub fn pulse_count(&self, axis: usize) -> u64 {
        self.pulses[axis].load(Ordering::Relaxed)
    }

    /// Current direction pin level of `axis`.
    pub fn dir_level(&self, axis: usize) -> bool {
        self.dir_level[axis].load(Ordering::Relaxed)
    }

    /// Number of direction pin writes on `axis`.
    pub fn dir_write_count(&self, axis: usize) -> u64 {
        self.dir_writes[axis].load(Ordering::Relaxed)
    }

    /// Current step pin level of `axis`.
    pub fn step_level(&self, axis: usize) -> bool {
        self.step_level[axis].load(Ordering::Relaxed)
    }

    /// Set a raw input level (test side).
    pub fn set_input(&self, idx: usize, high: bool) {
        self.inputs[idx].store(high, Ordering::Relaxed);
    }

    /// Current relay output level.
    pub fn output_level(&self, idx: usize) -> bool {
        self.outputs[idx].load(Ordering::Relaxed)
    }
}

impl StepDirBus for SimBus {
    fn write_step(&self, axis: usize, high: bool) {
        let was = self.step_level[axis].swap(high, Ordering::Relaxed);
        if high && !was {
            self.pulses[axis].fetch_add(1, Ordering::Relaxed);
        }
    }

    fn write_dir(&self, axis: usize, high: bool) {
        self.dir_level[axis].store(high, Ordering::Relaxed);
        self.dir_writes[axis].fetch_add(1, Ordering::Relaxed);
    }
}

impl InputBus for SimBus {
    fn read(&self, idx: usize) -> bool {
        self.inputs[idx].load(Ordering::Relaxed)
    }
}

impl OutputBus for SimBus {
    fn write(&self, idx: usize, high: bool) {
        self.outputs[idx].store(high, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pulses_count_rising_edges_only() {
        let bus = SimBus::new();
        bus.write_step(0, true);
        bus.write_step(0, true); // already high, no new edge
        bus.write_step(0, false);
        bus.write_step(0, true);
        assert_eq!(bus.pulse_count(0), 2);
    }

    #[test]
    fn dir_writes_are_tracked() {
        let bus = SimBus::new();
        bus.write_dir(2, true);
        bus.write_dir(2, false);
        assert_eq!(bus.dir_write_count(2), 2);
        assert!(!bus.dir_level(2));
    }

    #[test]
    fn inputs_roundtrip() {
        let bus = SimBus::new();
        assert!(!bus.read(5));
        bus.set_input(5, true);
        assert!(bus.read(5));
    }
}
