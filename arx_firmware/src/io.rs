//! Debounced digital inputs (buttons, estop, limit switches) and relay
//! outputs.
//!
//! Inputs are polled from the main loop; a level must hold for the
//! configured debounce interval before the stable state follows it.
//! Indices follow the wiring order: buttons 0..11, estop at 12, limit
//! switches J1..J6 at 13..18.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arx_common::consts::{
    BUTTON_COUNT, ESTOP_INPUT, INPUT_COUNT, JOINT_COUNT, LIMIT_INPUT_BASE, RELAY_COUNT,
};

use crate::hal::{InputBus, OutputBus};

/// Relay driving the "ready" lamp; mirrors "not estopped".
pub const READY_RELAY: usize = 0;
/// Red status LED relay (blinks while the estop is held).
pub const RED_LED_RELAY: usize = 1;
/// Yellow status LED relay (steady while the latch awaits acknowledgment).
pub const YELLOW_LED_RELAY: usize = 2;
/// Button acknowledging an estop clearance.
pub const ACK_BUTTON: usize = 0;

/// Static description of one debounced input.
#[derive(Debug, Clone, Copy)]
pub struct InputSpec {
    pub name: &'static str,
    /// Invert the electrical level before debouncing.
    pub active_low: bool,
    pub debounce: Duration,
}

#[derive(Debug)]
struct DebouncedInput {
    spec: InputSpec,
    stable: bool,
    last_reading: bool,
    last_change: Instant,
}

/// The wiring table: 12 buttons, the estop contact, six limit switches.
fn input_table() -> [InputSpec; INPUT_COUNT] {
    let mut table = [InputSpec {
        name: "",
        active_low: false,
        debounce: Duration::from_millis(20),
    }; INPUT_COUNT];

    const BUTTON_NAMES: [&str; BUTTON_COUNT] = [
        "BTN1", "BTN2", "BTN3", "BTN4", "BTN5", "BTN6", "BTN7", "BTN8", "BTN9", "BTN10", "BTN11",
        "BTN12",
    ];
    const LIMIT_NAMES: [&str; JOINT_COUNT] = ["LIM1", "LIM2", "LIM3", "LIM4", "LIM5", "LIM6"];

    for (i, name) in BUTTON_NAMES.iter().enumerate() {
        table[i].name = name;
    }
    table[ESTOP_INPUT] = InputSpec {
        name: "ESTOP",
        active_low: false,
        debounce: Duration::from_millis(5),
    };
    for (i, name) in LIMIT_NAMES.iter().enumerate() {
        table[LIMIT_INPUT_BASE + i] = InputSpec {
            name,
            active_low: false,
            debounce: Duration::from_millis(2),
        };
    }
    table
}

/// All debounced inputs plus the relay outputs.
pub struct IoBank {
    inputs: Vec<DebouncedInput>,
    in_bus: Arc<dyn InputBus>,
    out_bus: Arc<dyn OutputBus>,
    out_states: [bool; RELAY_COUNT],
}

impl IoBank {
    pub fn new(in_bus: Arc<dyn InputBus>, out_bus: Arc<dyn OutputBus>, now: Instant) -> Self {
        let inputs = input_table()
            .into_iter()
            .map(|spec| DebouncedInput {
                spec,
                stable: false,
                last_reading: false,
                last_change: now,
            })
            .collect();
        let mut bank = Self {
            inputs,
            in_bus,
            out_bus,
            out_states: [false; RELAY_COUNT],
        };
        for idx in 0..RELAY_COUNT {
            bank.out_bus.write(idx, false);
        }
        // Prime the debouncers with the boot-time levels.
        for (idx, input) in bank.inputs.iter_mut().enumerate() {
            let active = bank.in_bus.read(idx) ^ input.spec.active_low;
            input.last_reading = active;
            input.stable = active;
        }
        bank
    }

    /// Refresh the debounced state of every input.
    pub fn update(&mut self, now: Instant) {
        for (idx, input) in self.inputs.iter_mut().enumerate() {
            let raw = self.in_bus.read(idx);
            let active = raw ^ input.spec.active_low;
            if active != input.last_reading {
                input.last_reading = active;
                input.last_change = now;
            } else if now.duration_since(input.last_change) >= input.spec.debounce {
                input.stable = input.last_reading;
            }
        }
    }

    /// Debounced state of an arbitrary input index.
    pub fn input_active(&self, idx: usize) -> bool {
        self.inputs.get(idx).map(|i| i.stable).unwrap_or(false)
    }

    pub fn button_active(&self, button: usize) -> bool {
        button < BUTTON_COUNT && self.input_active(button)
    }

    pub fn estop_active(&self) -> bool {
        self.input_active(ESTOP_INPUT)
    }

    pub fn limit_active(&self, joint: usize) -> bool {
        joint < JOINT_COUNT && self.input_active(LIMIT_INPUT_BASE + joint)
    }

    /// Drive a relay output. Returns false for an invalid index.
    pub fn set_output(&mut self, idx: usize, on: bool) -> bool {
        if idx >= RELAY_COUNT {
            return false;
        }
        self.out_bus.write(idx, on);
        self.out_states[idx] = on;
        true
    }

    pub fn output(&self, idx: usize) -> bool {
        idx < RELAY_COUNT && self.out_states[idx]
    }

    /// Button states for the `inputStatus` payload.
    pub fn button_snapshot(&self) -> Vec<u8> {
        (0..BUTTON_COUNT)
            .map(|i| u8::from(self.input_active(i)))
            .collect()
    }

    /// Limit-switch states for the `inputStatus` payload.
    pub fn limit_snapshot(&self) -> Vec<u8> {
        (0..JOINT_COUNT)
            .map(|j| u8::from(self.limit_active(j)))
            .collect()
    }

    /// Relay states for the `outputStatus` payload.
    pub fn output_snapshot(&self) -> Vec<u8> {
        self.out_states.iter().map(|&s| u8::from(s)).collect()
    }
}
