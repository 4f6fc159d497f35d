//! Compile-time sizing constants shared across the workspace.

/// Number of motor-driven joints.
pub const JOINT_COUNT: usize = 6;

/// Number of operator buttons on the pendant.
pub const BUTTON_COUNT: usize = 12;

/// Debounced input index of the emergency-stop contact.
pub const ESTOP_INPUT: usize = BUTTON_COUNT;

/// Debounced input index of the first limit switch (J1).
pub const LIMIT_INPUT_BASE: usize = BUTTON_COUNT + 1;

/// Total debounced digital inputs: buttons + estop + limit switches.
pub const INPUT_COUNT: usize = BUTTON_COUNT + 1 + JOINT_COUNT;

/// Relay outputs: ready relay, tool relays, and the two status LEDs.
pub const RELAY_COUNT: usize = 9;

/// Maximum number of segments a streamed batch may carry.
pub const BATCH_MAX: usize = 500;

/// Micro-steps a batch slice is subdivided into on the firmware side.
pub const SUBDIVISIONS: u32 = 50;

/// Maximum accepted length of one serial command line.
pub const CMD_BUF_SIZE: usize = 256;

/// Capacity of the raw-line queue between the serial poller and the parser.
pub const RAW_QUEUE_MAX: usize = 400;

/// Size of the persisted key/value configuration blob [bytes].
pub const CFG_BLOB_SIZE: usize = 4284;

/// Offset of the configuration blob in nonvolatile storage.
pub const CFG_BLOB_ADDR: usize = 0;

/// Offset of the persisted joint positions (6 × f32, little-endian),
/// directly after the configuration blob.
pub const JOINT_POS_ADDR: usize = CFG_BLOB_ADDR + CFG_BLOB_SIZE;

/// Total nonvolatile storage footprint.
pub const NVS_SIZE: usize = JOINT_POS_ADDR + JOINT_COUNT * 4;

/// Default host link baud rate.
pub const DEFAULT_BAUD: u32 = 921_600;

/// Default step-engine tick rate [Hz].
pub const DEFAULT_TICK_HZ: u32 = 20_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_regions_are_disjoint() {
        assert!(JOINT_POS_ADDR >= CFG_BLOB_ADDR + CFG_BLOB_SIZE);
        assert_eq!(NVS_SIZE, JOINT_POS_ADDR + JOINT_COUNT * 4);
    }

    #[test]
    fn input_layout() {
        assert_eq!(ESTOP_INPUT, 12);
        assert_eq!(LIMIT_INPUT_BASE, 13);
        assert_eq!(INPUT_COUNT, 19);
    }
}
