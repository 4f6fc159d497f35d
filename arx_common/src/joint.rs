//! Per-joint configuration: immutable mechanical constants, tunable motion
//! parameters, and the typed key set used by the persistent store.
//!
//! Mechanical constants (steps per revolution, gearbox ratio, direction
//! inversion) are fixed at build time. Tunables carry factory defaults here
//! and may be overridden by values in nonvolatile storage under keys of the
//! form `joint<N>.<param>` (N is 1-based on the wire and in storage).

use crate::consts::JOINT_COUNT;

/// Immutable mechanical constants plus tunable defaults for one joint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JointConfig {
    /// Human-readable name ("J1".."J6").
    pub name: &'static str,
    /// Full steps per motor revolution as configured on the driver.
    pub steps_per_rev: u32,
    /// Gearbox reduction ratio (motor revs per joint rev).
    pub gearbox_ratio: f64,
    /// Direction pin polarity inversion.
    pub reversed: bool,
    /// Maximum joint speed [deg/s].
    pub max_speed: f64,
    /// Maximum joint acceleration [deg/s²].
    pub max_accel: f64,
    /// Fast homing approach speed [deg/s].
    pub homing_speed: f64,
    /// Slow homing re-approach speed [deg/s].
    pub slow_homing_speed: f64,
    /// Physical coordinate of the limit switch [deg].
    pub joint_min: f64,
    /// Physical travel from the limit switch [deg].
    pub joint_max: f64,
    /// User-space zero offset from the limit switch [deg].
    pub home_offset: f64,
    /// Dimensionless correction applied to the steps-per-degree conversion.
    pub position_factor: f64,
}

impl JointConfig {
    /// Effective steps per physical degree:
    /// `(stepsPerRev · gearboxRatio / 360) / positionFactor`.
    #[inline]
    pub fn steps_per_phys_deg(&self) -> f64 {
        (self.steps_per_rev as f64 * self.gearbox_ratio / 360.0) / self.position_factor
    }
}

/// Factory defaults, one entry per joint.
///
/// These values match the shipped mechanics; any of the tunable fields can
/// be overridden through the persistent store at runtime.
pub const JOINT_DEFAULTS: [JointConfig; JOINT_COUNT] = [
    JointConfig {
        name: "J1",
        steps_per_rev: 6400,
        gearbox_ratio: 136.0 / 24.0,
        reversed: false,
        max_speed: 25.0,
        max_accel: 25.0,
        homing_speed: 8.0,
        slow_homing_speed: 3.0,
        joint_min: 0.0,
        joint_max: 180.0,
        home_offset: 37.0,
        position_factor: 3.3333,
    },
    JointConfig {
        name: "J2",
        steps_per_rev: 400,
        gearbox_ratio: 75.0 / 24.0 * 5.0 * 27.0,
        reversed: false,
        max_speed: 60.0,
        max_accel: 25.0,
        homing_speed: 5.0,
        slow_homing_speed: 2.0,
        joint_min: 0.0,
        joint_max: 170.0,
        home_offset: 10.0,
        position_factor: 0.8333,
    },
    JointConfig {
        name: "J3",
        steps_per_rev: 400,
        gearbox_ratio: 75.0 / 24.0 * 5.0 * 27.0,
        reversed: true,
        max_speed: 80.0,
        max_accel: 150.0,
        homing_speed: 10.0,
        slow_homing_speed: 2.0,
        joint_min: 0.0,
        joint_max: 250.0,
        home_offset: 29.5,
        position_factor: 0.8804,
    },
    JointConfig {
        name: "J4",
        steps_per_rev: 1600,
        gearbox_ratio: 27.0,
        reversed: true,
        max_speed: 150.0,
        max_accel: 1800.0,
        homing_speed: 20.0,
        slow_homing_speed: 3.0,
        joint_min: 0.0,
        joint_max: 350.0,
        home_offset: 213.5,
        position_factor: 1.0,
    },
    JointConfig {
        name: "J5",
        steps_per_rev: 1600,
        gearbox_ratio: 20.0,
        reversed: false,
        max_speed: 250.0,
        max_accel: 250.0,
        homing_speed: 20.0,
        slow_homing_speed: 3.0,
        joint_min: 0.0,
        joint_max: 240.0,
        home_offset: 120.0,
        position_factor: 0.8411,
    },
    JointConfig {
        name: "J6",
        steps_per_rev: 1600,
        gearbox_ratio: 10.0,
        reversed: false,
        max_speed: 360.0,
        max_accel: 5600.0,
        homing_speed: 50.0,
        slow_homing_speed: 3.0,
        joint_min: 0.0,
        joint_max: 345.0,
        home_offset: 147.0,
        position_factor: 1.0,
    },
];

// ─── Tunable keys ───────────────────────────────────────────────────

/// The tunable parameters persisted per joint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tunable {
    PositionFactor,
    MaxAccel,
    MaxSpeed,
    HomingSpeed,
    SlowHomingSpeed,
    JointMin,
    JointMax,
    HomeOffset,
}

impl Tunable {
    /// All tunables, in storage-blob order.
    pub const ALL: [Tunable; 8] = [
        Tunable::PositionFactor,
        Tunable::MaxAccel,
        Tunable::MaxSpeed,
        Tunable::HomingSpeed,
        Tunable::SlowHomingSpeed,
        Tunable::JointMin,
        Tunable::JointMax,
        Tunable::HomeOffset,
    ];

    /// Parameter name as it appears in the storage key.
    pub const fn param(&self) -> &'static str {
        match self {
            Tunable::PositionFactor => "positionFactor",
            Tunable::MaxAccel => "maxAccel",
            Tunable::MaxSpeed => "maxSpeed",
            Tunable::HomingSpeed => "homingSpeed",
            Tunable::SlowHomingSpeed => "slowHomingSpeed",
            Tunable::JointMin => "jointMin",
            Tunable::JointMax => "jointMax",
            Tunable::HomeOffset => "homeOffset",
        }
    }

    /// Storage key for this tunable on the given joint (0-based).
    pub fn key(&self, joint: usize) -> String {
        format!("joint{}.{}", joint + 1, self.param())
    }

    /// Factory default for this tunable on the given joint.
    pub fn default_for(&self, joint: usize) -> f64 {
        let cfg = &JOINT_DEFAULTS[joint];
        match self {
            Tunable::PositionFactor => cfg.position_factor,
            Tunable::MaxAccel => cfg.max_accel,
            Tunable::MaxSpeed => cfg.max_speed,
            Tunable::HomingSpeed => cfg.homing_speed,
            Tunable::SlowHomingSpeed => cfg.slow_homing_speed,
            Tunable::JointMin => cfg.joint_min,
            Tunable::JointMax => cfg.joint_max,
            Tunable::HomeOffset => cfg.home_offset,
        }
    }
}
