//! # ARX Arm Firmware
//!
//! Motion-control firmware for a six-axis articulated arm driven by
//! step/direction stepper drivers, commanded by a host over a
//! line-delimited JSON serial protocol.
//!
//! ## Architecture
//!
//! Two execution contexts share the machine:
//!
//! - **Tick context** — [`tick::TickRunner`] drives [`step::StepEngine`] at a
//!   fixed rate. The engine owns the authoritative step positions and the
//!   active per-axis profiles (trapezoidal position plans or slewed velocity
//!   plans) and emits step/direction pulses through a [`hal::StepDirBus`].
//! - **Main context** — a single cooperative loop ([`runtime::Firmware`])
//!   that polls the serial link, dispatches commands, runs the safety
//!   arbiter, paces batch execution, advances the homing state machine,
//!   flushes the config store, and refreshes the debounced inputs.
//!
//! Plan installation and the all-axis jog update are atomic with respect to
//! the tick (single engine lock); positions are read lock-free.

pub mod batch;
pub mod comm;
pub mod hal;
pub mod homing;
pub mod io;
pub mod motion;
pub mod runtime;
pub mod safety;
pub mod step;
pub mod storage;
pub mod tick;
