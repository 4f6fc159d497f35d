//! Safety arbiter: the single authoritative emergency-stop latch.
//!
//! The estop contact is observed through the debounced input layer. On
//! assertion the latch sets and [`SafetyEvent::Latched`] is returned; the
//! runtime then halts the engine, aborts homing, and kills any batch. The
//! latch only clears once the contact is released AND the operator presses
//! the acknowledge button, producing [`SafetyEvent::Cleared`].
//!
//! While latched, every move/jog/home/batch submission fails — the shared
//! [`EstopFlag`] is checked at each submission site. The engine keeps
//! ticking; it simply has no plans left to execute.
//!
//! LED policy: estop held → red blinking; released but still latched →
//! yellow steady; cleared → both off. The ready relay mirrors the latch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::io::{IoBank, ACK_BUTTON, READY_RELAY, RED_LED_RELAY, YELLOW_LED_RELAY};

/// Red LED blink half-period while the estop is held.
const BLINK_INTERVAL: Duration = Duration::from_millis(250);

/// Shared, lock-free view of the estop latch.
///
/// Submission paths clone this; the arbiter is the only writer.
#[derive(Debug, Clone, Default)]
pub struct EstopFlag(Arc<AtomicBool>);

impl EstopFlag {
    /// True while the latch is set.
    #[inline]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Write the latch. Only the safety arbiter (and tests) call this.
    #[inline]
    pub fn set(&self, value: bool) {
        self.0.store(value, Ordering::Relaxed);
    }
}

/// Edge produced by one safety poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyEvent {
    /// Estop asserted: the runtime must halt the engine, abort homing,
    /// kill any batch, and notify the host.
    Latched,
    /// Operator acknowledged a released estop: submissions are allowed
    /// again; the runtime notifies the host.
    Cleared,
}

/// The latch plus its LED and re-arm bookkeeping.
pub struct SafetyArbiter {
    estop: EstopFlag,
    /// Guards against re-triggering until an explicit re-arm.
    armed: bool,
    blink_on: bool,
    last_blink: Instant,
}

impl SafetyArbiter {
    pub fn new(now: Instant) -> Self {
        Self {
            estop: EstopFlag::default(),
            armed: true,
            blink_on: false,
            last_blink: now,
        }
    }

    /// A cloneable handle for submission-site checks.
    pub fn flag(&self) -> EstopFlag {
        self.estop.clone()
    }

    #[inline]
    pub fn is_estopped(&self) -> bool {
        self.estop.is_set()
    }

    /// Evaluate the estop input and drive the indicator outputs.
    ///
    /// Returns the latch edge, if any; the caller performs the heavyweight
    /// side effects (engine halt, homing/batch abort, host notification).
    pub fn poll(&mut self, io: &mut IoBank, now: Instant) -> Option<SafetyEvent> {
        let pressed = io.estop_active();
        let mut event = None;

        if pressed && self.armed && !self.estop.is_set() {
            self.estop.set(true);
            self.armed = false;
            self.blink_on = true;
            self.last_blink = now;
            io.set_output(RED_LED_RELAY, true);
            warn!("emergency stop asserted");
            event = Some(SafetyEvent::Latched);
        } else if self.estop.is_set() {
            if pressed {
                // Held: blink red, keep yellow dark.
                if now.duration_since(self.last_blink) >= BLINK_INTERVAL {
                    self.last_blink = now;
                    self.blink_on = !self.blink_on;
                    io.set_output(RED_LED_RELAY, self.blink_on);
                }
                io.set_output(YELLOW_LED_RELAY, false);
            } else {
                // Released but not acknowledged: steady yellow.
                io.set_output(RED_LED_RELAY, false);
                io.set_output(YELLOW_LED_RELAY, true);

                if io.button_active(ACK_BUTTON) {
                    self.estop.set(false);
                    self.armed = true;
                    io.set_output(RED_LED_RELAY, false);
                    io.set_output(YELLOW_LED_RELAY, false);
                    info!("emergency stop cleared and re-armed");
                    event = Some(SafetyEvent::Cleared);
                }
            }
        }

        io.set_output(READY_RELAY, !self.estop.is_set());
        event
    }
}
