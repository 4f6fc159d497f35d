//! The cooperative main loop and process wiring.
//!
//! [`Firmware`] owns every main-context component; one [`Firmware::poll`]
//! performs, in order: serial intake → command dispatch (skipped while a
//! batch executes) → safety checks → batch pacing → homing update → config
//! write-back → debounced input refresh → idle-edge position persistence.
//! The step engine itself runs in the tick thread ([`crate::tick`]).
//!
//! [`run`] is the production entry: file-backed storage, the simulation
//! pin bus, a spawned tick thread, and the host serial port.

use std::io::{ErrorKind, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use arx_common::config::FirmwareConfig;
use arx_common::consts::JOINT_COUNT;
use arx_common::joint::JOINT_DEFAULTS;
use arx_common::protocol::Ack;

use crate::batch::BatchStreamer;
use crate::comm::dispatch::{send_homed, send_input_status, DispatchCtx, Dispatcher};
use crate::comm::{LineFramer, Outbox, RawQueue};
use crate::hal::{InputBus, OutputBus, SimBus, StepDirBus};
use crate::homing::HomingController;
use crate::io::IoBank;
use crate::motion::MotionController;
use crate::safety::{SafetyArbiter, SafetyEvent};
use crate::step::StepEngine;
use crate::storage::{ConfigStore, FileNvs, Nvs, StorageError};
use crate::tick::TickRunner;

/// Fatal boot/run errors. Motion failures are never fatal; these are.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("serial port: {0}")]
    Serial(#[from] serialport::Error),
}

/// Main-context state: every component except the tick thread.
pub struct Firmware {
    engine: Arc<StepEngine>,
    store: Arc<Mutex<ConfigStore>>,
    motion: MotionController,
    homing: HomingController,
    batch: BatchStreamer,
    safety: SafetyArbiter,
    io: IoBank,
    dispatcher: Dispatcher,
    framer: LineFramer,
    queue: RawQueue,
    was_idle: bool,
}

impl Firmware {
    /// Wire up all components against the given storage and pin buses and
    /// restore the persisted joint positions.
    pub fn new(
        config: &FirmwareConfig,
        nvs: Box<dyn Nvs>,
        step_bus: Arc<dyn StepDirBus>,
        input_bus: Arc<dyn InputBus>,
        output_bus: Arc<dyn OutputBus>,
        now: Instant,
    ) -> Result<Self, RuntimeError> {
        let store = Arc::new(Mutex::new(ConfigStore::open(nvs)?));

        let mut reversed = [false; JOINT_COUNT];
        for (i, joint) in JOINT_DEFAULTS.iter().enumerate() {
            reversed[i] = joint.reversed;
        }
        let engine = Arc::new(StepEngine::new(step_bus, config.tick_hz, reversed));

        let safety = SafetyArbiter::new(now);
        let estop = safety.flag();
        let mut motion = MotionController::new(engine.clone(), store.clone(), estop.clone());
        let homing = HomingController::new(store.clone(), estop);
        let io = IoBank::new(input_bus, output_bus, now);

        // Restore the last persisted joint angles.
        let saved = store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .load_joint_positions()?;
        for (joint, deg) in saved.iter().enumerate() {
            let _ = motion.reset_position(joint, *deg);
            info!(joint = joint + 1, position = deg, "restored joint position");
        }

        Ok(Self {
            engine,
            store,
            motion,
            homing,
            batch: BatchStreamer::new(now),
            safety,
            io,
            dispatcher: Dispatcher::new(now),
            framer: LineFramer::new(),
            queue: RawQueue::new(),
            was_idle: true,
        })
    }

    /// The step engine (the tick thread and tests drive it directly).
    pub fn engine(&self) -> Arc<StepEngine> {
        self.engine.clone()
    }

    /// True once a host `Restart` was acknowledged.
    pub fn restart_requested(&self) -> bool {
        self.dispatcher.restart_requested()
    }

    fn store(&self) -> MutexGuard<'_, ConfigStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// One cooperative iteration against the host link.
    pub fn poll<L: Read + Write>(&mut self, link: &mut L, now: Instant) {
        // 1. Pull pending serial bytes into the raw-line queue.
        let mut buf = [0u8; 512];
        for _ in 0..8 {
            match link.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => self.framer.feed(&buf[..n], &mut self.queue),
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                    ) =>
                {
                    break
                }
                Err(e) => {
                    warn!(error = %e, "serial read failed");
                    break;
                }
            }
        }

        let mut tx = Outbox::new(link);

        // 2. Parse and dispatch (skipped entirely while EXECUTING).
        let estop = self.safety.flag();
        let mut ctx = DispatchCtx {
            motion: &mut self.motion,
            homing: &mut self.homing,
            batch: &mut self.batch,
            io: &mut self.io,
            store: &self.store,
            estop: &estop,
            now,
        };
        self.dispatcher.process(&mut self.queue, &mut ctx, &mut tx);

        // 3. Safety arbiter: latch edges cascade into every subsystem.
        match self.safety.poll(&mut self.io, now) {
            Some(SafetyEvent::Latched) => {
                self.engine.emergency_stop();
                self.homing.abort(&mut self.motion);
                if self.batch.estop_abort(&mut self.motion) {
                    tx.send(&Ack::ok("BatchAborted", None));
                }
                send_input_status(&self.io, true, &mut tx);
            }
            Some(SafetyEvent::Cleared) => {
                send_input_status(&self.io, false, &mut tx);
            }
            None => {}
        }

        // 4. Batch pacing.
        if self.batch.poll(now, &mut self.motion) {
            tx.send(&Ack::ok("BatchComplete", None));
        }

        // 5. Homing state machine.
        if let Some(limits) = self.homing.update(&mut self.motion, &self.io) {
            send_homed(&limits, &mut tx);
        }

        // 6. Debounced config write-back.
        self.store().update(now);

        // 7. Debounced input refresh.
        self.io.update(now);

        // 8. Persist joint positions on the moving→idle edge.
        let idle = self.engine.is_idle();
        if idle && !self.was_idle {
            let positions = self.motion.positions_snapshot();
            if let Err(e) = self.store().save_joint_positions(&positions) {
                warn!(error = %e, "joint position persistence failed");
            } else {
                debug!("joint positions persisted");
            }
        }
        self.was_idle = idle;
    }
}

/// Production entry point: storage file, simulation pin bus, tick thread,
/// and the configured serial port. Returns when a host restart is
/// requested.
pub fn run(config: &FirmwareConfig) -> Result<(), RuntimeError> {
    let nvs = FileNvs::open(&config.storage_path)?;
    let bus = Arc::new(SimBus::new());
    let now = Instant::now();
    let mut firmware = Firmware::new(
        config,
        Box::new(nvs),
        bus.clone(),
        bus.clone(),
        bus,
        now,
    )?;

    let _ticker = TickRunner::spawn(firmware.engine(), config.tick_hz);

    let mut port = serialport::new(&config.serial.device, config.serial.baud)
        .timeout(Duration::from_millis(2))
        .open()?;
    info!(
        device = %config.serial.device,
        baud = config.serial.baud,
        "host link up"
    );

    loop {
        firmware.poll(&mut port, Instant::now());
        if firmware.restart_requested() {
            info!("restart acknowledged, shutting down for supervisor relaunch");
            return Ok(());
        }
        // The batch micro period is dt/50 (≥ ~200 µs for practical dt);
        // a short sleep keeps the loop comfortably inside it.
        std::thread::sleep(Duration::from_micros(100));
    }
}
