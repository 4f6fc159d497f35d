//! Command dispatch: parsed lines in, state-machine calls and replies out.
//!
//! Dispatch is state-gated by the batch streamer: while LOADING only
//! segments and aborts are accepted; while EXECUTING no parsing happens at
//! all (lines stay queued). Every reply echoes the request's correlation
//! id when one was present.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::Serialize;
use tracing::{error, info};

use arx_common::consts::JOINT_COUNT;
use arx_common::protocol::{
    parse_line, Ack, Command, DataReply, ErrorTag, Envelope, Homed, InputStatus, JointStatus,
    LineError, OutputStatus, ParamValue, SoftLimits, SystemStatus,
};

use crate::batch::{BatchError, BatchState, BatchStreamer, LoadOutcome};
use crate::homing::{HomedLimits, HomingController, HomingError};
use crate::io::IoBank;
use crate::motion::{MotionController, MotionError};
use crate::safety::EstopFlag;
use crate::storage::ConfigStore;

use super::{Outbox, RawQueue};

/// Everything a command handler may touch, borrowed for one dispatch pass.
pub struct DispatchCtx<'a> {
    pub motion: &'a mut MotionController,
    pub homing: &'a mut HomingController,
    pub batch: &'a mut BatchStreamer,
    pub io: &'a mut IoBank,
    pub store: &'a Arc<Mutex<ConfigStore>>,
    pub estop: &'a EstopFlag,
    pub now: Instant,
}

impl DispatchCtx<'_> {
    fn store(&self) -> MutexGuard<'_, ConfigStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Send the asynchronous `inputStatus` notification (estop edges).
pub fn send_input_status(io: &IoBank, estopped: bool, tx: &mut Outbox<'_>) {
    tx.send(&DataReply::new(
        "inputStatus",
        InputStatus {
            estop: u8::from(estopped),
            buttons: io.button_snapshot(),
            limits: io.limit_snapshot(),
        },
        None,
    ));
}

/// Send the asynchronous `homed` notification.
pub fn send_homed(limits: &HomedLimits, tx: &mut Outbox<'_>) {
    tx.send(&DataReply::new(
        "homed",
        Homed {
            joint: limits.joint as i64 + 1,
            min: limits.min,
            max: limits.max,
        },
        None,
    ));
}

/// 1-based wire joint to 0-based index.
fn joint_index(joint: i64) -> Option<usize> {
    if (1..=JOINT_COUNT as i64).contains(&joint) {
        Some((joint - 1) as usize)
    } else {
        None
    }
}

fn motion_tag(err: MotionError) -> ErrorTag {
    match err {
        MotionError::InvalidJoint => ErrorTag::InvalidJoint,
        _ => ErrorTag::Rejected,
    }
}

/// Mark the motion cache dirty when a raw parameter write names a joint.
fn mark_dirty_for_key(motion: &mut MotionController, key: &str) {
    if let Some(rest) = key.strip_prefix("joint") {
        if let Some((num, _)) = rest.split_once('.') {
            if let Ok(n) = num.parse::<usize>() {
                if n >= 1 {
                    motion.mark_dirty(n - 1);
                }
            }
        }
    }
}

/// The motion command surface plus the status/parameter commands.
pub struct Dispatcher {
    started: Instant,
    restart_requested: bool,
}

impl Dispatcher {
    pub fn new(now: Instant) -> Self {
        Self {
            started: now,
            restart_requested: false,
        }
    }

    /// Set once a `Restart` has been acknowledged; the runtime persists
    /// state and exits so the supervisor can relaunch the process.
    pub fn restart_requested(&self) -> bool {
        self.restart_requested
    }

    /// Drain queued lines until empty or a batch starts executing.
    pub fn process(&mut self, queue: &mut RawQueue, ctx: &mut DispatchCtx<'_>, tx: &mut Outbox<'_>) {
        while ctx.batch.state() != BatchState::Executing {
            let Some(line) = queue.pop() else { return };
            self.dispatch_line(&line, ctx, tx);
        }
    }

    fn dispatch_line(&mut self, line: &str, ctx: &mut DispatchCtx<'_>, tx: &mut Outbox<'_>) {
        let envelope = match parse_line(line) {
            Ok(envelope) => envelope,
            Err(LineError::Malformed { id }) => {
                tx.send(&Ack::err("error", id, ErrorTag::ParseFailed));
                return;
            }
            Err(LineError::Unknown { name, id }) => {
                tx.send(&Ack::err_detail("unknownCmd", id, name));
                return;
            }
        };

        if ctx.batch.state() == BatchState::Loading {
            self.dispatch_loading(envelope, ctx, tx);
        } else {
            self.dispatch_idle(envelope, ctx, tx);
        }
    }

    /// While LOADING only segments and the abort are meaningful.
    fn dispatch_loading(&mut self, envelope: Envelope, ctx: &mut DispatchCtx<'_>, tx: &mut Outbox<'_>) {
        let id = envelope.id;
        match envelope.command {
            Command::M { s, a } => match ctx.batch.load(&s, &a, ctx.now) {
                Ok(LoadOutcome::Loaded) => tx.send(&Ack::ok("SegmentLoaded", id)),
                Ok(LoadOutcome::ExecStarted) => {
                    tx.send(&Ack::ok("SegmentLoaded", id));
                    tx.send(&Ack::ok("BatchExecStart", None));
                }
                Err(BatchError::TooMany) => tx.send(&Ack::err("SegmentError", id, ErrorTag::TooMany)),
                Err(BatchError::BadLength) => {
                    tx.send(&Ack::err("SegmentError", id, ErrorTag::BadLength))
                }
                Err(_) => tx.send(&Ack::err("SegmentError", id, ErrorTag::Rejected)),
            },
            Command::AbortBatch => {
                ctx.batch.abort(ctx.motion);
                tx.send(&Ack::ok("BatchAborted", id));
            }
            _ => tx.send(&Ack::err("error", id, ErrorTag::NotLoadingBatch)),
        }
    }

    fn dispatch_idle(&mut self, envelope: Envelope, ctx: &mut DispatchCtx<'_>, tx: &mut Outbox<'_>) {
        let id = envelope.id;
        match envelope.command {
            Command::MoveTo {
                joint,
                target,
                speed,
                accel,
            } => Self::reply_move(ctx, tx, "moveTo", id, joint, target, speed, accel),

            Command::MoveBy {
                joint,
                delta,
                speed,
                accel,
            } => {
                let Some(j) = joint_index(joint) else {
                    tx.send(&Ack::err("moveBy", id, ErrorTag::InvalidJoint));
                    return;
                };
                match ctx.motion.position(j) {
                    Ok(current) => {
                        Self::reply_move(ctx, tx, "moveBy", id, joint, current + delta, speed, accel)
                    }
                    Err(e) => tx.send(&Ack::err("moveBy", id, motion_tag(e))),
                }
            }

            Command::MoveMultiple {
                joints,
                targets,
                speeds,
                accels,
            } => {
                if joints.len() != targets.len()
                    || joints.len() != speeds.len()
                    || joints.len() != accels.len()
                {
                    tx.send(&Ack::err("moveMultiple", id, ErrorTag::LengthMismatch));
                    return;
                }
                let mut all_ok = true;
                for i in 0..joints.len() {
                    match joint_index(joints[i]) {
                        Some(j) => {
                            all_ok &= ctx
                                .motion
                                .move_to(j, targets[i], speeds[i], accels[i], false)
                                .is_ok();
                        }
                        None => all_ok = false,
                    }
                }
                if all_ok {
                    tx.send(&Ack::ok("moveMultiple", id));
                } else {
                    tx.send(&Ack::err("moveMultiple", id, ErrorTag::Rejected));
                }
            }

            Command::Jog { joint, target, accel } => match joint_index(joint) {
                Some(j) => match ctx.motion.jog(j, target, accel) {
                    Ok(()) => tx.send(&Ack::ok("jog", id)),
                    Err(e) => tx.send(&Ack::err("jog", id, motion_tag(e))),
                },
                None => tx.send(&Ack::err("jog", id, ErrorTag::InvalidJoint)),
            },

            Command::Stop { .. } => {
                ctx.motion.stop_all();
                tx.send(&Ack::ok("stop", id));
            }
            Command::StopAll => {
                ctx.motion.stop_all();
                tx.send(&Ack::ok("stopAll", id));
            }

            Command::Home {
                joint,
                speed_fast,
                speed_slow,
            } => match joint_index(joint) {
                Some(j) => match ctx.homing.start(j, speed_fast, speed_slow, ctx.motion) {
                    Ok(()) => tx.send(&Ack::ok("home", id)),
                    Err(HomingError::InvalidJoint) => {
                        tx.send(&Ack::err("home", id, ErrorTag::InvalidJoint))
                    }
                    Err(_) => tx.send(&Ack::err("home", id, ErrorTag::Rejected)),
                },
                None => tx.send(&Ack::err("home", id, ErrorTag::InvalidJoint)),
            },
            Command::AbortHoming => {
                ctx.homing.abort(ctx.motion);
                tx.send(&Ack::ok("abortHoming", id));
            }
            Command::IsHoming => {
                tx.send(&DataReply::new("isHoming", u8::from(ctx.homing.is_homing()), id));
            }

            Command::BeginBatch { count, dt } => match ctx.batch.begin(count, dt, ctx.motion) {
                Ok(()) => tx.send(&Ack::ok("BeginBatch", id)),
                Err(BatchError::InvalidCountOrDt) => {
                    tx.send(&Ack::err("BeginBatch", id, ErrorTag::InvalidCountOrDt))
                }
                Err(_) => tx.send(&Ack::err("BeginBatch", id, ErrorTag::Rejected)),
            },
            // Aborting with nothing in flight is an idempotent success.
            Command::AbortBatch => {
                ctx.batch.abort(ctx.motion);
                tx.send(&Ack::ok("BatchAborted", id));
            }
            Command::M { .. } => tx.send(&Ack::err("error", id, ErrorTag::NotLoadingBatch)),

            Command::SetSoftLimits { joint, min, max } => {
                Self::reply_set(tx, "setSoftLimits", id, joint, |j| {
                    ctx.motion.set_soft_limits(j, min, max)
                })
            }
            Command::GetSoftLimits { joint } => match joint_index(joint) {
                Some(j) => match ctx.motion.soft_limits(j) {
                    Ok((min, max)) => tx.send(&DataReply::new(
                        "getSoftLimits",
                        SoftLimits { joint, min, max },
                        id,
                    )),
                    Err(e) => tx.send(&Ack::err("getSoftLimits", id, motion_tag(e))),
                },
                None => tx.send(&Ack::err("getSoftLimits", id, ErrorTag::InvalidJoint)),
            },

            Command::SetMaxSpeed { joint, value } => {
                Self::reply_set(tx, "setMaxSpeed", id, joint, |j| ctx.motion.set_max_speed(j, value))
            }
            Command::GetMaxSpeed { joint } => {
                Self::reply_get(tx, "getMaxSpeed", id, joint, |j| ctx.motion.max_speed(j))
            }
            Command::SetMaxAccel { joint, value } => {
                Self::reply_set(tx, "setMaxAccel", id, joint, |j| ctx.motion.set_max_accel(j, value))
            }
            Command::GetMaxAccel { joint } => {
                Self::reply_get(tx, "getMaxAccel", id, joint, |j| ctx.motion.max_accel(j))
            }
            Command::SetHomeOffset { joint, value } => {
                Self::reply_set(tx, "setHomeOffset", id, joint, |j| {
                    ctx.motion.set_home_offset(j, value)
                })
            }
            Command::GetHomeOffset { joint } => {
                Self::reply_get(tx, "getHomeOffset", id, joint, |j| ctx.motion.home_offset(j))
            }
            Command::SetPositionFactor { joint, value } => {
                Self::reply_set(tx, "setPositionFactor", id, joint, |j| {
                    ctx.motion.set_position_factor(j, value)
                })
            }
            Command::GetPositionFactor { joint } => {
                Self::reply_get(tx, "getPositionFactor", id, joint, |j| {
                    ctx.motion.position_factor(j)
                })
            }

            Command::SetParam { key, value } => {
                {
                    let mut store = ctx.store();
                    store.set(&key, value);
                    if let Err(e) = store.save() {
                        error!(error = %e, "parameter save failed");
                    }
                }
                mark_dirty_for_key(ctx.motion, &key);
                tx.send(&Ack::ok("setParam", id));
            }
            Command::GetParam { key, default } => {
                let value = ctx.store().get(&key, default);
                tx.send(&DataReply::new("getParam", ParamValue { key, value }, id));
            }
            Command::ListParameters => {
                #[derive(Serialize)]
                struct Params {
                    params: BTreeMap<String, f64>,
                }
                let params = ctx.store().snapshot().clone();
                tx.send(&DataReply::new("parameters", Params { params }, id));
            }

            Command::GetInputs => {
                tx.send(&DataReply::new(
                    "inputStatus",
                    InputStatus {
                        estop: u8::from(ctx.estop.is_set()),
                        buttons: ctx.io.button_snapshot(),
                        limits: ctx.io.limit_snapshot(),
                    },
                    id,
                ));
            }
            Command::GetOutputs => {
                tx.send(&DataReply::new(
                    "outputStatus",
                    OutputStatus {
                        states: ctx.io.output_snapshot(),
                    },
                    id,
                ));
            }
            Command::GetSystemStatus => {
                tx.send(&DataReply::new(
                    "systemStatus",
                    SystemStatus {
                        uptime_sec: ctx.now.duration_since(self.started).as_secs(),
                        estop: u8::from(ctx.estop.is_set()),
                        homing: u8::from(ctx.homing.is_homing()),
                    },
                    id,
                ));
            }
            Command::GetJointStatus { joint } => match joint {
                None => {
                    let all: Vec<JointStatus> = (0..JOINT_COUNT)
                        .map(|j| Self::joint_status(ctx.motion, j))
                        .collect();
                    tx.send(&DataReply::new("jointStatusAll", all, id));
                }
                Some(joint) => match joint_index(joint) {
                    Some(j) => {
                        tx.send(&DataReply::new(
                            "jointStatus",
                            Self::joint_status(ctx.motion, j),
                            id,
                        ));
                    }
                    None => tx.send(&Ack::err("jointStatus", id, ErrorTag::InvalidJoint)),
                },
            },

            Command::Output { outputs, states } => {
                if outputs.len() != states.len() {
                    tx.send(&Ack::err("output", id, ErrorTag::LengthMismatch));
                    return;
                }
                for (out, state) in outputs.iter().zip(states.iter()) {
                    if *out >= 1 {
                        ctx.io.set_output((*out - 1) as usize, *state != 0);
                    }
                }
                tx.send(&Ack::ok("output", id));
            }

            Command::Restart => {
                info!("restart requested, persisting joint positions");
                ctx.homing.abort(ctx.motion);
                ctx.motion.stop_all();
                let positions = ctx.motion.positions_snapshot();
                {
                    let mut store = ctx.store();
                    if let Err(e) = store.save_joint_positions(&positions) {
                        error!(error = %e, "position persistence failed");
                    }
                    if let Err(e) = store.save() {
                        error!(error = %e, "config persistence failed");
                    }
                }
                tx.send(&Ack::ok("Restart", id));
                self.restart_requested = true;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn reply_move(
        ctx: &mut DispatchCtx<'_>,
        tx: &mut Outbox<'_>,
        reply: &'static str,
        id: Option<i64>,
        joint: i64,
        target: f64,
        speed: f64,
        accel: f64,
    ) {
        match joint_index(joint) {
            Some(j) => match ctx.motion.move_to(j, target, speed, accel, false) {
                Ok(()) => tx.send(&Ack::ok(reply, id)),
                Err(e) => tx.send(&Ack::err(reply, id, motion_tag(e))),
            },
            None => tx.send(&Ack::err(reply, id, ErrorTag::InvalidJoint)),
        }
    }

    fn reply_set(
        tx: &mut Outbox<'_>,
        reply: &'static str,
        id: Option<i64>,
        joint: i64,
        op: impl FnOnce(usize) -> Result<(), MotionError>,
    ) {
        match joint_index(joint) {
            Some(j) => match op(j) {
                Ok(()) => tx.send(&Ack::ok(reply, id)),
                Err(e) => tx.send(&Ack::err(reply, id, motion_tag(e))),
            },
            None => tx.send(&Ack::err(reply, id, ErrorTag::InvalidJoint)),
        }
    }

    fn reply_get(
        tx: &mut Outbox<'_>,
        reply: &'static str,
        id: Option<i64>,
        joint: i64,
        op: impl FnOnce(usize) -> Result<f64, MotionError>,
    ) {
        match joint_index(joint) {
            Some(j) => match op(j) {
                Ok(value) => tx.send(&DataReply::new(reply, value, id)),
                Err(e) => tx.send(&Ack::err(reply, id, motion_tag(e))),
            },
            None => tx.send(&Ack::err(reply, id, ErrorTag::InvalidJoint)),
        }
    }

    fn joint_status(motion: &mut MotionController, j: usize) -> JointStatus {
        JointStatus {
            joint: j as i64 + 1,
            position: motion.position(j).unwrap_or(0.0),
            velocity: motion.speed(j).unwrap_or(0.0),
            acceleration: motion.accel(j).unwrap_or(0.0),
            target: motion.target(j).unwrap_or(0.0),
        }
    }
}
