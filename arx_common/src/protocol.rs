//! The line-delimited JSON host protocol.
//!
//! Every request is one JSON object per line with a `cmd` discriminator and
//! an optional integer correlation `id` which is echoed in the reply.
//! Control replies carry `status: "ok" | "error"` (plus a short `error`
//! tag); data replies carry a `data` payload. Asynchronous notifications
//! (`inputStatus`, `homed`, `BatchComplete`, …) use the same envelopes
//! without a correlation id.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

// ─── Requests ───────────────────────────────────────────────────────

/// Request envelope: correlation id + the tagged command payload.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    /// Correlation id echoed in any resulting reply.
    #[serde(default)]
    pub id: Option<i64>,
    /// The command itself, discriminated by the `cmd` field.
    #[serde(flatten)]
    pub command: Command,
}

/// Every command the firmware accepts. Joints are 1-based on the wire.
#[derive(Debug, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    /// Absolute point-to-point move of one joint.
    #[serde(rename = "Move", alias = "MoveTo")]
    MoveTo {
        joint: i64,
        target: f64,
        speed: f64,
        accel: f64,
    },
    /// Relative move of one joint.
    MoveBy {
        joint: i64,
        delta: f64,
        speed: f64,
        accel: f64,
    },
    /// Independent per-axis moves in one request (no time coordination).
    MoveMultiple {
        joints: Vec<i64>,
        targets: Vec<f64>,
        speeds: Vec<f64>,
        accels: Vec<f64>,
    },
    /// Continuous velocity jog; `target` is signed [deg/s].
    Jog { joint: i64, target: f64, accel: f64 },
    /// Halt (engine-wide; the joint field is informational).
    Stop {
        #[serde(default)]
        joint: Option<i64>,
    },
    /// Halt all axes.
    StopAll,
    /// Start the two-stage homing procedure on one joint.
    Home {
        joint: i64,
        #[serde(rename = "speedFast")]
        speed_fast: f64,
        #[serde(rename = "speedSlow")]
        speed_slow: f64,
    },
    /// Abort an in-flight homing job.
    AbortHoming,
    /// Query whether a homing job is active (data reply: 0/1).
    IsHoming,
    /// Open a batch of `count` velocity segments paced at `dt` seconds.
    BeginBatch { count: usize, dt: f64 },
    /// One batch segment: per-joint signed speeds and accelerations.
    M { s: Vec<f64>, a: Vec<f64> },
    /// Discard the batch currently loading or executing.
    AbortBatch,
    SetSoftLimits { joint: i64, min: f64, max: f64 },
    GetSoftLimits { joint: i64 },
    SetMaxSpeed { joint: i64, value: f64 },
    GetMaxSpeed { joint: i64 },
    SetMaxAccel { joint: i64, value: f64 },
    GetMaxAccel { joint: i64 },
    SetHomeOffset { joint: i64, value: f64 },
    GetHomeOffset { joint: i64 },
    SetPositionFactor { joint: i64, value: f64 },
    GetPositionFactor { joint: i64 },
    /// Raw key/value write to the config store (saved immediately).
    SetParam { key: String, value: f64 },
    /// Raw key/value read; `default` is returned for an absent key.
    GetParam {
        key: String,
        #[serde(default)]
        default: f64,
    },
    /// Dump every persisted parameter.
    ListParameters,
    GetInputs,
    GetOutputs,
    GetSystemStatus,
    /// One joint's status, or all joints when `joint` is absent.
    GetJointStatus {
        #[serde(default)]
        joint: Option<i64>,
    },
    /// Drive relay outputs; `outputs` are 1-based indices.
    Output { outputs: Vec<i64>, states: Vec<i64> },
    /// Persist joint positions and request a process restart.
    Restart,
}

/// Wire names of every accepted command, used to tell an unknown command
/// apart from a malformed payload.
const COMMAND_NAMES: &[&str] = &[
    "Move",
    "MoveTo",
    "MoveBy",
    "MoveMultiple",
    "Jog",
    "Stop",
    "StopAll",
    "Home",
    "AbortHoming",
    "IsHoming",
    "BeginBatch",
    "M",
    "AbortBatch",
    "SetSoftLimits",
    "GetSoftLimits",
    "SetMaxSpeed",
    "GetMaxSpeed",
    "SetMaxAccel",
    "GetMaxAccel",
    "SetHomeOffset",
    "GetHomeOffset",
    "SetPositionFactor",
    "GetPositionFactor",
    "SetParam",
    "GetParam",
    "ListParameters",
    "GetInputs",
    "GetOutputs",
    "GetSystemStatus",
    "GetJointStatus",
    "Output",
    "Restart",
];

/// Why a received line could not be dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LineError {
    /// Not JSON, no `cmd` string, or a payload type mismatch.
    #[error("malformed command line")]
    Malformed {
        /// Correlation id, when one could still be extracted.
        id: Option<i64>,
    },
    /// Well-formed JSON naming a command this firmware does not know.
    #[error("unknown command {name}")]
    Unknown { name: String, id: Option<i64> },
}

/// Parse one serial line into a command envelope.
///
/// Distinguishes an unknown `cmd` (so the reply can echo the offending
/// name) from a malformed payload.
pub fn parse_line(line: &str) -> Result<Envelope, LineError> {
    let value: Value =
        serde_json::from_str(line).map_err(|_| LineError::Malformed { id: None })?;
    let id = value.get("id").and_then(Value::as_i64);
    let cmd = value
        .get("cmd")
        .and_then(Value::as_str)
        .ok_or(LineError::Malformed { id })?;
    if !COMMAND_NAMES.contains(&cmd) {
        return Err(LineError::Unknown {
            name: cmd.to_string(),
            id,
        });
    }
    serde_json::from_value(value).map_err(|_| LineError::Malformed { id })
}

// ─── Replies ────────────────────────────────────────────────────────

/// Short error tags surfaced in `error` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorTag {
    /// Joint index outside 1..=JOINT_COUNT.
    InvalidJoint,
    /// Submission rejected: out-of-range target, busy, or estop latched.
    Rejected,
    /// Parallel arrays of unequal length.
    LengthMismatch,
    /// BeginBatch with a bad count or a non-positive dt.
    InvalidCountOrDt,
    /// More segments than the batch header announced.
    TooMany,
    /// A segment's arrays are not JOINT_COUNT long.
    BadLength,
    /// Segment or abort received outside the LOADING state.
    NotLoadingBatch,
    /// The line was not a valid command object.
    ParseFailed,
}

impl ErrorTag {
    /// Wire representation.
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorTag::InvalidJoint => "invalid joint",
            ErrorTag::Rejected => "invalid/moving/estop",
            ErrorTag::LengthMismatch => "length mismatch",
            ErrorTag::InvalidCountOrDt => "invalidCountOrDt",
            ErrorTag::TooMany => "tooMany",
            ErrorTag::BadLength => "badLength",
            ErrorTag::NotLoadingBatch => "notLoadingBatch",
            ErrorTag::ParseFailed => "parseFailed",
        }
    }
}

/// Control reply: `{cmd, status, id?, error?}`.
#[derive(Debug, Serialize)]
pub struct Ack {
    pub cmd: &'static str,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Ack {
    /// Successful acknowledgment.
    pub fn ok(cmd: &'static str, id: Option<i64>) -> Self {
        Self {
            cmd,
            status: "ok",
            id,
            error: None,
        }
    }

    /// Failed acknowledgment with a tag from the fixed error set.
    pub fn err(cmd: &'static str, id: Option<i64>, tag: ErrorTag) -> Self {
        Self {
            cmd,
            status: "error",
            id,
            error: Some(tag.as_str().to_string()),
        }
    }

    /// Failed acknowledgment with free-form detail (unknown command echo).
    pub fn err_detail(cmd: &'static str, id: Option<i64>, detail: impl Into<String>) -> Self {
        Self {
            cmd,
            status: "error",
            id,
            error: Some(detail.into()),
        }
    }
}

/// Data reply: `{cmd, data, id?}`.
#[derive(Debug, Serialize)]
pub struct DataReply<T: Serialize> {
    pub cmd: &'static str,
    pub data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
}

impl<T: Serialize> DataReply<T> {
    pub fn new(cmd: &'static str, data: T, id: Option<i64>) -> Self {
        Self { cmd, data, id }
    }
}

// ─── Data payloads ──────────────────────────────────────────────────

/// Snapshot of the debounced inputs (`inputStatus`).
#[derive(Debug, Serialize)]
pub struct InputStatus {
    pub estop: u8,
    pub buttons: Vec<u8>,
    pub limits: Vec<u8>,
}

/// Relay output snapshot (`outputStatus`).
#[derive(Debug, Serialize)]
pub struct OutputStatus {
    pub states: Vec<u8>,
}

/// Firmware liveness summary (`systemStatus`).
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub uptime_sec: u64,
    pub estop: u8,
    pub homing: u8,
}

/// Per-joint kinematic snapshot (`jointStatus` / `jointStatusAll`).
#[derive(Debug, Serialize)]
pub struct JointStatus {
    pub joint: i64,
    pub position: f64,
    pub velocity: f64,
    pub acceleration: f64,
    pub target: f64,
}

/// Result of a completed homing job (`homed`).
#[derive(Debug, Serialize)]
pub struct Homed {
    pub joint: i64,
    pub min: f64,
    pub max: f64,
}

/// Soft-limit pair (`getSoftLimits`).
#[derive(Debug, Serialize)]
pub struct SoftLimits {
    pub joint: i64,
    pub min: f64,
    pub max: f64,
}

/// Key/value pair (`getParam`).
#[derive(Debug, Serialize)]
pub struct ParamValue {
    pub key: String,
    pub value: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn move_and_alias_parse() {
        for name in ["Move", "MoveTo"] {
            let line = format!(r#"{{"cmd":"{name}","joint":1,"target":10.0,"speed":5,"accel":2,"id":7}}"#);
            let env = parse_line(&line).unwrap();
            assert_eq!(env.id, Some(7));
            match env.command {
                Command::MoveTo {
                    joint,
                    target,
                    speed,
                    accel,
                } => {
                    assert_eq!(joint, 1);
                    assert_eq!(target, 10.0);
                    assert_eq!(speed, 5.0);
                    assert_eq!(accel, 2.0);
                }
                other => panic!("unexpected command: {other:?}"),
            }
        }
    }

    #[test]
    fn segment_parses() {
        let env = parse_line(r#"{"cmd":"M","s":[0,0,0,0,0,0],"a":[1,1,1,1,1,1]}"#).unwrap();
        match env.command {
            Command::M { s, a } => {
                assert_eq!(s.len(), 6);
                assert_eq!(a.len(), 6);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn unit_commands_parse_without_payload() {
        assert!(matches!(
            parse_line(r#"{"cmd":"StopAll"}"#).unwrap().command,
            Command::StopAll
        ));
        assert!(matches!(
            parse_line(r#"{"cmd":"AbortBatch","id":3}"#).unwrap().command,
            Command::AbortBatch
        ));
    }

    #[test]
    fn joint_status_joint_is_optional() {
        assert!(matches!(
            parse_line(r#"{"cmd":"GetJointStatus"}"#).unwrap().command,
            Command::GetJointStatus { joint: None }
        ));
        assert!(matches!(
            parse_line(r#"{"cmd":"GetJointStatus","joint":2}"#).unwrap().command,
            Command::GetJointStatus { joint: Some(2) }
        ));
    }

    #[test]
    fn unknown_command_is_distinguished() {
        match parse_line(r#"{"cmd":"Teleport","id":9}"#) {
            Err(LineError::Unknown { name, id }) => {
                assert_eq!(name, "Teleport");
                assert_eq!(id, Some(9));
            }
            other => panic!("expected Unknown, got {other:?}"),
        }
    }

    #[test]
    fn malformed_lines_are_rejected() {
        assert!(matches!(
            parse_line("not json"),
            Err(LineError::Malformed { id: None })
        ));
        assert!(matches!(
            parse_line(r#"{"id":4}"#),
            Err(LineError::Malformed { id: Some(4) })
        ));
        // Known command, wrong payload type.
        assert!(matches!(
            parse_line(r#"{"cmd":"Jog","joint":"one","target":1,"accel":1}"#),
            Err(LineError::Malformed { id: None })
        ));
    }

    #[test]
    fn ack_serialization_shapes() {
        let ok = serde_json::to_value(Ack::ok("moveTo", Some(3))).unwrap();
        assert_eq!(ok["status"], "ok");
        assert_eq!(ok["id"], 3);
        assert!(ok.get("error").is_none());

        let err = serde_json::to_value(Ack::err("moveTo", None, ErrorTag::Rejected)).unwrap();
        assert_eq!(err["status"], "error");
        assert_eq!(err["error"], "invalid/moving/estop");
        assert!(err.get("id").is_none());
    }

    #[test]
    fn data_reply_shape() {
        let reply = DataReply::new("isHoming", 1u8, Some(11));
        let v = serde_json::to_value(reply).unwrap();
        assert_eq!(v["cmd"], "isHoming");
        assert_eq!(v["data"], 1);
        assert_eq!(v["id"], 11);
    }

    #[test]
    fn system_status_uses_camel_case() {
        let v = serde_json::to_value(SystemStatus {
            uptime_sec: 12,
            estop: 0,
            homing: 1,
        })
        .unwrap();
        assert_eq!(v["uptimeSec"], 12);
    }
}
