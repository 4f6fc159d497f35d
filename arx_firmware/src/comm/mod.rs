//! Serial line plumbing: byte framing, the bounded raw-line queue, and the
//! reply writer.
//!
//! The main loop feeds raw serial bytes into [`LineFramer`], which splits
//! on `\n` (ignoring `\r`) and enqueues complete lines into [`RawQueue`].
//! Parsing and dispatch happen later — and not at all while a batch is
//! executing, which is exactly why the queue exists.
//!
//! Overflow policy: when the queue is full the incoming line is dropped
//! (drop-newest), consistently.

pub mod dispatch;

use std::collections::VecDeque;
use std::io::Write;

use serde::Serialize;
use tracing::warn;

use arx_common::consts::{CMD_BUF_SIZE, RAW_QUEUE_MAX};

/// Accumulates serial bytes into newline-delimited lines.
#[derive(Debug, Default)]
pub struct LineFramer {
    buf: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed received bytes; complete lines land in `queue`.
    pub fn feed(&mut self, bytes: &[u8], queue: &mut RawQueue) {
        for &b in bytes {
            match b {
                b'\r' => {}
                b'\n' => {
                    if !self.buf.is_empty() {
                        let line = String::from_utf8_lossy(&self.buf).into_owned();
                        self.buf.clear();
                        queue.push(line);
                    }
                }
                _ => {
                    // Overlong lines lose their tail; the parse will fail
                    // and the host sees parseFailed.
                    if self.buf.len() + 1 < CMD_BUF_SIZE {
                        self.buf.push(b);
                    }
                }
            }
        }
    }
}

/// Bounded FIFO of complete, unparsed lines.
#[derive(Debug, Default)]
pub struct RawQueue {
    lines: VecDeque<String>,
    dropped: u64,
}

impl RawQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a line; a full queue drops the newcomer.
    pub fn push(&mut self, line: String) {
        if self.lines.len() < RAW_QUEUE_MAX {
            self.lines.push_back(line);
        } else {
            self.dropped += 1;
            warn!(dropped = self.dropped, "raw line queue full, dropping line");
        }
    }

    pub fn pop(&mut self) -> Option<String> {
        self.lines.pop_front()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Lines discarded by the overflow policy since boot.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Serializes replies and notifications onto the serial link, one JSON
/// object per line.
pub struct Outbox<'a> {
    writer: &'a mut dyn Write,
}

impl<'a> Outbox<'a> {
    pub fn new(writer: &'a mut dyn Write) -> Self {
        Self { writer }
    }

    /// Send one message. Transport errors are logged, never fatal.
    pub fn send<T: Serialize>(&mut self, msg: &T) {
        match serde_json::to_string(msg) {
            Ok(json) => {
                if let Err(e) = writeln!(self.writer, "{json}") {
                    warn!(error = %e, "serial write failed");
                }
            }
            Err(e) => warn!(error = %e, "reply serialization failed"),
        }
    }
}
