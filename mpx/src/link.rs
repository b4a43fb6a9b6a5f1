//! The session's read/write funnel.
//!
//! Every read from the transport lands here. While mounts are live, the
//! raw bytes are staged and scanned for VFS frames: complete frames are
//! serviced and answered immediately, everything else flows into the line
//! buffer in its original order. Writes are guarded — nothing may be
//! injected while a frame exchange is in flight.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::{Duration, Instant};

use mpx_proto::{Reply, Scan, decode_request, encode_reply, err};

use crate::error::{Error, Result};
use crate::line::{self, LineBuffer};
use crate::mount::MountHandler;
use crate::transport::Transport;

/// Marker a rebooting interpreter prints before its banner.
const SOFT_REBOOT: &[u8] = b"soft reboot";

/// Friendly prompt; its appearance after a reboot marker means the device
/// is ready to have mounts re-installed.
const FRIENDLY_PROMPT: &[u8] = b">>> ";

/// Largest poll slice while waiting without a deadline.
const POLL_SLICE: Duration = Duration::from_millis(100);

/// Bytes kept when the reboot-scan window is trimmed.
const REBOOT_WINDOW: usize = 256;

/// Byte stream + line discipline + mount demultiplexer.
pub(crate) struct Link {
    transport: Transport,
    line: LineBuffer,
    /// Raw bytes not yet classified as frame or output.
    staging: Vec<u8>,
    mounts: Vec<MountHandler>,
    /// Set while a frame reply is being produced and written.
    busy: bool,
    /// Sliding window over recent output, watching for the reboot marker.
    reboot_window: Vec<u8>,
    /// Reboot marker seen; waiting for the friendly prompt.
    saw_reboot: bool,
    /// Mounts need re-installing.
    remount_due: bool,
}

impl Link {
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            line: LineBuffer::new(),
            staging: Vec::new(),
            mounts: Vec::new(),
            busy: false,
            reboot_window: Vec::new(),
            saw_reboot: false,
            remount_due: false,
        }
    }

    pub fn transport_mut(&mut self) -> &mut Transport {
        &mut self.transport
    }

    /// Registers a live mount; the read path starts intercepting its
    /// frames immediately.
    pub fn add_mount(&mut self, handler: MountHandler) {
        self.mounts.push(handler);
    }

    /// Removes a mount by id, returning it for teardown bookkeeping.
    pub fn remove_mount(&mut self, mount_id: u8) -> Option<MountHandler> {
        let at = self.mounts.iter().position(|m| m.mount_id() == mount_id)?;
        let mut handler = self.mounts.remove(at);
        handler.close_all();
        if self.mounts.is_empty() {
            // No more frames can arrive; whatever is staged is output.
            let staged = std::mem::take(&mut self.staging);
            self.line.push(&staged);
        }
        Some(handler)
    }

    pub fn mounts(&self) -> &[MountHandler] {
        &self.mounts
    }

    pub fn mounts_mut(&mut self) -> &mut [MountHandler] {
        &mut self.mounts
    }

    pub fn has_mounts(&self) -> bool {
        !self.mounts.is_empty()
    }

    /// True once a soft reset has been observed and the device is back at
    /// its prompt; cleared by the call.
    pub fn take_remount_due(&mut self) -> bool {
        std::mem::take(&mut self.remount_due)
    }

    /// Guarded write: refuses while a frame reply is in flight.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.busy {
            return Err(Error::Busy);
        }
        self.transport.write_all(data)
    }

    /// One transport read of up to `wait`, demultiplexed. Returns `true`
    /// if any bytes were consumed from the transport.
    fn pump(&mut self, wait: Duration) -> Result<bool> {
        let data = self.transport.read_some(wait)?;
        if data.is_empty() {
            return Ok(false);
        }
        if self.mounts.is_empty() {
            self.scan_reboot(&data);
            self.line.push(&data);
            return Ok(true);
        }
        self.staging.extend_from_slice(&data);
        self.demux()?;
        Ok(true)
    }

    /// Classifies staged bytes: frames are serviced, output is forwarded.
    fn demux(&mut self) -> Result<()> {
        loop {
            match mpx_proto::scan(&self.staging) {
                Scan::Output { n } => {
                    self.emit_output(n);
                    return Ok(());
                }
                Scan::Pending { n } => {
                    self.emit_output(n);
                    return Ok(());
                }
                Scan::Frame { before, end, frame } => {
                    self.emit_output(before);
                    // After emit_output the frame starts at offset 0.
                    self.staging.drain(..end - before);
                    self.answer(frame.kind, frame.mount, &frame.payload)?;
                }
            }
        }
    }

    /// Moves `n` staged bytes into the line buffer.
    fn emit_output(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        let out: Vec<u8> = self.staging.drain(..n).collect();
        self.scan_reboot(&out);
        self.line.push(&out);
    }

    /// Services one frame and writes exactly one reply.
    fn answer(&mut self, kind: u8, mount_id: u8, payload: &[u8]) -> Result<()> {
        let frame = mpx_proto::Frame {
            kind,
            mount: mount_id,
            payload: payload.to_vec(),
        };
        let reply = match self.mounts.iter_mut().find(|m| m.mount_id() == mount_id) {
            None => {
                tracing::warn!(mount_id, "frame for unknown mount");
                Reply::Err(err::EINVAL)
            }
            Some(handler) => match decode_request(&frame) {
                Err(_) => Reply::Err(err::EINVAL),
                // The frame loop must never panic outward: the device is
                // blocked waiting and a lost reply wedges it. Any servicing
                // panic is converted into a framed I/O error.
                Ok(req) => catch_unwind(AssertUnwindSafe(|| handler.service(req)))
                    .unwrap_or(Reply::Err(err::EIO)),
            },
        };
        self.busy = true;
        let result = self
            .transport
            .write_all(&encode_reply(kind, mount_id, &reply));
        self.busy = false;
        result
    }

    /// Watches forwarded output for the soft-reboot marker followed by the
    /// friendly prompt.
    fn scan_reboot(&mut self, data: &[u8]) {
        if self.mounts.is_empty() {
            return;
        }
        self.reboot_window.extend_from_slice(data);
        if self.saw_reboot {
            if line::find(&self.reboot_window, FRIENDLY_PROMPT).is_some() {
                tracing::info!("device is back at its prompt, mounts need re-install");
                self.saw_reboot = false;
                self.remount_due = true;
                self.reboot_window.clear();
            }
        } else if line::find(&self.reboot_window, SOFT_REBOOT).is_some() {
            tracing::debug!("soft reboot observed in output stream");
            self.saw_reboot = true;
            self.reboot_window.clear();
        }
        if self.reboot_window.len() > REBOOT_WINDOW {
            let tail = self.reboot_window.len() - REBOOT_WINDOW / 4;
            self.reboot_window.drain(..tail);
        }
    }

    /// Reads until `pattern` appears; the pattern is consumed.
    pub fn read_until(&mut self, pattern: &[u8], deadline: Option<Instant>) -> Result<Vec<u8>> {
        let start = Instant::now();
        loop {
            if let Some(before) = self.line.take_until(pattern) {
                return Ok(before);
            }
            let wait = match remaining(deadline) {
                Some(left) if left.is_zero() => {
                    return Err(Error::Timeout {
                        expected: String::from_utf8_lossy(pattern).into_owned(),
                        waited: start.elapsed(),
                        pending: self.line.pending().to_vec(),
                    });
                }
                Some(left) => left.min(POLL_SLICE),
                None => POLL_SLICE,
            };
            self.pump(wait)?;
        }
    }

    /// Reads exactly `n` bytes.
    pub fn read_exact(&mut self, n: usize, deadline: Option<Instant>) -> Result<Vec<u8>> {
        let start = Instant::now();
        loop {
            if let Some(bytes) = self.line.take_exact(n) {
                return Ok(bytes);
            }
            let wait = match remaining(deadline) {
                Some(left) if left.is_zero() => {
                    return Err(Error::Timeout {
                        expected: format!("{n} bytes"),
                        waited: start.elapsed(),
                        pending: self.line.pending().to_vec(),
                    });
                }
                Some(left) => left.min(POLL_SLICE),
                None => POLL_SLICE,
            };
            self.pump(wait)?;
        }
    }

    /// Returns whatever output is available right now.
    pub fn read_available(&mut self, wait: Duration) -> Result<Vec<u8>> {
        self.pump(wait)?;
        Ok(self.line.take_all())
    }

    /// Reads and discards output for `duration`.
    pub fn drain(&mut self, duration: Duration) -> Result<usize> {
        let deadline = Instant::now() + duration;
        let mut discarded = self.line.take_all().len();
        while let Some(left) = remaining(Some(deadline)) {
            if left.is_zero() {
                break;
            }
            self.pump(left.min(POLL_SLICE))?;
            discarded += self.line.take_all().len();
        }
        Ok(discarded)
    }
}

/// Time left until `deadline`; `None` means wait forever.
fn remaining(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|d| d.saturating_duration_since(Instant::now()))
}
