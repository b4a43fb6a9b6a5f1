//! The interactive REPL protocol engine.
//!
//! Drives the device between friendly and raw REPL, injects code units,
//! and captures their output. Large payloads go through raw-paste mode
//! when the device advertises it; the capability is probed once and
//! cached for the session.

use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::link::Link;

pub(crate) const CTRL_A: u8 = 0x01;
pub(crate) const CTRL_B: u8 = 0x02;
pub(crate) const CTRL_C: u8 = 0x03;
pub(crate) const CTRL_D: u8 = 0x04;

/// Friendly-mode prompt.
const FRIENDLY_PROMPT: &[u8] = b">>> ";
/// Banner printed on entering raw mode.
const RAW_BANNER: &[u8] = b"raw REPL; CTRL-B to exit\r\n>";
/// Probe sequence asking for flow-controlled paste mode.
const RAW_PASTE_PROBE: &[u8] = b"\x05A\x01";

/// Re-entry attempts before a desync is escalated.
const RAW_RETRIES: usize = 3;

const PROMPT_TIMEOUT: Duration = Duration::from_secs(1);
const BANNER_TIMEOUT: Duration = Duration::from_secs(2);
const RESET_TIMEOUT: Duration = Duration::from_secs(5);
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the engine believes the device's REPL is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplState {
    /// Nothing known yet (fresh session, or after machine reset).
    Unknown,
    /// At the `>>> ` prompt; echoes input, runs boot scripts on reset.
    Friendly,
    /// In raw mode, idle at the `>` prompt.
    Raw,
    /// Mid raw-paste transfer.
    RawPaste,
    /// Transport has been closed.
    Closed,
}

pub(crate) struct Repl {
    link: Link,
    state: ReplState,
    /// `None` until probed; then the advertised window, or `None` inside
    /// when the device answered `R\x00`.
    raw_paste: Option<Option<u16>>,
}

impl Repl {
    pub fn new(link: Link) -> Self {
        Self {
            link,
            state: ReplState::Unknown,
            raw_paste: None,
        }
    }

    pub fn link(&mut self) -> &mut Link {
        &mut self.link
    }

    pub fn link_ref(&self) -> &Link {
        &self.link
    }

    pub fn state(&self) -> ReplState {
        self.state
    }

    pub fn set_closed(&mut self) {
        self.state = ReplState::Closed;
    }

    /// Cached raw-paste window, if the capability has been probed.
    pub fn raw_paste_window(&self) -> Option<Option<u16>> {
        self.raw_paste
    }

    /// Brings the device to the raw prompt, wherever it was.
    pub fn enter_raw(&mut self) -> Result<()> {
        if self.state == ReplState::Raw {
            return Ok(());
        }
        tracing::debug!(state = ?self.state, "entering raw REPL");
        // Interrupt anything running, then make sure we are at a friendly
        // prompt so Ctrl-A lands on the outer REPL.
        self.link.write(&[CTRL_C])?;
        self.link.drain(Duration::from_millis(150))?;
        self.link.write(&[CTRL_B])?;
        match self.link.read_until(FRIENDLY_PROMPT, after(PROMPT_TIMEOUT)) {
            Ok(_) | Err(Error::Timeout { .. }) => {}
            Err(e) => return Err(e),
        }

        let mut last_pending = Vec::new();
        for attempt in 0..RAW_RETRIES {
            self.link.write(&[CTRL_A])?;
            match self.link.read_until(RAW_BANNER, after(BANNER_TIMEOUT)) {
                Ok(_) => {
                    self.state = ReplState::Raw;
                    return Ok(());
                }
                Err(Error::Timeout { pending, .. }) => {
                    tracing::warn!(attempt, "raw banner did not appear, resyncing");
                    last_pending = pending;
                    self.link.write(&[CTRL_C, CTRL_C])?;
                    self.link.drain(Duration::from_millis(200))?;
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::Desync {
            expected: "raw REPL banner",
            got: truncated(last_pending),
        })
    }

    /// Returns to the friendly prompt.
    pub fn exit_raw(&mut self) -> Result<()> {
        if self.state == ReplState::Friendly {
            return Ok(());
        }
        tracing::debug!("exiting raw REPL");
        self.link.write(&[CTRL_B])?;
        self.link.read_until(FRIENDLY_PROMPT, after(BANNER_TIMEOUT))?;
        self.state = ReplState::Friendly;
        Ok(())
    }

    /// Executes one code unit and returns its stdout.
    ///
    /// A zero `timeout` means submit-only: the code is sent, the compile
    /// acknowledgement consumed, and no output is collected.
    pub fn exec(&mut self, code: &str, timeout: Duration) -> Result<Vec<u8>> {
        self.enter_raw()?;
        tracing::debug!(unit = first_line(code), "exec");

        if timeout.is_zero() {
            self.link.write(code.as_bytes())?;
            self.link.write(&[CTRL_D])?;
            self.link.read_until(b"OK", after(SUBMIT_TIMEOUT))?;
            return Ok(Vec::new());
        }

        let deadline = Instant::now() + timeout;
        let pasted = match self.raw_paste {
            Some(None) => false,
            _ => self.try_raw_paste(code.as_bytes(), deadline)?,
        };
        if !pasted {
            self.link.write(code.as_bytes())?;
            self.link.write(&[CTRL_D])?;
            self.link.read_until(b"OK", Some(deadline))?;
        }
        self.collect(code, deadline)
    }

    /// Strict raw-paste execute: fails with a capability error instead of
    /// downgrading when the device lacks paste mode.
    pub fn exec_raw_paste(&mut self, code: &str, timeout: Duration) -> Result<Vec<u8>> {
        self.enter_raw()?;
        if self.raw_paste == Some(None) {
            return Err(Error::CapabilityUnavailable("raw-paste mode"));
        }
        let deadline = Instant::now() + timeout;
        if self.try_raw_paste(code.as_bytes(), deadline)? {
            self.collect(code, deadline)
        } else {
            Err(Error::CapabilityUnavailable("raw-paste mode"))
        }
    }

    /// Reads stdout and stderr framing after a code unit was submitted.
    fn collect(&mut self, code: &str, deadline: Instant) -> Result<Vec<u8>> {
        let stdout = self.link.read_until(&[CTRL_D], Some(deadline))?;
        let stderr = self.link.read_until(b"\x04>", Some(deadline))?;
        if stderr.is_empty() {
            Ok(stdout)
        } else {
            Err(Error::Cmd {
                cmd: code.to_owned(),
                stdout,
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            })
        }
    }

    /// Attempts the raw-paste handshake and, on success, streams `code`
    /// under window flow control. Returns `false` after caching a
    /// downgrade when the device answers `R\x00`.
    fn try_raw_paste(&mut self, code: &[u8], deadline: Instant) -> Result<bool> {
        self.link.write(RAW_PASTE_PROBE)?;
        let resp = self.link.read_exact(2, after(BANNER_TIMEOUT))?;
        if resp == b"R\x00" {
            tracing::debug!("device declines raw-paste; caching fallback");
            self.raw_paste = Some(None);
            return Ok(false);
        }
        if resp != b"R\x01" {
            return Err(Error::Desync {
                expected: "raw-paste acknowledgement",
                got: resp,
            });
        }
        let wb = self.link.read_exact(2, after(PROMPT_TIMEOUT))?;
        let window = usize::from(u16::from_le_bytes([wb[0], wb[1]]));
        let first = self.link.read_exact(1, after(PROMPT_TIMEOUT))?;
        if first != [0x01] {
            return Err(Error::Desync {
                expected: "raw-paste initial credit",
                got: first,
            });
        }
        self.raw_paste = Some(Some(u16::from_le_bytes([wb[0], wb[1]])));
        self.state = ReplState::RawPaste;
        tracing::debug!(window, bytes = code.len(), "raw-paste transfer");

        let mut budget = window;
        let mut sent = 0;
        while sent < code.len() {
            if budget == 0 {
                budget = self.wait_credit(window, deadline)?;
            }
            let n = budget.min(code.len() - sent);
            self.link.write(&code[sent..sent + n])?;
            sent += n;
            budget -= n;
        }
        if budget == 0 {
            // The payload filled the window exactly: the device must drain
            // it and grant one more credit before end-of-data.
            self.wait_credit(window, deadline)?;
        }
        self.link.write(&[CTRL_D])?;
        self.state = ReplState::Raw;
        Ok(true)
    }

    /// Waits for one flow-control byte.
    fn wait_credit(&mut self, window: usize, deadline: Instant) -> Result<usize> {
        let byte = self.link.read_exact(1, Some(deadline))?;
        match byte[0] {
            0x01 => Ok(window),
            0x03 => {
                self.state = ReplState::Raw;
                Err(Error::Desync {
                    expected: "raw-paste credit",
                    got: byte,
                })
            }
            _ => Err(Error::Desync {
                expected: "raw-paste credit",
                got: byte,
            }),
        }
    }

    /// Interrupts whatever is running and drains back to the friendly
    /// prompt. Safe in any state.
    pub fn stop(&mut self) -> Result<()> {
        tracing::debug!("stop current operation");
        self.link.write(&[CTRL_C, CTRL_C])?;
        match self.link.read_until(FRIENDLY_PROMPT, after(PROMPT_TIMEOUT)) {
            Ok(_) => {
                self.state = ReplState::Friendly;
                Ok(())
            }
            Err(Error::Timeout { .. }) => {
                // No friendly prompt: the device is likely sitting in raw
                // mode. Leave it.
                self.link.write(&[CTRL_B])?;
                self.link.read_until(FRIENDLY_PROMPT, after(BANNER_TIMEOUT))?;
                self.state = ReplState::Friendly;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Soft reset from friendly mode: restarts the interpreter and runs
    /// boot scripts, then waits for the next prompt.
    pub fn soft_reset(&mut self) -> Result<()> {
        match self.state {
            ReplState::Friendly => {}
            ReplState::Raw | ReplState::RawPaste => self.exit_raw()?,
            ReplState::Unknown => self.stop()?,
            ReplState::Closed => {
                return Err(Error::Transport(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "session is closed",
                )));
            }
        }
        tracing::info!("soft reset (boot scripts run)");
        self.link.write(&[CTRL_D])?;
        self.link.read_until(FRIENDLY_PROMPT, after(RESET_TIMEOUT))?;
        self.state = ReplState::Friendly;
        Ok(())
    }

    /// Soft reset inside raw mode: clears interpreter RAM without running
    /// boot scripts; the engine stays in raw mode.
    pub fn soft_reset_raw(&mut self) -> Result<()> {
        self.enter_raw()?;
        tracing::info!("soft reset (raw, no boot scripts)");
        self.link.write(&[CTRL_D])?;
        self.link.read_until(RAW_BANNER, after(RESET_TIMEOUT))?;
        self.state = ReplState::Raw;
        Ok(())
    }

    /// Reboots the chip via `machine.reset()` and re-attaches.
    pub fn machine_reset(&mut self, reconnect_timeout: Duration) -> Result<()> {
        tracing::info!("machine reset");
        self.exec("import machine; machine.reset()", Duration::ZERO)?;
        self.state = ReplState::Unknown;
        self.raw_paste = None;
        // The device node (or TCP peer) drops while the chip reboots.
        std::thread::sleep(Duration::from_millis(500));
        self.link.transport_mut().reconnect(reconnect_timeout)?;
        Ok(())
    }
}

/// Deadline `d` from now.
fn after(d: Duration) -> Option<Instant> {
    Some(Instant::now() + d)
}

fn truncated(mut bytes: Vec<u8>) -> Vec<u8> {
    bytes.truncate(128);
    bytes
}

fn first_line(code: &str) -> &str {
    code.lines().next().unwrap_or_default()
}
