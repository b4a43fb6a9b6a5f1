//! The session: one transport, one REPL engine, one set of caches and
//! live mounts. All public operations are totally ordered through it.

use std::path::Path;
use std::time::Duration;

use crate::config::{Compress, SessionConfig};
use crate::device::HELPERS_UNIT;
use crate::error::{Error, Result};
use crate::link::Link;
use crate::literal::{self, Value};
use crate::mount::{MountHandler, MountOptions, MpyCross, agent};
use crate::probe::{DeviceInfo, PROBE_UNIT};
use crate::repl::{Repl, ReplState};
use crate::transport::Transport;

/// Chunk-size ladder the transfer pipeline picks from.
const CHUNK_LADDER: &[usize] = &[32768, 16384, 8192, 4096, 2048, 1024, 512];

/// A chunk may claim at most this fraction of reported free RAM.
const CHUNK_RAM_DIVISOR: u64 = 5;

/// A connected device session.
pub struct Session {
    repl: Repl,
    config: SessionConfig,
    info: Option<DeviceInfo>,
    helpers_installed: bool,
    agent_installed: bool,
    chunk: Option<usize>,
    next_mount_id: u8,
}

impl Session {
    /// Opens the configured transport and binds a session to it.
    ///
    /// No bytes are exchanged yet; the first operation drives the device
    /// into raw mode.
    pub fn open(config: SessionConfig) -> Result<Self> {
        let transport = Transport::open(&config.endpoint)?;
        Ok(Self::bind(transport, config))
    }

    pub(crate) fn bind(transport: Transport, config: SessionConfig) -> Self {
        Self {
            repl: Repl::new(Link::new(transport)),
            config,
            info: None,
            helpers_installed: false,
            agent_installed: false,
            chunk: None,
            next_mount_id: 0,
        }
    }

    /// The configuration this session was opened with.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Engine state, mostly useful for diagnostics.
    #[must_use]
    pub fn state(&self) -> ReplState {
        self.repl.state()
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.config.timeout
    }

    /// Executes a code unit with the configured timeout and returns its
    /// stdout.
    pub fn exec(&mut self, code: &str) -> Result<Vec<u8>> {
        self.sync_mounts()?;
        self.repl.exec(code, self.config.timeout)
    }

    /// Executes a code unit with an explicit timeout.
    pub fn exec_with_timeout(&mut self, code: &str, timeout: Duration) -> Result<Vec<u8>> {
        self.sync_mounts()?;
        self.repl.exec(code, timeout)
    }

    /// Fire-and-forget submit: sends the code unit and returns once the
    /// device acknowledged the compile, without collecting output.
    pub fn submit(&mut self, code: &str) -> Result<()> {
        self.sync_mounts()?;
        self.repl.exec(code, Duration::ZERO)?;
        Ok(())
    }

    /// Strict raw-paste execute; fails with a capability error on devices
    /// without paste mode instead of downgrading.
    pub fn exec_raw_paste(&mut self, code: &str) -> Result<Vec<u8>> {
        self.sync_mounts()?;
        self.repl.exec_raw_paste(code, self.config.timeout)
    }

    /// Evaluates an expression on the device and parses the printed
    /// literal.
    pub(crate) fn exec_eval(&mut self, expr: &str) -> Result<Value> {
        self.exec_eval_with_timeout(expr, self.config.timeout)
    }

    pub(crate) fn exec_eval_with_timeout(&mut self, expr: &str, timeout: Duration) -> Result<Value> {
        let stdout = self.exec_with_timeout(&format!("print(repr({expr}))"), timeout)?;
        literal::parse(&stdout)
    }

    /// Installs the device-side helper functions once per session.
    pub(crate) fn ensure_helpers(&mut self) -> Result<()> {
        self.sync_mounts()?;
        if !self.helpers_installed {
            self.repl.exec(HELPERS_UNIT, self.config.timeout)?;
            self.helpers_installed = true;
        }
        Ok(())
    }

    /// Interrupts whatever runs and resynchronises at the friendly
    /// prompt. Safe at any time.
    pub fn stop(&mut self) -> Result<()> {
        self.repl.stop()
    }

    /// Soft reset running boot scripts, then re-installs live mounts.
    pub fn soft_reset(&mut self) -> Result<()> {
        self.repl.soft_reset()?;
        self.invalidate_device_state();
        // Consume the passive detector's flag; we re-install explicitly.
        let _ = self.repl.link().take_remount_due();
        self.reinstall_mounts()?;
        Ok(())
    }

    /// Soft reset inside raw mode: clears RAM without running boot
    /// scripts, then re-installs live mounts.
    pub fn soft_reset_raw(&mut self) -> Result<()> {
        self.repl.soft_reset_raw()?;
        self.invalidate_device_state();
        let _ = self.repl.link().take_remount_due();
        self.reinstall_mounts()?;
        Ok(())
    }

    /// `machine.reset()` and reconnect within the configured window.
    pub fn machine_reset(&mut self) -> Result<()> {
        let window = self.config.reconnect_timeout;
        self.repl.machine_reset(window)?;
        self.invalidate_device_state();
        let _ = self.repl.link().take_remount_due();
        self.reinstall_mounts()?;
        Ok(())
    }

    /// Hardware reset via the serial control lines.
    pub fn hard_reset(&mut self) -> Result<()> {
        self.repl.link().transport_mut().hard_reset()?;
        self.invalidate_device_state();
        Ok(())
    }

    /// Holds the boot strap through a reset to enter the ROM bootloader.
    pub fn enter_bootloader(&mut self) -> Result<()> {
        self.repl.link().transport_mut().enter_bootloader()
    }

    fn invalidate_device_state(&mut self) {
        self.helpers_installed = false;
        self.agent_installed = false;
        self.info = None;
        self.chunk = None;
    }

    /// Capability probe, cached until the next reset.
    pub fn info(&mut self) -> Result<DeviceInfo> {
        if self.info.is_none() {
            self.sync_mounts()?;
            let stdout = self.repl.exec(PROBE_UNIT, self.config.timeout)?;
            let info = DeviceInfo::from_value(&literal::parse(&stdout)?)?;
            tracing::info!(
                platform = %info.platform,
                version = %info.version,
                free_ram = info.free_ram,
                "device probed"
            );
            self.info = Some(info);
        }
        Ok(self.info.clone().unwrap_or_default())
    }

    pub(crate) fn device_has_deflate(&mut self) -> Result<bool> {
        Ok(self.info()?.has_deflate)
    }

    /// Transfer chunk size: the configured override, or the largest ladder
    /// step that fits the device's free RAM.
    pub(crate) fn negotiated_chunk_size(&mut self) -> Result<usize> {
        if let Some(forced) = self.config.chunk_size {
            return Ok(forced);
        }
        if let Some(cached) = self.chunk {
            return Ok(cached);
        }
        let free = self.info()?.free_ram;
        let picked = pick_chunk(free);
        tracing::debug!(free, picked, "chunk size negotiated");
        self.chunk = Some(picked);
        Ok(picked)
    }

    /// Whether a transfer should compress, given the policy, the device,
    /// and (for uploads) the data itself.
    pub(crate) fn resolve_compression(&mut self, data: Option<&[u8]>) -> Result<bool> {
        match self.config.compress {
            Compress::Off => Ok(false),
            Compress::On => {
                if self.device_has_deflate()? {
                    Ok(true)
                } else {
                    Err(Error::CompressionUnavailable)
                }
            }
            Compress::Auto => {
                if !self.device_has_deflate()? {
                    return Ok(false);
                }
                // Inflating needs headroom: small-RAM boards negotiate
                // small chunks, and those boards should not decompress.
                if self.negotiated_chunk_size()? < 8192 {
                    return Ok(false);
                }
                Ok(data.is_none_or(looks_textual))
            }
        }
    }

    // ------------------------------------------------------------------
    // Mounts

    /// Serves `local_root` to the device at `mount_point`.
    ///
    /// Installs the agent (once per session), registers a device-side VFS
    /// instance, and switches the read path into intercepted mode. The
    /// returned id can be used with [`Session::add_submount`].
    pub fn mount(
        &mut self,
        local_root: impl AsRef<Path>,
        mount_point: &str,
        options: MountOptions,
    ) -> Result<u8> {
        if !mount_point.starts_with('/') {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("mount point '{mount_point}' must be absolute"),
            )));
        }
        let root = local_root.as_ref().canonicalize()?;
        if !root.is_dir() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                format!("{} is not a directory", root.display()),
            )));
        }
        let point = mount_point.trim_end_matches('/').to_owned();
        for live in self.repl.link_ref().mounts() {
            let existing = live.mount_point();
            if point == existing
                || point.starts_with(&format!("{existing}/"))
                || existing.starts_with(&format!("{point}/"))
            {
                return Err(Error::MountOverlap(point));
            }
        }

        let compiler = if options.compile {
            let info = self.info()?;
            MpyCross::detect(&info)
        } else {
            None
        };

        self.ensure_agent()?;
        let mount_id = self.next_mount_id;
        self.next_mount_id = self.next_mount_id.wrapping_add(1);
        self.exec(&agent::mount_call(&point, mount_id))?;

        let handler = MountHandler::new(mount_id, point.clone(), root, options.writable, compiler);
        self.repl.link().add_mount(handler);
        tracing::info!(mount_point = %point, mount_id, "mount live");
        Ok(mount_id)
    }

    /// Routes a subtree of an existing mount to a different host
    /// directory.
    pub fn add_submount(
        &mut self,
        mount_id: u8,
        subpath: &str,
        local: impl AsRef<Path>,
    ) -> Result<()> {
        let canonical = local.as_ref().canonicalize()?;
        let handler = self
            .repl
            .link()
            .mounts_mut()
            .iter_mut()
            .find(|m| m.mount_id() == mount_id)
            .ok_or_else(|| Error::PathNotFound(format!("mount #{mount_id}")))?;
        handler.add_submount(subpath, canonical);
        Ok(())
    }

    /// Device paths currently mounted, in install order.
    #[must_use]
    pub fn mount_points(&self) -> Vec<String> {
        self.repl
            .link_ref()
            .mounts()
            .iter()
            .map(|m| m.mount_point().to_owned())
            .collect()
    }

    /// Removes the device-side registration and the host handler.
    pub fn umount(&mut self, mount_point: &str) -> Result<()> {
        let point = mount_point.trim_end_matches('/');
        let id = self
            .repl
            .link_ref()
            .mounts()
            .iter()
            .find(|m| m.mount_point() == point)
            .map(MountHandler::mount_id)
            .ok_or_else(|| Error::PathNotFound(point.to_owned()))?;
        self.exec(&agent::umount_call(point))?;
        self.repl.link().remove_mount(id);
        tracing::info!(mount_point = point, "mount removed");
        Ok(())
    }

    /// Re-installs mounts if the read path noticed a device reset.
    pub(crate) fn sync_mounts(&mut self) -> Result<()> {
        if self.repl.link().take_remount_due() {
            self.invalidate_device_state();
            self.reinstall_mounts()?;
        }
        Ok(())
    }

    fn ensure_agent(&mut self) -> Result<()> {
        if !self.agent_installed {
            let chunk = self.negotiated_chunk_size()?;
            let unit = agent::agent_install(chunk);
            self.repl.exec(&unit, self.config.timeout)?;
            self.agent_installed = true;
        }
        Ok(())
    }

    /// Re-installs every live mount in original order and restores the
    /// device CWD to the first mount point. A mount that fails to come
    /// back is dropped with an error report; the session continues.
    fn reinstall_mounts(&mut self) -> Result<()> {
        if !self.repl.link_ref().has_mounts() {
            return Ok(());
        }
        let specs: Vec<(u8, String)> = self
            .repl
            .link_ref()
            .mounts()
            .iter()
            .map(|m| (m.mount_id(), m.mount_point().to_owned()))
            .collect();
        tracing::info!(count = specs.len(), "re-installing mounts after reset");

        // Device-side file objects died with the interpreter state.
        for handler in self.repl.link().mounts_mut() {
            handler.close_all();
        }

        self.ensure_agent()?;
        let mut first_ok: Option<String> = None;
        for (mount_id, point) in specs {
            let result = self
                .repl
                .exec(&agent::mount_call(&point, mount_id), self.config.timeout);
            match result {
                Ok(_) => {
                    if first_ok.is_none() {
                        first_ok = Some(point);
                    }
                }
                Err(e) => {
                    tracing::error!(mount_point = %point, error = %e, "mount did not survive reset, dropping");
                    self.repl.link().remove_mount(mount_id);
                }
            }
        }
        if let Some(point) = first_ok {
            self.repl.exec(
                &format!("import os\nos.chdir('{}')", crate::device::py_str_escape(&point)),
                self.config.timeout,
            )?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Raw output passthrough (interactive consumers)

    /// Reads whatever REPL output is available within `wait`, after frame
    /// demultiplexing. Mount re-installs triggered by an observed reset
    /// happen here, without caller action.
    pub fn read_output(&mut self, wait: Duration) -> Result<Vec<u8>> {
        let out = self.repl.link().read_available(wait)?;
        self.sync_mounts()?;
        Ok(out)
    }

    /// Writes raw bytes to the device (interactive stdin passthrough).
    pub fn write_stdin(&mut self, data: &[u8]) -> Result<()> {
        self.repl.link().write(data)
    }

    /// Tears the session down: unmounts in LIFO order, leaves raw mode,
    /// and closes the transport.
    pub fn close(&mut self) -> Result<()> {
        if self.repl.state() == ReplState::Closed {
            return Ok(());
        }
        let points: Vec<String> = self.mount_points().into_iter().rev().collect();
        for point in points {
            if let Err(e) = self.umount(&point) {
                tracing::warn!(mount_point = %point, error = %e, "unmount during close failed");
            }
        }
        let _ = self.repl.exit_raw();
        self.repl.link().transport_mut().close();
        self.repl.set_closed();
        Ok(())
    }

    pub(crate) fn repl(&mut self) -> &mut Repl {
        &mut self.repl
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Largest ladder step within the RAM budget.
fn pick_chunk(free_ram: u64) -> usize {
    let budget = free_ram / CHUNK_RAM_DIVISOR;
    CHUNK_LADDER
        .iter()
        .copied()
        .find(|&c| (c as u64) <= budget)
        .unwrap_or(512)
}

/// Rough text detector for the auto-compression policy.
fn looks_textual(data: &[u8]) -> bool {
    if data.is_empty() {
        return false;
    }
    let sample = &data[..data.len().min(512)];
    let printable = sample
        .iter()
        .filter(|&&b| b == b'\n' || b == b'\r' || b == b'\t' || (0x20..0x7f).contains(&b))
        .count();
    printable * 100 / sample.len() >= 90
}
