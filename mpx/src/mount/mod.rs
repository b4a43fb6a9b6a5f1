//! Transparent host-directory mounts.
//!
//! A mount has two halves: a small agent injected into the running
//! interpreter ([`agent`]) and a host-side handler that answers its
//! framed filesystem requests against a local directory ([`handler`]).
//! The demultiplexing of frames out of the REPL byte stream lives in
//! [`crate::link`]; installation, teardown, and re-install after soft
//! reset live in [`crate::session`].

pub(crate) mod agent;
mod handler;
mod mpy_cross;

pub use handler::MountHandler;
pub use mpy_cross::{BOOT_FILES, MpyCross};

/// Options for [`crate::Session::mount`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MountOptions {
    /// Allow the device to write, remove, mkdir, and rename.
    pub writable: bool,
    /// Serve compiled `.mpy` counterparts for `.py` sources, using an
    /// `mpy-cross` binary found on `PATH` and targeting the device's
    /// bytecode version.
    pub compile: bool,
}

impl MountOptions {
    /// Read-only, source-serving mount.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables device-side writes.
    #[must_use]
    pub fn writable(mut self) -> Self {
        self.writable = true;
        self
    }

    /// Enables transparent `.mpy` compilation.
    #[must_use]
    pub fn compile(mut self) -> Self {
        self.compile = true;
        self
    }
}
