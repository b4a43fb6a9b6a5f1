//! Error types for mpx operations.

use std::io;
use std::time::Duration;

/// Alias for `Result<T, mpx::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by session, transfer, and mount operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The byte stream is broken or could not be opened. Fatal for the
    /// current session; callers may reconnect and retry.
    #[error("transport: {0}")]
    Transport(#[source] io::Error),

    /// A deadline expired while waiting for an expected delimiter.
    /// Recoverable: call [`crate::Session::stop`] to resynchronise.
    #[error("timed out after {waited:?} waiting for {expected}")]
    Timeout {
        /// Human-readable description of the awaited pattern.
        expected: String,
        /// How long the engine waited.
        waited: Duration,
        /// Bytes received while waiting (kept for diagnostics).
        pending: Vec<u8>,
    },

    /// Bytes on the wire did not match any expected banner, and the
    /// bounded resync retries were exhausted.
    #[error("protocol desync: expected {expected}, got {got:?}")]
    Desync {
        /// The banner the engine was trying to reach.
        expected: &'static str,
        /// What arrived instead (truncated).
        got: Vec<u8>,
    },

    /// The device raised while executing a host-submitted code unit.
    #[error("device error in `{cmd}`: {stderr}")]
    Cmd {
        /// The submitted code unit.
        cmd: String,
        /// Stdout collected before the failure.
        stdout: Vec<u8>,
        /// Device traceback, decoded as UTF-8 (lossy).
        stderr: String,
    },

    /// A device path does not exist.
    #[error("path '{0}' was not found")]
    PathNotFound(String),

    /// A device file does not exist.
    #[error("file '{0}' was not found")]
    FileNotFound(String),

    /// A device directory does not exist (or is a file).
    #[error("dir '{0}' was not found")]
    DirNotFound(String),

    /// Mutation on a read-only mount, or a path that resolves outside a
    /// mount root.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Compression was forced but the device has no `deflate` module.
    #[error("compression requested but device lacks deflate")]
    CompressionUnavailable,

    /// The operation requires a device feature that is not present.
    #[error("device capability unavailable: {0}")]
    CapabilityUnavailable(&'static str),

    /// A write was attempted while a mount request was being serviced.
    #[error("link busy: a mount request is in flight")]
    Busy,

    /// A new mount point nests inside (or contains) a live mount.
    #[error("mount point '{0}' overlaps an existing mount")]
    MountOverlap(String),

    /// The device printed a reply the restricted literal reader could not
    /// parse, or of an unexpected shape.
    #[error("malformed device reply: {0}")]
    BadReply(String),

    /// An I/O error on the host side (local files, mpy-cross).
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// True when [`crate::Session::stop`] is expected to recover the link.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Cmd { .. })
    }
}
