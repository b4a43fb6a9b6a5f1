//! Session configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Serial bit rates the session accepts.
pub const BAUD_RATES: &[u32] = &[
    9600, 19200, 38400, 57600, 115_200, 230_400, 460_800, 921_600,
];

/// Default serial bit rate (8-N-1).
pub const DEFAULT_BAUD: u32 = 115_200;

/// Default TCP port when the address carries none.
pub const DEFAULT_TCP_PORT: u16 = 23;

/// Which byte stream to open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endpoint {
    /// A serial device node (UART or USB-CDC).
    Serial {
        /// Port path, e.g. `/dev/ttyACM0`.
        port: String,
        /// Bit rate; see [`BAUD_RATES`].
        baud: u32,
    },
    /// A TCP tunnel exposing the same byte stream.
    Tcp {
        /// `host` or `host:port`; port defaults to [`DEFAULT_TCP_PORT`].
        address: String,
    },
}

/// Compression policy for transfers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compress {
    /// Compress text-looking data when the device has `deflate` and RAM.
    #[default]
    Auto,
    /// Always compress; error if the device lacks `deflate`.
    On,
    /// Never compress.
    Off,
}

/// Options threaded through a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Which transport to open.
    pub endpoint: Endpoint,
    /// Overrides transfer chunk auto-sizing when set.
    pub chunk_size: Option<usize>,
    /// Compression policy for `put`/`get`.
    pub compress: Compress,
    /// Bypass the skip-unchanged phase of the transfer pipeline.
    pub force: bool,
    /// Deadline for collecting one code unit's stdout.
    pub timeout: Duration,
    /// How long to keep retrying `reconnect` after a machine reset.
    pub reconnect_timeout: Duration,
}

impl SessionConfig {
    /// Serial endpoint with the default bit rate and timeouts.
    #[must_use]
    pub fn serial(port: impl Into<String>) -> Self {
        Self::new(Endpoint::Serial {
            port: port.into(),
            baud: DEFAULT_BAUD,
        })
    }

    /// TCP endpoint with default timeouts.
    #[must_use]
    pub fn tcp(address: impl Into<String>) -> Self {
        Self::new(Endpoint::Tcp {
            address: address.into(),
        })
    }

    fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            chunk_size: None,
            compress: Compress::default(),
            force: false,
            timeout: Duration::from_secs(5),
            reconnect_timeout: Duration::from_secs(10),
        }
    }

    /// Sets the serial bit rate.
    #[must_use]
    pub fn baud(mut self, baud: u32) -> Self {
        if let Endpoint::Serial { baud: b, .. } = &mut self.endpoint {
            *b = baud;
        }
        self
    }

    /// Forces a transfer chunk size instead of auto-sizing.
    #[must_use]
    pub fn chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = Some(bytes);
        self
    }

    /// Sets the compression policy.
    #[must_use]
    pub fn compress(mut self, compress: Compress) -> Self {
        self.compress = compress;
        self
    }

    /// Bypasses the skip-unchanged phase.
    #[must_use]
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Sets the per-code-unit stdout deadline.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the machine-reset reconnect window.
    #[must_use]
    pub fn reconnect_timeout(mut self, timeout: Duration) -> Self {
        self.reconnect_timeout = timeout;
        self
    }
}
