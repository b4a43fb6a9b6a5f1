//! Drive MicroPython boards over a byte stream.
//!
//! `mpx` talks to a board's REPL over serial (UART / USB-CDC) or a TCP
//! tunnel and builds a file-manager-grade toolkit on top of it: code
//! execution with captured output, chunked and hash-skipped file
//! transfer, device introspection, and a transparent mount that lets the
//! board import files straight from a host directory.
//!
//! # Quick start
//!
//! ```no_run
//! use mpx::{Session, SessionConfig};
//!
//! let mut session = Session::open(SessionConfig::serial("/dev/ttyACM0"))?;
//! for (name, size) in session.ls("/")? {
//!     println!("{name} {size:?}");
//! }
//! session.put("main.py", b"print('hi')\n", None)?;
//! let out = session.exec("exec(open('main.py').read())")?;
//! assert_eq!(out, b"hi\r\n");
//! # Ok::<(), mpx::Error>(())
//! ```
//!
//! # Mounts
//!
//! ```no_run
//! use mpx::{MountOptions, Session, SessionConfig};
//! use std::time::Duration;
//!
//! let mut session = Session::open(SessionConfig::tcp("192.168.4.1"))?;
//! session.mount("./src", "/remote", MountOptions::new())?;
//! session.submit("import app")?; // served from ./src, on demand
//! let output = session.read_output(Duration::from_millis(100))?;
//! # Ok::<(), mpx::Error>(())
//! ```
//!
//! One session owns one transport; operations are totally ordered through
//! it, block with deadlines, and never spin up threads.

mod config;
mod device;
mod error;
mod line;
mod link;
mod literal;
mod mount;
mod probe;
mod repl;
mod session;
mod speedtest;
mod transfer;
mod transport;

#[cfg(test)]
mod testing;

pub use config::{BAUD_RATES, Compress, DEFAULT_BAUD, DEFAULT_TCP_PORT, Endpoint, SessionConfig};
pub use device::{
    Encoding, FilesystemInfo, MemoryUsage, Progress, PutOutcome, RemoteFileInfo, Stat, TreeEntry,
};
pub use error::{Error, Result};
pub use mount::{BOOT_FILES, MountOptions, MpyCross};
pub use probe::DeviceInfo;
pub use repl::ReplState;
pub use session::Session;
pub use speedtest::SpeedSample;
pub use transfer::{TransferItem, TransferProgress, TransferReport};
pub use transport::Transport;

#[cfg(test)]
mod scenarios;
