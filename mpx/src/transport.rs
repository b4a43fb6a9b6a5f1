//! Byte-stream transports: serial (UART / USB-CDC) and TCP.
//!
//! A transport moves bytes and nothing else — no CR/LF translation, no
//! XON/XOFF. Control-line toggles and reconnect are serial-only extras;
//! callers that need them get a capability error elsewhere.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};

use serialport::SerialPort;

use crate::config::{DEFAULT_TCP_PORT, Endpoint};
use crate::error::{Error, Result};

/// How long a TCP connect may take before the open fails.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Read block size per transport poll.
const READ_BLOCK: usize = 4096;

/// Serial writes are paced in small slices so the device-side input
/// buffer is not overrun outside raw-paste flow control.
const SERIAL_WRITE_SLICE: usize = 256;
const SERIAL_WRITE_GAP: Duration = Duration::from_millis(5);

/// A bidirectional byte stream to the device.
pub struct Transport {
    inner: Inner,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            Inner::Serial { path, baud, .. } => {
                f.debug_struct("Serial").field("path", path).field("baud", baud).finish()
            }
            Inner::Tcp { address, .. } => {
                f.debug_struct("Tcp").field("address", address).finish()
            }
            #[cfg(test)]
            Inner::Fake(_) => f.write_str("Fake"),
            Inner::Closed => f.write_str("Closed"),
        }
    }
}

enum Inner {
    Serial {
        port: Box<dyn serialport::SerialPort>,
        path: String,
        baud: u32,
    },
    Tcp {
        stream: TcpStream,
        address: String,
    },
    #[cfg(test)]
    Fake(crate::testing::FakePort),
    Closed,
}

impl Transport {
    /// Opens the transport described by `endpoint`.
    pub fn open(endpoint: &Endpoint) -> Result<Self> {
        let inner = match endpoint {
            Endpoint::Serial { port, baud } => open_serial(port, *baud)?,
            Endpoint::Tcp { address } => open_tcp(address)?,
        };
        Ok(Self { inner })
    }

    /// Wraps a scripted port; test builds only.
    #[cfg(test)]
    pub(crate) fn fake(port: crate::testing::FakePort) -> Self {
        Self {
            inner: Inner::Fake(port),
        }
    }

    /// Reads whatever is available, blocking up to `wait` for the first
    /// byte. Returns an empty buffer when nothing arrived in time.
    pub fn read_some(&mut self, wait: Duration) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; READ_BLOCK];
        let n = match &mut self.inner {
            Inner::Serial { port, .. } => {
                port.set_timeout(wait.max(Duration::from_millis(1)))
                    .map_err(|e| Error::Transport(io::Error::other(e)))?;
                match port.read(&mut buf) {
                    Ok(0) => return Err(closed()),
                    Ok(n) => n,
                    Err(e) => return read_err(e),
                }
            }
            Inner::Tcp { stream, .. } => {
                stream
                    .set_read_timeout(Some(wait.max(Duration::from_millis(1))))
                    .map_err(Error::Transport)?;
                match stream.read(&mut buf) {
                    Ok(0) => return Err(closed()),
                    Ok(n) => n,
                    Err(e) => return read_err(e),
                }
            }
            #[cfg(test)]
            Inner::Fake(port) => return Ok(port.read_some(wait)),
            Inner::Closed => return Err(closed()),
        };
        buf.truncate(n);
        Ok(buf)
    }

    /// Writes all of `data`.
    pub fn write_all(&mut self, data: &[u8]) -> Result<()> {
        match &mut self.inner {
            Inner::Serial { port, .. } => {
                // Paced: the friendly/raw REPL reader on small boards keeps
                // only a few hundred bytes of input buffer.
                let mut rest = data;
                while !rest.is_empty() {
                    let n = rest.len().min(SERIAL_WRITE_SLICE);
                    port.write_all(&rest[..n]).map_err(Error::Transport)?;
                    port.flush().map_err(Error::Transport)?;
                    rest = &rest[n..];
                    if !rest.is_empty() {
                        thread::sleep(SERIAL_WRITE_GAP);
                    }
                }
                Ok(())
            }
            Inner::Tcp { stream, .. } => {
                stream.write_all(data).map_err(Error::Transport)?;
                stream.flush().map_err(Error::Transport)
            }
            #[cfg(test)]
            Inner::Fake(port) => {
                port.write_all(data);
                Ok(())
            }
            Inner::Closed => Err(closed()),
        }
    }

    /// Sets the DTR control line (serial only).
    pub fn set_dtr(&mut self, level: bool) -> Result<()> {
        match &mut self.inner {
            Inner::Serial { port, .. } => port
                .write_data_terminal_ready(level)
                .map_err(|e| Error::Transport(io::Error::other(e))),
            _ => Err(Error::CapabilityUnavailable("DTR control line")),
        }
    }

    /// Sets the RTS control line (serial only).
    pub fn set_rts(&mut self, level: bool) -> Result<()> {
        match &mut self.inner {
            Inner::Serial { port, .. } => port
                .write_request_to_send(level)
                .map_err(|e| Error::Transport(io::Error::other(e))),
            _ => Err(Error::CapabilityUnavailable("RTS control line")),
        }
    }

    /// Pulses the control lines to reset boards wired for RTS reset.
    pub fn hard_reset(&mut self) -> Result<()> {
        self.set_dtr(false)?;
        self.set_rts(true)?;
        thread::sleep(Duration::from_millis(100));
        self.set_rts(false)
    }

    /// ESP-style DTR/RTS dance that holds the boot strap pin through reset.
    pub fn enter_bootloader(&mut self) -> Result<()> {
        self.set_dtr(false)?;
        self.set_rts(true)?;
        thread::sleep(Duration::from_millis(100));
        self.set_dtr(true)?;
        self.set_rts(false)?;
        thread::sleep(Duration::from_millis(50));
        self.set_dtr(false)
    }

    /// Re-opens the same endpoint, retrying until `timeout` elapses.
    ///
    /// USB-CDC nodes disappear and come back after a machine reset; TCP
    /// peers drop the connection. Either way the endpoint identity is
    /// retained, so reconnecting is a plain re-open loop.
    pub fn reconnect(&mut self, timeout: Duration) -> Result<()> {
        let endpoint = match &self.inner {
            Inner::Serial { path, baud, .. } => Endpoint::Serial {
                port: path.clone(),
                baud: *baud,
            },
            Inner::Tcp { address, .. } => Endpoint::Tcp {
                address: address.clone(),
            },
            #[cfg(test)]
            Inner::Fake(_) => return Ok(()),
            Inner::Closed => return Err(closed()),
        };
        self.inner = Inner::Closed;

        let deadline = Instant::now() + timeout;
        loop {
            match Transport::open(&endpoint) {
                Ok(t) => {
                    self.inner = t.inner;
                    return Ok(());
                }
                Err(e) if Instant::now() >= deadline => return Err(e),
                Err(_) => thread::sleep(Duration::from_millis(250)),
            }
        }
    }

    /// Closes the stream; subsequent reads and writes fail.
    pub fn close(&mut self) {
        self.inner = Inner::Closed;
    }

    /// Whether this transport ends in a USB/serial device node.
    #[must_use]
    pub fn is_serial(&self) -> bool {
        matches!(self.inner, Inner::Serial { .. })
    }
}

fn open_serial(path: &str, baud: u32) -> Result<Inner> {
    if !crate::config::BAUD_RATES.contains(&baud) {
        return Err(Error::Transport(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unrecognised baud rate {baud}"),
        )));
    }
    let port = serialport::new(path, baud)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .timeout(Duration::from_millis(100))
        .open()
        .map_err(|e| Error::Transport(io::Error::other(format!("open {path}: {e}"))))?;
    tracing::debug!(path, baud, "serial port open");
    Ok(Inner::Serial {
        port,
        path: path.to_owned(),
        baud,
    })
}

fn open_tcp(address: &str) -> Result<Inner> {
    let with_port = if address.contains(':') {
        address.to_owned()
    } else {
        format!("{address}:{DEFAULT_TCP_PORT}")
    };
    let addrs: Vec<_> = with_port
        .to_socket_addrs()
        .map_err(Error::Transport)?
        .collect();
    let mut last = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(stream) => {
                stream.set_nodelay(true).map_err(Error::Transport)?;
                tracing::debug!(%addr, "tcp connected");
                return Ok(Inner::Tcp {
                    stream,
                    address: address.to_owned(),
                });
            }
            Err(e) => last = Some(e),
        }
    }
    Err(Error::Transport(last.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("no address for {address}"))
    })))
}

fn closed() -> Error {
    Error::Transport(io::Error::new(
        io::ErrorKind::NotConnected,
        "transport is closed",
    ))
}

fn read_err(e: io::Error) -> Result<Vec<u8>> {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => {
            Ok(Vec::new())
        }
        _ => Err(Error::Transport(e)),
    }
}
