//! Serial-link throughput measurement.
//!
//! A minimal chat program is started on the device via raw REPL; the host
//! then pushes and pulls buffers of increasing size, timing each leg and
//! verifying the echo byte-for-byte.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::Result;
use crate::session::Session;

/// The chat program. Protocol: u16-LE size header, then
/// `n > 0` upload `n` bytes (ack `.\n`), `0` echo the buffer back,
/// `0xFFFF` quit.
const CHAT_UNIT: &str = "\
import sys
_r=sys.stdin.buffer.read
_w=sys.stdout.buffer.write
b=b''
while True:
 n=int.from_bytes(_r(2),'little')
 if n==65535:
  break
 if n==0:
  _w(b)
  _w(b'\\n')
 else:
  b=_r(n)
  _w(b'.\\n')";

/// Buffer sizes measured, smallest first.
const TEST_SIZES: &[usize] = &[
    0, 16, 32, 64, 128, 256, 512, 1024, 2048, 4096, 8192, 16384, 32768,
];

/// Deadline for a single chat exchange.
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Throughput measurement for one buffer size.
#[derive(Debug, Clone, Serialize)]
pub struct SpeedSample {
    /// Payload size in bytes.
    pub size: usize,
    /// Upload throughput, bytes per second.
    pub upload_bps: f64,
    /// Download (echo) throughput, bytes per second.
    pub download_bps: f64,
    /// First verification failure, if any round corrupted data.
    pub error: Option<String>,
}

impl Session {
    /// Measures link throughput across the size ladder.
    ///
    /// `repeats` exchanges are averaged per size; `pattern` fills the test
    /// buffers. The device is left at the raw prompt.
    pub fn speedtest(&mut self, repeats: usize, pattern: u8) -> Result<Vec<SpeedSample>> {
        let repeats = repeats.max(1);
        self.sync_mounts()?;
        // Start the chat program; it keeps running after the OK.
        self.repl().exec(CHAT_UNIT, Duration::ZERO)?;
        tracing::info!(repeats, "speed test running");

        let result = self.speedtest_rounds(repeats, pattern);

        // Quit the chat program and consume the code unit's trailing
        // output framing, leaving the engine idle in raw mode.
        let link = self.repl().link();
        let quit = result.is_ok();
        if quit {
            link.write(&0xFFFFu16.to_le_bytes())?;
            link.read_until(b"\x04", deadline(Duration::from_secs(2)))?;
            link.read_until(b"\x04>", deadline(Duration::from_secs(2)))?;
        }
        result
    }

    fn speedtest_rounds(&mut self, repeats: usize, pattern: u8) -> Result<Vec<SpeedSample>> {
        let mut samples = Vec::with_capacity(TEST_SIZES.len());
        for &size in TEST_SIZES {
            let data = vec![pattern; size];
            let header = u16::try_from(size).unwrap_or(u16::MAX).to_le_bytes();
            let mut up_total = Duration::ZERO;
            let mut down_total = Duration::ZERO;
            let mut error = None;

            for _ in 0..repeats {
                let link = self.repl().link();

                // Upload leg: header + payload, until the ack line.
                let t0 = Instant::now();
                link.write(&header)?;
                if !data.is_empty() {
                    link.write(&data)?;
                }
                link.read_until(b"\n", deadline(EXCHANGE_TIMEOUT))?;
                up_total += t0.elapsed();

                // Download leg: zero header, echo until newline.
                let t0 = Instant::now();
                link.write(&[0, 0])?;
                let echo = link.read_until(b"\n", deadline(EXCHANGE_TIMEOUT))?;
                down_total += t0.elapsed();

                if error.is_none() {
                    error = verify(&data, &echo);
                }
            }

            samples.push(SpeedSample {
                size,
                upload_bps: throughput(size, repeats, up_total),
                download_bps: throughput(size, repeats, down_total),
                error,
            });
        }
        Ok(samples)
    }
}

fn deadline(d: Duration) -> Option<Instant> {
    Some(Instant::now() + d)
}

#[allow(clippy::cast_precision_loss)]
fn throughput(size: usize, repeats: usize, total: Duration) -> f64 {
    if total.is_zero() {
        return 0.0;
    }
    (size * repeats) as f64 / total.as_secs_f64()
}

/// First difference between sent and echoed data, if any.
fn verify(sent: &[u8], received: &[u8]) -> Option<String> {
    if sent == received {
        return None;
    }
    if sent.len() != received.len() {
        return Some(format!("length {}/{}", received.len(), sent.len()));
    }
    sent.iter()
        .zip(received)
        .position(|(a, b)| a != b)
        .map(|at| format!("byte {at}: {:#04x}!={:#04x}", sent[at], received[at]))
}
