//! Frame encoding, decoding, and in-stream location.

use crate::message::{Frame, KIND_MAX, KIND_MIN, OpenMode, Reply, Request};
use crate::{HEADER_LEN, MAGIC, MAX_PAYLOAD, REPLY_BIT};

/// Decoding failures. A frame that fails to decode is not an error at the
/// stream level — the scanner treats the bytes as program output instead.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum FrameError {
    /// Kind byte outside the request range.
    #[error("unknown frame kind {0}")]
    UnknownKind(u8),
    /// Payload does not match the kind's layout.
    #[error("malformed {0} payload")]
    Malformed(&'static str),
    /// A path field is not valid UTF-8.
    #[error("path is not valid UTF-8")]
    BadPath,
}

/// Outcome of scanning a buffer for the next frame.
#[derive(Debug, PartialEq, Eq)]
pub enum Scan {
    /// The first `n` bytes are plain output; no frame start follows them.
    Output {
        /// Number of leading bytes to forward as output.
        n: usize,
    },
    /// The first `n` bytes are plain output; the rest could be the start of
    /// a frame but more bytes are needed to decide.
    Pending {
        /// Number of leading bytes safe to forward as output.
        n: usize,
    },
    /// A complete frame was found.
    Frame {
        /// Bytes of plain output preceding the frame.
        before: usize,
        /// Offset one past the frame's last byte.
        end: usize,
        /// The decoded frame.
        frame: Frame,
    },
}

/// Locates the next frame in `buf`.
///
/// Bytes that merely resemble the magic (wrong second byte, invalid kind,
/// oversized length, payload that fails to decode as its kind) are
/// reclassified as output one byte at a time, so a coincidental `0x18` in
/// print output never desynchronises the stream.
#[must_use]
pub fn scan(buf: &[u8]) -> Scan {
    let mut from = 0;
    loop {
        let Some(rel) = buf[from..].iter().position(|&b| b == MAGIC[0]) else {
            return Scan::Output { n: buf.len() };
        };
        let at = from + rel;

        // Candidate start; not enough bytes yet to rule it in or out.
        if at + 1 >= buf.len() {
            return Scan::Pending { n: at };
        }
        if buf[at + 1] != MAGIC[1] {
            from = at + 1;
            continue;
        }
        if at + HEADER_LEN > buf.len() {
            // Magic matched but the header is still incomplete. Validate
            // what we have so a bad kind does not stall the stream.
            if at + 2 < buf.len() && !(KIND_MIN..=KIND_MAX).contains(&buf[at + 2]) {
                from = at + 1;
                continue;
            }
            return Scan::Pending { n: at };
        }

        let kind = buf[at + 2];
        let mount = buf[at + 3];
        let len = usize::from(u16::from_le_bytes([buf[at + 4], buf[at + 5]]));
        if !(KIND_MIN..=KIND_MAX).contains(&kind) || len > MAX_PAYLOAD {
            from = at + 1;
            continue;
        }
        let end = at + HEADER_LEN + len;
        if end > buf.len() {
            return Scan::Pending { n: at };
        }
        let frame = Frame {
            kind,
            mount,
            payload: buf[at + HEADER_LEN..end].to_vec(),
        };
        // Only a payload that decodes as its kind counts as a frame.
        if decode_request(&frame).is_err() {
            from = at + 1;
            continue;
        }
        return Scan::Frame {
            before: at,
            end,
            frame,
        };
    }
}

/// Decodes a located frame into a typed request.
pub fn decode_request(frame: &Frame) -> Result<Request, FrameError> {
    let p = &frame.payload;
    match frame.kind {
        1 => Ok(Request::Stat {
            path: path_of(p, "stat")?,
        }),
        2 => Ok(Request::Listdir {
            path: path_of(p, "listdir")?,
        }),
        3 => {
            let (&mode, rest) = p.split_first().ok_or(FrameError::Malformed("open"))?;
            let mode = OpenMode::from_byte(mode).ok_or(FrameError::Malformed("open"))?;
            Ok(Request::Open {
                path: path_of(rest, "open")?,
                mode,
            })
        }
        4 => {
            if p.len() != 4 {
                return Err(FrameError::Malformed("read"));
            }
            Ok(Request::Read {
                handle: u16::from_le_bytes([p[0], p[1]]),
                n: u16::from_le_bytes([p[2], p[3]]),
            })
        }
        5 => {
            if p.len() != 2 {
                return Err(FrameError::Malformed("close"));
            }
            Ok(Request::Close {
                handle: u16::from_le_bytes([p[0], p[1]]),
            })
        }
        6 => {
            if p.len() < 2 {
                return Err(FrameError::Malformed("write"));
            }
            Ok(Request::Write {
                handle: u16::from_le_bytes([p[0], p[1]]),
                data: p[2..].to_vec(),
            })
        }
        7 => Ok(Request::Remove {
            path: path_of(p, "remove")?,
        }),
        8 => Ok(Request::Mkdir {
            path: path_of(p, "mkdir")?,
        }),
        9 => {
            if p.len() < 2 {
                return Err(FrameError::Malformed("rename"));
            }
            let flen = usize::from(u16::from_le_bytes([p[0], p[1]]));
            if p.len() < 2 + flen {
                return Err(FrameError::Malformed("rename"));
            }
            Ok(Request::Rename {
                from: path_of(&p[2..2 + flen], "rename")?,
                to: path_of(&p[2 + flen..], "rename")?,
            })
        }
        k => Err(FrameError::UnknownKind(k)),
    }
}

fn path_of(bytes: &[u8], _ctx: &'static str) -> Result<String, FrameError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| FrameError::BadPath)
}

/// Frames a request as the device agent would emit it. Used by tests and
/// by the loopback transport; the real requests come from MicroPython.
#[must_use]
pub fn encode_request(mount: u8, req: &Request) -> Vec<u8> {
    let payload = match req {
        Request::Stat { path } | Request::Listdir { path } | Request::Remove { path } | Request::Mkdir { path } => {
            path.as_bytes().to_vec()
        }
        Request::Open { path, mode } => {
            let mut p = vec![mode.as_byte()];
            p.extend_from_slice(path.as_bytes());
            p
        }
        Request::Read { handle, n } => {
            let mut p = handle.to_le_bytes().to_vec();
            p.extend_from_slice(&n.to_le_bytes());
            p
        }
        Request::Write { handle, data } => {
            let mut p = handle.to_le_bytes().to_vec();
            p.extend_from_slice(data);
            p
        }
        Request::Close { handle } => handle.to_le_bytes().to_vec(),
        Request::Rename { from, to } => {
            let fb = from.as_bytes();
            let mut p = u16::try_from(fb.len()).unwrap_or(u16::MAX).to_le_bytes().to_vec();
            p.extend_from_slice(fb);
            p.extend_from_slice(to.as_bytes());
            p
        }
    };
    frame_bytes(req.kind(), mount, &payload)
}

/// Frames a reply for the device agent.
#[must_use]
pub fn encode_reply(kind: u8, mount: u8, reply: &Reply) -> Vec<u8> {
    let mut payload = vec![0u8];
    match reply {
        Reply::Err(code) => payload[0] = *code,
        Reply::Ok => {}
        Reply::Stat {
            is_dir,
            size,
            mtime,
        } => {
            payload.push(u8::from(*is_dir));
            payload.extend_from_slice(&size.to_le_bytes());
            payload.extend_from_slice(&mtime.to_le_bytes());
        }
        Reply::Listdir { entries } => {
            let count = u16::try_from(entries.len()).unwrap_or(u16::MAX);
            payload.extend_from_slice(&count.to_le_bytes());
            for (name, is_dir, size) in entries {
                let nb = name.as_bytes();
                let nlen = u16::try_from(nb.len()).unwrap_or(u16::MAX);
                payload.extend_from_slice(&nlen.to_le_bytes());
                payload.extend_from_slice(nb);
                payload.push(u8::from(*is_dir));
                payload.extend_from_slice(&size.to_le_bytes());
            }
        }
        Reply::Open { handle } => payload.extend_from_slice(&handle.to_le_bytes()),
        Reply::Read { data } => payload.extend_from_slice(data),
        Reply::Written { n } => payload.extend_from_slice(&n.to_le_bytes()),
    }
    frame_bytes(kind | REPLY_BIT, mount, &payload)
}

fn frame_bytes(kind: u8, mount: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&MAGIC);
    out.push(kind);
    out.push(mount);
    let len = u16::try_from(payload.len()).unwrap_or(u16::MAX);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    out
}
