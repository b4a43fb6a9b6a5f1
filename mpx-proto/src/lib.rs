//! Wire protocol spoken between the on-device filesystem agent and the
//! host-side mount proxy.
//!
//! The agent shares the byte stream with ordinary REPL traffic, so frames
//! must be locatable inside arbitrary program output. Every frame is:
//!
//! ```text
//! [0x18 0xA6] [u8 kind] [u8 mount id] [u16-le payload length] [payload]
//! ```
//!
//! Replies reuse the request kind with [`REPLY_BIT`] set; their payload
//! starts with a status byte (`0` = ok, otherwise an errno from [`err`]).
//! A byte pair that looks like the magic but is not followed by a valid
//! header is ordinary output and must be forwarded untouched — see
//! [`scan`] for the rules.

mod codec;
mod message;

pub use codec::{FrameError, Scan, decode_request, encode_reply, encode_request, scan};
pub use message::{Frame, OpenMode, Reply, Request, err};

/// Two-byte frame delimiter. `0x18` (CAN) does not occur in the raw-REPL
/// control set; `0xA6` keeps a lone CAN byte in program output from being
/// mistaken for a frame start.
pub const MAGIC: [u8; 2] = [0x18, 0xA6];

/// Set on the kind byte of every reply frame.
pub const REPLY_BIT: u8 = 0x80;

/// Upper bound on a frame payload: one transfer chunk (32 KiB) plus the
/// handle word. Anything larger is a coincidental magic, not a frame.
pub const MAX_PAYLOAD: usize = 32 * 1024 + 2;

/// Frame header length: magic + kind + mount id + payload length.
pub const HEADER_LEN: usize = 6;
