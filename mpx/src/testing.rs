//! Test doubles: a scripted byte port and a raw-REPL board emulator.
//!
//! [`FakeBoard`] speaks the device side of the REPL protocol byte by
//! byte — friendly/raw transitions, `OK`/`\x04` execute framing, the
//! raw-paste handshake with window credits, soft reboots, and the
//! speed-test chat program — so engine and command tests run against
//! realistic wire traffic rather than canned strings.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

/// What the board "runs" when a code unit is executed.
pub(crate) enum BoardReply {
    /// Produce stdout/stderr and return to the raw prompt.
    Out(Vec<u8>, Vec<u8>),
    /// The code unit starts the speed-test chat server.
    EnterChat,
}

impl BoardReply {
    pub fn ok() -> Self {
        Self::Out(Vec::new(), Vec::new())
    }

    pub fn stdout(bytes: impl Into<Vec<u8>>) -> Self {
        Self::Out(bytes.into(), Vec::new())
    }

    pub fn stderr(text: &str) -> Self {
        Self::Out(Vec::new(), text.as_bytes().to_vec())
    }
}

enum Mode {
    Friendly,
    Raw,
    /// Raw-paste reception with flow-control credits.
    Paste {
        buf: Vec<u8>,
        until_credit: u16,
    },
    /// Probe bytes after `\x05` while still deciding.
    Probe(Vec<u8>),
    /// The speed-test chat server.
    Chat {
        header: Vec<u8>,
        want: usize,
        incoming: Vec<u8>,
        buffer: Vec<u8>,
    },
}

const FRIENDLY_BANNER: &[u8] =
    b"\r\nMicroPython v1.22.0 on fake-board\r\nType \"help()\" for more information.\r\n>>> ";
const RAW_BANNER: &[u8] = b"raw REPL; CTRL-B to exit\r\n>";

/// Device-side emulator.
pub(crate) struct FakeBoard {
    mode: Mode,
    out: Vec<u8>,
    code: Vec<u8>,
    /// Window advertised to raw-paste probes; `None` replies `R\x00`.
    paste_window: Option<u16>,
    /// Every code unit the board accepted, in order.
    pub execs: Vec<String>,
    exec_fn: Box<dyn FnMut(&str) -> BoardReply>,
}

impl FakeBoard {
    pub fn new() -> Self {
        Self {
            mode: Mode::Friendly,
            out: Vec::new(),
            code: Vec::new(),
            paste_window: None,
            execs: Vec::new(),
            exec_fn: Box::new(|_| BoardReply::ok()),
        }
    }

    /// Advertises raw-paste support with the given window.
    pub fn paste_window(mut self, window: u16) -> Self {
        self.paste_window = Some(window);
        self
    }

    /// Installs the execute handler.
    pub fn on_exec(mut self, f: impl FnMut(&str) -> BoardReply + 'static) -> Self {
        self.exec_fn = Box::new(f);
        self
    }

    /// Queues raw bytes as if the device printed them.
    #[allow(dead_code)]
    pub fn print(&mut self, bytes: &[u8]) {
        self.out.extend_from_slice(bytes);
    }

    fn run_code(&mut self) {
        let code = String::from_utf8_lossy(&self.code).into_owned();
        self.code.clear();
        self.execs.push(code.clone());
        match (self.exec_fn)(&code) {
            BoardReply::Out(stdout, stderr) => {
                self.out.extend_from_slice(&stdout);
                self.out.push(0x04);
                self.out.extend_from_slice(&stderr);
                self.out.extend_from_slice(b"\x04>");
            }
            BoardReply::EnterChat => {
                self.mode = Mode::Chat {
                    header: Vec::new(),
                    want: 0,
                    incoming: Vec::new(),
                    buffer: Vec::new(),
                };
            }
        }
    }

    fn feed(&mut self, byte: u8) {
        match &mut self.mode {
            Mode::Friendly => match byte {
                0x01 => {
                    self.code.clear();
                    self.mode = Mode::Raw;
                    self.out.extend_from_slice(RAW_BANNER);
                }
                0x02 => self.out.extend_from_slice(b"\r\n>>> "),
                0x03 => self.out.extend_from_slice(b"\r\nKeyboardInterrupt\r\n>>> "),
                0x04 => {
                    self.out.extend_from_slice(b"MPY: soft reboot\r\n");
                    self.out.extend_from_slice(&FRIENDLY_BANNER[2..]);
                }
                _ => {}
            },
            Mode::Raw => match byte {
                0x01 => {
                    self.code.clear();
                    self.out.extend_from_slice(RAW_BANNER);
                }
                0x02 => {
                    self.mode = Mode::Friendly;
                    self.out.extend_from_slice(FRIENDLY_BANNER);
                }
                0x03 => {
                    self.code.clear();
                    self.out.extend_from_slice(b"\r\n>");
                }
                0x04 => {
                    if self.code.is_empty() {
                        self.out.extend_from_slice(b"MPY: soft reboot\r\n");
                        self.out.extend_from_slice(RAW_BANNER);
                    } else {
                        self.out.extend_from_slice(b"OK");
                        self.run_code();
                    }
                }
                0x05 => self.mode = Mode::Probe(Vec::new()),
                b => self.code.push(b),
            },
            Mode::Probe(seen) => {
                seen.push(byte);
                if seen.len() == 2 {
                    let matched = seen == b"A\x01";
                    self.mode = Mode::Raw;
                    if !matched {
                        return;
                    }
                    if let Some(window) = self.paste_window {
                        self.out.extend_from_slice(b"R\x01");
                        self.out.extend_from_slice(&window.to_le_bytes());
                        self.out.push(0x01);
                        self.mode = Mode::Paste {
                            buf: Vec::new(),
                            until_credit: window,
                        };
                    } else {
                        self.out.extend_from_slice(b"R\x00");
                    }
                }
            }
            Mode::Paste { buf, until_credit } => {
                if byte == 0x04 {
                    self.code = std::mem::take(buf);
                    self.mode = Mode::Raw;
                    if self.code.is_empty() {
                        self.out.extend_from_slice(b"\x04\x04>");
                    } else {
                        self.run_code();
                    }
                    return;
                }
                buf.push(byte);
                *until_credit -= 1;
                if *until_credit == 0 {
                    // One full window consumed: grant another.
                    let window = self.paste_window.unwrap_or(1);
                    *until_credit = window;
                    self.out.push(0x01);
                }
            }
            Mode::Chat {
                header,
                want,
                incoming,
                buffer,
            } => {
                if header.len() < 2 {
                    header.push(byte);
                    if header.len() == 2 {
                        let n = usize::from(u16::from_le_bytes([header[0], header[1]]));
                        match n {
                            0xFFFF => {
                                // Quit: the program finishes like any code unit.
                                self.mode = Mode::Raw;
                                self.out.extend_from_slice(b"\x04\x04>");
                            }
                            0 => {
                                let echo = buffer.clone();
                                self.out.extend_from_slice(&echo);
                                self.out.push(b'\n');
                                header.clear();
                            }
                            n => {
                                *want = n;
                                incoming.clear();
                            }
                        }
                    }
                    return;
                }
                incoming.push(byte);
                if incoming.len() == *want {
                    *buffer = std::mem::take(incoming);
                    self.out.extend_from_slice(b".\n");
                    header.clear();
                    *want = 0;
                }
            }
        }
    }
}

struct PortInner {
    script: VecDeque<Vec<u8>>,
    written: Vec<u8>,
    board: Option<FakeBoard>,
}

/// Cloneable in-memory transport endpoint.
#[derive(Clone)]
pub(crate) struct FakePort(Rc<RefCell<PortInner>>);

impl FakePort {
    /// A port that replays fixed read chunks and records writes.
    pub fn scripted(chunks: Vec<Vec<u8>>) -> Self {
        Self(Rc::new(RefCell::new(PortInner {
            script: chunks.into(),
            written: Vec::new(),
            board: None,
        })))
    }

    /// A port backed by a [`FakeBoard`].
    pub fn board(board: FakeBoard) -> Self {
        Self(Rc::new(RefCell::new(PortInner {
            script: VecDeque::new(),
            written: Vec::new(),
            board: Some(board),
        })))
    }

    pub fn read_some(&self, wait: Duration) -> Vec<u8> {
        let mut inner = self.0.borrow_mut();
        if let Some(board) = &mut inner.board {
            if board.out.is_empty() {
                drop(inner);
                std::thread::sleep(wait.min(Duration::from_millis(1)));
                return Vec::new();
            }
            return std::mem::take(&mut board.out);
        }
        match inner.script.pop_front() {
            Some(chunk) => chunk,
            None => {
                drop(inner);
                std::thread::sleep(wait.min(Duration::from_millis(1)));
                Vec::new()
            }
        }
    }

    pub fn write_all(&self, data: &[u8]) {
        let mut inner = self.0.borrow_mut();
        inner.written.extend_from_slice(data);
        if let Some(board) = &mut inner.board {
            for &b in data {
                board.feed(b);
            }
        }
    }

    /// Everything the host has written so far.
    pub fn written(&self) -> Vec<u8> {
        self.0.borrow().written.clone()
    }

    /// Direct access to the board for assertions and scripted prints.
    pub fn with_board<R>(&self, f: impl FnOnce(&mut FakeBoard) -> R) -> R {
        let mut inner = self.0.borrow_mut();
        f(inner.board.as_mut().expect("port has no board"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn board_enters_and_leaves_raw() {
        let mut board = FakeBoard::new();
        board.feed(0x01);
        assert!(board.out.ends_with(RAW_BANNER));
        board.out.clear();
        board.feed(0x02);
        assert!(board.out.ends_with(b">>> "));
    }

    #[test]
    fn board_frames_execute_output() {
        let mut board = FakeBoard::new().on_exec(|code| {
            assert_eq!(code, "print(1)");
            BoardReply::stdout(b"1\r\n".to_vec())
        });
        board.feed(0x01);
        board.out.clear();
        for &b in b"print(1)\x04" {
            board.feed(b);
        }
        assert_eq!(board.out, b"OK1\r\n\x04\x04>");
        assert_eq!(board.execs, vec!["print(1)"]);
    }

    #[test]
    fn paste_credits_flow_per_window() {
        let mut board = FakeBoard::new().paste_window(4);
        board.feed(0x01);
        board.out.clear();
        for &b in b"\x05A\x01" {
            board.feed(b);
        }
        assert_eq!(&board.out[..2], b"R\x01");
        assert_eq!(u16::from_le_bytes([board.out[2], board.out[3]]), 4);
        assert_eq!(board.out[4], 0x01);
        board.out.clear();

        // Exactly one window of code: the credit arrives with the last byte.
        for &b in b"x=1\n" {
            board.feed(b);
        }
        assert_eq!(board.out, [0x01]);
        board.feed(0x04);
        assert!(board.out.ends_with(b"\x04\x04>"));
        assert_eq!(board.execs, vec!["x=1\n"]);
    }
}
