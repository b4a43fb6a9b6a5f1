//! End-to-end tests: a session driving an emulated board whose exec
//! handler implements the device side of the helper protocol over an
//! in-memory filesystem.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};
use std::rc::Rc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};

use crate::config::{Compress, SessionConfig};
use crate::device::py_bytes_literal;
use crate::error::Error;
use crate::literal::{self, Value};
use crate::mount::MountOptions;
use crate::session::Session;
use crate::testing::{BoardReply, FakeBoard, FakePort};
use crate::transfer::TransferItem;
use crate::transport::Transport;

#[derive(Default)]
struct Sim {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    open: Option<OpenFile>,
    free_ram: u64,
    has_deflate: bool,
}

struct OpenFile {
    path: String,
    write: bool,
    buf: Vec<u8>,
    pos: usize,
}

type SimRef = Rc<RefCell<Sim>>;

fn stdout_line(text: String) -> BoardReply {
    let mut out = text.into_bytes();
    out.extend_from_slice(b"\r\n");
    BoardReply::stdout(out)
}

/// Answers the code units the command layer generates, against `sim`.
#[allow(clippy::too_many_lines)]
fn answer(sim: &SimRef, code: &str) -> BoardReply {
    // Install units and bookkeeping that only need an acknowledgement.
    if code.starts_with("import os,sys,gc,io,binascii")
        || code.starts_with("import sys,io,os,micropython")
        || code.starts_with("_mx_mnt(")
        || code.starts_with("import os\nos.chdir(")
        || code == "gc.collect()"
    {
        return BoardReply::ok();
    }
    // The platform probe.
    if code.starts_with("import sys,os,gc,binascii") {
        let s = sim.borrow();
        return stdout_line(format!(
            "{{'platform': 'rp2', 'version': '1.22.0', 'impl': 'micropython', 'machine': 'Sim Board', 'uid': 'e6614c31', 'free': {}, 'deflate': {}, 'hashlib': True, 'mpy': 6, 'mpy_sub': 2, 'arch': 0, 'paste': True}}",
            s.free_ram,
            if s.has_deflate { "True" } else { "False" },
        ));
    }
    if let Some(path) = code
        .strip_prefix("_mx_f=open('")
        .and_then(|rest| rest.strip_suffix("','wb')"))
    {
        sim.borrow_mut().open = Some(OpenFile {
            path: path.to_owned(),
            write: true,
            buf: Vec::new(),
            pos: 0,
        });
        return BoardReply::ok();
    }
    if let Some(path) = code
        .strip_prefix("_mx_f=open('")
        .and_then(|rest| rest.strip_suffix("','rb')"))
    {
        let contents = sim.borrow().files.get(path).cloned();
        return match contents {
            Some(buf) => {
                sim.borrow_mut().open = Some(OpenFile {
                    path: path.to_owned(),
                    write: false,
                    buf,
                    pos: 0,
                });
                BoardReply::ok()
            }
            None => BoardReply::stderr(
                "Traceback (most recent call last):\r\nOSError: [Errno 2] ENOENT\r\n",
            ),
        };
    }
    if code == "_mx_f.close()" {
        let open = sim.borrow_mut().open.take();
        if let Some(open) = open {
            if open.write {
                sim.borrow_mut().files.insert(open.path, open.buf);
            }
        }
        return BoardReply::ok();
    }
    if code == "exec(open('h.py').read())" {
        let runs = sim
            .borrow()
            .files
            .get("h.py")
            .is_some_and(|c| c.starts_with(b"print('hi')"));
        return if runs {
            BoardReply::stdout(b"hi\r\n".to_vec())
        } else {
            BoardReply::stderr("OSError: ENOENT\r\n")
        };
    }
    // Evaluated expressions.
    if let Some(expr) = code
        .strip_prefix("print(repr(")
        .and_then(|rest| rest.strip_suffix("))"))
    {
        return eval_expr(sim, expr);
    }
    BoardReply::ok()
}

#[allow(clippy::too_many_lines)]
fn eval_expr(sim: &SimRef, expr: &str) -> BoardReply {
    if let Some(path) = expr
        .strip_prefix("tuple(os.ilistdir('")
        .and_then(|rest| rest.strip_suffix("'))"))
    {
        let s = sim.borrow();
        let prefix = if path == "/" || path.is_empty() {
            String::new()
        } else {
            format!("{}/", path.trim_matches('/'))
        };
        let mut entries = Vec::new();
        for dir in &s.dirs {
            if let Some(name) = direct_child(dir, &prefix) {
                entries.push(format!("('{name}', 16384, 0, 0)"));
            }
        }
        for (file, data) in &s.files {
            if let Some(name) = direct_child(file, &prefix) {
                entries.push(format!("('{name}', 32768, 0, {})", data.len()));
            }
        }
        if entries.is_empty() && !prefix.is_empty() && !s.dirs.contains(path.trim_matches('/')) {
            return BoardReply::stderr("OSError: [Errno 2] ENOENT\r\n");
        }
        return stdout_line(format!("({},)", entries.join(", ")).replace("(,)", "()"));
    }
    if let Some(path) = expr
        .strip_prefix("_mx_st('")
        .and_then(|rest| rest.strip_suffix("')"))
    {
        let s = sim.borrow();
        if s.dirs.contains(path.trim_matches('/')) || path == "/" {
            return stdout_line("-1".into());
        }
        return match s.files.get(path) {
            Some(data) => stdout_line(data.len().to_string()),
            None => stdout_line("None".into()),
        };
    }
    if let Some(inner) = expr
        .strip_prefix("_mx_wb(")
        .and_then(|rest| rest.strip_suffix(")"))
    {
        let Ok(Value::Bytes(tagged)) = literal::parse(inner.as_bytes()) else {
            return BoardReply::stderr("ValueError: bad chunk literal\r\n");
        };
        let decoded = decode_tagged(&tagged);
        let mut s = sim.borrow_mut();
        let Some(open) = s.open.as_mut() else {
            return BoardReply::stderr("NameError: _mx_f\r\n");
        };
        open.buf.extend_from_slice(&decoded);
        return stdout_line(decoded.len().to_string());
    }
    if expr.starts_with("_mx_rb(") || expr.starts_with("_mx_rz(") {
        let compressing = expr.starts_with("_mx_rz(");
        let n: usize = expr[7..expr.len() - 1].parse().unwrap_or(512);
        let mut s = sim.borrow_mut();
        let Some(open) = s.open.as_mut() else {
            return BoardReply::stderr("NameError: _mx_f\r\n");
        };
        let end = (open.pos + n).min(open.buf.len());
        let chunk = open.buf[open.pos..end].to_vec();
        open.pos = end;
        if chunk.is_empty() {
            return stdout_line("b''".into());
        }
        let mut tagged = Vec::new();
        if compressing {
            let mut enc =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(&chunk).unwrap();
            let deflated = enc.finish().unwrap();
            if deflated.len() < chunk.len() {
                tagged.push(b'z');
                tagged.extend_from_slice(BASE64.encode(&deflated).as_bytes());
            }
        }
        if tagged.is_empty() {
            tagged.push(b'b');
            tagged.extend_from_slice(BASE64.encode(&chunk).as_bytes());
        }
        return stdout_line(py_bytes_literal(&tagged));
    }
    if let Some(inner) = expr
        .strip_prefix("_mx_fi(")
        .and_then(|rest| rest.strip_suffix(")"))
    {
        let Ok(Value::Dict(pairs)) = literal::parse(inner.as_bytes()) else {
            return BoardReply::stderr("ValueError: bad fileinfo arg\r\n");
        };
        let s = sim.borrow();
        let mut parts = Vec::new();
        for (key, expected) in pairs {
            let path = key.as_str().unwrap_or_default();
            let entry = match s.files.get(path) {
                None => "None".to_owned(),
                Some(data) => {
                    let size = data.len() as u64;
                    if Some(size) == expected.as_u64() {
                        let digest = BASE64.encode(Sha256::digest(data));
                        format!("({size}, b'{digest}')")
                    } else {
                        format!("({size}, None)")
                    }
                }
            };
            parts.push(format!("'{path}': {entry}"));
        }
        return stdout_line(format!("{{{}}}", parts.join(", ")));
    }
    BoardReply::stderr("NameError: unhandled expression\r\n")
}

/// Decodes a put chunk the way `_mx_wb` would.
fn decode_tagged(tagged: &[u8]) -> Vec<u8> {
    let (&tag, rest) = tagged.split_first().expect("tagged payload");
    match tag {
        b'r' => rest.to_vec(),
        b'b' => BASE64.decode(rest).expect("base64 chunk"),
        b'z' => {
            let deflated = if rest.first() == Some(&b'b') {
                BASE64.decode(&rest[1..]).expect("base64 zlib chunk")
            } else {
                rest[1..].to_vec()
            };
            let mut out = Vec::new();
            flate2::read::ZlibDecoder::new(&deflated[..])
                .read_to_end(&mut out)
                .expect("zlib chunk");
            out
        }
        other => panic!("unknown chunk tag {other}"),
    }
}

/// `path` relative to `prefix`, when it is a direct child.
fn direct_child<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = path.strip_prefix(prefix)?;
    (!rest.is_empty() && !rest.contains('/')).then_some(rest)
}

fn sim_session(config: SessionConfig, free_ram: u64, has_deflate: bool) -> (Session, FakePort, SimRef) {
    let sim: SimRef = Rc::new(RefCell::new(Sim {
        free_ram,
        has_deflate,
        ..Sim::default()
    }));
    let answering = Rc::clone(&sim);
    let board = FakeBoard::new()
        .paste_window(1024)
        .on_exec(move |code| answer(&answering, code));
    let port = FakePort::board(board);
    let session = Session::bind(Transport::fake(port.clone()), config);
    (session, port, sim)
}

fn exec_count(port: &FakePort) -> usize {
    port.with_board(|b| b.execs.len())
}

/// Deterministic pseudo-random bytes (xorshift).
fn pseudo_random(len: usize) -> Vec<u8> {
    let mut state = 0x2545_f491_4f6c_dd1du64;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 24) as u8
        })
        .collect()
}

#[test]
fn fresh_session_lists_root() {
    let (mut session, _port, sim) = sim_session(SessionConfig::serial("/dev/sim"), 0, false);
    {
        let mut s = sim.borrow_mut();
        s.files.insert("boot.py".into(), b"x" .repeat(12));
        s.dirs.insert("lib".into());
    }
    let listing = session.ls("/").unwrap();
    assert_eq!(
        listing,
        vec![("lib".to_owned(), None), ("boot.py".to_owned(), Some(12))]
    );
}

#[test]
fn ls_of_missing_dir_is_dir_not_found() {
    let (mut session, _port, _sim) = sim_session(SessionConfig::serial("/dev/sim"), 0, false);
    assert!(matches!(
        session.ls("/nope"),
        Err(Error::DirNotFound(p)) if p == "/nope"
    ));
}

#[test]
fn put_then_execute_prints() {
    let cfg = SessionConfig::serial("/dev/sim").chunk_size(4096);
    let (mut session, _port, sim) = sim_session(cfg, 0, false);
    session.put("h.py", b"print('hi')\n", None).unwrap();
    assert_eq!(sim.borrow().files.get("h.py").unwrap(), b"print('hi')\n");
    let out = session.exec("exec(open('h.py').read())").unwrap();
    assert_eq!(out, b"hi\r\n");
}

#[test]
fn large_binary_round_trip_uncompressed() {
    let cfg = SessionConfig::serial("/dev/sim")
        .chunk_size(4096)
        .compress(Compress::Off);
    let (mut session, _port, sim) = sim_session(cfg, 0, false);

    let data = pseudo_random(65_536);
    session.put("blob.bin", &data, None).unwrap();
    assert_eq!(sim.borrow().files.get("blob.bin").unwrap(), &data);

    let back = session.get("blob.bin", None).unwrap();
    assert_eq!(back.len(), 65_536);
    assert_eq!(Sha256::digest(&back), Sha256::digest(&data));
}

#[test]
fn zero_byte_file_round_trips() {
    let cfg = SessionConfig::serial("/dev/sim").chunk_size(512);
    let (mut session, _port, sim) = sim_session(cfg, 0, false);
    session.put("empty", b"", None).unwrap();
    assert_eq!(sim.borrow().files.get("empty").unwrap(), b"");
    assert_eq!(session.get("empty", None).unwrap(), b"");
}

#[test]
fn chunk_multiple_has_no_trailing_empty_chunk() {
    let cfg = SessionConfig::serial("/dev/sim").chunk_size(512);
    let (mut session, port, _sim) = sim_session(cfg, 0, false);
    session.put("even.bin", &[7u8; 1024], None).unwrap();
    let writes = port.with_board(|b| {
        b.execs
            .iter()
            .filter(|c| c.contains("_mx_wb("))
            .count()
    });
    assert_eq!(writes, 2, "exactly 1024/512 chunks, no empty tail");
}

#[test]
fn compressed_round_trip() {
    let cfg = SessionConfig::serial("/dev/sim")
        .chunk_size(16_384)
        .compress(Compress::On);
    let (mut session, _port, sim) = sim_session(cfg, 256 * 1024, true);

    let data = b"the quick brown fox jumps over the lazy dog\n".repeat(500);
    let outcome = session.put("text.txt", &data, None).unwrap();
    assert!(outcome.encodings.contains(&crate::device::Encoding::Compressed));
    assert_eq!(sim.borrow().files.get("text.txt").unwrap(), &data);

    let back = session.get("text.txt", None).unwrap();
    assert_eq!(back, data);
}

#[test]
fn forced_compression_without_deflate_fails() {
    let cfg = SessionConfig::serial("/dev/sim")
        .chunk_size(4096)
        .compress(Compress::On);
    let (mut session, _port, _sim) = sim_session(cfg, 64 * 1024, false);
    assert!(matches!(
        session.put("x", b"data", None),
        Err(Error::CompressionUnavailable)
    ));
}

#[test]
fn progress_fires_per_chunk() {
    let cfg = SessionConfig::serial("/dev/sim").chunk_size(256);
    let (mut session, _port, _sim) = sim_session(cfg, 0, false);
    let mut seen = Vec::new();
    let mut cb = |done: u64, total: u64| seen.push((done, total));
    session.put("p.bin", &[1u8; 700], Some(&mut cb)).unwrap();
    assert_eq!(seen, vec![(256, 700), (512, 700), (700, 700)]);
}

#[test]
fn upload_set_skips_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let mut items = Vec::new();
    for i in 0..9 {
        let path = dir.path().join(format!("f{i}.py"));
        std::fs::write(&path, format!("value = {i}\n")).unwrap();
        items.push(TransferItem::new(path, format!("/f{i}.py")));
    }

    let cfg = SessionConfig::serial("/dev/sim").chunk_size(4096);
    let (mut session, port, _sim) = sim_session(cfg, 0, false);

    let first = session.upload(&items, None).unwrap();
    assert_eq!((first.transferred, first.skipped), (9, 0));

    // Change three sources.
    for i in 0..3 {
        let path = dir.path().join(format!("f{i}.py"));
        std::fs::write(&path, format!("value = {i} + 100\n")).unwrap();
    }
    let second = session.upload(&items, None).unwrap();
    assert_eq!((second.transferred, second.skipped), (3, 6));

    // A third run with nothing changed costs exactly one code unit: the
    // batched fileinfo round-trip.
    let before = exec_count(&port);
    let third = session.upload(&items, None).unwrap();
    assert_eq!((third.transferred, third.skipped), (0, 9));
    assert_eq!(exec_count(&port) - before, 1);
}

#[test]
fn force_bypasses_skip_phase() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.py");
    std::fs::write(&path, "a = 1\n").unwrap();
    let items = vec![TransferItem::new(path, "/a.py")];

    let cfg = SessionConfig::serial("/dev/sim").chunk_size(4096).force(true);
    let (mut session, port, _sim) = sim_session(cfg, 0, false);
    session.upload(&items, None).unwrap();
    session.upload(&items, None).unwrap();
    let fileinfo_calls = port.with_board(|b| {
        b.execs.iter().filter(|c| c.contains("_mx_fi(")).count()
    });
    assert_eq!(fileinfo_calls, 0);
}

#[test]
fn download_writes_local_files() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = SessionConfig::serial("/dev/sim").chunk_size(4096);
    let (mut session, _port, sim) = sim_session(cfg, 0, false);
    sim.borrow_mut()
        .files
        .insert("data.txt".into(), b"from device\n".to_vec());

    let local = dir.path().join("data.txt");
    let items = vec![TransferItem::new(&local, "data.txt")];
    let report = session.download(&items, None).unwrap();
    assert_eq!(report.transferred, 1);
    assert_eq!(std::fs::read(&local).unwrap(), b"from device\n");

    // Unchanged local copy: second download is skipped.
    let again = session.download(&items, None).unwrap();
    assert_eq!((again.transferred, again.skipped), (0, 1));
}

#[test]
fn stat_and_delete_and_mkdir() {
    let (mut session, _port, sim) = sim_session(SessionConfig::serial("/dev/sim"), 0, false);
    sim.borrow_mut().files.insert("kill.me".into(), vec![1, 2]);

    assert_eq!(session.stat("kill.me").unwrap(), crate::device::Stat::File(2));
    assert_eq!(session.stat("/").unwrap(), crate::device::Stat::Dir);
    assert_eq!(session.stat("ghost").unwrap(), crate::device::Stat::Absent);

    assert!(matches!(
        session.delete("ghost"),
        Err(Error::PathNotFound(_))
    ));
}

#[test]
fn mount_overlap_rejected_and_remount_after_soft_reset() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("m.py"), b"print('ok')\n").unwrap();

    let cfg = SessionConfig::serial("/dev/sim").chunk_size(4096);
    let (mut session, port, _sim) = sim_session(cfg, 0, false);

    session.mount(dir.path(), "/remote", MountOptions::new()).unwrap();
    assert_eq!(session.mount_points(), vec!["/remote".to_owned()]);

    // Nested and identical mount points are refused.
    assert!(matches!(
        session.mount(dir.path(), "/remote/sub", MountOptions::new()),
        Err(Error::MountOverlap(_))
    ));
    assert!(matches!(
        session.mount(dir.path(), "/remote", MountOptions::new()),
        Err(Error::MountOverlap(_))
    ));

    // Soft reset: the agent and the mount call are replayed and the CWD
    // restored to the first mount point, without caller action.
    let before = port.with_board(|b| b.execs.clone());
    assert_eq!(
        before.iter().filter(|c| c.starts_with("_mx_mnt(")).count(),
        1
    );
    session.soft_reset().unwrap();
    let after = port.with_board(|b| b.execs.clone());
    assert_eq!(
        after.iter().filter(|c| c.starts_with("_mx_mnt(")).count(),
        2,
        "mount call replayed"
    );
    assert!(
        after.iter().any(|c| c.contains("os.chdir('/remote')")),
        "cwd restored"
    );
    assert_eq!(session.mount_points(), vec!["/remote".to_owned()]);
}

#[test]
fn umount_removes_registration() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = SessionConfig::serial("/dev/sim").chunk_size(4096);
    let (mut session, port, _sim) = sim_session(cfg, 0, false);

    session.mount(dir.path(), "/remote", MountOptions::new()).unwrap();
    session.umount("/remote").unwrap();
    assert!(session.mount_points().is_empty());
    assert!(
        port.with_board(|b| b.execs.iter().any(|c| c.contains("os.umount('/remote')"))),
        "umount code unit submitted"
    );
    assert!(matches!(
        session.umount("/remote"),
        Err(Error::PathNotFound(_))
    ));
}

#[test]
fn getcwd_roundtrip_shapes() {
    let (mut session, port, _sim) = sim_session(SessionConfig::serial("/dev/sim"), 0, false);
    // The sim answers unhandled expressions with a NameError; getcwd is
    // not part of the sim, so just assert the unit shape goes out.
    let _ = session.getcwd();
    assert!(
        port.with_board(|b| b.execs.iter().any(|c| c == "print(repr(os.getcwd()))"))
    );
}
