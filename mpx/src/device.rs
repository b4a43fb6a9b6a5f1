//! High-level device operations.
//!
//! Each operation composes one or more short code units that print their
//! result as a literal (see [`crate::literal`]). Expensive operations are
//! batched on the device by a set of helper functions installed once per
//! session; the install is redone automatically after any reset.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::literal::Value;
use crate::session::Session;

/// Per-chunk progress callback: `(transferred, total)` in content bytes.
pub type Progress<'a> = &'a mut dyn FnMut(u64, u64);

/// Helper functions installed on the device in one code unit.
///
/// `_mx_f` is the module-level file object the chunked `get`/`put` paths
/// operate on; the read/write helpers tag every payload with its encoding
/// in the first byte (`r` raw, `b` base64, `z` deflate).
pub(crate) const HELPERS_UNIT: &str = "\
import os,sys,gc,io,binascii
try:
 import deflate
except ImportError:
 deflate=None
try:
 import hashlib
except ImportError:
 hashlib=None
def _mx_j(p,n):
 if not p:return n
 if p=='/':return '/'+n
 return p+'/'+n
def _mx_st(p):
 try:
  s=os.stat(p)
 except OSError:
  return None
 m=s[0]&0xf000
 if m==0x4000:return -1
 if m==0x8000:return s[6]
 return None
def _mx_tr(p):
 D=[];F=[];t=0
 for e in os.ilistdir(p):
  n=e[0];m=e[1]&0xf000
  if m==0x8000:
   z=e[3] if len(e)>3 else 0
   F.append((n,z,None));t+=z
  elif m==0x4000:
   c=_mx_tr(_mx_j(p,n))
   D.append((n,c[1],c[2]));t+=c[1]
 return (p,t,D+F)
def _mx_md(p):
 c='/' if p[:1]=='/' else ''
 for d in [x for x in p.split('/') if x]:
  c=c+d
  try:
   if os.stat(c)[0]&0xf000!=0x4000:return 1
  except OSError:
   os.mkdir(c)
  c=c+'/'
 return 0
def _mx_rm(p):
 for e in os.ilistdir(p):
  q=_mx_j(p,e[0])
  if e[1]&0xf000==0x4000:
   _mx_rm(q)
  else:
   os.remove(q)
 os.rmdir(p)
def _mx_hs(p):
 if not hashlib:return None
 h=hashlib.sha256()
 with open(p,'rb') as f:
  while True:
   c=f.read(512)
   if not c:break
   h.update(c)
 return binascii.b2a_base64(h.digest()).strip()
def _mx_fi(d):
 r={}
 for p,x in d.items():
  s=_mx_st(p)
  if s is None or s<0:
   r[p]=None
  else:
   r[p]=(s,_mx_hs(p) if s==x else None)
 gc.collect()
 return r
def _mx_rb(n):
 d=_mx_f.read(n)
 if not d:return b''
 return b'b'+binascii.b2a_base64(d).strip()
def _mx_rz(n):
 d=_mx_f.read(n)
 if not d:return b''
 b=io.BytesIO()
 z=deflate.DeflateIO(b,deflate.ZLIB)
 z.write(d)
 z.close()
 c=b.getvalue()
 if len(c)<len(d):
  return b'z'+binascii.b2a_base64(c).strip()
 return b'b'+binascii.b2a_base64(d).strip()
def _mx_wb(p):
 t=p[:1];d=p[1:]
 if t==b'b':
  d=binascii.a2b_base64(d)
 elif t==b'z':
  if d[:1]==b'b':
   d=binascii.a2b_base64(d[1:])
  else:
   d=d[1:]
  d=deflate.DeflateIO(io.BytesIO(d)).read()
 return _mx_f.write(d)
def _mx_vf():
 r=[]
 for m in ('/','/flash','/sd'):
  try:
   s=os.statvfs(m)
   r.append((m,s[1]*s[2],s[1]*s[3]))
  except OSError:
   pass
 return r";

/// Directory attribute bit in `os.stat` / `os.ilistdir` mode words.
const ATTR_DIR: i64 = 0x4000;
/// Regular-file attribute bit.
const ATTR_FILE: i64 = 0x8000;

/// Result of a single-round-trip `stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stat {
    /// Path does not exist.
    Absent,
    /// Path is a directory.
    Dir,
    /// Path is a file of this size.
    File(u64),
}

/// One node of a recursive [`Session::tree`] listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeEntry {
    /// Name (or, for the root node, the queried path).
    pub name: String,
    /// File size, or total size of all descendant files.
    pub size: u64,
    /// `None` for files; child entries for directories.
    pub children: Option<Vec<TreeEntry>>,
}

/// Per-destination result of a batched [`Session::fileinfo`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteFileInfo {
    /// Destination does not exist (or is a directory).
    Absent,
    /// Exists with a different size; no hash was computed.
    SizeMismatch {
        /// Actual size on the device.
        size: u64,
    },
    /// Size matches; hash of the device file for comparison.
    SizeMatch {
        /// Size on the device.
        size: u64,
        /// SHA-256 of the device file.
        sha256: Vec<u8>,
    },
}

/// On-wire encoding used for a transfer chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Encoding {
    /// Bytes-literal, for 8-bit-clean chunks that repr compactly.
    Raw,
    /// Base64, the safe default on the REPL channel.
    Base64,
    /// Deflate-compressed (then base64 or raw, whichever is smaller).
    Compressed,
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Raw => "raw",
            Self::Base64 => "base64",
            Self::Compressed => "compressed",
        })
    }
}

/// What a [`Session::put`] actually sent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PutOutcome {
    /// Encodings used across the file's chunks.
    pub encodings: std::collections::BTreeSet<Encoding>,
    /// Bytes that went over the wire, including command overhead.
    pub wire_bytes: u64,
}

/// Heap usage snapshot from [`Session::memory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryUsage {
    /// Allocated heap bytes after a collect.
    pub alloc: u64,
    /// Free heap bytes.
    pub free: u64,
}

impl MemoryUsage {
    /// Total managed heap.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.alloc + self.free
    }
}

/// One mounted filesystem from [`Session::filesystems`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilesystemInfo {
    /// Mount point on the device.
    pub mount: String,
    /// Capacity in bytes.
    pub total: u64,
    /// Free bytes.
    pub free: u64,
}

impl FilesystemInfo {
    /// Bytes in use.
    #[must_use]
    pub fn used(&self) -> u64 {
        self.total.saturating_sub(self.free)
    }
}

/// Escapes a path for embedding in a single-quoted Python string.
pub(crate) fn py_str_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Renders bytes as a Python bytes literal.
pub(crate) fn py_bytes_literal(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() + 3);
    out.push_str("b'");
    for &b in data {
        match b {
            b'\\' => out.push_str("\\\\"),
            b'\'' => out.push_str("\\'"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(b as char),
            _ => out.push_str(&format!("\\x{b:02x}")),
        }
    }
    out.push('\'');
    out
}

impl Session {
    /// Lists a directory: `(name, Some(size))` for files, `(name, None)`
    /// for directories, directories first.
    pub fn ls(&mut self, path: &str) -> Result<Vec<(String, Option<u64>)>> {
        self.ensure_helpers()?;
        let value = self
            .exec_eval(&format!("tuple(os.ilistdir('{}'))", py_str_escape(path)))
            .map_err(|e| match e {
                Error::Cmd { .. } => Error::DirNotFound(path.to_owned()),
                other => other,
            })?;
        let entries = value
            .items()
            .ok_or_else(|| Error::BadReply("ls expects a tuple".into()))?;
        let mut dirs = Vec::new();
        let mut files = Vec::new();
        for entry in entries {
            let fields = entry
                .items()
                .ok_or_else(|| Error::BadReply("ls entry shape".into()))?;
            let name = fields
                .first()
                .and_then(Value::as_str)
                .ok_or_else(|| Error::BadReply("ls entry name".into()))?
                .to_owned();
            let attr = fields.get(1).and_then(Value::as_int).unwrap_or(0) & 0xf000;
            if attr == ATTR_DIR {
                dirs.push((name, None));
            } else if attr == ATTR_FILE {
                let size = fields.get(3).and_then(Value::as_u64).unwrap_or(0);
                files.push((name, Some(size)));
            }
        }
        dirs.extend(files);
        Ok(dirs)
    }

    /// Stats a path in a single round-trip.
    pub fn stat(&mut self, path: &str) -> Result<Stat> {
        self.ensure_helpers()?;
        let value = self.exec_eval(&format!("_mx_st('{}')", py_str_escape(path)))?;
        stat_of(&value)
    }

    /// Recursive listing with per-directory total sizes.
    pub fn tree(&mut self, path: &str) -> Result<TreeEntry> {
        self.ensure_helpers()?;
        if !matches!(path, "" | "." | "/") {
            match self.stat(path)? {
                Stat::Absent => return Err(Error::DirNotFound(path.to_owned())),
                Stat::File(size) => {
                    return Ok(TreeEntry {
                        name: path.to_owned(),
                        size,
                        children: None,
                    });
                }
                Stat::Dir => {}
            }
        }
        let value = self.exec_eval(&format!("_mx_tr('{}')", py_str_escape(path)))?;
        tree_of(&value)
    }

    /// Creates `path` and any missing parents as directories.
    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        self.ensure_helpers()?;
        let value = self.exec_eval(&format!("_mx_md('{}')", py_str_escape(path)))?;
        if value.as_int() == Some(0) {
            Ok(())
        } else {
            Err(Error::Cmd {
                cmd: format!("mkdir {path}"),
                stdout: Vec::new(),
                stderr: format!("a segment of '{path}' exists and is a file"),
            })
        }
    }

    /// Deletes a file, or a directory recursively (leaves first).
    pub fn delete(&mut self, path: &str) -> Result<()> {
        match self.stat(path)? {
            Stat::Absent => Err(Error::PathNotFound(path.to_owned())),
            Stat::Dir => {
                self.exec_with_timeout(
                    &format!("_mx_rm('{}')", py_str_escape(path)),
                    Duration::from_secs(20),
                )?;
                Ok(())
            }
            Stat::File(_) => {
                self.exec(&format!("os.remove('{}')", py_str_escape(path)))?;
                Ok(())
            }
        }
    }

    /// Renames (moves) a file or directory.
    pub fn rename(&mut self, src: &str, dst: &str) -> Result<()> {
        self.ensure_helpers()?;
        self.exec(&format!(
            "os.rename('{}','{}')",
            py_str_escape(src),
            py_str_escape(dst)
        ))?;
        Ok(())
    }

    /// SHA-256 of a device file; `None` when the device has no hashing
    /// facility.
    pub fn hashfile(&mut self, path: &str) -> Result<Option<Vec<u8>>> {
        self.ensure_helpers()?;
        let value = self.exec_eval(&format!("_mx_hs('{}')", py_str_escape(path)))?;
        match value {
            Value::None => Ok(None),
            Value::Bytes(b64) => {
                let digest = BASE64
                    .decode(&b64)
                    .map_err(|e| Error::BadReply(format!("hash base64: {e}")))?;
                Ok(Some(digest))
            }
            _ => Err(Error::BadReply("hashfile reply shape".into())),
        }
    }

    /// Size and hash of many destinations in one round-trip. The hash is
    /// only computed device-side when the size matches the expectation.
    pub fn fileinfo(
        &mut self,
        expected: &BTreeMap<String, u64>,
    ) -> Result<BTreeMap<String, RemoteFileInfo>> {
        self.ensure_helpers()?;
        let mut arg = String::from("{");
        for (path, size) in expected {
            arg.push_str(&format!("'{}':{size},", py_str_escape(path)));
        }
        arg.push('}');
        #[allow(clippy::cast_possible_truncation)]
        let timeout =
            self.timeout().max(Duration::from_secs(5)) + Duration::from_millis(500) * expected.len() as u32;
        let value = self.exec_eval_with_timeout(&format!("_mx_fi({arg})"), timeout)?;
        let Value::Dict(pairs) = value else {
            return Err(Error::BadReply("fileinfo expects a dict".into()));
        };
        let mut out = BTreeMap::new();
        for (key, info) in pairs {
            let path = key
                .as_str()
                .ok_or_else(|| Error::BadReply("fileinfo key".into()))?
                .to_owned();
            out.insert(path, remote_info_of(&info)?);
        }
        Ok(out)
    }

    /// Reads a device file, chunked, optionally decompressing.
    pub fn get(&mut self, path: &str, mut progress: Option<Progress<'_>>) -> Result<Vec<u8>> {
        self.ensure_helpers()?;
        let total = if progress.is_some() {
            match self.stat(path)? {
                Stat::File(size) => size,
                _ => 0,
            }
        } else {
            0
        };
        let chunk = self.negotiated_chunk_size()?;
        let compressed = self.resolve_compression(None)?;
        self.exec(&format!("_mx_f=open('{}','rb')", py_str_escape(path)))
            .map_err(|e| match e {
                Error::Cmd { .. } => Error::FileNotFound(path.to_owned()),
                other => other,
            })?;
        let reader = if compressed { "_mx_rz" } else { "_mx_rb" };
        let mut data = Vec::new();
        loop {
            let value = self.exec_eval(&format!("{reader}({chunk})"))?;
            let payload = value
                .as_bytes()
                .ok_or_else(|| Error::BadReply("get chunk shape".into()))?;
            if payload.is_empty() {
                break;
            }
            let (&tag, body) = payload.split_first().unwrap_or((&b'b', &[]));
            let decoded = BASE64
                .decode(body)
                .map_err(|e| Error::BadReply(format!("get chunk base64: {e}")))?;
            match tag {
                b'b' => data.extend_from_slice(&decoded),
                b'z' => {
                    let mut inflated = Vec::new();
                    let mut dec = flate2::read::ZlibDecoder::new(&decoded[..]);
                    std::io::Read::read_to_end(&mut dec, &mut inflated)
                        .map_err(|e| Error::BadReply(format!("get chunk inflate: {e}")))?;
                    data.extend_from_slice(&inflated);
                }
                _ => return Err(Error::BadReply("get chunk tag".into())),
            }
            if let Some(cb) = progress.as_mut() {
                cb(data.len() as u64, total);
            }
        }
        self.exec("_mx_f.close()")?;
        Ok(data)
    }

    /// Writes a device file, chunked, choosing the cheapest encoding per
    /// chunk.
    ///
    /// A put that fails part-way leaves a truncated file behind: the
    /// destination is opened with truncation by the first chunk and only
    /// completed by the last.
    pub fn put(
        &mut self,
        path: &str,
        data: &[u8],
        mut progress: Option<Progress<'_>>,
    ) -> Result<PutOutcome> {
        self.ensure_helpers()?;
        let chunk_size = self.negotiated_chunk_size()?;
        let compress = self.resolve_compression(Some(data))?;
        let total = data.len() as u64;
        let mut outcome = PutOutcome::default();

        self.exec(&format!("_mx_f=open('{}','wb')", py_str_escape(path)))?;
        let mut sent = 0usize;
        while sent < data.len() {
            let end = (sent + chunk_size).min(data.len());
            let chunk = &data[sent..end];
            let (literal, encoding) = encode_chunk(chunk, compress);
            let expr = format!("_mx_wb({literal})");
            // Wire accounting includes the print/repr wrapper around the
            // submitted expression.
            outcome.wire_bytes += expr.len() as u64 + "print(repr())".len() as u64;
            outcome.encodings.insert(encoding);
            let written = self
                .exec_eval_with_timeout(&expr, self.timeout().max(Duration::from_secs(10)))?;
            if written.as_u64().is_none() {
                return Err(Error::BadReply("put chunk reply shape".into()));
            }
            sent = end;
            if let Some(cb) = progress.as_mut() {
                cb(sent as u64, total);
            }
        }
        self.exec("_mx_f.close()")?;
        self.exec("gc.collect()")?;
        Ok(outcome)
    }

    /// Current device working directory.
    pub fn getcwd(&mut self) -> Result<String> {
        self.ensure_helpers()?;
        let value = self.exec_eval("os.getcwd()")?;
        value
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| Error::BadReply("getcwd reply shape".into()))
    }

    /// Changes the device working directory.
    pub fn chdir(&mut self, path: &str) -> Result<()> {
        self.ensure_helpers()?;
        self.exec(&format!("os.chdir('{}')", py_str_escape(path)))
            .map_err(|e| match e {
                Error::Cmd { .. } => Error::DirNotFound(path.to_owned()),
                other => other,
            })?;
        Ok(())
    }

    /// The module search path as the device sees it.
    pub fn get_sys_path(&mut self) -> Result<Vec<String>> {
        self.ensure_helpers()?;
        let value = self.exec_eval("sys.path")?;
        sys_path_of(&value)
    }

    /// Replaces the module search path (deduplicated, order preserved).
    pub fn set_sys_path(&mut self, entries: &[String]) -> Result<Vec<String>> {
        self.ensure_helpers()?;
        let mut seen = std::collections::BTreeSet::new();
        let mut literal = String::from("[");
        for entry in entries {
            if seen.insert(entry.as_str()) {
                literal.push_str(&format!("'{}',", py_str_escape(entry)));
            }
        }
        literal.push(']');
        let stdout = self.exec(&format!("sys.path[:]={literal}\nprint(repr(sys.path))"))?;
        sys_path_of(&crate::literal::parse(&stdout)?)
    }

    /// Moves (or inserts) an entry at the front of the search path.
    pub fn prepend_sys_path(&mut self, entry: &str) -> Result<Vec<String>> {
        self.sys_path_edit(entry, "sys.path.insert(0,_mx_p)")
    }

    /// Moves (or inserts) an entry at the end of the search path.
    pub fn append_sys_path(&mut self, entry: &str) -> Result<Vec<String>> {
        self.sys_path_edit(entry, "sys.path.append(_mx_p)")
    }

    /// Removes an entry from the search path, if present.
    pub fn remove_from_sys_path(&mut self, entry: &str) -> Result<Vec<String>> {
        self.sys_path_edit(entry, "pass")
    }

    fn sys_path_edit(&mut self, entry: &str, insert: &str) -> Result<Vec<String>> {
        self.ensure_helpers()?;
        let code = format!(
            "_mx_p='{}'\nif _mx_p in sys.path:\n sys.path.remove(_mx_p)\n{insert}\nprint(repr(sys.path))",
            py_str_escape(entry)
        );
        let stdout = self.exec(&code)?;
        sys_path_of(&crate::literal::parse(&stdout)?)
    }

    /// Heap usage after a collect.
    pub fn memory(&mut self) -> Result<MemoryUsage> {
        self.ensure_helpers()?;
        let value = self.exec_eval("(gc.collect(),gc.mem_alloc(),gc.mem_free())[1:]")?;
        let pair = value
            .items()
            .filter(|v| v.len() == 2)
            .ok_or_else(|| Error::BadReply("memory reply shape".into()))?;
        Ok(MemoryUsage {
            alloc: pair[0]
                .as_u64()
                .ok_or_else(|| Error::BadReply("memory alloc".into()))?,
            free: pair[1]
                .as_u64()
                .ok_or_else(|| Error::BadReply("memory free".into()))?,
        })
    }

    /// Capacity and free space of the device's mounted filesystems.
    pub fn filesystems(&mut self) -> Result<Vec<FilesystemInfo>> {
        self.ensure_helpers()?;
        let value = self.exec_eval("_mx_vf()")?;
        let entries = value
            .items()
            .ok_or_else(|| Error::BadReply("filesystems reply shape".into()))?;
        let mut out = Vec::new();
        for entry in entries {
            let fields = entry
                .items()
                .filter(|f| f.len() == 3)
                .ok_or_else(|| Error::BadReply("filesystems entry".into()))?;
            out.push(FilesystemInfo {
                mount: fields[0]
                    .as_str()
                    .ok_or_else(|| Error::BadReply("filesystems mount".into()))?
                    .to_owned(),
                total: fields[1].as_u64().unwrap_or(0),
                free: fields[2].as_u64().unwrap_or(0),
            });
        }
        Ok(out)
    }
}

/// Picks the smallest of raw / base64 / compressed renderings.
pub(crate) fn encode_chunk(chunk: &[u8], compress: bool) -> (String, Encoding) {
    let mut tagged = Vec::with_capacity(chunk.len() + 1);
    tagged.push(b'r');
    tagged.extend_from_slice(chunk);
    let raw = py_bytes_literal(&tagged);

    let mut best = (raw, Encoding::Raw);

    let b64 = {
        let mut t = Vec::with_capacity(chunk.len() * 4 / 3 + 2);
        t.push(b'b');
        t.extend_from_slice(BASE64.encode(chunk).as_bytes());
        py_bytes_literal(&t)
    };
    if b64.len() < best.0.len() {
        best = (b64, Encoding::Base64);
    }

    if compress {
        let mut enc =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        let deflated = std::io::Write::write_all(&mut enc, chunk)
            .ok()
            .and_then(|()| enc.finish().ok());
        if let Some(deflated) = deflated {
            // Inner tag: raw zlib bytes or base64, whichever reprs smaller.
            let mut zr = Vec::with_capacity(deflated.len() + 2);
            zr.extend_from_slice(b"zr");
            zr.extend_from_slice(&deflated);
            let mut zb = Vec::with_capacity(deflated.len() * 4 / 3 + 2);
            zb.extend_from_slice(b"zb");
            zb.extend_from_slice(BASE64.encode(&deflated).as_bytes());
            let z_raw = py_bytes_literal(&zr);
            let z_b64 = py_bytes_literal(&zb);
            let z = if z_raw.len() <= z_b64.len() { z_raw } else { z_b64 };
            if z.len() < best.0.len() {
                best = (z, Encoding::Compressed);
            }
        }
    }
    best
}

fn stat_of(value: &Value) -> Result<Stat> {
    match value {
        Value::None => Ok(Stat::Absent),
        Value::Int(n) if *n < 0 => Ok(Stat::Dir),
        Value::Int(n) => Ok(Stat::File(u64::try_from(*n).unwrap_or(0))),
        _ => Err(Error::BadReply("stat reply shape".into())),
    }
}

fn tree_of(value: &Value) -> Result<TreeEntry> {
    let fields = value
        .items()
        .filter(|f| f.len() == 3)
        .ok_or_else(|| Error::BadReply("tree entry shape".into()))?;
    let name = fields[0]
        .as_str()
        .ok_or_else(|| Error::BadReply("tree entry name".into()))?
        .to_owned();
    let size = fields[1]
        .as_u64()
        .ok_or_else(|| Error::BadReply("tree entry size".into()))?;
    let children = match &fields[2] {
        Value::None => None,
        listing => Some(
            listing
                .items()
                .ok_or_else(|| Error::BadReply("tree children shape".into()))?
                .iter()
                .map(tree_of)
                .collect::<Result<Vec<_>>>()?,
        ),
    };
    Ok(TreeEntry {
        name,
        size,
        children,
    })
}

fn remote_info_of(value: &Value) -> Result<RemoteFileInfo> {
    match value {
        Value::None => Ok(RemoteFileInfo::Absent),
        Value::Tuple(fields) if fields.len() == 2 => {
            let size = fields[0]
                .as_u64()
                .ok_or_else(|| Error::BadReply("fileinfo size".into()))?;
            match &fields[1] {
                Value::None => Ok(RemoteFileInfo::SizeMismatch { size }),
                Value::Bytes(b64) => {
                    let sha256 = BASE64
                        .decode(b64)
                        .map_err(|e| Error::BadReply(format!("fileinfo hash: {e}")))?;
                    Ok(RemoteFileInfo::SizeMatch { size, sha256 })
                }
                _ => Err(Error::BadReply("fileinfo hash shape".into())),
            }
        }
        _ => Err(Error::BadReply("fileinfo entry shape".into())),
    }
}

fn sys_path_of(value: &Value) -> Result<Vec<String>> {
    value
        .items()
        .ok_or_else(|| Error::BadReply("sys.path reply shape".into()))?
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_owned)
                .ok_or_else(|| Error::BadReply("sys.path entry".into()))
        })
        .collect()
}
