//! Host-side servicing of mount requests against a local directory tree.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use mpx_proto::{OpenMode, Reply, Request, err};

use super::mpy_cross::{BOOT_FILES, MpyCross};

/// Upper bound on concurrently open handles per mount.
const MAX_OPEN_FILES: usize = 64;

/// One live mount: local root, policy, submounts, and open-file table.
#[derive(Debug)]
pub struct MountHandler {
    /// Identifier baked into the device-side VFS instance.
    mount_id: u8,
    /// Absolute device path the VFS is registered at.
    mount_point: String,
    /// Canonicalised host root.
    root: PathBuf,
    writable: bool,
    /// `(device-relative path, canonical host path)`, longest prefix wins.
    submounts: Vec<(String, PathBuf)>,
    compiler: Option<MpyCross>,
    files: BTreeMap<u16, OpenFile>,
}

#[derive(Debug)]
struct OpenFile {
    file: File,
    /// Append handles keep their cursor at the end across writes.
    append: bool,
}

impl MountHandler {
    /// Creates a handler over an already-canonicalised root.
    pub fn new(
        mount_id: u8,
        mount_point: impl Into<String>,
        root: PathBuf,
        writable: bool,
        compiler: Option<MpyCross>,
    ) -> Self {
        Self {
            mount_id,
            mount_point: mount_point.into(),
            root,
            writable,
            submounts: Vec::new(),
            compiler,
            files: BTreeMap::new(),
        }
    }

    /// Identifier baked into the device-side VFS instance.
    #[must_use]
    pub fn mount_id(&self) -> u8 {
        self.mount_id
    }

    /// Absolute device path this mount is registered at.
    #[must_use]
    pub fn mount_point(&self) -> &str {
        &self.mount_point
    }

    /// Registers a virtual submount at a device-relative path.
    pub fn add_submount(&mut self, subpath: impl Into<String>, local: PathBuf) {
        let sub = subpath.into();
        let sub = sub.trim_matches('/').to_owned();
        self.submounts.push((sub, local));
        // Longest prefix first so nested submounts shadow their parents.
        self.submounts.sort_by_key(|(p, _)| std::cmp::Reverse(p.len()));
    }

    /// Closes every open handle; used on teardown and after a soft reset
    /// invalidated the device-side file objects.
    pub fn close_all(&mut self) {
        self.files.clear();
    }

    /// Services one request. Never fails outward: every problem becomes an
    /// error reply so the blocked device always unblocks.
    pub fn service(&mut self, req: Request) -> Reply {
        tracing::debug!(mount = self.mount_id, ?req, "vfs request");
        if req.is_mutating() && !self.writable {
            return Reply::Err(err::EROFS);
        }
        match req {
            Request::Stat { path } => self.stat(&path),
            Request::Listdir { path } => self.listdir(&path),
            Request::Open { path, mode } => self.open(&path, mode),
            Request::Read { handle, n } => self.read(handle, n),
            Request::Write { handle, data } => self.write(handle, &data),
            Request::Close { handle } => self.close(handle),
            Request::Remove { path } => self.remove(&path),
            Request::Mkdir { path } => self.mkdir(&path),
            Request::Rename { from, to } => self.rename(&from, &to),
        }
    }

    /// Maps a device path into the host tree.
    ///
    /// Submounts take priority by longest matching prefix. The result is
    /// canonicalised with symlinks resolved; anything that lands outside
    /// the owning root is rejected, however the traversal was spelled.
    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let rel = path.trim_matches('/');
        for (sub, local) in &self.submounts {
            if rel == sub || rel.starts_with(&format!("{sub}/")) {
                let remainder = rel[sub.len()..].trim_start_matches('/');
                return resolve_within(local, remainder);
            }
        }
        resolve_within(&self.root, rel)
    }

    /// Whether `path` is an intermediate directory that exists only
    /// because a submount is registered somewhere below it.
    fn is_virtual_dir(&self, path: &str) -> bool {
        let prefix = path.trim_matches('/');
        if prefix.is_empty() {
            return false;
        }
        self.submounts
            .iter()
            .any(|(sub, _)| sub.starts_with(&format!("{prefix}/")))
    }

    fn stat(&mut self, path: &str) -> Reply {
        let Some(local) = self.resolve(path) else {
            return Reply::Err(err::EACCES);
        };

        // With a compile policy, stat of a compilable .py reports absence so
        // the importer falls through to the .mpy counterpart; stat of the
        // .mpy reports the compiled artifact.
        if let Some(cross) = &self.compiler {
            if path.ends_with(".py") {
                let boot = local
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| BOOT_FILES.contains(&n));
                if !boot {
                    match fs::metadata(&local) {
                        Ok(meta) if meta.len() > 0 && cross.compile(&local).is_some() => {
                            return Reply::Err(err::ENOENT);
                        }
                        Ok(meta) => return stat_reply(&meta),
                        Err(_) => return Reply::Err(err::ENOENT),
                    }
                }
            } else if path.ends_with(".mpy") {
                let src = local.with_extension("py");
                if src.is_file() {
                    if let Some(mpy) = cross.find_compiled(&src) {
                        return fs::metadata(&mpy)
                            .map_or(Reply::Err(err::ENOENT), |m| stat_reply(&m));
                    }
                }
                return Reply::Err(err::ENOENT);
            }
        }

        match fs::metadata(&local) {
            Ok(meta) => stat_reply(&meta),
            Err(_) if self.is_virtual_dir(path) => Reply::Stat {
                is_dir: true,
                size: 0,
                mtime: 0,
            },
            Err(e) => Reply::Err(errno_of(&e)),
        }
    }

    fn listdir(&mut self, path: &str) -> Reply {
        let local = self.resolve(path);
        let mut entries: Vec<(String, bool, u32)> = Vec::new();
        let mut real_dir = false;
        if let Some(local) = &local {
            if let Ok(rd) = fs::read_dir(local) {
                real_dir = true;
                for entry in rd.flatten() {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if let Ok(meta) = entry.metadata() {
                        let size = u32::try_from(meta.len()).unwrap_or(u32::MAX);
                        entries.push((name, meta.is_dir(), if meta.is_dir() { 0 } else { size }));
                    }
                }
            }
        }
        if local.is_none() && !self.is_virtual_dir(path) {
            return Reply::Err(err::EACCES);
        }

        // Surface submounts as direct children of their parent prefix.
        let prefix = path.trim_matches('/');
        for (sub, local_sub) in &self.submounts {
            let child = if prefix.is_empty() {
                sub.as_str()
            } else if let Some(rest) = sub.strip_prefix(&format!("{prefix}/")) {
                rest
            } else {
                continue;
            };
            let name = child.split('/').next().unwrap_or(child);
            if name.is_empty() || entries.iter().any(|(n, ..)| n == name) {
                continue;
            }
            let is_dir = name != child || local_sub.is_dir();
            entries.push((name.to_owned(), is_dir, 0));
        }

        if entries.is_empty() && !real_dir && !self.is_virtual_dir(path) {
            return Reply::Err(err::ENOENT);
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Reply::Listdir { entries }
    }

    fn open(&mut self, path: &str, mode: OpenMode) -> Reply {
        let Some(mut local) = self.resolve(path) else {
            return Reply::Err(err::EACCES);
        };

        // Compile policy: serve the compiled artifact for .mpy requests.
        if mode == OpenMode::Read && path.ends_with(".mpy") {
            if let Some(cross) = &self.compiler {
                let src = local.with_extension("py");
                if src.is_file() {
                    if let Some(mpy) = cross.find_compiled(&src) {
                        local = mpy;
                    }
                }
            }
        }

        if self.files.len() >= MAX_OPEN_FILES {
            return Reply::Err(err::EMFILE);
        }
        let opened = match mode {
            OpenMode::Read => File::open(&local),
            OpenMode::Write => File::create(&local),
            OpenMode::Append => OpenOptions::new().create(true).append(true).open(&local),
        };
        match opened {
            Ok(file) => {
                let handle = self.alloc_handle();
                self.files.insert(
                    handle,
                    OpenFile {
                        file,
                        append: mode == OpenMode::Append,
                    },
                );
                Reply::Open { handle }
            }
            Err(e) => Reply::Err(errno_of(&e)),
        }
    }

    /// Smallest unused handle.
    fn alloc_handle(&self) -> u16 {
        let mut candidate = 0u16;
        for &used in self.files.keys() {
            if used == candidate {
                candidate += 1;
            } else {
                break;
            }
        }
        candidate
    }

    fn read(&mut self, handle: u16, n: u16) -> Reply {
        let Some(open) = self.files.get_mut(&handle) else {
            return Reply::Err(err::EBADF);
        };
        let mut buf = vec![0u8; usize::from(n)];
        let mut filled = 0;
        // Loop: a short read from a regular file is legal, EOF is not the
        // only cause.
        while filled < buf.len() {
            match open.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(got) => filled += got,
                Err(e) => return Reply::Err(errno_of(&e)),
            }
        }
        buf.truncate(filled);
        Reply::Read { data: buf }
    }

    fn write(&mut self, handle: u16, data: &[u8]) -> Reply {
        let Some(open) = self.files.get_mut(&handle) else {
            return Reply::Err(err::EBADF);
        };
        if open.append {
            if let Err(e) = open.file.seek(SeekFrom::End(0)) {
                return Reply::Err(errno_of(&e));
            }
        }
        match open.file.write_all(data) {
            Ok(()) => Reply::Written {
                n: u16::try_from(data.len()).unwrap_or(u16::MAX),
            },
            Err(e) => Reply::Err(errno_of(&e)),
        }
    }

    fn close(&mut self, handle: u16) -> Reply {
        match self.files.remove(&handle) {
            Some(_) => Reply::Ok,
            None => Reply::Err(err::EBADF),
        }
    }

    fn remove(&mut self, path: &str) -> Reply {
        let Some(local) = self.resolve(path) else {
            return Reply::Err(err::EACCES);
        };
        let result = match fs::metadata(&local) {
            Ok(meta) if meta.is_dir() => fs::remove_dir(&local),
            Ok(_) => fs::remove_file(&local),
            Err(e) => return Reply::Err(errno_of(&e)),
        };
        result.map_or_else(|e| Reply::Err(errno_of(&e)), |()| Reply::Ok)
    }

    fn mkdir(&mut self, path: &str) -> Reply {
        let Some(local) = self.resolve(path) else {
            return Reply::Err(err::EACCES);
        };
        fs::create_dir_all(&local).map_or_else(|e| Reply::Err(errno_of(&e)), |()| Reply::Ok)
    }

    fn rename(&mut self, from: &str, to: &str) -> Reply {
        let (Some(src), Some(dst)) = (self.resolve(from), self.resolve(to)) else {
            return Reply::Err(err::EACCES);
        };
        fs::rename(&src, &dst).map_or_else(|e| Reply::Err(errno_of(&e)), |()| Reply::Ok)
    }
}

/// Canonicalises `rel` against `root`, resolving symlinks along the way,
/// and rejects anything that ends up outside `root`.
///
/// Trailing components are allowed to not exist yet (open-for-write,
/// mkdir, rename targets); only the existing prefix is resolved.
fn resolve_within(root: &Path, rel: &str) -> Option<PathBuf> {
    let mut cur = root.to_path_buf();
    for comp in rel.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                cur = cur.parent()?.to_path_buf();
            }
            name => cur.push(name),
        }
        if let Ok(resolved) = cur.canonicalize() {
            cur = resolved;
        }
    }
    cur.starts_with(root).then_some(cur)
}

fn stat_reply(meta: &fs::Metadata) -> Reply {
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .and_then(|d| u32::try_from(d.as_secs()).ok())
        .unwrap_or(0);
    Reply::Stat {
        is_dir: meta.is_dir(),
        size: if meta.is_dir() {
            0
        } else {
            u32::try_from(meta.len()).unwrap_or(u32::MAX)
        },
        mtime,
    }
}

fn errno_of(e: &std::io::Error) -> u8 {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::NotFound => err::ENOENT,
        ErrorKind::PermissionDenied => err::EACCES,
        _ => err::EIO,
    }
}
