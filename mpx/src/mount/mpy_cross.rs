//! Thin wrapper around the external `mpy-cross` compiler.
//!
//! The compiler itself is an external collaborator; this module only
//! locates the binary, targets the device's bytecode version, and keeps an
//! mtime-checked cache under `__pycache__` next to each source file.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::{env, fs};

use crate::probe::DeviceInfo;

/// Files that must stay as plain source: the loader reads them before the
/// VFS is fully up, and they are the ones users edit on the fly.
pub const BOOT_FILES: &[&str] = &["boot.py", "main.py"];

/// Native arch names indexed by `sys.implementation._mpy` bits 10-13.
const ARCH_NAMES: &[&str] = &[
    "", "x86", "x64", "armv6", "armv6m", "armv7m", "armv7em", "armv7emsp", "armv7emdp", "xtensa",
    "xtensawin", "rv32imc", "rv64imc",
];

/// A configured compiler targeting one device's bytecode format.
#[derive(Debug, Clone)]
pub struct MpyCross {
    bin: PathBuf,
    /// Extra arguments: optimisation, `-b` version targeting, `-march`.
    args: Vec<String>,
    /// Device bytecode version, used in cache file names.
    version: (u8, u8),
    /// Native arch name, or empty when bytecode-only.
    arch: String,
}

impl MpyCross {
    /// Locates `mpy-cross` and configures it for `info`'s bytecode format.
    ///
    /// Returns `None` when the binary is missing, its version cannot be
    /// parsed, or the device does not report a bytecode version — mounts
    /// then serve plain `.py` sources.
    #[must_use]
    pub fn detect(info: &DeviceInfo) -> Option<Self> {
        if info.mpy_version == 0 {
            tracing::warn!("device reports no bytecode version, serving .py sources");
            return None;
        }
        let bin = find_in_path("mpy-cross")?;
        let out = Command::new(&bin).arg("--version").output().ok()?;
        let text = String::from_utf8_lossy(&out.stdout).into_owned()
            + &String::from_utf8_lossy(&out.stderr);
        let cross = parse_mpy_version(&text)?;
        Some(Self::configure(bin, cross, info))
    }

    /// Builds a compiler around an explicit binary; used by tests.
    #[must_use]
    pub(crate) fn with_binary(bin: PathBuf, cross: (u8, u8), info: &DeviceInfo) -> Self {
        Self::configure(bin, cross, info)
    }

    fn configure(bin: PathBuf, cross: (u8, u8), info: &DeviceInfo) -> Self {
        let device = (info.mpy_version, info.mpy_minor);
        let mut args = vec!["-O2".to_owned()];
        if cross != device {
            args.push("-b".to_owned());
            args.push(format!("{}.{}", device.0, device.1));
        }
        let arch = ARCH_NAMES
            .get(usize::from(info.mpy_arch))
            .copied()
            .unwrap_or("")
            .to_owned();
        if !arch.is_empty() {
            args.push(format!("-march={arch}"));
        }
        tracing::debug!(?device, ?cross, arch = %arch, "mpy-cross configured");
        Self {
            bin,
            args,
            version: device,
            arch,
        }
    }

    /// Cache location for a source file.
    fn cache_path(&self, src: &Path) -> Option<PathBuf> {
        let stem = src.file_stem()?.to_str()?;
        let arch_suffix = if self.arch.is_empty() {
            String::new()
        } else {
            format!("-{}", self.arch)
        };
        let name = format!(
            "{stem}.mpy-{}.{}{arch_suffix}.mpy",
            self.version.0, self.version.1
        );
        Some(src.parent()?.join("__pycache__").join(name))
    }

    /// Compiles `src`, returning the cached `.mpy` path.
    ///
    /// Returns `None` — meaning "serve the source instead" — for boot
    /// files, non-`.py` paths, and compile failures. The cache is reused
    /// while its mtime is not older than the source's.
    #[must_use]
    pub fn compile(&self, src: &Path) -> Option<PathBuf> {
        let name = src.file_name()?.to_str()?;
        if BOOT_FILES.contains(&name) || !name.ends_with(".py") {
            return None;
        }
        let cache = self.cache_path(src)?;
        if let (Ok(cm), Ok(sm)) = (fs::metadata(&cache), fs::metadata(src)) {
            if let (Ok(ct), Ok(st)) = (cm.modified(), sm.modified()) {
                if ct >= st {
                    return Some(cache);
                }
            }
        }
        fs::create_dir_all(cache.parent()?).ok()?;
        let status = Command::new(&self.bin)
            .args(&self.args)
            .arg("-o")
            .arg(&cache)
            .arg(src)
            .output();
        match status {
            Ok(out) if out.status.success() => Some(cache),
            Ok(out) => {
                tracing::warn!(
                    src = %src.display(),
                    stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                    "mpy-cross failed, serving source"
                );
                None
            }
            Err(e) => {
                tracing::warn!(src = %src.display(), error = %e, "mpy-cross did not run");
                None
            }
        }
    }

    /// Resolves the `.mpy` to serve for a source file: a pre-existing
    /// sibling `.mpy` wins over the compile cache.
    #[must_use]
    pub fn find_compiled(&self, src: &Path) -> Option<PathBuf> {
        let sibling = src.with_extension("mpy");
        if sibling.is_file() {
            return Some(sibling);
        }
        self.compile(src)
    }
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Pulls `X.Y` out of `mpy-cross` version output like
/// `MicroPython v1.23.0 on 2024-06-02; mpy-cross emitting mpy v6.3`.
fn parse_mpy_version(text: &str) -> Option<(u8, u8)> {
    let at = text.find("mpy v")?;
    let rest = &text[at + 5..];
    let mut parts = rest
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty());
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}
