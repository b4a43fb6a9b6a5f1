//! One-shot device introspection.
//!
//! A single code unit gathers platform identity, RAM, and capability
//! flags as one printed literal. The result is cached in the session and
//! invalidated by any reset.

use serde::Serialize;

use crate::error::{Error, Result};
use crate::literal::Value;

/// Code unit that prints the capability dictionary.
pub(crate) const PROBE_UNIT: &str = "\
import sys,os,gc,binascii
def _mx_nfo():
 gc.collect()
 try:
  import machine
  u=binascii.hexlify(machine.unique_id()).decode()
 except (ImportError,AttributeError):
  u=''
 try:
  import deflate
  dz=True
 except ImportError:
  dz=False
 try:
  import hashlib
  hh=hasattr(hashlib,'sha256')
 except ImportError:
  hh=False
 i=sys.implementation
 v=getattr(i,'version',(0,0,0))
 m=getattr(i,'_mpy',0)
 try:
  mc=os.uname().machine
 except AttributeError:
  mc=''
 return {'platform':sys.platform,'version':'.'.join(str(x) for x in v[:3]),'impl':i.name,'machine':mc,'uid':u,'free':gc.mem_free(),'deflate':dz,'hashlib':hh,'mpy':m&0xff,'mpy_sub':(m>>8)&3,'arch':(m>>10)&0xf,'paste':tuple(v[:2])>=(1,17)}
print(repr(_mx_nfo()))";

/// Capabilities and identity of the attached device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub struct DeviceInfo {
    /// Port family, e.g. `rp2`, `esp32`.
    pub platform: String,
    /// Interpreter version, e.g. `1.22.0`.
    pub version: String,
    /// Implementation name (`micropython`).
    pub implementation: String,
    /// Board/machine description from `os.uname()`.
    pub machine: String,
    /// Hex-encoded hardware unique id; empty when unavailable.
    pub unique_id: String,
    /// Free heap after a collect, in bytes.
    pub free_ram: u64,
    /// `deflate` module available (compressed transfers possible).
    pub has_deflate: bool,
    /// `hashlib.sha256` available (skip-unchanged possible).
    pub has_hashlib: bool,
    /// Bytecode major version; 0 when unreported.
    pub mpy_version: u8,
    /// Bytecode minor version.
    pub mpy_minor: u8,
    /// Native arch index from the `_mpy` descriptor; 0 = bytecode only.
    pub mpy_arch: u8,
    /// Firmware is recent enough to offer raw-paste mode.
    pub raw_paste: bool,
}

impl DeviceInfo {
    /// Builds the struct from the probe unit's printed dictionary.
    pub(crate) fn from_value(value: &Value) -> Result<Self> {
        let text = |key: &str| -> Result<String> {
            value
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_owned)
                .ok_or_else(|| Error::BadReply(format!("probe field '{key}'")))
        };
        let flag = |key: &str| -> Result<bool> {
            value
                .get(key)
                .and_then(Value::as_bool)
                .ok_or_else(|| Error::BadReply(format!("probe field '{key}'")))
        };
        let num = |key: &str| -> Result<u64> {
            value
                .get(key)
                .and_then(Value::as_u64)
                .ok_or_else(|| Error::BadReply(format!("probe field '{key}'")))
        };
        #[allow(clippy::cast_possible_truncation)]
        Ok(Self {
            platform: text("platform")?,
            version: text("version")?,
            implementation: text("impl")?,
            machine: text("machine")?,
            unique_id: text("uid")?,
            free_ram: num("free")?,
            has_deflate: flag("deflate")?,
            has_hashlib: flag("hashlib")?,
            mpy_version: num("mpy")? as u8,
            mpy_minor: num("mpy_sub")? as u8,
            mpy_arch: num("arch")? as u8,
            raw_paste: flag("paste")?,
        })
    }
}
