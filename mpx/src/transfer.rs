//! The transfer pipeline: batched skip-unchanged phase, then chunked
//! streaming with progress.
//!
//! A transfer set whose destinations already match (size and SHA-256)
//! costs exactly one round-trip: the batched `fileinfo`. Everything else
//! streams through [`crate::Session::put`] / [`crate::Session::get`].

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::device::RemoteFileInfo;
use crate::error::Result;
use crate::session::Session;

/// One `(local, remote)` pair of a transfer set.
#[derive(Debug, Clone)]
pub struct TransferItem {
    /// Host-side file.
    pub local: PathBuf,
    /// Device-side destination path.
    pub remote: String,
}

impl TransferItem {
    /// Pairs a host path with a device path.
    pub fn new(local: impl Into<PathBuf>, remote: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            remote: remote.into(),
        }
    }
}

/// What a pipeline run did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransferReport {
    /// Files whose bytes were moved.
    pub transferred: usize,
    /// Files skipped because the destination already matched.
    pub skipped: usize,
    /// Content bytes moved (before encoding).
    pub content_bytes: u64,
    /// Bytes put on the wire, including command overhead (uploads only).
    pub wire_bytes: u64,
}

/// Per-chunk pipeline progress: the item being moved plus
/// `(transferred, total)` for it.
pub type TransferProgress<'a> = &'a mut dyn FnMut(&TransferItem, u64, u64);

impl Session {
    /// Uploads a set of local files, skipping destinations that already
    /// hold identical content.
    ///
    /// The skip phase is one batched round-trip; `force` in the session
    /// config bypasses it entirely.
    pub fn upload(
        &mut self,
        items: &[TransferItem],
        mut progress: Option<TransferProgress<'_>>,
    ) -> Result<TransferReport> {
        let mut report = TransferReport::default();
        let mut contents: Vec<(usize, Vec<u8>)> = Vec::with_capacity(items.len());
        for (at, item) in items.iter().enumerate() {
            contents.push((at, fs::read(&item.local)?));
        }

        let skip: std::collections::BTreeSet<usize> = if self.config().force {
            std::collections::BTreeSet::new()
        } else {
            let expected: BTreeMap<String, u64> = items
                .iter()
                .zip(&contents)
                .map(|(item, (_, data))| (item.remote.clone(), data.len() as u64))
                .collect();
            let remote = self.fileinfo(&expected)?;
            contents
                .iter()
                .filter(|(at, data)| {
                    matches!(
                        remote.get(&items[*at].remote),
                        Some(RemoteFileInfo::SizeMatch { sha256, .. })
                            if sha256.as_slice() == Sha256::digest(data).as_slice()
                    )
                })
                .map(|(at, _)| *at)
                .collect()
        };

        for (at, data) in contents {
            let item = &items[at];
            if skip.contains(&at) {
                tracing::debug!(remote = %item.remote, "destination unchanged, skipping");
                report.skipped += 1;
                continue;
            }
            let outcome = match progress.as_mut() {
                Some(cb) => {
                    let mut adapter = |done: u64, total: u64| cb(item, done, total);
                    self.put(&item.remote, &data, Some(&mut adapter))?
                }
                None => self.put(&item.remote, &data, None)?,
            };
            report.transferred += 1;
            report.content_bytes += data.len() as u64;
            report.wire_bytes += outcome.wire_bytes;
        }
        Ok(report)
    }

    /// Downloads a set of device files, skipping local files that already
    /// hold identical content.
    pub fn download(
        &mut self,
        items: &[TransferItem],
        mut progress: Option<TransferProgress<'_>>,
    ) -> Result<TransferReport> {
        let mut report = TransferReport::default();

        // Skip phase: hash the device side for every destination whose
        // local counterpart exists with the same size.
        let mut skip: std::collections::BTreeSet<usize> = std::collections::BTreeSet::new();
        if !self.config().force {
            let mut expected = BTreeMap::new();
            let mut locals: BTreeMap<String, Vec<u8>> = BTreeMap::new();
            for item in items {
                if let Ok(data) = fs::read(&item.local) {
                    expected.insert(item.remote.clone(), data.len() as u64);
                    locals.insert(item.remote.clone(), data);
                }
            }
            if !expected.is_empty() {
                let remote = self.fileinfo(&expected)?;
                for (at, item) in items.iter().enumerate() {
                    if let (Some(RemoteFileInfo::SizeMatch { sha256, .. }), Some(data)) =
                        (remote.get(&item.remote), locals.get(&item.remote))
                    {
                        if sha256.as_slice() == Sha256::digest(data).as_slice() {
                            skip.insert(at);
                        }
                    }
                }
            }
        }

        for (at, item) in items.iter().enumerate() {
            if skip.contains(&at) {
                tracing::debug!(remote = %item.remote, "local copy unchanged, skipping");
                report.skipped += 1;
                continue;
            }
            let data = match progress.as_mut() {
                Some(cb) => {
                    let mut adapter = |done: u64, total: u64| cb(item, done, total);
                    self.get(&item.remote, Some(&mut adapter))?
                }
                None => self.get(&item.remote, None)?,
            };
            if let Some(parent) = item.local.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&item.local, &data)?;
            report.transferred += 1;
            report.content_bytes += data.len() as u64;
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_serialises() {
        let report = TransferReport {
            transferred: 3,
            skipped: 6,
            content_bytes: 1024,
            wire_bytes: 1400,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["transferred"], 3);
        assert_eq!(json["skipped"], 6);
    }
}
