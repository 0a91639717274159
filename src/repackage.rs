// src/repackage.rs

//! Repackaging of packages about to be erased
//!
//! Before an erase, the package's surviving on-disk files are captured into
//! a cpio archive alongside its header, so a failed transaction can restore
//! exactly what was removed. Archives land in the configured spool
//! directory as `<nevra>-<tid>.rpx`; the header rides as the first entry
//! under a reserved name.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::{EngineConfig, safe_join};
use crate::error::{Error, Result};
use crate::fileinfo::{FileAction, FileInfoSet};
use crate::header::Header;
use crate::payload::{CpioEntry, CpioReader, CpioWriter, Payload, PayloadEntry};

/// Reserved archive member carrying the serialized header
const HEADER_MEMBER: &str = ".rpmtxn/header.json";

/// Writes and reads repackaged archives
pub struct Repackager<'a> {
    config: &'a EngineConfig,
    tid: u32,
}

impl<'a> Repackager<'a> {
    pub fn new(config: &'a EngineConfig, tid: u32) -> Self {
        Self { config, tid }
    }

    /// Capture a package's on-disk files before erasure
    ///
    /// Only files the erase will actually touch (erase or backup
    /// dispositions) are captured; files another package keeps alive stay
    /// out of the archive. Files already missing from disk are skipped.
    pub fn repackage(&self, header: &Header, fi: &FileInfoSet) -> Result<PathBuf> {
        let nevra = header.nevra()?;
        std::fs::create_dir_all(&self.config.repackage_dir)?;
        let out_path = self
            .config
            .repackage_dir
            .join(format!("{}-{}.rpx", nevra, self.tid));

        let file = File::create(&out_path)?;
        let mut writer = CpioWriter::new(BufWriter::new(file));

        let header_json = serde_json::to_vec(header)?;
        writer.append(
            &CpioEntry {
                name: HEADER_MEMBER.to_string(),
                size: header_json.len() as u64,
                mode: 0o100644,
                mtime: 0,
                uid: 0,
                gid: 0,
                nlink: 1,
            },
            &header_json,
        )?;

        let mut captured = 0usize;
        for i in 0..fi.file_count() {
            if !matches!(fi.actions[i], FileAction::Erase | FileAction::Backup) {
                continue;
            }
            let path = fi.path(i);
            let Ok(on_disk) = safe_join(&self.config.root, &path) else {
                continue;
            };
            let Ok(meta) = on_disk.symlink_metadata() else {
                debug!("{} missing, not repackaged", path);
                continue;
            };

            let content = if meta.is_symlink() {
                std::fs::read_link(&on_disk)?
                    .to_string_lossy()
                    .into_owned()
                    .into_bytes()
            } else if meta.is_dir() {
                Vec::new()
            } else {
                std::fs::read(&on_disk)?
            };

            writer.append(
                &CpioEntry {
                    name: format!(".{}", path),
                    size: content.len() as u64,
                    mode: fi.modes[i],
                    mtime: fi.mtimes[i] as u64,
                    uid: 0,
                    gid: 0,
                    nlink: 1,
                },
                &content,
            )?;
            captured += 1;
        }

        writer.finish()?;
        info!(
            "repackaged {} ({} files) to {}",
            nevra,
            captured,
            out_path.display()
        );
        Ok(out_path)
    }

    /// Load a repackaged archive back as a header and payload
    pub fn load(path: &Path) -> Result<(Arc<Header>, Payload)> {
        let file = File::open(path)?;
        let mut reader = CpioReader::new(BufReader::new(file));

        let mut header: Option<Arc<Header>> = None;
        let mut payload = Payload::new();
        while let Some((entry, content)) = reader.next_entry()? {
            if entry.name == HEADER_MEMBER {
                header = Some(Arc::new(serde_json::from_slice(&content)?));
                continue;
            }
            payload.insert(
                &entry.name,
                PayloadEntry {
                    content,
                    mode: entry.mode,
                    mtime: entry.mtime,
                },
            );
        }

        let header = header.ok_or_else(|| {
            Error::Repackage(format!("{} carries no header member", path.display()))
        })?;
        Ok((header, payload))
    }
}
