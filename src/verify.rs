// src/verify.rs

//! Installed-package verification
//!
//! Compares what the database says about installed files with what is on
//! disk. Digest work dominates, so packages are verified in parallel once
//! their metadata has been loaded from the database.

use std::path::Path;

use bitflags::bitflags;
use rayon::prelude::*;
use tracing::debug;

use crate::config::{EngineConfig, safe_join};
use crate::error::Result;
use crate::fileinfo::{FileFlags, FileInfoSet, FileState, file_digest, is_regular};
use crate::nevra::Nevra;
use crate::rpmdb::PackageDb;

bitflags! {
    /// Discrepancies found for one file
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VerifyFlags: u32 {
        const MISSING     = 1 << 0;
        const DIGEST      = 1 << 1;
        const SIZE        = 1 << 2;
        const MODE        = 1 << 3;
        const LINK_TARGET = 1 << 4;
        const MTIME       = 1 << 5;
    }
}

/// Verification outcome for one installed package
#[derive(Debug)]
pub struct VerifyReport {
    pub package: Nevra,
    /// Files with at least one discrepancy
    pub findings: Vec<(String, VerifyFlags)>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

/// Verify every installed package against the filesystem
pub fn verify_all(db: &PackageDb, config: &EngineConfig) -> Result<Vec<VerifyReport>> {
    let mut packages = Vec::new();
    for instance in db.all_instances()? {
        let header = db.header(instance)?;
        let nevra = header.nevra()?;
        let mut fi = FileInfoSet::from_header(&header);
        let states = db.file_states(instance)?;
        if states.len() == fi.file_count() {
            fi.states = states;
        }
        packages.push((nevra, fi));
    }

    Ok(packages
        .par_iter()
        .map(|(nevra, fi)| verify_package(nevra, fi, &config.root))
        .collect())
}

/// Verify one package's files against the filesystem under `root`
pub fn verify_package(package: &Nevra, fi: &FileInfoSet, root: &Path) -> VerifyReport {
    let mut findings = Vec::new();
    for i in 0..fi.file_count() {
        // Only files actually laid down in the normal state are claims
        // against the filesystem.
        if fi.states[i] != FileState::Normal {
            continue;
        }
        if fi.flags[i].contains(FileFlags::GHOST) {
            continue;
        }
        let flags = verify_file(fi, i, root);
        if !flags.is_empty() {
            findings.push((fi.path(i), flags));
        }
    }
    if !findings.is_empty() {
        debug!("{}: {} files with discrepancies", package, findings.len());
    }
    VerifyReport {
        package: package.clone(),
        findings,
    }
}

fn verify_file(fi: &FileInfoSet, i: usize, root: &Path) -> VerifyFlags {
    let mut flags = VerifyFlags::empty();
    let Ok(on_disk) = safe_join(root, &fi.path(i)) else {
        return VerifyFlags::MISSING;
    };
    let Ok(meta) = on_disk.symlink_metadata() else {
        if fi.flags[i].contains(FileFlags::MISSINGOK) {
            return flags;
        }
        return VerifyFlags::MISSING;
    };

    let mode = fi.modes[i];
    if mode & 0o170000 == 0o120000 {
        let target = std::fs::read_link(&on_disk)
            .map(|t| t.to_string_lossy().into_owned())
            .unwrap_or_default();
        if target != fi.link_targets[i] {
            flags |= VerifyFlags::LINK_TARGET;
        }
        return flags;
    }

    if !is_regular(mode) {
        return flags;
    }

    use std::os::unix::fs::MetadataExt;
    if meta.mode() & 0o7777 != mode & 0o7777 {
        flags |= VerifyFlags::MODE;
    }
    if meta.len() != fi.sizes[i] {
        flags |= VerifyFlags::SIZE;
    }
    if fi.mtimes[i] != 0 && meta.mtime() as u32 != fi.mtimes[i] {
        flags |= VerifyFlags::MTIME;
    }
    if !fi.digests[i].is_empty() {
        match file_digest(&on_disk) {
            Ok(d) if d == fi.digests[i] => {}
            _ => flags |= VerifyFlags::DIGEST,
        }
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fileinfo::digest_bytes;
    use crate::header::HeaderBuilder;
    use tempfile::TempDir;

    #[test]
    fn test_clean_package_verifies() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("usr/bin")).unwrap();
        std::fs::write(tmp.path().join("usr/bin/tool"), b"payload").unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(
            tmp.path().join("usr/bin/tool"),
            std::fs::Permissions::from_mode(0o755),
        )
        .unwrap();

        let h = HeaderBuilder::new("tool", "1.0", "1")
            .file_full(
                "/usr/bin/tool",
                0o100755,
                7,
                FileFlags::empty(),
                &digest_bytes(b"payload"),
                "",
                "",
                0,
            )
            .build();
        let fi = FileInfoSet::from_header(&h);
        let report = verify_package(&h.nevra().unwrap(), &fi, tmp.path());
        assert!(report.is_clean());
    }

    #[test]
    fn test_modified_and_missing_flagged() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("etc")).unwrap();
        std::fs::write(tmp.path().join("etc/app.conf"), b"tampered").unwrap();

        let h = HeaderBuilder::new("app", "1.0", "1")
            .file_full(
                "/etc/app.conf",
                0o100644,
                8,
                FileFlags::CONFIG,
                &digest_bytes(b"original"),
                "",
                "",
                0,
            )
            .file("/usr/bin/gone", 0o100755, 4, FileFlags::empty())
            .build();
        let fi = FileInfoSet::from_header(&h);
        let report = verify_package(&h.nevra().unwrap(), &fi, tmp.path());

        assert_eq!(report.findings.len(), 2);
        assert!(report.findings[0].1.contains(VerifyFlags::DIGEST));
        assert!(report.findings[1].1.contains(VerifyFlags::MISSING));
    }

    #[test]
    fn test_skipped_states_not_claimed() {
        let tmp = TempDir::new().unwrap();
        let h = HeaderBuilder::new("doc", "1.0", "1")
            .file("/usr/share/doc/README", 0o100644, 3, FileFlags::DOC)
            .build();
        let mut fi = FileInfoSet::from_header(&h);
        fi.states[0] = FileState::NotInstalled;

        let report = verify_package(&h.nevra().unwrap(), &fi, tmp.path());
        assert!(report.is_clean());
    }
}
