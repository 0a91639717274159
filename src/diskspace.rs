// src/diskspace.rs

//! Per-filesystem disk usage accounting
//!
//! Tracks the projected block and inode deltas of a transaction per
//! filesystem, so space exhaustion is reported as a problem before any file
//! is written. Filesystems are discovered lazily by device id as file paths
//! are accounted; a filesystem that cannot be statted is simply not
//! accounted, never an error.

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use nix::sys::statvfs::statvfs;
use tracing::debug;

use crate::config::safe_join;
use crate::fileinfo::{FileAction, FileInfoSet};
use crate::nevra::Nevra;
use crate::problems::{ProblemKind, ProblemSet};

#[derive(Debug)]
struct FsEntry {
    dev: u64,
    /// Deepest existing ancestor used to discover this filesystem;
    /// stands in for the mount point in problem reports
    mount: String,
    block_size: u64,
    avail_blocks: u64,
    avail_inodes: u64,
    needed_blocks: i64,
    needed_inodes: i64,
}

/// Projected disk usage of one transaction, per filesystem
#[derive(Debug)]
pub struct DiskUsage {
    root: PathBuf,
    entries: Vec<FsEntry>,
}

impl DiskUsage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            entries: Vec::new(),
        }
    }

    /// Account every file of one element's resolved info set
    ///
    /// Create-like actions add the file's rounded size and subtract the
    /// size of whatever it replaces; erase subtracts; skips cost nothing.
    pub fn account(&mut self, fi: &FileInfoSet) {
        for i in 0..fi.file_count() {
            let path = fi.path(i);
            match fi.actions[i] {
                FileAction::Create | FileAction::Backup | FileAction::AltName => {
                    self.account_file(&path, fi.sizes[i] as i64, fi.replaced_sizes[i] as i64, 1);
                }
                FileAction::Erase => {
                    self.account_file(&path, -(fi.sizes[i] as i64), 0, -1);
                }
                _ => {}
            }
        }
    }

    fn account_file(&mut self, path: &str, size: i64, replaced: i64, inodes: i64) {
        let Some(ix) = self.entry_for(path) else {
            return;
        };
        let e = &mut self.entries[ix];
        e.needed_blocks += block_round(size, e.block_size) - block_round(replaced, e.block_size);
        e.needed_inodes += inodes;
    }

    /// Report exhaustion problems for the element just accounted
    pub fn check(&self, package: &Nevra, problems: &mut ProblemSet) {
        for e in &self.entries {
            if e.needed_blocks > 0 && e.needed_blocks as u64 > e.avail_blocks {
                problems.append(
                    package.clone(),
                    ProblemKind::DiskSpace {
                        mount: e.mount.clone(),
                        needed: e.needed_blocks as u64 * e.block_size,
                        available: e.avail_blocks * e.block_size,
                    },
                );
            }
            if e.needed_inodes > 0 && e.needed_inodes as u64 > e.avail_inodes {
                problems.append(
                    package.clone(),
                    ProblemKind::DiskNodes {
                        mount: e.mount.clone(),
                        needed: e.needed_inodes as u64,
                        available: e.avail_inodes,
                    },
                );
            }
        }
    }

    /// Find or create the accounting entry for the filesystem under a path
    fn entry_for(&mut self, path: &str) -> Option<usize> {
        let joined = safe_join(&self.root, path).ok()?;
        let existing = deepest_existing(&joined)?;
        let dev = existing.metadata().ok()?.dev();

        if let Some(ix) = self.entries.iter().position(|e| e.dev == dev) {
            return Some(ix);
        }

        let vfs = statvfs(&existing).ok()?;
        let entry = FsEntry {
            dev,
            mount: existing.display().to_string(),
            block_size: vfs.fragment_size() as u64,
            avail_blocks: vfs.blocks_available() as u64,
            avail_inodes: vfs.files_available() as u64,
            needed_blocks: 0,
            needed_inodes: 0,
        };
        debug!(
            "accounting filesystem {} ({} blocks free)",
            entry.mount, entry.avail_blocks
        );
        self.entries.push(entry);
        Some(self.entries.len() - 1)
    }
}

fn deepest_existing(path: &Path) -> Option<PathBuf> {
    let mut p = path;
    loop {
        if p.exists() {
            return Some(p.to_path_buf());
        }
        p = p.parent()?;
    }
}

/// Round a signed byte count to whole blocks, preserving sign
fn block_round(bytes: i64, block_size: u64) -> i64 {
    if block_size == 0 {
        return 0;
    }
    let bs = block_size as i64;
    let blocks = (bytes.abs() + bs - 1) / bs;
    if bytes < 0 { -blocks } else { blocks }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fileinfo::FileFlags;
    use crate::header::HeaderBuilder;
    use crate::problems::ProblemFilter;
    use tempfile::TempDir;

    #[test]
    fn test_block_round() {
        assert_eq!(block_round(0, 4096), 0);
        assert_eq!(block_round(1, 4096), 1);
        assert_eq!(block_round(4096, 4096), 1);
        assert_eq!(block_round(4097, 4096), 2);
        assert_eq!(block_round(-4097, 4096), -2);
    }

    #[test]
    fn test_small_install_passes() {
        let tmp = TempDir::new().unwrap();
        let h = HeaderBuilder::new("foo", "1.0", "1")
            .file("/usr/bin/foo", 0o100755, 100, FileFlags::empty())
            .build();
        let mut fi = crate::fileinfo::FileInfoSet::from_header(&h);
        fi.actions[0] = FileAction::Create;

        let mut usage = DiskUsage::new(tmp.path());
        usage.account(&fi);

        let mut problems = ProblemSet::new(ProblemFilter::empty());
        usage.check(&h.nevra().unwrap(), &mut problems);
        assert!(problems.is_empty());
    }

    #[test]
    fn test_skipped_files_cost_nothing() {
        let tmp = TempDir::new().unwrap();
        let h = HeaderBuilder::new("foo", "1.0", "1")
            .file("/usr/share/doc/README", 0o100644, u32::MAX, FileFlags::DOC)
            .build();
        let mut fi = crate::fileinfo::FileInfoSet::from_header(&h);
        fi.actions[0] = FileAction::SkipNstate;

        let mut usage = DiskUsage::new(tmp.path());
        usage.account(&fi);

        let mut problems = ProblemSet::new(ProblemFilter::empty());
        usage.check(&h.nevra().unwrap(), &mut problems);
        assert!(problems.is_empty());
    }

    #[test]
    fn test_erase_offsets_create() {
        let tmp = TempDir::new().unwrap();
        let mut usage = DiskUsage::new(tmp.path());
        usage.account_file("/a", 8192, 0, 1);
        usage.account_file("/b", -8192, 0, -1);
        let e = &usage.entries[0];
        assert_eq!(e.needed_blocks, 0);
        assert_eq!(e.needed_inodes, 0);
    }
}
