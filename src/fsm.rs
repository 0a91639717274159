// src/fsm.rs

//! File state machine
//!
//! Executes the resolved per-file dispositions of one element against the
//! filesystem: laying payload files down for an install, removing files
//! for an erase. Every failure is reported with the path that failed, so
//! the caller can attach it to the package's problem report.
//!
//! Special files (fifos, device nodes) are recorded but not created, and
//! directory removal tolerates leftover content: a directory that is not
//! empty simply survives the erase.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::safe_join;
use crate::error::{Error, Result};
use crate::fileinfo::{FileAction, FileFlags, FileInfoSet, is_directory};
use crate::payload::Payload;

/// Suffix for the preserved copy of a file displaced by an install
const SUFFIX_ORIG: &str = ".rpmorig";
/// Suffix for the alternate name of a kept-back config install
const SUFFIX_NEW: &str = ".rpmnew";
/// Suffix for a modified config saved during erase
const SUFFIX_SAVE: &str = ".rpmsave";

/// File state machine bound to one target root
pub struct Fsm<'a> {
    root: &'a Path,
}

impl<'a> Fsm<'a> {
    pub fn new(root: &'a Path) -> Self {
        Self { root }
    }

    /// Lay an element's files down from its payload
    pub fn install(&self, fi: &FileInfoSet, payload: &Payload) -> Result<()> {
        for i in 0..fi.file_count() {
            let path = fi.path(i);
            self.install_one(fi, i, payload)
                .map_err(|source| Error::FileStateMachine { file: path, source })?;
        }
        Ok(())
    }

    fn install_one(&self, fi: &FileInfoSet, i: usize, payload: &Payload) -> io::Result<usize> {
        let path = fi.path(i);
        let target = match fi.actions[i] {
            FileAction::Create => self.resolve(&path)?,
            FileAction::AltName => {
                let alt = format!("{}{}", path, SUFFIX_NEW);
                warn!("{} created as {}", path, alt);
                self.resolve(&alt)?
            }
            FileAction::Backup => {
                let resolved = self.resolve(&path)?;
                if resolved.symlink_metadata().is_ok() {
                    let saved = with_suffix(&resolved, SUFFIX_ORIG);
                    warn!("{} saved as {}", path, saved.display());
                    fs::rename(&resolved, &saved)?;
                }
                resolved
            }
            // Skips and erase dispositions write nothing on install.
            _ => return Ok(0),
        };

        if fi.flags[i].contains(FileFlags::GHOST) {
            // Ghosts are owned but never materialized.
            return Ok(0);
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        let mode = fi.modes[i];
        if is_directory(mode) {
            fs::create_dir_all(&target)?;
            fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o7777))?;
            return Ok(0);
        }

        if mode & 0o170000 == 0o120000 {
            let link_target = if fi.link_targets[i].is_empty() {
                payload
                    .get(&path)
                    .map(|e| String::from_utf8_lossy(&e.content).to_string())
                    .unwrap_or_default()
            } else {
                fi.link_targets[i].clone()
            };
            if target.symlink_metadata().is_ok() {
                fs::remove_file(&target)?;
            }
            std::os::unix::fs::symlink(&link_target, &target)?;
            return Ok(0);
        }

        if !crate::fileinfo::is_regular(mode) {
            debug!("not creating special file {}", path);
            return Ok(0);
        }

        let entry = payload.get(&path).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "file missing from payload")
        })?;
        fs::write(&target, &entry.content)?;
        // Permissions come from the header, including set-id bits; writing
        // them last keeps a partially written file from being set-id.
        fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o7777))?;
        Ok(entry.content.len())
    }

    /// Remove an element's files per their dispositions
    ///
    /// Files are walked in reverse header order so entries inside a
    /// directory go before the directory itself.
    pub fn erase(&self, fi: &FileInfoSet) -> Result<()> {
        for i in (0..fi.file_count()).rev() {
            let path = fi.path(i);
            self.erase_one(fi, i)
                .map_err(|source| Error::FileStateMachine { file: path, source })?;
        }
        Ok(())
    }

    fn erase_one(&self, fi: &FileInfoSet, i: usize) -> io::Result<()> {
        let path = fi.path(i);
        match fi.actions[i] {
            FileAction::Erase => {
                let target = self.resolve(&path)?;
                if is_directory(fi.modes[i]) {
                    match fs::remove_dir(&target) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e)
                            if e.raw_os_error() == Some(libc::ENOTEMPTY)
                                || e.raw_os_error() == Some(libc::EEXIST) =>
                        {
                            debug!("{} not removed: directory not empty", path);
                        }
                        Err(e) => return Err(e),
                    }
                } else {
                    match fs::remove_file(&target) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {
                            debug!("{} already gone", path);
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            FileAction::Backup => {
                let target = self.resolve(&path)?;
                if target.symlink_metadata().is_ok() {
                    let saved = with_suffix(&target, SUFFIX_SAVE);
                    warn!("{} saved as {}", path, saved.display());
                    fs::rename(&target, &saved)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Put a file saved aside at install time back under its own name
    ///
    /// Undoes a `Backup` disposition: the `.rpmorig` copy, if present,
    /// returns to the original path.
    pub fn restore_backup(&self, path: &str) -> Result<()> {
        let wrap = |source: io::Error| Error::FileStateMachine {
            file: path.to_string(),
            source,
        };
        let target = self.resolve(path).map_err(wrap)?;
        let saved = with_suffix(&target, SUFFIX_ORIG);
        if saved.symlink_metadata().is_ok() {
            warn!("{} restored from {}", path, saved.display());
            fs::rename(&saved, &target).map_err(wrap)?;
        }
        Ok(())
    }

    fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        safe_join(self.root, path).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::HeaderBuilder;
    use crate::payload::PayloadEntry;
    use tempfile::TempDir;

    fn payload_with(path: &str, content: &[u8]) -> Payload {
        let mut p = Payload::new();
        p.insert(
            path,
            PayloadEntry {
                content: content.to_vec(),
                mode: 0o100644,
                mtime: 0,
            },
        );
        p
    }

    #[test]
    fn test_install_create_and_skip() {
        let tmp = TempDir::new().unwrap();
        let h = HeaderBuilder::new("foo", "1.0", "1")
            .file("/usr/bin/foo", 0o100755, 5, FileFlags::empty())
            .file("/usr/share/doc/README", 0o100644, 3, FileFlags::DOC)
            .build();
        let mut fi = crate::fileinfo::FileInfoSet::from_header(&h);
        fi.actions[0] = FileAction::Create;
        fi.actions[1] = FileAction::SkipNstate;

        let mut payload = payload_with("/usr/bin/foo", b"hello");
        payload.insert(
            "/usr/share/doc/README",
            PayloadEntry {
                content: b"doc".to_vec(),
                mode: 0o100644,
                mtime: 0,
            },
        );

        Fsm::new(tmp.path()).install(&fi, &payload).unwrap();
        assert_eq!(
            std::fs::read(tmp.path().join("usr/bin/foo")).unwrap(),
            b"hello"
        );
        assert!(!tmp.path().join("usr/share/doc/README").exists());
    }

    #[test]
    fn test_install_altname_and_backup() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("etc")).unwrap();
        std::fs::write(tmp.path().join("etc/a.conf"), b"local a").unwrap();
        std::fs::write(tmp.path().join("etc/b.conf"), b"local b").unwrap();

        let h = HeaderBuilder::new("foo", "1.0", "1")
            .file("/etc/a.conf", 0o100644, 5, FileFlags::CONFIG)
            .file("/etc/b.conf", 0o100644, 5, FileFlags::CONFIG)
            .build();
        let mut fi = crate::fileinfo::FileInfoSet::from_header(&h);
        fi.actions[0] = FileAction::AltName;
        fi.actions[1] = FileAction::Backup;

        let mut payload = payload_with("/etc/a.conf", b"new a");
        payload.insert(
            "/etc/b.conf",
            PayloadEntry {
                content: b"new b".to_vec(),
                mode: 0o100644,
                mtime: 0,
            },
        );

        Fsm::new(tmp.path()).install(&fi, &payload).unwrap();

        // AltName leaves the local file alone and lands beside it.
        assert_eq!(
            std::fs::read(tmp.path().join("etc/a.conf")).unwrap(),
            b"local a"
        );
        assert_eq!(
            std::fs::read(tmp.path().join("etc/a.conf.rpmnew")).unwrap(),
            b"new a"
        );
        // Backup moves the local file aside and installs in place.
        assert_eq!(
            std::fs::read(tmp.path().join("etc/b.conf")).unwrap(),
            b"new b"
        );
        assert_eq!(
            std::fs::read(tmp.path().join("etc/b.conf.rpmorig")).unwrap(),
            b"local b"
        );
    }

    #[test]
    fn test_install_missing_payload_names_file() {
        let tmp = TempDir::new().unwrap();
        let h = HeaderBuilder::new("foo", "1.0", "1")
            .file("/usr/bin/foo", 0o100755, 5, FileFlags::empty())
            .build();
        let mut fi = crate::fileinfo::FileInfoSet::from_header(&h);
        fi.actions[0] = FileAction::Create;

        let err = Fsm::new(tmp.path())
            .install(&fi, &Payload::new())
            .unwrap_err();
        assert!(err.to_string().contains("/usr/bin/foo"));
    }

    #[test]
    fn test_erase_reverse_order_and_backup() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("opt/app")).unwrap();
        std::fs::write(tmp.path().join("opt/app/bin"), b"x").unwrap();
        std::fs::write(tmp.path().join("opt/app/app.conf"), b"edited").unwrap();

        let h = HeaderBuilder::new("app", "1.0", "1")
            .file("/opt/app", 0o040755, 0, FileFlags::empty())
            .file("/opt/app/bin", 0o100755, 1, FileFlags::empty())
            .file("/opt/app/app.conf", 0o100644, 6, FileFlags::CONFIG)
            .build();
        let mut fi = crate::fileinfo::FileInfoSet::from_header(&h);
        fi.actions[0] = FileAction::Erase;
        fi.actions[1] = FileAction::Erase;
        fi.actions[2] = FileAction::Backup;

        Fsm::new(tmp.path()).erase(&fi).unwrap();
        assert!(!tmp.path().join("opt/app/bin").exists());
        assert!(tmp.path().join("opt/app/app.conf.rpmsave").exists());
        // The config save keeps the directory alive; that is tolerated.
        assert!(tmp.path().join("opt/app").exists());
    }

    #[test]
    fn test_restore_backup_returns_saved_copy() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("etc")).unwrap();
        std::fs::write(tmp.path().join("etc/b.conf.rpmorig"), b"local b").unwrap();

        let fsm = Fsm::new(tmp.path());
        fsm.restore_backup("/etc/b.conf").unwrap();
        assert_eq!(
            std::fs::read(tmp.path().join("etc/b.conf")).unwrap(),
            b"local b"
        );
        assert!(!tmp.path().join("etc/b.conf.rpmorig").exists());

        // No saved copy is fine; the path is simply left alone.
        fsm.restore_backup("/etc/missing.conf").unwrap();
        assert!(!tmp.path().join("etc/missing.conf").exists());
    }

    #[test]
    fn test_ghost_never_materialized() {
        let tmp = TempDir::new().unwrap();
        let h = HeaderBuilder::new("foo", "1.0", "1")
            .file("/var/log/foo.log", 0o100644, 0, FileFlags::GHOST)
            .build();
        let mut fi = crate::fileinfo::FileInfoSet::from_header(&h);
        fi.actions[0] = FileAction::Create;

        Fsm::new(tmp.path()).install(&fi, &Payload::new()).unwrap();
        assert!(!tmp.path().join("var/log/foo.log").exists());
    }
}
