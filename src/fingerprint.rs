// src/fingerprint.rs

//! Path fingerprinting
//!
//! Two header paths may name the same on-disk file through different
//! spellings (symlinked directories, not-yet-created parents). A
//! fingerprint reduces a path to a canonical identity: the deepest
//! existing ancestor directory with symlinks resolved, the not-yet-existing
//! remainder below it, and the basename. Files whose fingerprints compare
//! equal will collide on disk, whatever the headers call them.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::safe_join;
use crate::fileinfo::FileInfoSet;

/// Canonical identity of one header path
#[derive(Debug, Clone, Eq)]
pub struct Fingerprint {
    /// Deepest existing ancestor directory, symlink-resolved, with a
    /// trailing slash; shared between files under the same directory
    pub entry_dir: Arc<str>,
    /// Remainder of the directory path below `entry_dir` (may be empty)
    pub sub_dir: String,
    pub base_name: String,
}

impl PartialEq for Fingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.base_name == other.base_name
            && self.sub_dir == other.sub_dir
            && *self.entry_dir == *other.entry_dir
    }
}

impl Hash for Fingerprint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entry_dir.hash(state);
        self.sub_dir.hash(state);
        self.base_name.hash(state);
    }
}

impl Fingerprint {
    /// Reassemble the root-relative path this fingerprint stands for
    pub fn to_path(&self) -> String {
        format!("{}{}{}", self.entry_dir, self.sub_dir, self.base_name)
    }
}

/// Directory-level cache for fingerprint computation
///
/// Stat results against the target root are cached per directory string, so
/// fingerprinting every file of a large transaction stats each distinct
/// directory at most once.
#[derive(Debug)]
pub struct FingerprintCache {
    root: PathBuf,
    dirs: HashMap<String, Arc<str>>,
}

impl FingerprintCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            dirs: HashMap::new(),
        }
    }

    /// Fingerprint one (directory, basename) pair
    pub fn lookup(&mut self, dir_name: &str, base_name: &str) -> Fingerprint {
        let entry_dir = self.canonical_entry(dir_name);
        let sub_dir = dir_name
            .strip_prefix(&*entry_dir)
            .unwrap_or("")
            .to_string();
        Fingerprint {
            entry_dir,
            sub_dir,
            base_name: base_name.to_string(),
        }
    }

    /// Fingerprint every file of an info set, memoizing per directory index
    pub fn lookup_list(&mut self, fi: &FileInfoSet) -> Vec<Fingerprint> {
        let mut per_dir: Vec<Option<Arc<str>>> = vec![None; fi.dir_count()];
        let mut out = Vec::with_capacity(fi.file_count());
        for i in 0..fi.file_count() {
            let dx = fi.dir_indexes[i] as usize;
            let entry_dir = match &per_dir[dx] {
                Some(e) => e.clone(),
                None => {
                    let e = self.canonical_entry(&fi.dir_names[dx]);
                    per_dir[dx] = Some(e.clone());
                    e
                }
            };
            let sub_dir = fi.dir_names[dx]
                .strip_prefix(&*entry_dir)
                .unwrap_or("")
                .to_string();
            out.push(Fingerprint {
                entry_dir,
                sub_dir,
                base_name: fi.base_names[i].clone(),
            });
        }
        out
    }

    /// Resolve the deepest existing ancestor of a directory path
    ///
    /// Walks upward one component at a time until a stat under the root
    /// succeeds, then canonicalizes that ancestor to collapse symlinks.
    fn canonical_entry(&mut self, dir_name: &str) -> Arc<str> {
        if let Some(cached) = self.dirs.get(dir_name) {
            return cached.clone();
        }

        let mut candidate = dir_name.to_string();
        let entry: Arc<str> = loop {
            if candidate == "/" || candidate.is_empty() {
                break Arc::from("/");
            }
            if let Some(cached) = self.dirs.get(&candidate) {
                break cached.clone();
            }
            match self.stat_dir(&candidate) {
                Some(canonical) => break Arc::from(canonical.as_str()),
                None => candidate = parent_dir(&candidate),
            }
        };

        self.dirs.insert(dir_name.to_string(), entry.clone());
        entry
    }

    /// Canonicalize a root-relative directory if it exists as a directory
    fn stat_dir(&self, dir: &str) -> Option<String> {
        let joined = if dir == "/" {
            self.root.clone()
        } else {
            safe_join(&self.root, dir).ok()?
        };
        let meta = joined.metadata().ok()?;
        if !meta.is_dir() {
            return None;
        }
        let canonical = joined.canonicalize().ok()?;
        let relative = canonical
            .strip_prefix(&self.canonical_root())
            .map(Path::to_path_buf)
            .unwrap_or(canonical);
        let mut s = format!("/{}", relative.display());
        if s == "//" {
            s = "/".to_string();
        }
        if !s.ends_with('/') {
            s.push('/');
        }
        Some(s)
    }

    fn canonical_root(&self) -> PathBuf {
        self.root
            .canonicalize()
            .unwrap_or_else(|_| self.root.clone())
    }
}

/// Parent of a directory path that keeps its trailing slash
fn parent_dir(dir: &str) -> String {
    let trimmed = dir.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(pos) => trimmed[..=pos].to_string(),
    }
}

/// Reference to one file of one transaction element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileRef {
    pub element: usize,
    pub file: usize,
}

/// Index of every fingerprint claimed by more than zero transaction files
///
/// Per-fingerprint lists preserve insertion order, so iterating the index
/// visits claimants in (element index, file index) order.
#[derive(Debug, Default)]
pub struct SharedFileIndex {
    map: HashMap<Fingerprint, Vec<FileRef>>,
}

impl SharedFileIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every fingerprint of one element's file set
    pub fn add_element(&mut self, element: usize, fingerprints: &[Fingerprint]) {
        for (file, fp) in fingerprints.iter().enumerate() {
            self.map
                .entry(fp.clone())
                .or_default()
                .push(FileRef { element, file });
        }
    }

    /// All transaction files colliding on the given fingerprint
    pub fn claimants(&self, fp: &Fingerprint) -> &[FileRef] {
        self.map.get(fp).map_or(&[], Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
