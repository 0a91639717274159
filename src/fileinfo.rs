// src/fileinfo.rs

//! Per-element file info set
//!
//! Parallel arrays indexed by file number, mirroring the header's file
//! tags, plus the per-file disposition state the resolver fills in. One
//! file info set is exclusively owned by its transaction element.

use std::fs;
use std::io::Read;
use std::path::Path;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::header::{Header, Tag};

bitflags! {
    /// Per-file attribute flags carried in the header
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct FileFlags: u32 {
        const CONFIG    = 1 << 0;
        const DOC       = 1 << 1;
        const MISSINGOK = 1 << 3;
        const NOREPLACE = 1 << 4;
        const GHOST     = 1 << 6;
        const LICENSE   = 1 << 7;
        const README    = 1 << 8;
        /// Set during resolution: the file exists on disk
        const EXISTS    = 1 << 9;
        /// Set during resolution: the on-disk file is sparse
        const SPARSE    = 1 << 10;
    }
}

bitflags! {
    /// Payload mapping modifiers handed to the file state machine
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MapFlags: u32 {
        /// Recheck setuid/setgid bits on overlapping installed files
        const SBIT_CHECK    = 1 << 0;
        /// Archive entries carry absolute paths (repackage)
        const ABSOLUTE      = 1 << 1;
        /// Prefix archive entries with "./" (repackage)
        const ADD_DOT       = 1 << 2;
        /// Map every hardlink, not just the last (repackage)
        const ALL_HARDLINKS = 1 << 3;
    }
}

/// Terminal per-file disposition
///
/// `Unknown` is the initial sentinel; every other value is terminal for the
/// file within one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileAction {
    Unknown,
    Create,
    Skip,
    SkipNstate,
    SkipNetShared,
    SkipColor,
    Backup,
    AltName,
    Erase,
}

impl FileAction {
    /// True for every skip-like terminal action
    pub fn is_skipped(self) -> bool {
        matches!(
            self,
            Self::Skip | Self::SkipNstate | Self::SkipNetShared | Self::SkipColor
        )
    }
}

/// Recorded install state of a database file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileState {
    Normal,
    Replaced,
    NotInstalled,
    NetShared,
    WrongColor,
}

impl FileState {
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::Replaced => 1,
            Self::NotInstalled => 2,
            Self::NetShared => 3,
            Self::WrongColor => 4,
        }
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Replaced,
            2 => Self::NotInstalled,
            3 => Self::NetShared,
            4 => Self::WrongColor,
            _ => Self::Normal,
        }
    }
}

/// One file of this package replacing a file of another installed package
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedFileInfo {
    /// File number within this package
    pub pkg_file_num: u32,
    /// Database instance of the other package
    pub other_pkg: u32,
    /// File number within the other package
    pub other_file_num: u32,
    /// The other package is itself being removed by this transaction
    pub is_removed: bool,
}

/// Parallel-array record of every file belonging to one transaction element
#[derive(Debug, Clone, Default)]
pub struct FileInfoSet {
    pub dir_names: Vec<String>,
    pub base_names: Vec<String>,
    pub dir_indexes: Vec<u32>,
    pub modes: Vec<u32>,
    pub sizes: Vec<u64>,
    pub flags: Vec<FileFlags>,
    pub digests: Vec<String>,
    pub link_targets: Vec<String>,
    pub langs: Vec<String>,
    pub colors: Vec<u32>,
    pub mtimes: Vec<u32>,
    pub states: Vec<FileState>,
    pub actions: Vec<FileAction>,
    /// Size of the installed file each entry replaces, for disk accounting
    pub replaced_sizes: Vec<u64>,
    /// Files of other installed packages replaced by this element
    pub replaced: Vec<SharedFileInfo>,
    /// Batch-computed fingerprints; empty until the runner fills them
    pub fingerprints: Vec<Fingerprint>,
    pub map_flags: MapFlags,
    /// Database instance for removed elements, 0 for added ones
    pub record: u32,
}

impl FileInfoSet {
    /// Build a file info set from a header's file tags
    pub fn from_header(header: &Header) -> Self {
        let fc = header.file_count();
        let str_arr = |tag| {
            header
                .get_str_array(tag)
                .map(<[String]>::to_vec)
                .unwrap_or_else(|| vec![String::new(); fc])
        };
        let u32_arr = |tag| {
            header
                .get_u32_array(tag)
                .map(<[u32]>::to_vec)
                .unwrap_or_else(|| vec![0; fc])
        };

        Self {
            dir_names: header
                .get_str_array(Tag::DirNames)
                .map(<[String]>::to_vec)
                .unwrap_or_default(),
            base_names: str_arr(Tag::BaseNames),
            dir_indexes: u32_arr(Tag::DirIndexes),
            modes: u32_arr(Tag::FileModes),
            sizes: u32_arr(Tag::FileSizes).into_iter().map(u64::from).collect(),
            flags: u32_arr(Tag::FileFlags)
                .into_iter()
                .map(FileFlags::from_bits_truncate)
                .collect(),
            digests: str_arr(Tag::FileDigests),
            link_targets: str_arr(Tag::FileLinkTos),
            langs: str_arr(Tag::FileLangs),
            colors: u32_arr(Tag::FileColors),
            mtimes: u32_arr(Tag::FileMtimes),
            states: vec![FileState::Normal; fc],
            actions: vec![FileAction::Unknown; fc],
            replaced_sizes: vec![0; fc],
            replaced: Vec::new(),
            fingerprints: Vec::new(),
            map_flags: MapFlags::empty(),
            record: 0,
        }
    }

    /// Number of files
    pub fn file_count(&self) -> usize {
        self.base_names.len()
    }

    /// Number of distinct directories
    pub fn dir_count(&self) -> usize {
        self.dir_names.len()
    }

    /// Directory of file `i`
    pub fn dir(&self, i: usize) -> &str {
        &self.dir_names[self.dir_indexes[i] as usize]
    }

    /// Full path of file `i`
    pub fn path(&self, i: usize) -> String {
        format!("{}{}", self.dir(i), self.base_names[i])
    }

    /// Assign an action, never downgrading a skip-like terminal decision
    pub fn set_action(&mut self, i: usize, action: FileAction) {
        if self.actions[i].is_skipped() && action == FileAction::Create {
            return;
        }
        self.actions[i] = action;
    }

    /// Compare file `i` against `other`'s file `oi`, true when they differ
    ///
    /// Type-specific exemptions: directories compare mode only; symlinks
    /// compare the link target only; device nodes compare mode only.
    pub fn differs_from(&self, i: usize, other: &FileInfoSet, oi: usize) -> bool {
        let mode = self.modes[i];
        let omode = other.modes[oi];

        if file_type_of(mode) != file_type_of(omode) {
            return true;
        }

        match file_type_of(mode) {
            FileType::Directory => false,
            FileType::Symlink => self.link_targets[i] != other.link_targets[oi],
            FileType::Device | FileType::Fifo => mode != omode,
            FileType::Regular => {
                mode != omode
                    || self.sizes[i] != other.sizes[oi]
                    || self.digests[i] != other.digests[oi]
                    || (self.mtimes[i] != 0
                        && other.mtimes[oi] != 0
                        && self.mtimes[i] != other.mtimes[oi]
                        && self.digests[i].is_empty())
            }
        }
    }

    /// Decide the fate of a `%config` file shared with an installed package
    ///
    /// `self`/`i` is the incoming file, `old`/`oi` the installed one. Reads
    /// the live file under `root` to detect local modification.
    pub fn decide_fate(
        &self,
        i: usize,
        old: &FileInfoSet,
        oi: usize,
        skip_missing: bool,
        root: &Path,
    ) -> FileAction {
        let on_disk = match crate::config::safe_join(root, &self.path(i))
            .ok()
            .filter(|p| p.symlink_metadata().is_ok())
        {
            Some(p) => p,
            None => {
                return if skip_missing {
                    FileAction::Skip
                } else {
                    FileAction::Create
                };
            }
        };

        let disk_digest = match file_digest(&on_disk) {
            Ok(d) => d,
            Err(_) => return FileAction::Create,
        };

        if disk_digest == old.digests[oi] {
            // Untouched since the old package installed it: quietly replace.
            return FileAction::Create;
        }
        if disk_digest == self.digests[i] {
            // Locally modified, but already identical to the incoming file.
            return FileAction::Skip;
        }
        if self.flags[i].contains(FileFlags::NOREPLACE) {
            FileAction::AltName
        } else {
            FileAction::Backup
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileType {
    Regular,
    Directory,
    Symlink,
    Fifo,
    Device,
}

fn file_type_of(mode: u32) -> FileType {
    match mode & 0o170000 {
        0o040000 => FileType::Directory,
        0o120000 => FileType::Symlink,
        0o010000 => FileType::Fifo,
        0o020000 | 0o060000 => FileType::Device,
        _ => FileType::Regular,
    }
}

/// True for regular files per the header mode word
pub fn is_regular(mode: u32) -> bool {
    file_type_of(mode) == FileType::Regular
}

/// True for directories per the header mode word
pub fn is_directory(mode: u32) -> bool {
    file_type_of(mode) == FileType::Directory
}

/// Hex SHA-256 digest of a file's contents
pub fn file_digest(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).map_err(|source| Error::Fingerprint {
        path: path.to_path_buf(),
        source,
    })?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hex SHA-256 digest of a byte slice
pub fn digest_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
