// src/problems.rs

//! Transaction problem set
//!
//! Non-fatal per-package conditions discovered during resolution collect
//! here instead of aborting the run. Each problem kind can be waived by the
//! matching probe filter bit, in which case it is recorded as ignored and
//! does not block commit.

use std::fmt;

use bitflags::bitflags;

use crate::nevra::Nevra;

bitflags! {
    /// Waivers for individual problem classes
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ProblemFilter: u32 {
        /// Permit replacing files owned by other to-be-installed packages
        const REPLACE_NEW_FILES = 1 << 0;
        /// Permit replacing files owned by already-installed packages
        const REPLACE_OLD_FILES = 1 << 1;
        /// Permit downgrading an installed package
        const OLD_PACKAGE       = 1 << 2;
        /// Permit reinstalling the identical package
        const REPLACE_PKG       = 1 << 3;
        /// Ignore filesystem block exhaustion
        const DISK_SPACE        = 1 << 4;
        /// Ignore filesystem inode exhaustion
        const DISK_NODES        = 1 << 5;
    }
}

/// One diagnosable condition attached to a package
#[derive(Debug, Clone, PartialEq)]
pub enum ProblemKind {
    /// A file is claimed by two packages being installed together
    NewFileConflict { path: String, other: Nevra },
    /// A file conflicts with one owned by an installed package
    FileConflict { path: String, other: Nevra },
    /// The package is older than the installed version
    OldPackage { installed: Nevra },
    /// The exact package is already installed
    PackageInstalled,
    /// Committing would exhaust free blocks on a filesystem
    DiskSpace { mount: String, needed: u64, available: u64 },
    /// Committing would exhaust free inodes on a filesystem
    DiskNodes { mount: String, needed: u64, available: u64 },
}

impl ProblemKind {
    fn filter_bit(&self) -> ProblemFilter {
        match self {
            Self::NewFileConflict { .. } => ProblemFilter::REPLACE_NEW_FILES,
            Self::FileConflict { .. } => ProblemFilter::REPLACE_OLD_FILES,
            Self::OldPackage { .. } => ProblemFilter::OLD_PACKAGE,
            Self::PackageInstalled => ProblemFilter::REPLACE_PKG,
            Self::DiskSpace { .. } => ProblemFilter::DISK_SPACE,
            Self::DiskNodes { .. } => ProblemFilter::DISK_NODES,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Problem {
    pub package: Nevra,
    pub kind: ProblemKind,
    /// Waived by the active filter; kept for reporting but non-blocking
    pub ignored: bool,
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ProblemKind::NewFileConflict { path, other } => write!(
                f,
                "file {} conflicts between attempted installs of {} and {}",
                path, self.package, other
            ),
            ProblemKind::FileConflict { path, other } => write!(
                f,
                "file {} from install of {} conflicts with file from package {}",
                path, self.package, other
            ),
            ProblemKind::OldPackage { installed } => write!(
                f,
                "package {} (which is newer than {}) is already installed",
                installed, self.package
            ),
            ProblemKind::PackageInstalled => {
                write!(f, "package {} is already installed", self.package)
            }
            ProblemKind::DiskSpace {
                mount,
                needed,
                available,
            } => write!(
                f,
                "installing {} needs {} bytes on the {} filesystem ({} available)",
                self.package, needed, mount, available
            ),
            ProblemKind::DiskNodes {
                mount,
                needed,
                available,
            } => write!(
                f,
                "installing {} needs {} inodes on the {} filesystem ({} available)",
                self.package, needed, mount, available
            ),
        }
    }
}

/// Deduplicating collection of problems for one transaction run
#[derive(Debug, Default)]
pub struct ProblemSet {
    problems: Vec<Problem>,
    filter: ProblemFilter,
}

impl ProblemSet {
    pub fn new(filter: ProblemFilter) -> Self {
        Self {
            problems: Vec::new(),
            filter,
        }
    }

    /// Record a problem, marking it ignored if its class is waived
    pub fn append(&mut self, package: Nevra, kind: ProblemKind) {
        let ignored = self.filter.contains(kind.filter_bit());
        let problem = Problem {
            package,
            kind,
            ignored,
        };
        // Resolution passes can rediscover the same conflict from both
        // sides of an overlap; keep one copy.
        if !self.problems.contains(&problem) {
            self.problems.push(problem);
        }
    }

    /// Problems that actually block the transaction
    pub fn blockers(&self) -> impl Iterator<Item = &Problem> {
        self.problems.iter().filter(|p| !p.ignored)
    }

    /// True when any non-ignored problem remains
    pub fn has_blockers(&self) -> bool {
        self.blockers().next().is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.problems.is_empty()
    }

    pub fn len(&self) -> usize {
        self.problems.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Problem> {
        self.problems.iter()
    }

    /// Drop disk accounting problems so they can be recomputed
    pub fn clear_disk_problems(&mut self) {
        self.problems.retain(|p| {
            !matches!(
                p.kind,
                ProblemKind::DiskSpace { .. } | ProblemKind::DiskNodes { .. }
            )
        });
    }
}
