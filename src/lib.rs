// src/lib.rs

//! Package installation transaction engine
//!
//! Executes ordered sets of package installs, upgrades, and erases against
//! a filesystem root and an SQLite-backed installed-package database.
//!
//! # Architecture
//!
//! - Two-phase runs: full conflict resolution (fingerprints, dispositions,
//!   disk accounting) before a single byte is written
//! - Fingerprint identity: symlink-aware canonical paths decide which
//!   header files collide on disk
//! - Per-file dispositions: every file gets a terminal action (create,
//!   skip variants, backup, alternate name, erase) before commit
//! - State machines: a package state machine sequences scriptlets,
//!   filesystem work, and the database record per element
//! - Safety nets: advisory locking, repackaging of erased packages, and
//!   optional automatic rollback of failed transactions

pub mod config;
pub mod diskspace;
pub mod disposition;
pub mod element;
mod error;
pub mod fileinfo;
pub mod fingerprint;
pub mod fsm;
pub mod header;
pub mod lock;
pub mod nevra;
pub mod payload;
pub mod problems;
pub mod psm;
pub mod repackage;
pub mod rpmdb;
pub mod scriptlet;
pub mod transaction;
pub mod verify;

pub use config::EngineConfig;
pub use element::{ElementType, TransactionElement};
pub use error::{Error, Result};
pub use fileinfo::{FileAction, FileFlags, FileInfoSet, FileState};
pub use header::{Header, HeaderBuilder, Tag, Value};
pub use nevra::Nevra;
pub use payload::{CpioEntry, CpioReader, CpioWriter, Payload, PayloadEntry};
pub use problems::{Problem, ProblemFilter, ProblemKind, ProblemSet};
pub use rpmdb::PackageDb;
pub use transaction::{
    NotifyCallback, NotifyEvent, TransFlags, Transaction, TransactionReport,
};
pub use verify::{VerifyFlags, VerifyReport, verify_all};
