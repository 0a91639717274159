// src/transaction/mod.rs

//! Transaction assembly
//!
//! A transaction is an ordered set of package operations built up by the
//! caller: installs, upgrades (an install linked to the erasures it
//! supersedes), and erases. Assembly validates nothing beyond identity;
//! all conflict detection happens when the transaction runs.

mod runner;

pub use runner::TransactionReport;

use std::collections::HashMap;
use std::sync::Arc;

use bitflags::bitflags;
use tracing::debug;

use crate::config::EngineConfig;
use crate::element::{ElementType, TransactionElement};
use crate::error::{Error, Result};
use crate::header::Header;
use crate::nevra::Nevra;
use crate::payload::Payload;
use crate::problems::ProblemFilter;
use crate::rpmdb::PackageDb;

bitflags! {
    /// Behavior switches for one transaction run
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TransFlags: u32 {
        /// Resolve and report only; touch nothing
        const TEST         = 1 << 0;
        /// Update the database without touching the filesystem
        const JUST_DB      = 1 << 1;
        /// Suppress all scriptlets
        const NO_SCRIPTS   = 1 << 2;
        /// Install config files even when the on-disk copy is missing
        const ALL_FILES    = 1 << 3;
        /// Capture erased packages into the repackage spool
        const REPACKAGE    = 1 << 4;
        /// Suppress %pretrans scriptlets
        const NO_PRETRANS  = 1 << 5;
        /// Suppress %posttrans scriptlets
        const NO_POSTTRANS = 1 << 6;
    }
}

/// Multilib color bit preferred when two claims collide (64-bit ELF)
pub const PREFER_COLOR: u32 = 0x2;

/// Progress event reported while a transaction runs
#[derive(Debug, Clone)]
pub enum NotifyEvent {
    /// Resolution finished; the commit phase is starting
    TransactionStart { elements: usize },
    ElementStart { package: Nevra, kind: ElementType },
    ElementDone { package: Nevra, ok: bool },
    TransactionDone { failed: usize },
}

/// Receiver for progress events
pub trait NotifyCallback {
    fn notify(&mut self, event: &NotifyEvent);
}

/// An ordered set of package operations against one root
pub struct Transaction {
    pub(crate) config: EngineConfig,
    pub(crate) db: PackageDb,
    pub(crate) elements: Vec<TransactionElement>,
    pub(crate) payloads: HashMap<usize, Payload>,
    pub(crate) flags: TransFlags,
    pub(crate) filter: ProblemFilter,
    /// Mask of colors the transaction cares about; 0 disables coloring
    pub(crate) color: u32,
    pub(crate) pref_color: u32,
}

impl Transaction {
    /// Open a transaction against the configured root and database
    pub fn new(config: EngineConfig) -> Result<Self> {
        let db = PackageDb::open(&config.db_path)?;
        Ok(Self {
            config,
            db,
            elements: Vec::new(),
            payloads: HashMap::new(),
            flags: TransFlags::empty(),
            filter: ProblemFilter::empty(),
            color: 0,
            pref_color: PREFER_COLOR,
        })
    }

    pub fn set_flags(&mut self, flags: TransFlags) {
        self.flags = flags;
    }

    pub fn set_problem_filter(&mut self, filter: ProblemFilter) {
        self.filter = filter;
    }

    /// Enable multilib coloring with the given transaction color mask
    pub fn set_color(&mut self, color: u32) {
        self.color = color;
    }

    /// Queue a fresh install
    pub fn install(&mut self, header: Arc<Header>, payload: Payload) -> Result<()> {
        let nevra = header.nevra()?;
        debug!("queueing install of {}", nevra);
        let ix = self.elements.len();
        self.elements
            .push(TransactionElement::added(header, nevra, None));
        self.payloads.insert(ix, payload);
        Ok(())
    }

    /// Queue an upgrade: install the header, erase every installed
    /// instance of the same name
    pub fn upgrade(&mut self, header: Arc<Header>, payload: Payload) -> Result<()> {
        let nevra = header.nevra()?;
        debug!("queueing upgrade to {}", nevra);
        let add_ix = self.elements.len();
        self.elements
            .push(TransactionElement::added(header, nevra.clone(), None));
        self.payloads.insert(add_ix, payload);

        let installed = self.db.find_by_name(&nevra.name)?;
        for (instance, old_header) in installed {
            let old_nevra = old_header.nevra()?;
            let rm_ix = self.elements.len();
            self.elements
                .push(TransactionElement::removed(old_header, old_nevra, instance));
            self.elements[rm_ix].superseded_by = Some(add_ix);
            self.elements[add_ix].erasures.push(rm_ix);
        }
        Ok(())
    }

    /// Queue erasure of every installed instance of a name
    pub fn erase(&mut self, name: &str) -> Result<()> {
        let installed = self.db.find_by_name(name)?;
        if installed.is_empty() {
            return Err(Error::Transaction(format!(
                "package {} is not installed",
                name
            )));
        }
        for (instance, header) in installed {
            let nevra = header.nevra()?;
            debug!("queueing erase of {}", nevra);
            self.elements
                .push(TransactionElement::removed(header, nevra, instance));
        }
        Ok(())
    }

    /// Queue erasure of one database instance
    pub fn erase_instance(&mut self, instance: u32) -> Result<()> {
        let header = self.db.header(instance)?;
        let nevra = header.nevra()?;
        debug!("queueing erase of {} (instance {})", nevra, instance);
        self.elements
            .push(TransactionElement::removed(header, nevra, instance));
        Ok(())
    }

    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    pub fn elements(&self) -> &[TransactionElement] {
        &self.elements
    }

    /// The underlying package database
    pub fn db(&self) -> &PackageDb {
        &self.db
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fileinfo::{FileFlags, FileState};
    use crate::header::HeaderBuilder;
    use tempfile::TempDir;

    fn transaction(tmp: &TempDir) -> Transaction {
        Transaction::new(EngineConfig::new(tmp.path())).unwrap()
    }

    #[test]
    fn test_install_queues_added_element() {
        let tmp = TempDir::new().unwrap();
        let mut ts = transaction(&tmp);
        let h = HeaderBuilder::new("foo", "1.0", "1")
            .file("/usr/bin/foo", 0o100755, 5, FileFlags::empty())
            .build();
        ts.install(h, Payload::new()).unwrap();
        assert_eq!(ts.element_count(), 1);
        assert!(ts.elements()[0].is_added());
    }

    #[test]
    fn test_upgrade_links_erasures() {
        let tmp = TempDir::new().unwrap();
        let mut ts = transaction(&tmp);

        let old = HeaderBuilder::new("foo", "1.0", "1").build();
        ts.db.add_package(&old, &[]).unwrap();

        let new = HeaderBuilder::new("foo", "2.0", "1").build();
        ts.upgrade(new, Payload::new()).unwrap();

        assert_eq!(ts.element_count(), 2);
        assert_eq!(ts.elements()[0].erasures, vec![1]);
        assert_eq!(ts.elements()[1].superseded_by, Some(0));
    }

    #[test]
    fn test_erase_missing_package_fails() {
        let tmp = TempDir::new().unwrap();
        let mut ts = transaction(&tmp);
        assert!(ts.erase("nosuch").is_err());
    }

    #[test]
    fn test_erase_all_instances() {
        let tmp = TempDir::new().unwrap();
        let mut ts = transaction(&tmp);
        let v1 = HeaderBuilder::new("multi", "1.0", "1").build();
        let v2 = HeaderBuilder::new("multi", "2.0", "1").build();
        ts.db.add_package(&v1, &[FileState::Normal]).unwrap();
        ts.db.add_package(&v2, &[FileState::Normal]).unwrap();

        ts.erase("multi").unwrap();
        assert_eq!(ts.element_count(), 2);
        assert!(ts.elements().iter().all(|e| e.is_removed()));
    }
}
