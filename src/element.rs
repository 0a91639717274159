// src/element.rs

//! Transaction elements
//!
//! One element per package operation: an install adds one `Added` element,
//! an upgrade adds an `Added` element linked to the `Removed` elements it
//! supersedes. Each element exclusively owns its file info set once the
//! runner has populated it.

use std::sync::Arc;

use crate::fileinfo::FileInfoSet;
use crate::header::Header;
use crate::nevra::Nevra;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    Added,
    Removed,
}

/// A single package operation within a transaction
#[derive(Debug)]
pub struct TransactionElement {
    pub header: Arc<Header>,
    pub nevra: Nevra,
    pub kind: ElementType,
    /// Caller-supplied key, typically the package file path; carried
    /// through notification callbacks untouched
    pub key: Option<String>,
    /// Database instance; nonzero for removed elements and for added
    /// elements once committed
    pub db_instance: u32,
    /// Per-file state, populated by the runner before resolution
    pub fi: Option<FileInfoSet>,
    /// Element failed (or was condemned by a linked failure); its
    /// stages are skipped for the rest of the run
    pub failed: bool,
    /// For added elements: indices of removed elements this install
    /// supersedes (the erasure half of an upgrade)
    pub erasures: Vec<usize>,
    /// For removed elements: index of the added element superseding it
    pub superseded_by: Option<usize>,
    /// Package color, already masked by the transaction color
    pub color: u32,
}

impl TransactionElement {
    pub fn added(header: Arc<Header>, nevra: Nevra, key: Option<String>) -> Self {
        let color = header.color();
        Self {
            header,
            nevra,
            kind: ElementType::Added,
            key,
            db_instance: 0,
            fi: None,
            failed: false,
            erasures: Vec::new(),
            superseded_by: None,
            color,
        }
    }

    pub fn removed(header: Arc<Header>, nevra: Nevra, db_instance: u32) -> Self {
        let color = header.color();
        Self {
            header,
            nevra,
            kind: ElementType::Removed,
            key: None,
            db_instance,
            fi: None,
            failed: false,
            erasures: Vec::new(),
            superseded_by: None,
            color,
        }
    }

    pub fn is_added(&self) -> bool {
        self.kind == ElementType::Added
    }

    pub fn is_removed(&self) -> bool {
        self.kind == ElementType::Removed
    }

    /// File count of this element's header
    pub fn file_count(&self) -> usize {
        self.header.file_count()
    }
}

/// Condemn every erasure linked to a failed added element
///
/// When an install fails, the removals it superseded must not proceed or
/// the old package would be lost without its replacement.
pub fn mark_linked_failed(elements: &mut [TransactionElement], failed: usize) {
    elements[failed].failed = true;
    let linked: Vec<usize> = elements[failed].erasures.clone();
    for ix in linked {
        if !elements[ix].failed {
            tracing::debug!(
                "skipping erasure of {}: linked install failed",
                elements[ix].nevra
            );
            elements[ix].failed = true;
        }
    }
}
