// src/transaction/runner.rs

//! Transaction execution
//!
//! Running a transaction is two phases under one advisory lock. Resolution
//! builds every element's file set, checks identities against the
//! database, fingerprints all paths, and runs the disposition passes plus
//! disk accounting, collecting problems as it goes. If anything blocks (or
//! test mode is set) the run stops there. Commit then drives each element
//! through its package state machine in transaction order; a failed
//! install condemns its linked erasures, and when auto-rollback is
//! configured the already-committed operations are inverted from the
//! repackage spool.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use chrono::Utc;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::disposition::{
    handle_inst_installed_files, handle_overlapped_files, handle_rmvd_installed_files, skip_files,
};
use crate::element::{ElementType, TransactionElement, mark_linked_failed};
use crate::error::{Error, Result};
use crate::fileinfo::{FileAction, FileInfoSet, is_directory};
use crate::fingerprint::{Fingerprint, FingerprintCache, SharedFileIndex};
use crate::fsm::Fsm;
use crate::lock::TransactionLock;
use crate::nevra::Nevra;
use crate::problems::{ProblemKind, ProblemSet};
use crate::psm::Psm;
use crate::repackage::Repackager;
use crate::rpmdb::PackageDb;
use crate::scriptlet::{ScriptPhase, ScriptletExecutor};

use super::{NotifyCallback, NotifyEvent, TransFlags, Transaction};

/// Outcome of one transaction run
#[derive(Debug)]
pub struct TransactionReport {
    /// Every problem found during resolution, waived ones included
    pub problems: ProblemSet,
    /// The commit phase ran (test mode and blocked runs never commit)
    pub committed: bool,
    /// Elements whose state machine failed
    pub failed: Vec<Nevra>,
    /// A failure triggered automatic rollback of the committed prefix
    pub rolled_back: bool,
}

impl TransactionReport {
    pub fn is_clean(&self) -> bool {
        self.committed && self.failed.is_empty()
    }
}

impl Transaction {
    /// Resolve and (unless blocked) commit the queued operations
    pub fn run(
        &mut self,
        mut notify: Option<&mut dyn NotifyCallback>,
    ) -> Result<TransactionReport> {
        if self.elements.is_empty() {
            return Err(Error::EmptyTransaction);
        }

        let test = self.flags.contains(TransFlags::TEST);
        let _lock = if test {
            None
        } else {
            Some(TransactionLock::acquire(&self.config.lock_path)?)
        };

        let mut problems = ProblemSet::new(self.filter);

        self.prepare_elements(&mut problems)?;
        if !problems.has_blockers() {
            self.run_trans_scripts(ScriptPhase::PreTransaction, TransFlags::NO_PRETRANS);
        }

        let (mut cache, index) = self.fingerprint_elements();
        self.resolve_installed(&mut cache, &mut problems)?;
        handle_overlapped_files(
            &mut self.elements,
            &index,
            self.color,
            self.pref_color,
            &self.config.root,
            &mut problems,
        );
        self.check_disk_space(&mut problems);

        if problems.has_blockers() || test {
            for p in problems.blockers() {
                warn!("{}", p);
            }
            return Ok(TransactionReport {
                problems,
                committed: false,
                failed: Vec::new(),
                rolled_back: false,
            });
        }

        let repackaged = self.repackage_removals()?;

        emit(&mut notify, &NotifyEvent::TransactionStart {
            elements: self.elements.len(),
        });
        let (failed, rolled_back) = self.commit(&mut notify, &repackaged)?;
        emit(&mut notify, &NotifyEvent::TransactionDone {
            failed: failed.len(),
        });

        if !rolled_back {
            self.run_trans_scripts(ScriptPhase::PostTransaction, TransFlags::NO_POSTTRANS);
        }
        self.db.sync()?;

        Ok(TransactionReport {
            problems,
            committed: !rolled_back,
            failed,
            rolled_back,
        })
    }

    /// Build every element's file set and check package identities
    fn prepare_elements(&mut self, problems: &mut ProblemSet) -> Result<()> {
        let db = &self.db;
        let elements = &mut self.elements;

        for element in elements.iter_mut() {
            match element.kind {
                ElementType::Added => {
                    for (_, installed) in db.find_by_name(&element.nevra.name)? {
                        let inst_nevra = installed.nevra()?;
                        match element.nevra.compare_evr(&inst_nevra) {
                            Ordering::Equal if element.nevra.arch == inst_nevra.arch => {
                                problems
                                    .append(element.nevra.clone(), ProblemKind::PackageInstalled);
                            }
                            Ordering::Less => {
                                problems.append(
                                    element.nevra.clone(),
                                    ProblemKind::OldPackage {
                                        installed: inst_nevra,
                                    },
                                );
                            }
                            _ => {}
                        }
                    }
                    element.fi = Some(FileInfoSet::from_header(&element.header));
                }
                ElementType::Removed => {
                    let mut fi = FileInfoSet::from_header(&element.header);
                    fi.record = element.db_instance;
                    let states = db.file_states(element.db_instance)?;
                    if states.len() == fi.file_count() {
                        fi.states = states;
                    }
                    element.fi = Some(fi);
                }
            }
        }
        Ok(())
    }

    /// Apply policy skips, fingerprint every path, build the shared index
    fn fingerprint_elements(&mut self) -> (FingerprintCache, SharedFileIndex) {
        let mut cache = FingerprintCache::new(&self.config.root);
        let mut index = SharedFileIndex::new();
        for ix in 0..self.elements.len() {
            let added = self.elements[ix].is_added();
            if let Some(fi) = self.elements[ix].fi.as_mut() {
                if added {
                    skip_files(fi, &self.config, self.color);
                }
                fi.fingerprints = cache.lookup_list(fi);
                index.add_element(ix, &fi.fingerprints);
            }
        }
        (cache, index)
    }

    /// Resolve each element against installed packages sharing fingerprints
    fn resolve_installed(
        &mut self,
        cache: &mut FingerprintCache,
        problems: &mut ProblemSet,
    ) -> Result<()> {
        let removed_instances: HashSet<u32> = self
            .elements
            .iter()
            .filter(|e| e.is_removed())
            .map(|e| e.db_instance)
            .collect();
        let skip_missing = !self.flags.contains(TransFlags::ALL_FILES);

        let db = &self.db;
        let config = &self.config;
        let elements = &mut self.elements;

        for element in elements.iter_mut() {
            let Some(el_fps) = element.fi.as_ref().map(|fi| fi.fingerprints.clone()) else {
                continue;
            };
            let bases: Vec<&str> = element
                .fi
                .as_ref()
                .map(|fi| fi.base_names.iter().map(String::as_str).collect())
                .unwrap_or_default();

            for instance in db.packages_with_basenames(&bases)? {
                if instance == element.db_instance {
                    continue;
                }
                let other_header = db.header(instance)?;
                let other_nevra = other_header.nevra()?;
                let mut other = FileInfoSet::from_header(&other_header);
                other.record = instance;
                let states = db.file_states(instance)?;
                if states.len() == other.file_count() {
                    other.states = states;
                }

                let shared = shared_pairs(&el_fps, &cache.lookup_list(&other));
                if shared.is_empty() {
                    continue;
                }
                let being_removed = removed_instances.contains(&instance);

                let package = element.nevra.clone();
                let kind = element.kind;
                let Some(fi) = element.fi.as_mut() else {
                    continue;
                };
                match kind {
                    ElementType::Added => handle_inst_installed_files(
                        fi,
                        &package,
                        &other,
                        &other_nevra,
                        &shared,
                        being_removed,
                        self.color,
                        self.pref_color,
                        &config.root,
                        skip_missing,
                        problems,
                    ),
                    ElementType::Removed => {
                        handle_rmvd_installed_files(fi, &other.states, &shared)
                    }
                }
            }
        }
        Ok(())
    }

    /// Project disk usage per element and report exhaustion
    fn check_disk_space(&mut self, problems: &mut ProblemSet) {
        let mut usage = crate::diskspace::DiskUsage::new(&self.config.root);
        for element in &self.elements {
            if let Some(fi) = element.fi.as_ref() {
                usage.account(fi);
                usage.check(&element.nevra, problems);
            }
        }
    }

    /// Capture removals into the repackage spool when configured
    fn repackage_removals(&self) -> Result<HashMap<usize, PathBuf>> {
        let mut out = HashMap::new();
        if !self.flags.contains(TransFlags::REPACKAGE) && !self.config.rollback_on_failure {
            return Ok(out);
        }
        let tid = Utc::now().timestamp() as u32;
        let repackager = Repackager::new(&self.config, tid);
        for (ix, element) in self.elements.iter().enumerate() {
            if !element.is_removed() || element.failed {
                continue;
            }
            if let Some(fi) = element.fi.as_ref() {
                out.insert(ix, repackager.repackage(&element.header, fi)?);
            }
        }
        Ok(out)
    }

    /// Drive each element through its state machine in transaction order
    fn commit(
        &mut self,
        notify: &mut Option<&mut dyn NotifyCallback>,
        repackaged: &HashMap<usize, PathBuf>,
    ) -> Result<(Vec<Nevra>, bool)> {
        let Transaction {
            ref config,
            ref mut db,
            ref mut elements,
            ref payloads,
            flags,
            ..
        } = *self;
        let scripts = ScriptletExecutor::new(&config.root, config.scriptlet_timeout);

        let mut failed: Vec<Nevra> = Vec::new();
        let mut committed: Vec<usize> = Vec::new();

        for ix in 0..elements.len() {
            if elements[ix].failed {
                continue;
            }
            let kind = elements[ix].kind;
            let package = elements[ix].nevra.clone();
            emit(notify, &NotifyEvent::ElementStart {
                package: package.clone(),
                kind,
            });

            let mut psm = Psm::new(config, db, &scripts, flags);
            let result = match kind {
                ElementType::Added => {
                    let payload = payloads.get(&ix).ok_or_else(|| {
                        Error::Transaction(format!("{} has no payload", package))
                    })?;
                    let remaining = if elements[ix].erasures.is_empty() { 1 } else { 2 };
                    psm.install(&mut elements[ix], payload, remaining)
                }
                ElementType::Removed => {
                    let remaining = u32::from(elements[ix].superseded_by.is_some());
                    psm.erase(&mut elements[ix], remaining)
                }
            };

            let ok = result.is_ok();
            emit(notify, &NotifyEvent::ElementDone {
                package: package.clone(),
                ok,
            });

            match result {
                Ok(_) => committed.push(ix),
                Err(e) => {
                    warn!("{} failed: {}", package, e);
                    failed.push(package);
                    mark_linked_failed(elements, ix);

                    if config.rollback_on_failure {
                        info!("rolling back {} committed operations", committed.len());
                        rollback(config, db, elements, &committed, repackaged)?;
                        return Ok((failed, true));
                    }
                }
            }
        }

        Ok((failed, false))
    }

    /// Run a transaction-scoped scriptlet phase over the added elements
    ///
    /// These phases are advisory: a failing script is logged, never fatal.
    fn run_trans_scripts(&self, phase: ScriptPhase, suppress: TransFlags) {
        if self.flags.contains(TransFlags::TEST)
            || self.flags.contains(TransFlags::NO_SCRIPTS)
            || self.flags.contains(suppress)
        {
            return;
        }
        let scripts = ScriptletExecutor::new(&self.config.root, self.config.scriptlet_timeout);
        for element in self.elements.iter().filter(|e| e.is_added() && !e.failed) {
            if let Err(e) = scripts.run(&element.header, phase, 1) {
                warn!("{} {} scriptlet: {}", element.nevra, phase.as_str(), e);
            }
        }
    }
}

/// Invert the committed prefix of a failed transaction, newest first
fn rollback(
    config: &EngineConfig,
    db: &mut PackageDb,
    elements: &mut [TransactionElement],
    committed: &[usize],
    repackaged: &HashMap<usize, PathBuf>,
) -> Result<()> {
    let scripts = ScriptletExecutor::new(&config.root, config.scriptlet_timeout);
    let mut psm = Psm::new(config, db, &scripts, TransFlags::NO_SCRIPTS);

    for &ix in committed.iter().rev() {
        match elements[ix].kind {
            ElementType::Added => {
                // Undo the install: erase exactly what was laid down, then
                // put saved-aside copies back under their own names.
                let mut backed_up = Vec::new();
                if let Some(fi) = elements[ix].fi.as_mut() {
                    for i in 0..fi.file_count() {
                        if fi.actions[i] == FileAction::Backup {
                            backed_up.push(fi.path(i));
                        }
                        fi.actions[i] = match fi.actions[i] {
                            FileAction::Create | FileAction::Backup => FileAction::Erase,
                            _ => FileAction::Skip,
                        };
                    }
                }
                psm.erase(&mut elements[ix], 0)?;
                let fsm = Fsm::new(&config.root);
                for path in &backed_up {
                    fsm.restore_backup(path)?;
                }
            }
            ElementType::Removed => {
                let Some(archive) = repackaged.get(&ix) else {
                    warn!(
                        "{} was erased but has no repackage archive; cannot restore",
                        elements[ix].nevra
                    );
                    continue;
                };
                let (header, payload) = Repackager::load(archive)?;
                let nevra = header.nevra()?;
                let mut fi = FileInfoSet::from_header(&header);
                for i in 0..fi.file_count() {
                    let present =
                        is_directory(fi.modes[i]) || payload.get(&fi.path(i)).is_some();
                    fi.actions[i] = if present {
                        FileAction::Create
                    } else {
                        FileAction::Skip
                    };
                }
                let mut restored = TransactionElement::added(header, nevra, None);
                restored.fi = Some(fi);
                psm.restore(&mut restored, &payload)?;
            }
        }
    }
    Ok(())
}

/// Pairs of (element file, other file) sharing a fingerprint, in order
fn shared_pairs(el_fps: &[Fingerprint], other_fps: &[Fingerprint]) -> Vec<(usize, usize)> {
    let mut by_fp: HashMap<&Fingerprint, Vec<usize>> = HashMap::new();
    for (i, fp) in el_fps.iter().enumerate() {
        by_fp.entry(fp).or_default().push(i);
    }
    let mut pairs = Vec::new();
    for (j, ofp) in other_fps.iter().enumerate() {
        if let Some(is) = by_fp.get(ofp) {
            for &i in is {
                pairs.push((i, j));
            }
        }
    }
    pairs.sort_unstable();
    pairs
}

fn emit(notify: &mut Option<&mut dyn NotifyCallback>, event: &NotifyEvent) {
    if let Some(cb) = notify.as_mut() {
        cb.notify(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fileinfo::FileFlags;
    use crate::header::HeaderBuilder;
    use crate::payload::{Payload, PayloadEntry};
    use tempfile::TempDir;

    fn payload_for(files: &[(&str, &[u8])]) -> Payload {
        let mut p = Payload::new();
        for (path, content) in files {
            p.insert(
                path,
                PayloadEntry {
                    content: content.to_vec(),
                    mode: 0o100644,
                    mtime: 0,
                },
            );
        }
        p
    }

    #[test]
    fn test_empty_transaction_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut ts = Transaction::new(EngineConfig::new(tmp.path())).unwrap();
        assert!(matches!(ts.run(None), Err(Error::EmptyTransaction)));
    }

    #[test]
    fn test_test_mode_commits_nothing() {
        let tmp = TempDir::new().unwrap();
        let mut ts = Transaction::new(EngineConfig::new(tmp.path())).unwrap();
        let h = HeaderBuilder::new("foo", "1.0", "1")
            .file("/usr/bin/foo", 0o100755, 5, FileFlags::empty())
            .build();
        ts.install(h, payload_for(&[("/usr/bin/foo", b"hello")]))
            .unwrap();
        ts.set_flags(TransFlags::TEST);

        let report = ts.run(None).unwrap();
        assert!(!report.committed);
        assert!(!tmp.path().join("usr/bin/foo").exists());
        assert_eq!(ts.db().package_count().unwrap(), 0);
    }

    #[test]
    fn test_duplicate_install_blocks() {
        let tmp = TempDir::new().unwrap();
        let mut ts = Transaction::new(EngineConfig::new(tmp.path())).unwrap();
        let h = HeaderBuilder::new("foo", "1.0", "1").arch("x86_64").build();
        ts.db.add_package(&h, &[]).unwrap();

        ts.install(h, Payload::new()).unwrap();
        let report = ts.run(None).unwrap();
        assert!(!report.committed);
        assert!(report.problems.has_blockers());
        assert!(
            report
                .problems
                .iter()
                .any(|p| matches!(p.kind, ProblemKind::PackageInstalled))
        );
    }

    #[test]
    fn test_downgrade_reported_and_waivable() {
        let tmp = TempDir::new().unwrap();
        let mut ts = Transaction::new(EngineConfig::new(tmp.path())).unwrap();
        let newer = HeaderBuilder::new("foo", "2.0", "1").build();
        ts.db.add_package(&newer, &[]).unwrap();

        let older = HeaderBuilder::new("foo", "1.0", "1")
            .file("/usr/bin/foo", 0o100755, 5, FileFlags::empty())
            .build();
        ts.install(older, payload_for(&[("/usr/bin/foo", b"old")]))
            .unwrap();

        let report = ts.run(None).unwrap();
        assert!(!report.committed);
        assert!(
            report
                .problems
                .iter()
                .any(|p| matches!(p.kind, ProblemKind::OldPackage { .. }))
        );
    }

    #[test]
    fn test_shared_pairs_ordering() {
        let tmp = TempDir::new().unwrap();
        let mut cache = FingerprintCache::new(tmp.path());
        let a = cache.lookup("/usr/bin/", "x");
        let b = cache.lookup("/usr/bin/", "y");
        let pairs = shared_pairs(&[a.clone(), b.clone()], &[b, a]);
        assert_eq!(pairs, vec![(0, 1), (1, 0)]);
    }
}
