// src/psm.rs

//! Package state machine
//!
//! Drives one element through its install or erase lifecycle as a fixed
//! sequence of typed stages: pre-scriptlet, filesystem processing,
//! post-scriptlet, database commit. The machine borrows the element and
//! the shared services for the duration of one operation; it owns nothing.
//!
//! Database commit is last on install so a filesystem failure leaves no
//! phantom record; on erase the record goes last too, so a failed erase
//! still shows the package as installed.

use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::element::TransactionElement;
use crate::error::{Error, Result};
use crate::fileinfo::FileState;
use crate::fsm::Fsm;
use crate::payload::Payload;
use crate::rpmdb::PackageDb;
use crate::scriptlet::{ScriptPhase, ScriptletExecutor};
use crate::transaction::TransFlags;

/// Lifecycle stage of one package operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    PreScript,
    Process,
    PostScript,
    Commit,
}

/// Package state machine bound to one transaction's services
pub struct Psm<'a> {
    config: &'a EngineConfig,
    db: &'a mut PackageDb,
    scripts: &'a ScriptletExecutor,
    flags: TransFlags,
}

impl<'a> Psm<'a> {
    pub fn new(
        config: &'a EngineConfig,
        db: &'a mut PackageDb,
        scripts: &'a ScriptletExecutor,
        flags: TransFlags,
    ) -> Self {
        Self {
            config,
            db,
            scripts,
            flags,
        }
    }

    /// Install one added element from its payload
    ///
    /// `remaining` is the post-operation instance count handed to
    /// scriptlets: 1 for a fresh install, 2 when upgrading.
    pub fn install(
        &mut self,
        element: &mut TransactionElement,
        payload: &Payload,
        remaining: u32,
    ) -> Result<()> {
        info!("installing {}", element.nevra);

        self.script_stage(element, Stage::PreScript, ScriptPhase::PreInstall, remaining)?;

        if !self.flags.contains(TransFlags::JUST_DB) {
            self.stage(element, Stage::Process);
            let fi = element
                .fi
                .as_ref()
                .ok_or_else(|| Error::Transaction(format!("{} has no file set", element.nevra)))?;
            Fsm::new(&self.config.root).install(fi, payload)?;
        }

        self.script_stage(element, Stage::PostScript, ScriptPhase::PostInstall, remaining)?;

        self.stage(element, Stage::Commit);
        let fi = element
            .fi
            .as_ref()
            .ok_or_else(|| Error::Transaction(format!("{} has no file set", element.nevra)))?;
        let instance = self.db.add_package(&element.header, &fi.states)?;
        element.db_instance = instance;

        // Files of other installed packages that this install overwrote
        // are no longer live claims.
        for replaced in &fi.replaced {
            if !replaced.is_removed {
                self.db.set_file_state(
                    replaced.other_pkg,
                    replaced.other_file_num,
                    FileState::Replaced,
                )?;
            }
        }

        Ok(())
    }

    /// Erase one removed element
    ///
    /// `remaining` is 0 for a final erase, 1 when another version of the
    /// name stays installed (the erase half of an upgrade).
    pub fn erase(
        &mut self,
        element: &mut TransactionElement,
        remaining: u32,
    ) -> Result<()> {
        info!("erasing {}", element.nevra);

        self.script_stage(element, Stage::PreScript, ScriptPhase::PreErase, remaining)?;

        if !self.flags.contains(TransFlags::JUST_DB) {
            self.stage(element, Stage::Process);
            let fi = element
                .fi
                .as_ref()
                .ok_or_else(|| Error::Transaction(format!("{} has no file set", element.nevra)))?;
            Fsm::new(&self.config.root).erase(fi)?;
        }

        self.script_stage(element, Stage::PostScript, ScriptPhase::PostErase, remaining)?;

        self.stage(element, Stage::Commit);
        self.db.remove_package(element.db_instance)?;

        Ok(())
    }

    /// Restore a previously erased element from its repackaged payload
    ///
    /// Used by rollback: lays the captured files back down and re-adds the
    /// database record, with scriptlets suppressed.
    pub fn restore(
        &mut self,
        element: &mut TransactionElement,
        payload: &Payload,
    ) -> Result<()> {
        info!("restoring {}", element.nevra);

        if !self.flags.contains(TransFlags::JUST_DB) {
            self.stage(element, Stage::Process);
            let fi = element
                .fi
                .as_ref()
                .ok_or_else(|| Error::Transaction(format!("{} has no file set", element.nevra)))?;
            Fsm::new(&self.config.root).install(fi, payload)?;
        }

        self.stage(element, Stage::Commit);
        let fi = element
            .fi
            .as_ref()
            .ok_or_else(|| Error::Transaction(format!("{} has no file set", element.nevra)))?;
        let instance = self.db.add_package(&element.header, &fi.states)?;
        element.db_instance = instance;

        Ok(())
    }

    fn stage(&self, element: &TransactionElement, stage: Stage) {
        debug!("{}: {:?} stage", element.nevra, stage);
    }

    fn script_stage(
        &self,
        element: &TransactionElement,
        stage: Stage,
        phase: ScriptPhase,
        remaining: u32,
    ) -> Result<()> {
        if self.flags.contains(TransFlags::NO_SCRIPTS) {
            return Ok(());
        }
        self.stage(element, stage);
        self.scripts.run(&element.header, phase, remaining)
    }
}
