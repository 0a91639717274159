// src/rpmdb.rs

//! Installed-package database
//!
//! SQLite-backed store of installed headers and per-file install state.
//! Headers are kept whole as JSON blobs; a relational `files` table carries
//! the basename index used to find installed packages that might collide
//! with an incoming transaction, plus the mutable per-file state byte.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use crate::error::{Error, Result};
use crate::fileinfo::FileState;
use crate::header::{Header, Tag};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS packages (
    instance     INTEGER PRIMARY KEY AUTOINCREMENT,
    name         TEXT NOT NULL,
    epoch        INTEGER,
    version      TEXT NOT NULL,
    release      TEXT NOT NULL,
    arch         TEXT,
    color        INTEGER NOT NULL DEFAULT 0,
    header       TEXT NOT NULL,
    install_time TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_packages_name ON packages(name);

CREATE TABLE IF NOT EXISTS files (
    pkg     INTEGER NOT NULL REFERENCES packages(instance) ON DELETE CASCADE,
    file_ix INTEGER NOT NULL,
    dir     TEXT NOT NULL,
    base    TEXT NOT NULL,
    state   INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (pkg, file_ix)
);

CREATE INDEX IF NOT EXISTS idx_files_base ON files(base);
";

/// Handle to the installed-package database
pub struct PackageDb {
    conn: Connection,
}

impl PackageDb {
    /// Open (creating if necessary) the database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        debug!("opened package database at {}", path.display());
        Ok(Self { conn })
    }

    /// In-memory database, for tests and dry runs
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Record a newly installed package, returning its database instance
    ///
    /// Per-file states are stored alongside; files the resolver skipped are
    /// recorded in their skip state so verification and later transactions
    /// know they were never laid down.
    pub fn add_package(&mut self, header: &Header, states: &[FileState]) -> Result<u32> {
        let nevra = header.nevra()?;
        let json = serde_json::to_string(header)?;

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO packages (name, epoch, version, release, arch, color, header, install_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                nevra.name,
                nevra.epoch,
                nevra.version,
                nevra.release,
                nevra.arch,
                header.color(),
                json,
                Utc::now().to_rfc3339(),
            ],
        )?;
        let instance = tx.last_insert_rowid() as u32;

        if let (Some(bases), Some(dirs), Some(dixs)) = (
            header.get_str_array(Tag::BaseNames),
            header.get_str_array(Tag::DirNames),
            header.get_u32_array(Tag::DirIndexes),
        ) {
            let mut stmt = tx.prepare(
                "INSERT INTO files (pkg, file_ix, dir, base, state) VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (ix, base) in bases.iter().enumerate() {
                let dir = &dirs[dixs[ix] as usize];
                let state = states
                    .get(ix)
                    .copied()
                    .unwrap_or(FileState::Normal)
                    .to_u8();
                stmt.execute(params![instance, ix as u32, dir, base, state])?;
            }
            drop(stmt);
        }

        tx.commit()?;
        debug!("added {} as instance {}", nevra, instance);
        Ok(instance)
    }

    /// Remove an installed package record
    pub fn remove_package(&mut self, instance: u32) -> Result<()> {
        let changed = self
            .conn
            .execute("DELETE FROM packages WHERE instance = ?1", [instance])?;
        if changed == 0 {
            return Err(Error::Transaction(format!(
                "no package instance {} in database",
                instance
            )));
        }
        debug!("removed package instance {}", instance);
        Ok(())
    }

    /// Load the header of an installed package
    pub fn header(&self, instance: u32) -> Result<Arc<Header>> {
        let json: String = self
            .conn
            .query_row(
                "SELECT header FROM packages WHERE instance = ?1",
                [instance],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| {
                Error::Transaction(format!("no package instance {} in database", instance))
            })?;
        Ok(Arc::new(serde_json::from_str(&json)?))
    }

    /// All installed instances of a package name, in instance order
    pub fn find_by_name(&self, name: &str) -> Result<Vec<(u32, Arc<Header>)>> {
        let mut stmt = self.conn.prepare(
            "SELECT instance, header FROM packages WHERE name = ?1 ORDER BY instance",
        )?;
        let rows = stmt.query_map([name], |row| {
            Ok((row.get::<_, u32>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (instance, json) = row?;
            out.push((instance, Arc::new(serde_json::from_str::<Header>(&json)?)));
        }
        Ok(out)
    }

    /// All installed instances, in instance order
    pub fn all_instances(&self) -> Result<Vec<u32>> {
        let mut stmt = self
            .conn
            .prepare("SELECT instance FROM packages ORDER BY instance")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<std::result::Result<Vec<u32>, _>>()
            .map_err(Error::from)
    }

    /// Distinct installed packages owning any of the given basenames
    ///
    /// This is the coarse candidate query; callers confirm real collisions
    /// by fingerprint before treating a candidate as a conflict.
    pub fn packages_with_basenames(&self, bases: &[&str]) -> Result<Vec<u32>> {
        let mut out = Vec::new();
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT pkg FROM files WHERE base = ?1 ORDER BY pkg")?;
        for base in bases {
            let rows = stmt.query_map([base], |row| row.get::<_, u32>(0))?;
            for row in rows {
                let pkg = row?;
                if !out.contains(&pkg) {
                    out.push(pkg);
                }
            }
        }
        out.sort_unstable();
        Ok(out)
    }

    /// Per-file install states of an installed package
    pub fn file_states(&self, instance: u32) -> Result<Vec<FileState>> {
        let mut stmt = self
            .conn
            .prepare("SELECT state FROM files WHERE pkg = ?1 ORDER BY file_ix")?;
        let rows = stmt.query_map([instance], |row| row.get::<_, u8>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(FileState::from_u8(row?));
        }
        Ok(out)
    }

    /// Overwrite the state of one file of an installed package
    pub fn set_file_state(&mut self, instance: u32, file_ix: u32, state: FileState) -> Result<()> {
        self.conn.execute(
            "UPDATE files SET state = ?1 WHERE pkg = ?2 AND file_ix = ?3",
            params![state.to_u8(), instance, file_ix],
        )?;
        Ok(())
    }

    /// Number of installed packages
    pub fn package_count(&self) -> Result<u32> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM packages", [], |row| row.get(0))?)
    }

    /// Flush the write-ahead log to the main database file
    pub fn sync(&self) -> Result<()> {
        self.conn
            .pragma_update(None, "wal_checkpoint", "TRUNCATE")?;
        Ok(())
    }
}
