// src/error.rs

//! Crate-wide error type
//!
//! Structural failures (lock, database, payload) abort a transaction run;
//! per-file and per-package conditions are reported through the problem set
//! instead and never surface here.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("empty transaction: no elements to run")]
    EmptyTransaction,

    #[error("cannot acquire transaction lock on {path}")]
    LockFailed { path: PathBuf },

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("path traversal attempt: {0}")]
    PathTraversal(String),

    #[error("fingerprint lookup failed for {path}: {source}")]
    Fingerprint {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("file state machine failed on {file}: {source}")]
    FileStateMachine {
        file: String,
        source: std::io::Error,
    },

    #[error("scriptlet {phase} failed: {detail}")]
    Scriptlet { phase: String, detail: String },

    #[error("header is missing tag {0}")]
    MissingTag(&'static str),

    #[error("repackage error: {0}")]
    Repackage(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
