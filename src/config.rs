// src/config.rs

//! Engine configuration
//!
//! All knobs that the original engine resolved lazily from global macro
//! state live here as explicit fields, constructed once and passed to the
//! components that need them. The lock path in particular is resolved per
//! configuration, so two engines with different roots never share it.

use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// Relative location of the transaction lock file under the target root
const DEFAULT_LOCK_PATH: &str = "var/lib/rpmtxn/.transaction_lock";

/// Relative location of the installed-package database under the root
const DEFAULT_DB_PATH: &str = "var/lib/rpmtxn/packages.db";

/// Relative location of repackaged-archive storage under the root
const DEFAULT_REPACKAGE_DIR: &str = "var/spool/repackage";

/// Engine-wide configuration shared by one transaction run
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Target filesystem root (usually "/")
    pub root: PathBuf,
    /// Path to the package database
    pub db_path: PathBuf,
    /// Path to the advisory transaction lock file
    pub lock_path: PathBuf,
    /// Directory receiving repackaged archives before erasure
    pub repackage_dir: PathBuf,
    /// Prefixes that are network-shared and must not be touched locally
    pub net_shared_paths: Vec<String>,
    /// Requested install languages; empty means all
    pub install_langs: Vec<String>,
    /// Skip %doc files
    pub exclude_docs: bool,
    /// Skip %config files
    pub exclude_configs: bool,
    /// Roll the transaction back automatically when an element fails
    pub rollback_on_failure: bool,
    /// Scriptlet timeout in seconds
    pub scriptlet_timeout: u64,
}

impl EngineConfig {
    /// Create a config with default layout under the given root
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            db_path: root.join(DEFAULT_DB_PATH),
            lock_path: root.join(DEFAULT_LOCK_PATH),
            repackage_dir: root.join(DEFAULT_REPACKAGE_DIR),
            root,
            net_shared_paths: Vec::new(),
            install_langs: Vec::new(),
            exclude_docs: false,
            exclude_configs: false,
            rollback_on_failure: false,
            scriptlet_timeout: 60,
        }
    }

    /// Resolve a package-relative path against the target root
    pub fn resolve(&self, path: &str) -> Result<PathBuf> {
        safe_join(&self.root, path)
    }
}

/// Sanitize a package path: reject traversal, strip leading slashes
pub fn sanitize_path(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    let path_str = path.to_string_lossy();
    let relative = path_str.trim_start_matches('/');

    let mut normalized = PathBuf::new();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(c) => normalized.push(c),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(Error::PathTraversal(path_str.to_string()));
            }
            Component::Prefix(_) | Component::RootDir => {}
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(Error::InvalidPath(
            "empty path after sanitization".to_string(),
        ));
    }

    Ok(normalized)
}

/// Join a root with an untrusted package path
pub fn safe_join(root: &Path, path: impl AsRef<Path>) -> Result<PathBuf> {
    Ok(root.join(sanitize_path(path)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = EngineConfig::new("/");
        assert_eq!(config.root, PathBuf::from("/"));
        assert_eq!(
            config.lock_path,
            PathBuf::from("/var/lib/rpmtxn/.transaction_lock")
        );
        assert_eq!(config.db_path, PathBuf::from("/var/lib/rpmtxn/packages.db"));
    }

    #[test]
    fn test_sanitize_rejects_traversal() {
        assert!(sanitize_path("../etc/passwd").is_err());
        assert!(sanitize_path("usr/../../etc/passwd").is_err());
        assert_eq!(
            sanitize_path("/usr/bin/foo").unwrap(),
            PathBuf::from("usr/bin/foo")
        );
    }

    #[test]
    fn test_safe_join() {
        let joined = safe_join(Path::new("/mnt/root"), "/etc/foo.conf").unwrap();
        assert_eq!(joined, PathBuf::from("/mnt/root/etc/foo.conf"));
    }
}
