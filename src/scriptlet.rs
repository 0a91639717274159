// src/scriptlet.rs

//! Package scriptlet execution
//!
//! Runs the embedded install/erase hooks of a package header. Scriptlets
//! receive one integer argument: the number of instances of the package
//! name that will remain installed after the operation ($1=1 fresh install,
//! $1=2 upgrade install, $1=1 upgrade erase, $1=0 final erase).
//!
//! Scripts run with a timeout and nullified stdin. Execution is skipped
//! with a warning when installing to a non-"/" root, where the script
//! would act on the host instead of the target.

use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use tempfile::TempDir;
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

use crate::error::{Error, Result};
use crate::header::{Header, Tag};
use crate::nevra::Nevra;

const DEFAULT_INTERPRETER: &str = "/bin/sh";

/// One scriptlet slot of a package header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptPhase {
    PreTransaction,
    PreInstall,
    PostInstall,
    PreErase,
    PostErase,
    PostTransaction,
}

impl ScriptPhase {
    /// Header tags carrying this phase's body and interpreter
    pub fn tags(self) -> (Tag, Tag) {
        match self {
            Self::PreTransaction => (Tag::Pretrans, Tag::PretransProg),
            Self::PreInstall => (Tag::Prein, Tag::PreinProg),
            Self::PostInstall => (Tag::Postin, Tag::PostinProg),
            Self::PreErase => (Tag::Preun, Tag::PreunProg),
            Self::PostErase => (Tag::Postun, Tag::PostunProg),
            Self::PostTransaction => (Tag::Posttrans, Tag::PosttransProg),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PreTransaction => "pretrans",
            Self::PreInstall => "prein",
            Self::PostInstall => "postin",
            Self::PreErase => "preun",
            Self::PostErase => "postun",
            Self::PostTransaction => "posttrans",
        }
    }
}

/// Scriptlet executor bound to one target root
pub struct ScriptletExecutor {
    root: PathBuf,
    timeout: Duration,
}

impl ScriptletExecutor {
    pub fn new(root: &Path, timeout_secs: u64) -> Self {
        Self {
            root: root.to_path_buf(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// Run one phase of a header's scriptlets, if present
    ///
    /// `remaining` is the instance count passed as $1. A missing scriptlet
    /// is a successful no-op.
    pub fn run(&self, header: &Header, phase: ScriptPhase, remaining: u32) -> Result<()> {
        let (body_tag, prog_tag) = phase.tags();
        let Some(body) = header.get_str(body_tag) else {
            return Ok(());
        };
        let interpreter = header.get_str(prog_tag).unwrap_or(DEFAULT_INTERPRETER);
        let nevra = header.nevra()?;
        self.execute(&nevra, phase, interpreter, body, remaining)
    }

    fn execute(
        &self,
        package: &Nevra,
        phase: ScriptPhase,
        interpreter: &str,
        body: &str,
        remaining: u32,
    ) -> Result<()> {
        // Scripts reference absolute paths; under a relocated root they
        // would mutate the host system.
        if self.root != Path::new("/") {
            warn!(
                "skipping {} scriptlet of {}: target root is {}",
                phase.as_str(),
                package,
                self.root.display()
            );
            return Ok(());
        }

        let interpreter_path = PathBuf::from(interpreter);
        if !interpreter_path.exists() {
            return Err(Error::Scriptlet {
                phase: phase.as_str().to_string(),
                detail: format!("interpreter not found: {}", interpreter_path.display()),
            });
        }

        info!("running {} scriptlet for {}", phase.as_str(), package);

        let temp_dir = TempDir::new()?;
        let script_path = self.prepare_script(temp_dir.path(), body)?;

        debug!(
            "executing {} {} {}",
            interpreter_path.display(),
            script_path.display(),
            remaining
        );

        let mut child = Command::new(&interpreter_path)
            .arg(&script_path)
            .arg(remaining.to_string())
            .env("RPMTXN_PACKAGE_NAME", &package.name)
            .env("RPMTXN_PACKAGE_VERSION", &package.version)
            .env("RPMTXN_PHASE", phase.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Scriptlet {
                phase: phase.as_str().to_string(),
                detail: format!("failed to spawn: {}", e),
            })?;

        match child.wait_timeout(self.timeout)? {
            Some(status) => {
                let output = child.wait_with_output()?;
                for line in String::from_utf8_lossy(&output.stdout).lines() {
                    info!("[{}] {}", phase.as_str(), line);
                }
                for line in String::from_utf8_lossy(&output.stderr).lines() {
                    warn!("[{}] {}", phase.as_str(), line);
                }

                if status.success() {
                    Ok(())
                } else {
                    Err(Error::Scriptlet {
                        phase: phase.as_str().to_string(),
                        detail: format!("exit code {}", status.code().unwrap_or(-1)),
                    })
                }
            }
            None => {
                let _ = child.kill();
                Err(Error::Scriptlet {
                    phase: phase.as_str().to_string(),
                    detail: format!("timed out after {} seconds", self.timeout.as_secs()),
                })
            }
        }
    }

    fn prepare_script(&self, temp_dir: &Path, body: &str) -> Result<PathBuf> {
        let script_path = temp_dir.join("scriptlet.sh");
        let mut file = File::create(&script_path)?;
        file.write_all(body.as_bytes())?;

        let mut perms = fs::metadata(&script_path)?.permissions();
        perms.set_mode(0o700);
        fs::set_permissions(&script_path, perms)?;
        Ok(script_path)
    }
}
