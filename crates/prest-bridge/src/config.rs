//! Where the core lives and how long to wait for it.

use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bridge::CoreError;

/// Environment variable overriding the core executable location.
pub const CORE_ENV: &str = "PREST_CORE";

/// Core executable names, in lookup order.
pub const CORE_EXECUTABLES: &[&str] = &["prest-core.exe", "prest-core"];

/// Precomputed preorder table handed to the core when available.
pub const PRECOMPUTED_PREORDERS: &str = "preorders-7.bin";

/// Files receiving copies of the raw request and response streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    pub requests: PathBuf,
    pub responses: PathBuf,
}

#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub executable: PathBuf,
    /// Passed to the core before any generated arguments.
    pub extra_args: Vec<OsString>,
    pub precomputed_preorders: Option<PathBuf>,
    /// Wait after sending `quit`, and again after SIGTERM.
    pub quit_timeout: Duration,
    pub stderr_join_timeout: Duration,
    /// Grace period between cancellation and killing the core.
    pub abort_grace: Duration,
    pub transcript: Option<Transcript>,
}

impl CoreConfig {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            extra_args: Vec::new(),
            precomputed_preorders: None,
            quit_timeout: Duration::from_secs(2),
            stderr_join_timeout: Duration::from_secs(1),
            abort_grace: Duration::from_secs(2),
            transcript: None,
        }
    }

    /// Find the core next to the working directory or the running executable.
    ///
    /// `$PREST_CORE` wins if set. The precomputed preorder table is picked up
    /// from the same places when present.
    pub fn locate() -> Result<Self, CoreError> {
        let dirs = search_dirs();
        let executable = match env::var_os(CORE_ENV) {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => find_embedded_file(CORE_EXECUTABLES, &dirs).ok_or_else(|| {
                CoreError::NotFound {
                    candidates: candidates(CORE_EXECUTABLES, &dirs),
                }
            })?,
        };

        let mut config = Self::new(executable);
        config.precomputed_preorders = find_embedded_file(&[PRECOMPUTED_PREORDERS], &dirs);
        tracing::debug!(
            executable = %config.executable.display(),
            precomputed = ?config.precomputed_preorders,
            "located core"
        );
        Ok(config)
    }

    pub fn with_arg(mut self, arg: impl Into<OsString>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    pub fn with_precomputed_preorders(mut self, path: impl Into<PathBuf>) -> Self {
        self.precomputed_preorders = Some(path.into());
        self
    }

    pub fn with_quit_timeout(mut self, timeout: Duration) -> Self {
        self.quit_timeout = timeout;
        self
    }

    pub fn with_stderr_join_timeout(mut self, timeout: Duration) -> Self {
        self.stderr_join_timeout = timeout;
        self
    }

    pub fn with_abort_grace(mut self, grace: Duration) -> Self {
        self.abort_grace = grace;
        self
    }

    pub fn with_transcript(mut self, requests: impl Into<PathBuf>, responses: impl Into<PathBuf>) -> Self {
        self.transcript = Some(Transcript {
            requests: requests.into(),
            responses: responses.into(),
        });
        self
    }

    /// Command-line arguments for the core.
    ///
    /// The preorder table is only passed if the file actually exists.
    pub fn args(&self) -> Vec<OsString> {
        let mut args = self.extra_args.clone();
        if let Some(path) = &self.precomputed_preorders
            && path.is_file()
        {
            args.push("--precomputed-preorders".into());
            args.push(path.clone().into_os_string());
        }
        args
    }
}

/// Working directory first, then the directory of the running executable.
fn search_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(cwd) = env::current_dir() {
        dirs.push(cwd);
    }
    if let Ok(exe) = env::current_exe()
        && let Some(dir) = exe.parent()
        && !dirs.iter().any(|d| d == dir)
    {
        dirs.push(dir.to_path_buf());
    }
    dirs
}

fn candidates(names: &[&str], dirs: &[PathBuf]) -> Vec<PathBuf> {
    dirs.iter()
        .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
        .collect()
}

/// First existing file among `names` in `dirs`, directories taking precedence.
pub fn find_embedded_file(names: &[&str], dirs: &[PathBuf]) -> Option<PathBuf> {
    candidates(names, dirs).into_iter().find(|p| is_file(p))
}

fn is_file(path: &Path) -> bool {
    path.metadata().map(|m| m.is_file()).unwrap_or(false)
}
