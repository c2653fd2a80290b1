//! Version information for prest.

/// Library version from Cargo.toml
pub const PREST_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Writer string recorded in workspace files, e.g. `Prest 3.0.0`.
pub fn program_version() -> String {
    format!("Prest {PREST_VERSION}")
}

/// Version information reported by the client.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub prest: &'static str,
    /// Workspace file format written by this build.
    pub workspace_format: u64,
    /// Core executable in use (if located).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub core: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            prest: PREST_VERSION,
            workspace_format: crate::workspace::FORMAT_VERSION,
            core: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the core executable path.
    pub fn with_core(mut self, path: String) -> Self {
        self.core = Some(path);
        self
    }
}
