use crate::config::ResolvedConfig;
use crate::error::{LaunchError, LaunchResult};
use std::path::{Path, PathBuf};

/// Files a launch writes into its work directory.
///
/// ```text
/// <work_dir>/<config file name>        resolved config dump
/// <work_dir>/<timestamp>.log           run log
/// <work_dir>/<timestamp>.handoff.json  trainer hand-off manifest
/// ```
#[derive(Debug, Clone)]
pub struct WorkDirLayout {
    root: PathBuf,
}

impl WorkDirLayout {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn config_dump_path(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }

    #[must_use]
    pub fn log_path(&self, timestamp: &str) -> PathBuf {
        self.root.join(format!("{timestamp}.log"))
    }

    #[must_use]
    pub fn handoff_path(&self, timestamp: &str) -> PathBuf {
        self.root.join(format!("{timestamp}.handoff.json"))
    }

    /// Create the work directory if it does not exist yet.
    pub fn ensure(&self) -> LaunchResult<()> {
        std::fs::create_dir_all(&self.root).map_err(|e| LaunchError::setup(&self.root, e))
    }

    /// Write the resolved config under its original file name.
    pub fn dump_config(&self, config: &ResolvedConfig) -> LaunchResult<PathBuf> {
        let path = self.config_dump_path(&config.file_name());
        let text = config.pretty_text()?;
        std::fs::write(&path, text).map_err(|e| LaunchError::setup(&path, e))?;
        Ok(path)
    }
}
