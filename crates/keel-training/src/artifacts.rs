use crate::config::{CheckpointMeta, WorkflowPhase};
use crate::dataset::DatasetSummary;
use crate::distributed::DistributedContext;
use crate::error::LaunchResult;
use crate::model::DetectorSummary;
use crate::seed::AppliedSeed;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Provenance of one launch, handed to the trainer and logged with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetadata {
    /// `key: value` lines describing the host.
    pub env_info: String,
    /// The resolved config as TOML.
    pub config: String,
    /// The seed the run actually uses.
    pub seed: u64,
    /// Config file name the run was launched from.
    pub exp_name: String,
}

/// Everything an external training loop needs to pick up a prepared run.
/// Written as `<work_dir>/<timestamp>.handoff.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub created_at: DateTime<Utc>,
    pub timestamp: String,
    pub trainer: String,
    pub meta: RunMetadata,
    pub distributed: DistributedContext,
    pub validate: bool,
    pub seed: AppliedSeed,
    pub work_dir: PathBuf,
    pub config_file: PathBuf,
    pub config_sha256: String,
    pub workflow: Vec<WorkflowPhase>,
    pub model: DetectorSummary,
    pub datasets: Vec<DatasetSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_meta: Option<CheckpointMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_from: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_from: Option<PathBuf>,
}

impl RunManifest {
    pub fn write(&self, path: &Path) -> LaunchResult<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn read(path: &Path) -> LaunchResult<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

pub fn sha256_file(path: &Path) -> LaunchResult<String> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sha256_file_known_digest() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("empty.toml");
        std::fs::write(&path, b"").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert!(sha256_file(&temp.path().join("missing")).is_err());
    }
}
