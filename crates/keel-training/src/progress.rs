use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

/// Milestones of a launch that the embedding application may react to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LaunchEvent {
    /// The work directory exists; the run log should go to `log_file`.
    /// Ranks other than 0 are expected to log at ERROR only.
    WorkDirReady { work_dir: PathBuf, log_file: PathBuf, rank: usize, log_level: String },
    SeedAgreed { seed: u64 },
    TrainerStarted { trainer: String },
    TrainerFinished { trainer: String },
}

pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: &LaunchEvent);
}

/// Reports events through `tracing`.
#[derive(Debug, Default)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn on_event(&self, event: &LaunchEvent) {
        match event {
            LaunchEvent::WorkDirReady { log_file, rank, .. } => {
                info!(rank, log_file = %log_file.display(), "work dir ready");
            }
            LaunchEvent::SeedAgreed { seed } => info!(seed, "seed agreed"),
            LaunchEvent::TrainerStarted { trainer } => info!(trainer, "trainer started"),
            LaunchEvent::TrainerFinished { trainer } => info!(trainer, "trainer finished"),
        }
    }
}
