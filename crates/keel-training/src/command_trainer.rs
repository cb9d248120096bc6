//! Runs an external training program on the prepared run.

use crate::error::{LaunchError, LaunchResult};
use crate::trainer::{ManifestTrainer, TrainOutcome, Trainer, TrainingRun};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

pub const ENV_HANDOFF: &str = "KEEL_HANDOFF";
pub const ENV_CONFIG: &str = "KEEL_CONFIG";
pub const ENV_RANK: &str = "KEEL_RANK";
pub const ENV_WORLD_SIZE: &str = "KEEL_WORLD_SIZE";
pub const ENV_SEED: &str = "KEEL_SEED";

/// Writes the hand-off manifest, then runs `program` with the run described
/// in its environment. `KEEL_HANDOFF` is only set on the rank that wrote the
/// manifest.
#[derive(Debug, Clone)]
pub struct CommandTrainer {
    program: String,
    args: Vec<String>,
}

impl CommandTrainer {
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self { program: program.into(), args }
    }
}

#[async_trait]
impl Trainer for CommandTrainer {
    fn id(&self) -> &'static str {
        "command"
    }

    async fn train(&self, run: TrainingRun) -> LaunchResult<TrainOutcome> {
        let handoff = ManifestTrainer::write_handoff(&run, self.id())?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env(ENV_CONFIG, run.config_file())
            .env(ENV_RANK, run.context.rank.to_string())
            .env(ENV_WORLD_SIZE, run.context.world_size.to_string())
            .env(ENV_SEED, run.seed.seed.to_string());
        if let Some(path) = &handoff {
            command.env(ENV_HANDOFF, path);
        }

        info!(program = %self.program, args = ?self.args, "starting training program");
        let status = command
            .status()
            .await
            .map_err(|e| LaunchError::Trainer(format!("failed to start `{}`: {e}", self.program)))?;

        if !status.success() {
            warn!(program = %self.program, %status, "training program failed");
            return Err(LaunchError::Trainer(format!("`{}` exited with {status}", self.program)));
        }
        Ok(TrainOutcome { handoff })
    }
}
