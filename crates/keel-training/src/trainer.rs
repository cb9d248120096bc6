use crate::artifacts::{sha256_file, RunManifest, RunMetadata};
use crate::config::ResolvedConfig;
use crate::distributed::DistributedContext;
use crate::error::LaunchResult;
use crate::layout::WorkDirLayout;
use crate::model::Detector;
use crate::seed::AppliedSeed;
use crate::workflow::DatasetBundle;
use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use tracing::info;

/// A fully prepared run, handed to the trainer by value.
#[derive(Debug)]
pub struct TrainingRun {
    pub model: Box<dyn Detector>,
    pub datasets: DatasetBundle,
    pub config: ResolvedConfig,
    pub distributed: bool,
    pub validate: bool,
    pub timestamp: String,
    pub meta: RunMetadata,
    pub context: DistributedContext,
    pub seed: AppliedSeed,
}

impl TrainingRun {
    #[must_use]
    pub fn layout(&self) -> WorkDirLayout {
        WorkDirLayout::new(self.config.work_dir())
    }

    /// Path of the config dump written at launch.
    #[must_use]
    pub fn config_file(&self) -> PathBuf {
        self.layout().config_dump_path(&self.config.file_name())
    }

    pub fn manifest(&self, trainer: &str) -> LaunchResult<RunManifest> {
        let config_file = self.config_file();
        let config = &self.config.config;
        Ok(RunManifest {
            created_at: Utc::now(),
            timestamp: self.timestamp.clone(),
            trainer: trainer.to_string(),
            meta: self.meta.clone(),
            distributed: self.context,
            validate: self.validate,
            seed: self.seed,
            work_dir: self.config.work_dir().to_path_buf(),
            config_sha256: sha256_file(&config_file)?,
            config_file,
            workflow: config.workflow.clone(),
            model: self.model.describe(),
            datasets: self.datasets.summaries(),
            checkpoint_meta: config.checkpoint_config.as_ref().and_then(|c| c.meta.clone()),
            load_from: config.load_from.clone(),
            resume_from: config.resume_from.clone(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrainOutcome {
    /// Hand-off manifest written for this run, if this rank wrote one.
    pub handoff: Option<PathBuf>,
}

/// The training loop behind the launcher.
#[async_trait]
pub trait Trainer: Send + Sync {
    fn id(&self) -> &'static str;

    async fn train(&self, run: TrainingRun) -> LaunchResult<TrainOutcome>;
}

/// Prepares the run for an out-of-process training loop: rank 0 writes the
/// hand-off manifest into the work directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManifestTrainer;

impl ManifestTrainer {
    pub fn write_handoff(run: &TrainingRun, trainer: &str) -> LaunchResult<Option<PathBuf>> {
        if !run.context.is_main() {
            return Ok(None);
        }
        let path = run.layout().handoff_path(&run.timestamp);
        run.manifest(trainer)?.write(&path)?;
        info!(path = %path.display(), "wrote hand-off manifest");
        Ok(Some(path))
    }
}

#[async_trait]
impl Trainer for ManifestTrainer {
    fn id(&self) -> &'static str {
        "manifest"
    }

    async fn train(&self, run: TrainingRun) -> LaunchResult<TrainOutcome> {
        let handoff = Self::write_handoff(&run, self.id())?;
        Ok(TrainOutcome { handoff })
    }
}
