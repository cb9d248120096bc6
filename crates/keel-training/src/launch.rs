//! The launch sequence.
//!
//! resolve config -> join process group -> work dir, config dump, run log ->
//! agree on and apply the seed -> build model -> assemble datasets ->
//! checkpoint metadata -> trainer.

use crate::artifacts::RunMetadata;
use crate::config::{CheckpointMeta, ConfigResolver, ResolveRequest};
use crate::dataset::DatasetFactory;
use crate::distributed::{bootstrap, Bootstrap, DistributedContext, EnvSnapshot, Launcher, ProcessGroupConnector, TcpConnector};
use crate::env_info::{collect_env, format_env_info, version_with_git_hash};
use crate::error::LaunchResult;
use crate::layout::WorkDirLayout;
use crate::model::DetectorFactory;
use crate::progress::{LaunchEvent, ProgressSink, TracingProgressSink};
use crate::seed::{apply_seed, AppliedSeed, RngStream, SeedCoordinator, SeedPolicy};
use crate::trainer::{ManifestTrainer, TrainOutcome, Trainer, TrainingRun};
use crate::workflow::WorkflowAssembler;
use chrono::Local;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Format of the run timestamp, e.g. `20240315_142501`.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Per-invocation inputs that are not part of the config file.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub request: ResolveRequest,
    pub launcher: Launcher,
    /// Local rank to use when the launcher environment does not provide one.
    pub local_rank: usize,
    pub seed: Option<u64>,
    pub deterministic: bool,
    pub no_validate: bool,
}

/// What a finished launch reports back.
#[derive(Debug, Clone)]
pub struct LaunchReport {
    pub context: DistributedContext,
    pub seed: AppliedSeed,
    pub timestamp: String,
    pub work_dir: PathBuf,
    pub log_file: PathBuf,
    pub config_file: PathBuf,
    pub outcome: TrainOutcome,
}

pub struct LaunchDriver {
    resolver: ConfigResolver,
    env: EnvSnapshot,
    connector: Arc<dyn ProcessGroupConnector>,
    datasets: DatasetFactory,
    detectors: DetectorFactory,
    trainer: Arc<dyn Trainer>,
    progress: Arc<dyn ProgressSink>,
}

impl Default for LaunchDriver {
    fn default() -> Self {
        Self {
            resolver: ConfigResolver::default(),
            env: EnvSnapshot::from_process(),
            connector: Arc::new(TcpConnector),
            datasets: DatasetFactory::default(),
            detectors: DetectorFactory::default(),
            trainer: Arc::new(ManifestTrainer),
            progress: Arc::new(TracingProgressSink),
        }
    }
}

impl std::fmt::Debug for LaunchDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchDriver")
            .field("resolver", &self.resolver)
            .field("trainer", &self.trainer.id())
            .finish_non_exhaustive()
    }
}

impl LaunchDriver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_resolver(mut self, resolver: ConfigResolver) -> Self {
        self.resolver = resolver;
        self
    }

    #[must_use]
    pub fn with_env(mut self, env: EnvSnapshot) -> Self {
        self.env = env;
        self
    }

    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn ProcessGroupConnector>) -> Self {
        self.connector = connector;
        self
    }

    #[must_use]
    pub fn with_datasets(mut self, datasets: DatasetFactory) -> Self {
        self.datasets = datasets;
        self
    }

    #[must_use]
    pub fn with_detectors(mut self, detectors: DetectorFactory) -> Self {
        self.detectors = detectors;
        self
    }

    #[must_use]
    pub fn with_trainer(mut self, trainer: Arc<dyn Trainer>) -> Self {
        self.trainer = trainer;
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub async fn launch(&self, options: &LaunchOptions) -> LaunchResult<LaunchReport> {
        let mut resolved = self.resolver.resolve(&options.request)?;

        let Bootstrap { context, group } = bootstrap(
            options.launcher,
            &self.env,
            options.local_rank,
            &resolved.config.dist_params,
            self.connector.as_ref(),
        )
        .await?;
        resolved.apply_distributed(&context);

        let layout = WorkDirLayout::new(resolved.work_dir());
        layout.ensure()?;
        let config_file = layout.dump_config(&resolved)?;

        let timestamp = Local::now().format(TIMESTAMP_FORMAT).to_string();
        let log_file = layout.log_path(&timestamp);
        self.progress.on_event(&LaunchEvent::WorkDirReady {
            work_dir: layout.root().to_path_buf(),
            log_file: log_file.clone(),
            rank: context.rank,
            log_level: resolved.config.log_level.clone(),
        });

        let env_info = format_env_info(&collect_env());
        let dash_line = "-".repeat(60);
        info!("Environment info:\n{dash_line}\n{env_info}\n{dash_line}");
        info!("Distributed training: {}", context.is_distributed);
        let config_text = resolved.pretty_text()?;
        info!("Config:\n{config_text}");

        let config = &resolved.config;
        let policy = SeedPolicy::effective(config.seed_policy, config.seed, options.seed);
        let seed = SeedCoordinator::new(group.as_ref(), &context).coordinate(policy).await?;
        self.progress.on_event(&LaunchEvent::SeedAgreed { seed });
        info!("Set random seed to {seed}, deterministic: {}", options.deterministic);
        let applied = apply_seed(seed, options.deterministic, config.cudnn_benchmark);
        resolved.record_seed(seed);

        let meta = RunMetadata { env_info, config: config_text, seed, exp_name: resolved.file_name() };

        let config = &resolved.config;
        let mut model = self.detectors.build(&config.model, config.train_cfg.as_ref(), config.test_cfg.as_ref())?;
        model.init_weights(&mut applied.rng(RngStream::General))?;

        let datasets = WorkflowAssembler::new(&self.datasets).assemble(config)?;
        let classes = datasets.classes();
        if let Some(checkpoint) = resolved.config.checkpoint_config.as_mut() {
            checkpoint.meta = Some(CheckpointMeta { keel_version: version_with_git_hash(), classes: classes.clone() });
        }
        model.set_classes(classes);

        let work_dir = resolved.work_dir().to_path_buf();
        let run = TrainingRun {
            model,
            datasets,
            config: resolved,
            distributed: context.is_distributed,
            validate: !options.no_validate,
            timestamp: timestamp.clone(),
            meta,
            context,
            seed: applied,
        };

        let trainer = self.trainer.id().to_string();
        self.progress.on_event(&LaunchEvent::TrainerStarted { trainer: trainer.clone() });
        let outcome = self.trainer.train(run).await?;
        self.progress.on_event(&LaunchEvent::TrainerFinished { trainer });

        Ok(LaunchReport { context, seed: applied, timestamp, work_dir, log_file, config_file, outcome })
    }
}
