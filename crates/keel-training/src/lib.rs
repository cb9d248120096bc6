//! Keel Training
//!
//! Launch-time orchestration for detector training runs:
//! - Resolving layered TOML configs plus command-line overrides (`config`)
//! - Joining a process group for multi-process runs (`distributed`)
//! - Agreeing on one seed across every rank (`seed`)
//! - Assembling the train/val datasets (`workflow`)
//! - Handing the prepared run to a training backend (`Trainer`)

pub mod artifacts;
pub mod command_trainer;
pub mod config;
pub mod dataset;
pub mod distributed;
pub mod env_info;
pub mod error;
pub mod launch;
pub mod layout;
pub mod model;
pub mod progress;
pub mod registry;
pub mod seed;
pub mod trainer;
pub mod workflow;

pub use artifacts::{sha256_file, RunManifest, RunMetadata};
pub use command_trainer::CommandTrainer;
pub use config::{ConfigOverride, ConfigResolver, ResolveRequest, ResolvedConfig, TrainConfig};
pub use dataset::{Dataset, DatasetFactory, DescriptorDataset};
pub use distributed::{
    bootstrap, DistributedContext, EnvSnapshot, Launcher, MemoryConnector, ProcessGroup, ProcessGroupConnector,
    TcpConnector,
};
pub use error::{LaunchError, LaunchResult};
pub use launch::{LaunchDriver, LaunchOptions, LaunchReport};
pub use layout::WorkDirLayout;
pub use model::{DeclaredDetector, Detector, DetectorFactory};
pub use progress::{LaunchEvent, ProgressSink, TracingProgressSink};
pub use seed::{apply_seed, AppliedSeed, SeedCoordinator, SeedPolicy};
pub use trainer::{ManifestTrainer, TrainOutcome, Trainer, TrainingRun};
pub use workflow::{DatasetBundle, WorkflowAssembler};
