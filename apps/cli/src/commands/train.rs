//! Training command implementation.

use crate::logging::{Logging, RunLogSink};
use anyhow::{Context, Result};
use colored::Colorize;
use keel_training::{CommandTrainer, ConfigOverride, LaunchDriver, LaunchOptions, Launcher, ResolveRequest};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

/// Arguments of `keel-cli train`.
#[derive(clap::Args, Debug)]
pub struct TrainArgs {
    /// Train config file path
    pub config: PathBuf,

    /// Directory to save logs, the config dump and the hand-off manifest
    #[arg(long)]
    pub work_dir: Option<PathBuf>,

    /// Checkpoint file to load weights from
    #[arg(long)]
    pub load_from: Option<PathBuf>,

    /// Checkpoint file to resume from
    #[arg(long)]
    pub resume_from: Option<PathBuf>,

    /// Do not evaluate checkpoints during training
    #[arg(long)]
    pub no_validate: bool,

    /// Number of workers to use (non-distributed runs only)
    #[arg(long)]
    pub gpus: Option<usize>,

    /// Ids of the workers to use (non-distributed runs only)
    #[arg(long, num_args = 1..)]
    pub gpu_ids: Option<Vec<usize>>,

    /// Random seed
    #[arg(long)]
    pub seed: Option<u64>,

    /// Restrict the backend to deterministic kernels
    #[arg(long)]
    pub deterministic: bool,

    /// Deprecated, use --cfg-options
    #[arg(long, num_args = 1.., value_name = "KEY=VALUE")]
    pub options: Vec<ConfigOverride>,

    /// Override config values, e.g. `optimizer.lr=0.01 data.samples_per_gpu=4`
    #[arg(long, num_args = 1.., value_name = "KEY=VALUE")]
    pub cfg_options: Vec<ConfigOverride>,

    /// Job launcher (none, pytorch, slurm, mpi)
    #[arg(long, default_value = "none")]
    pub launcher: Launcher,

    /// Local rank, used when the launcher environment does not set one
    #[arg(long, alias = "local_rank", default_value_t = 0)]
    pub local_rank: usize,

    /// Memory-cache config fragment defining `mc_file_client_args`
    #[arg(long)]
    pub mc_config: Option<PathBuf>,

    /// Run PROGRAM [ARGS...] as the training loop (must be the last option)
    #[arg(long, num_args = 1.., allow_hyphen_values = true, value_name = "PROGRAM")]
    pub exec: Vec<String>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

impl TrainArgs {
    fn launch_options(&self) -> LaunchOptions {
        LaunchOptions {
            request: ResolveRequest {
                config_path: self.config.clone(),
                work_dir: self.work_dir.clone(),
                load_from: self.load_from.clone(),
                resume_from: self.resume_from.clone(),
                gpus: self.gpus,
                gpu_ids: self.gpu_ids.clone(),
                options: self.options.clone(),
                cfg_options: self.cfg_options.clone(),
                mc_config: self.mc_config.clone(),
            },
            launcher: self.launcher,
            local_rank: self.local_rank,
            seed: self.seed,
            deterministic: self.deterministic,
            no_validate: self.no_validate,
        }
    }
}

pub async fn execute(args: TrainArgs, logging: Logging) -> Result<()> {
    let mut driver = LaunchDriver::new().with_progress(Arc::new(RunLogSink::new(logging)));
    if let Some((program, rest)) = args.exec.split_first() {
        driver = driver.with_trainer(Arc::new(CommandTrainer::new(program.clone(), rest.to_vec())));
    }

    let report = driver
        .launch(&args.launch_options())
        .await
        .with_context(|| format!("Failed to launch training from {}", args.config.display()))?;

    if !report.context.is_main() {
        return Ok(());
    }

    if args.json {
        let out = json!({
            "timestamp": report.timestamp,
            "work_dir": report.work_dir,
            "config_file": report.config_file,
            "log_file": report.log_file,
            "seed": report.seed.seed,
            "deterministic": report.seed.deterministic,
            "rank": report.context.rank,
            "world_size": report.context.world_size,
            "handoff": report.outcome.handoff,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("{}", "Training run prepared".bold().green());
    println!("  Work dir: {}", report.work_dir.display().to_string().cyan());
    println!("  Config:   {}", report.config_file.display().to_string().dimmed());
    println!("  Log:      {}", report.log_file.display().to_string().dimmed());
    println!("  Seed:     {}", report.seed.seed.to_string().cyan());
    if report.context.is_distributed {
        println!("  Workers:  {}", report.context.world_size);
    }
    if let Some(handoff) = &report.outcome.handoff {
        println!("  Hand-off: {}", handoff.display().to_string().dimmed());
    }
    println!();
    Ok(())
}
