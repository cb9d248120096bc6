use anyhow::{Context, Result};
use keel_training::{ConfigOverride, ConfigResolver, ResolveRequest};
use std::path::PathBuf;

/// Arguments of `keel-cli print-config`.
#[derive(clap::Args, Debug)]
pub struct PrintConfigArgs {
    /// Config file path
    pub config: PathBuf,

    #[arg(long)]
    pub work_dir: Option<PathBuf>,

    /// Deprecated, use --cfg-options
    #[arg(long, num_args = 1.., value_name = "KEY=VALUE")]
    pub options: Vec<ConfigOverride>,

    #[arg(long, num_args = 1.., value_name = "KEY=VALUE")]
    pub cfg_options: Vec<ConfigOverride>,

    #[arg(long)]
    pub mc_config: Option<PathBuf>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

pub fn execute(args: PrintConfigArgs) -> Result<()> {
    let request = ResolveRequest {
        work_dir: args.work_dir,
        options: args.options,
        cfg_options: args.cfg_options,
        mc_config: args.mc_config,
        ..ResolveRequest::new(&args.config)
    };
    let resolved = ConfigResolver::default()
        .resolve(&request)
        .with_context(|| format!("Failed to resolve config {}", args.config.display()))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&resolved.config)?);
    } else {
        print!("{}", resolved.pretty_text()?);
    }
    Ok(())
}
