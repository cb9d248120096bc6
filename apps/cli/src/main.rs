//! Keel CLI - launcher for detector training runs
//!
//! `keel-cli train` resolves a config, joins the process group when started
//! under a distributed launcher, agrees on a seed and hands the prepared run
//! to a trainer. `keel-cli print-config` shows the resolved config.

mod commands;
mod logging;

use clap::{Parser, Subcommand};
use commands::print_config::PrintConfigArgs;
use commands::train::TrainArgs;

/// Keel - detector training launcher
#[derive(Parser, Debug)]
#[command(
    name = "keel-cli",
    author,
    version,
    about = "Keel - detector training launcher",
    long_about = "Keel resolves layered training configs, coordinates distributed workers and seeds,\nand hands fully prepared training runs to a training loop."
)]
struct Args {
    /// Log level (trace, debug, info, warn, error); defaults to the config's log_level
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Launch a training run
    ///
    /// Resolves the config, creates the work directory, dumps the resolved
    /// config and run log there, and starts the trainer.
    Train(TrainArgs),

    /// Print the resolved config without launching
    PrintConfig(PrintConfigArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let logging = logging::init(args.log_level.as_deref())?;

    match args.command {
        Command::Train(cmd) => commands::train::execute(cmd, logging).await,
        Command::PrintConfig(cmd) => commands::print_config::execute(cmd),
    }
}
