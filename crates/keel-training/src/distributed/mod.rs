//! Run topology: single process, or one process per worker joined into a
//! process group.
//!
//! The process group itself is a collaborator behind [`ProcessGroup`] /
//! [`ProcessGroupConnector`]. Two implementations ship with the crate: a TCP
//! rendezvous for real multi-process runs ([`tcp`]) and an in-process hub
//! ([`memory`]) for running several ranks as tasks of one process.

pub mod env;
pub mod local;
pub mod memory;
pub mod tcp;

use crate::config::DistParams;
use crate::error::{LaunchError, LaunchResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

pub use env::{EnvSnapshot, Rendezvous};
pub use local::LocalProcessGroup;
pub use memory::{MemoryConnector, MemoryProcessGroup};
pub use tcp::{TcpConnector, TcpProcessGroup};

/// How the worker processes were started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Launcher {
    #[default]
    None,
    Pytorch,
    Slurm,
    Mpi,
}

impl Launcher {
    #[must_use]
    pub fn is_distributed(self) -> bool {
        self != Self::None
    }
}

impl std::fmt::Display for Launcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Pytorch => "pytorch",
            Self::Slurm => "slurm",
            Self::Mpi => "mpi",
        })
    }
}

impl std::str::FromStr for Launcher {
    type Err = LaunchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "pytorch" => Ok(Self::Pytorch),
            "slurm" => Ok(Self::Slurm),
            "mpi" => Ok(Self::Mpi),
            other => Err(LaunchError::config(format!(
                "unknown launcher `{other}` (expected none, pytorch, slurm or mpi)"
            ))),
        }
    }
}

/// Where this process sits in the run. Fixed once bootstrap returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedContext {
    pub is_distributed: bool,
    pub rank: usize,
    pub world_size: usize,
    pub local_rank: usize,
    pub launcher: Launcher,
}

impl DistributedContext {
    #[must_use]
    pub fn single() -> Self {
        Self { is_distributed: false, rank: 0, world_size: 1, local_rank: 0, launcher: Launcher::None }
    }

    pub fn new(launcher: Launcher, rank: usize, world_size: usize, local_rank: usize) -> LaunchResult<Self> {
        if world_size == 0 {
            return Err(LaunchError::dist("world size must be at least 1"));
        }
        if rank >= world_size {
            return Err(LaunchError::dist(format!(
                "rank {rank} is out of range for world size {world_size}"
            )));
        }
        Ok(Self { is_distributed: launcher.is_distributed(), rank, world_size, local_rank, launcher })
    }

    #[must_use]
    pub fn is_main(&self) -> bool {
        self.rank == 0
    }

    /// Worker ids of a distributed run: every rank in the group.
    #[must_use]
    pub fn gpu_ids(&self) -> Vec<usize> {
        (0..self.world_size).collect()
    }
}

/// A joined group of processes.
#[async_trait]
pub trait ProcessGroup: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Overwrite `buf` on every rank with the contents `src` holds.
    ///
    /// Blocks until every rank has taken part. All ranks must pass buffers of
    /// the same length.
    async fn broadcast(&self, buf: &mut [u8], src: usize) -> LaunchResult<()>;
}

/// Joins this process into a group.
#[async_trait]
pub trait ProcessGroupConnector: Send + Sync {
    async fn join(
        &self,
        launcher: Launcher,
        rendezvous: &Rendezvous,
        params: &DistParams,
    ) -> LaunchResult<Box<dyn ProcessGroup>>;
}

/// Outcome of [`bootstrap`]: the context plus the group collectives run on.
pub struct Bootstrap {
    pub context: DistributedContext,
    pub group: Box<dyn ProcessGroup>,
}

impl std::fmt::Debug for Bootstrap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bootstrap").field("context", &self.context).finish_non_exhaustive()
    }
}

/// Decide the run topology and, for a distributed launcher, join the group.
///
/// A failed join is returned as an error; the run is never downgraded to a
/// single process.
pub async fn bootstrap(
    launcher: Launcher,
    env: &EnvSnapshot,
    fallback_local_rank: usize,
    params: &DistParams,
    connector: &dyn ProcessGroupConnector,
) -> LaunchResult<Bootstrap> {
    if !launcher.is_distributed() {
        return Ok(Bootstrap { context: DistributedContext::single(), group: Box::new(LocalProcessGroup) });
    }

    let rendezvous = Rendezvous::from_env(launcher, env, params, fallback_local_rank)?;
    info!(
        %launcher,
        rank = rendezvous.rank,
        world_size = rendezvous.world_size,
        master = %format!("{}:{}", rendezvous.master_addr, rendezvous.port),
        "joining process group"
    );
    let group = connector.join(launcher, &rendezvous, params).await?;
    let context =
        DistributedContext::new(launcher, group.rank(), group.world_size(), rendezvous.local_rank)?;
    info!(rank = context.rank, world_size = context.world_size, "process group ready");
    Ok(Bootstrap { context, group })
}
