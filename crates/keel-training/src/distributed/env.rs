use crate::config::DistParams;
use crate::distributed::Launcher;
use crate::error::{LaunchError, LaunchResult};
use std::collections::HashMap;

pub const DEFAULT_MASTER_PORT: u16 = 29500;

/// Frozen copy of the environment variables launchers communicate through.
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot(HashMap<String, String>);

impl EnvSnapshot {
    #[must_use]
    pub fn from_process() -> Self {
        Self(std::env::vars().collect())
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    fn require(&self, key: &str, launcher: Launcher) -> LaunchResult<&str> {
        self.get(key).ok_or_else(|| {
            LaunchError::dist(format!("{key} is not set; is this process running under the {launcher} launcher?"))
        })
    }

    fn number<T: std::str::FromStr>(&self, key: &str, value: &str) -> LaunchResult<T> {
        value
            .trim()
            .parse()
            .map_err(|_| LaunchError::dist(format!("{key}={value} is not a valid number")))
    }
}

/// Everything a process needs to find the rest of its group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendezvous {
    pub rank: usize,
    pub world_size: usize,
    pub local_rank: usize,
    pub master_addr: String,
    pub port: u16,
}

struct LauncherVars {
    rank: &'static str,
    world_size: &'static str,
    local_rank: &'static str,
    extra_addr: Option<&'static str>,
}

fn launcher_vars(launcher: Launcher) -> Option<LauncherVars> {
    match launcher {
        Launcher::None => None,
        Launcher::Pytorch => Some(LauncherVars {
            rank: "RANK",
            world_size: "WORLD_SIZE",
            local_rank: "LOCAL_RANK",
            extra_addr: None,
        }),
        Launcher::Slurm => Some(LauncherVars {
            rank: "SLURM_PROCID",
            world_size: "SLURM_NTASKS",
            local_rank: "SLURM_LOCALID",
            extra_addr: Some("SLURM_LAUNCH_NODE_IPADDR"),
        }),
        Launcher::Mpi => Some(LauncherVars {
            rank: "OMPI_COMM_WORLD_RANK",
            world_size: "OMPI_COMM_WORLD_SIZE",
            local_rank: "OMPI_COMM_WORLD_LOCAL_RANK",
            extra_addr: None,
        }),
    }
}

impl Rendezvous {
    /// Read rank, world size and master endpoint for `launcher`.
    ///
    /// The master address comes from `dist_params.master_addr`, then
    /// `MASTER_ADDR`, then (slurm only) `SLURM_LAUNCH_NODE_IPADDR`. The port
    /// comes from `dist_params.port`, then `MASTER_PORT`, then 29500.
    /// `fallback_local_rank` is used when the launcher does not export one.
    pub fn from_env(
        launcher: Launcher,
        env: &EnvSnapshot,
        params: &DistParams,
        fallback_local_rank: usize,
    ) -> LaunchResult<Self> {
        let vars = launcher_vars(launcher)
            .ok_or_else(|| LaunchError::dist("launcher `none` has no rendezvous"))?;

        let rank: usize = env.number(vars.rank, env.require(vars.rank, launcher)?)?;
        let world_size: usize = env.number(vars.world_size, env.require(vars.world_size, launcher)?)?;
        let local_rank = match env.get(vars.local_rank) {
            Some(value) => env.number(vars.local_rank, value)?,
            None => fallback_local_rank,
        };

        if world_size == 0 || rank >= world_size {
            return Err(LaunchError::dist(format!(
                "{}={rank} is out of range for {}={world_size}",
                vars.rank, vars.world_size
            )));
        }

        let master_addr = params
            .master_addr
            .clone()
            .or_else(|| env.get("MASTER_ADDR").map(str::to_string))
            .or_else(|| vars.extra_addr.and_then(|key| env.get(key)).map(str::to_string))
            .ok_or_else(|| {
                LaunchError::dist(format!(
                    "no master address for the {launcher} launcher: set MASTER_ADDR or dist_params.master_addr"
                ))
            })?;

        let port = match (params.port, env.get("MASTER_PORT")) {
            (Some(port), _) => port,
            (None, Some(value)) => env.number("MASTER_PORT", value)?,
            (None, None) => DEFAULT_MASTER_PORT,
        };

        Ok(Self { rank, world_size, local_rank, master_addr, port })
    }
}
