//! Seed selection, cross-process agreement and application.
//!
//! Every rank of a data-parallel run must shuffle and initialize with the
//! same seed. A random candidate is therefore drawn on every rank, but only
//! rank 0's survives: it is broadcast once and every rank adopts it.

use crate::distributed::{DistributedContext, ProcessGroup};
use crate::error::LaunchResult;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Random candidates are drawn from `[0, SEED_UPPER_BOUND)`, which keeps them
/// representable as a signed 32-bit integer.
pub const SEED_UPPER_BOUND: u64 = 1 << 31;

/// How the run seed is chosen.
///
/// In a config file: `seed_policy = "random"`, `seed_policy = { fixed = 3407 }`
/// or `seed_policy = { explicit = 7 }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedPolicy {
    /// Use this seed as given.
    Explicit(u64),
    /// Draw a seed and agree on rank 0's draw.
    #[default]
    Random,
    /// Always use this seed, even when an explicit one was supplied.
    Fixed(u64),
}

impl SeedPolicy {
    /// Combine the configured policy with the seeds supplied by the caller.
    ///
    /// `Fixed` always wins. Otherwise a command-line seed, then a `seed` value
    /// from the config file, turns the policy into `Explicit`.
    #[must_use]
    pub fn effective(configured: Self, config_seed: Option<u64>, cli_seed: Option<u64>) -> Self {
        match (configured, cli_seed.or(config_seed)) {
            (Self::Fixed(fixed), Some(explicit)) => {
                if explicit != fixed {
                    warn!(fixed, explicit, "seed_policy is fixed; ignoring the supplied seed");
                }
                Self::Fixed(fixed)
            }
            (Self::Fixed(fixed), None) => Self::Fixed(fixed),
            (_, Some(explicit)) => Self::Explicit(explicit),
            (configured, None) => configured,
        }
    }
}

/// Draw a seed candidate.
pub fn random_candidate<R: Rng + ?Sized>(rng: &mut R) -> u64 {
    rng.gen_range(0..SEED_UPPER_BOUND)
}

/// Agrees on one seed across the ranks of a run.
pub struct SeedCoordinator<'a> {
    group: &'a dyn ProcessGroup,
    context: &'a DistributedContext,
}

impl<'a> SeedCoordinator<'a> {
    #[must_use]
    pub fn new(group: &'a dyn ProcessGroup, context: &'a DistributedContext) -> Self {
        Self { group, context }
    }

    /// Produce the seed every rank will use.
    ///
    /// `Explicit` and `Fixed` seeds are identical on every rank already and
    /// are returned without communication.
    pub async fn coordinate(&self, policy: SeedPolicy) -> LaunchResult<u64> {
        match policy {
            SeedPolicy::Explicit(seed) | SeedPolicy::Fixed(seed) => Ok(seed),
            SeedPolicy::Random => {
                let candidate = random_candidate(&mut rand::thread_rng());
                self.agree(candidate).await
            }
        }
    }

    /// Replace `candidate` with rank 0's candidate on every rank.
    pub async fn agree(&self, candidate: u64) -> LaunchResult<u64> {
        if self.context.world_size == 1 {
            return Ok(candidate);
        }
        let mut buf = if self.context.is_main() { candidate.to_le_bytes() } else { [0u8; 8] };
        self.group.broadcast(&mut buf, 0).await?;
        Ok(u64::from_le_bytes(buf))
    }
}

/// Random streams a training run draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RngStream {
    /// General-purpose randomness (shuffling, sampling).
    General,
    /// Numeric-library randomness (augmentation parameters).
    Numeric,
    /// Randomness on one accelerator device.
    Accelerator(usize),
}

/// The applied seed plus the backend flags that go with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedSeed {
    pub seed: u64,
    pub deterministic: bool,
    pub benchmark: bool,
}

/// Odd constant spreading stream seeds apart (the SplitMix64 increment).
const STREAM_STRIDE: u64 = 0x9E37_79B9_7F4A_7C15;

impl AppliedSeed {
    /// Seed of one stream. The general stream uses the agreed seed as is;
    /// the others are offset from it so they never replay each other.
    #[must_use]
    pub fn stream_seed(&self, stream: RngStream) -> u64 {
        let slot = match stream {
            RngStream::General => return self.seed,
            RngStream::Numeric => 1,
            RngStream::Accelerator(device) => 2 + device as u64,
        };
        self.seed.wrapping_add(STREAM_STRIDE.wrapping_mul(slot))
    }

    #[must_use]
    pub fn rng(&self, stream: RngStream) -> StdRng {
        StdRng::seed_from_u64(self.stream_seed(stream))
    }
}

/// Seed every random stream of this process.
///
/// Called once per launch. `deterministic` restricts the backend to
/// reproducible kernels, which rules out autotuning (`benchmark`).
#[must_use]
pub fn apply_seed(seed: u64, deterministic: bool, benchmark: bool) -> AppliedSeed {
    info!(seed, deterministic, "set random seed");
    AppliedSeed { seed, deterministic, benchmark: benchmark && !deterministic }
}
