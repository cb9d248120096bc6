//! In-process group: every rank is a task in the same process.

use crate::config::DistParams;
use crate::distributed::{Launcher, ProcessGroup, ProcessGroupConnector, Rendezvous};
use crate::error::{LaunchError, LaunchResult};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{broadcast, Barrier, Mutex};

#[derive(Debug, Clone)]
struct Message {
    src: usize,
    payload: Vec<u8>,
}

pub struct MemoryProcessGroup {
    rank: usize,
    world_size: usize,
    sender: broadcast::Sender<Message>,
    receiver: Mutex<broadcast::Receiver<Message>>,
    barrier: Arc<Barrier>,
}

impl std::fmt::Debug for MemoryProcessGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryProcessGroup")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .finish_non_exhaustive()
    }
}

impl MemoryProcessGroup {
    /// One handle per rank, all wired to the same hub.
    #[must_use]
    pub fn create(world_size: usize) -> Vec<Self> {
        let world_size = world_size.max(1);
        let (sender, _) = broadcast::channel(64);
        let barrier = Arc::new(Barrier::new(world_size));
        (0..world_size)
            .map(|rank| Self {
                rank,
                world_size,
                receiver: Mutex::new(sender.subscribe()),
                sender: sender.clone(),
                barrier: barrier.clone(),
            })
            .collect()
    }

    /// Wait until every rank has arrived.
    pub async fn barrier(&self) {
        self.barrier.wait().await;
    }
}

#[async_trait]
impl ProcessGroup for MemoryProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    async fn broadcast(&self, buf: &mut [u8], src: usize) -> LaunchResult<()> {
        if src >= self.world_size {
            return Err(LaunchError::dist(format!(
                "broadcast source {src} is out of range for world size {}",
                self.world_size
            )));
        }
        if self.rank == src {
            self.sender
                .send(Message { src, payload: buf.to_vec() })
                .map_err(|_| LaunchError::dist("broadcast hub has no receivers"))?;
        }

        // Every rank, the source included, consumes the message so the
        // receivers stay in step across rounds.
        let message = self
            .receiver
            .lock()
            .await
            .recv()
            .await
            .map_err(|e| LaunchError::dist(format!("broadcast receive failed: {e}")))?;
        if message.src != src || message.payload.len() != buf.len() {
            return Err(LaunchError::dist(format!(
                "rank {} expected {} bytes from rank {src}, got {} bytes from rank {}",
                self.rank,
                buf.len(),
                message.payload.len(),
                message.src
            )));
        }
        buf.copy_from_slice(&message.payload);
        Ok(())
    }
}

/// Hands out the in-process groups by rank; `join` waits for all ranks.
#[derive(Debug)]
pub struct MemoryConnector {
    world_size: usize,
    groups: std::sync::Mutex<Vec<Option<MemoryProcessGroup>>>,
}

impl MemoryConnector {
    #[must_use]
    pub fn new(world_size: usize) -> Self {
        let groups = MemoryProcessGroup::create(world_size);
        Self { world_size: groups.len(), groups: std::sync::Mutex::new(groups.into_iter().map(Some).collect()) }
    }
}

#[async_trait]
impl ProcessGroupConnector for MemoryConnector {
    async fn join(
        &self,
        _launcher: Launcher,
        rendezvous: &Rendezvous,
        _params: &DistParams,
    ) -> LaunchResult<Box<dyn ProcessGroup>> {
        if rendezvous.world_size != self.world_size {
            return Err(LaunchError::dist(format!(
                "rank {} expects world size {}, hub was created for {}",
                rendezvous.rank, rendezvous.world_size, self.world_size
            )));
        }
        if rendezvous.rank >= self.world_size {
            return Err(LaunchError::dist(format!(
                "rank {} is out of range for world size {}",
                rendezvous.rank, self.world_size
            )));
        }
        let group = {
            let mut groups = self
                .groups
                .lock()
                .map_err(|_| LaunchError::dist("in-process hub lock poisoned"))?;
            groups
                .get_mut(rendezvous.rank)
                .and_then(Option::take)
                .ok_or_else(|| LaunchError::dist(format!("rank {} joined twice", rendezvous.rank)))?
        };
        group.barrier().await;
        Ok(Box::new(group))
    }
}
