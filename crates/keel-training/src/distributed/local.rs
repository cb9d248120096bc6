use crate::distributed::ProcessGroup;
use crate::error::{LaunchError, LaunchResult};
use async_trait::async_trait;

/// The trivial group of a non-distributed run.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalProcessGroup;

#[async_trait]
impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    async fn broadcast(&self, _buf: &mut [u8], src: usize) -> LaunchResult<()> {
        if src != 0 {
            return Err(LaunchError::dist(format!("broadcast source {src} does not exist in a single-process run")));
        }
        Ok(())
    }
}
