//! Collective-communication seam
//!
//! The checkpoint manager needs exactly two things from the communication
//! layer: who this process is, and a barrier across every process in the job.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Barrier;
use tracing::trace;

use crate::{Rank, Result};

/// Rank/world-size accessors plus a job-wide barrier
#[async_trait]
pub trait Collective: Send + Sync {
    /// Global rank of this process
    fn rank(&self) -> Rank;

    /// Total number of processes in the job
    fn world_size(&self) -> u32;

    /// Returns true for the designated writer process
    fn is_leader(&self) -> bool {
        self.rank() == 0
    }

    /// Block until every process in the job has called `barrier`
    async fn barrier(&self) -> Result<()>;
}

/// A job made of a single process; the barrier returns immediately
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

#[async_trait]
impl Collective for SingleProcess {
    fn rank(&self) -> Rank {
        0
    }

    fn world_size(&self) -> u32 {
        1
    }

    async fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

/// One member of a group of workers sharing an address space
#[derive(Debug, Clone)]
pub struct LocalGroup {
    rank: Rank,
    world_size: u32,
    barrier: Arc<Barrier>,
}

impl LocalGroup {
    /// Create `world_size` members sharing one barrier, ordered by rank
    pub fn new(world_size: u32) -> Vec<LocalGroup> {
        let barrier = Arc::new(Barrier::new(world_size.max(1) as usize));
        (0..world_size)
            .map(|rank| LocalGroup {
                rank,
                world_size,
                barrier: barrier.clone(),
            })
            .collect()
    }
}

#[async_trait]
impl Collective for LocalGroup {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> u32 {
        self.world_size
    }

    async fn barrier(&self) -> Result<()> {
        trace!(rank = self.rank, "Entering barrier");
        self.barrier.wait().await;
        Ok(())
    }
}
