//! Process topology and collective operations

use mlx_rs::module::FlattenedModuleParam;

use crate::error::{Error, Result};

/// Rank and world size of the current process.
///
/// Built once at the entry point and handed to the trainer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributedContext {
    pub rank: usize,
    pub world_size: usize,
}

impl Default for DistributedContext {
    fn default() -> Self {
        Self::single()
    }
}

impl DistributedContext {
    /// Single-process run
    pub fn single() -> Self {
        Self { rank: 0, world_size: 1 }
    }

    pub fn new(rank: usize, world_size: usize) -> Result<Self> {
        if world_size == 0 || rank >= world_size {
            return Err(Error::distributed(format!(
                "rank {} is not valid for world size {}",
                rank, world_size
            )));
        }
        Ok(Self { rank, world_size })
    }

    /// Read `LOCAL_RANK` and `WORLD_SIZE` as set by the process launcher.
    /// Missing variables mean a single-process run.
    pub fn from_env() -> Result<Self> {
        let world_size = read_env_usize("WORLD_SIZE")?.unwrap_or(1);
        if world_size <= 1 {
            return Ok(Self::single());
        }
        let rank = read_env_usize("LOCAL_RANK")?
            .ok_or_else(|| Error::distributed("WORLD_SIZE is set but LOCAL_RANK is not"))?;
        Self::new(rank, world_size)
    }

    pub fn is_distributed(&self) -> bool {
        self.world_size > 1
    }

    /// The coordinator does all file I/O, logging of summaries and plotting
    pub fn is_coordinator(&self) -> bool {
        self.rank == 0
    }
}

fn read_env_usize(name: &str) -> Result<Option<usize>> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::distributed(format!("{} is not a non-negative integer: {:?}", name, value))),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(Error::distributed(format!("{}: {}", name, e))),
    }
}

/// Collective communication between training processes.
pub trait Collective {
    /// Block until every process reached the barrier
    fn barrier(&mut self) -> Result<()>;

    /// Replace each gradient with its mean across processes
    fn average_gradients(&mut self, gradients: FlattenedModuleParam) -> Result<FlattenedModuleParam>;
}

/// Collective of a single-process run; every operation is a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalCollective;

impl Collective for LocalCollective {
    fn barrier(&mut self) -> Result<()> {
        Ok(())
    }

    fn average_gradients(&mut self, gradients: FlattenedModuleParam) -> Result<FlattenedModuleParam> {
        Ok(gradients)
    }
}
