//! Process groups for the parallel collectors
//!
//! A [`Communicator`] connects the ranks that cooperate on one file-set.
//! [`LocalGroup`] runs every rank as a task of one process, exchanging
//! bytes through shared slots guarded by barriers.

use crate::error::{DcError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Barrier;

/// Collective operations used by the parallel collectors
///
/// Every rank of the group must make the same sequence of collective calls.
#[async_trait]
pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    async fn barrier(&self) -> Result<()>;

    /// Distribute `data` from `root`; other ranks' input is ignored
    async fn broadcast(&self, root: usize, data: Vec<u8>) -> Result<Vec<u8>>;

    /// Every rank's contribution, indexed by rank
    async fn all_gather(&self, data: Vec<u8>) -> Result<Vec<Vec<u8>>>;
}

/// The group with a single rank
#[derive(Debug, Default, Clone, Copy)]
pub struct SelfComm;

#[async_trait]
impl Communicator for SelfComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    async fn barrier(&self) -> Result<()> {
        Ok(())
    }

    async fn broadcast(&self, root: usize, data: Vec<u8>) -> Result<Vec<u8>> {
        check_root(root, 1)?;
        Ok(data)
    }

    async fn all_gather(&self, data: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        Ok(vec![data])
    }
}

fn check_root(root: usize, size: usize) -> Result<()> {
    if root < size {
        Ok(())
    } else {
        Err(DcError::InvalidArgument(format!(
            "Root rank {} is outside a group of {}",
            root, size
        )))
    }
}

struct Shared {
    barrier: Barrier,
    slots: Mutex<Vec<Vec<u8>>>,
}

/// Builds in-process groups whose ranks run as concurrent tasks
pub struct LocalGroup;

impl LocalGroup {
    /// One endpoint per rank; hand each to its own task
    pub fn new(size: usize) -> Vec<LocalComm> {
        let shared = Arc::new(Shared {
            barrier: Barrier::new(size.max(1)),
            slots: Mutex::new(vec![Vec::new(); size.max(1)]),
        });
        (0..size.max(1))
            .map(|rank| LocalComm {
                rank,
                size: size.max(1),
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

/// One rank of a [`LocalGroup`]
pub struct LocalComm {
    rank: usize,
    size: usize,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for LocalComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalComm")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish()
    }
}

#[async_trait]
impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    async fn barrier(&self) -> Result<()> {
        self.shared.barrier.wait().await;
        Ok(())
    }

    async fn broadcast(&self, root: usize, data: Vec<u8>) -> Result<Vec<u8>> {
        check_root(root, self.size)?;
        if self.rank == root {
            self.shared.slots.lock()[root] = data;
        }
        self.shared.barrier.wait().await;
        let out = self.shared.slots.lock()[root].clone();
        // nobody may refill the slot before every rank has copied it
        self.shared.barrier.wait().await;
        Ok(out)
    }

    async fn all_gather(&self, data: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        self.shared.slots.lock()[self.rank] = data;
        self.shared.barrier.wait().await;
        let out = self.shared.slots.lock().clone();
        self.shared.barrier.wait().await;
        Ok(out)
    }
}
