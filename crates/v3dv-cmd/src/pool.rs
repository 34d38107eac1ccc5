//! # Command Pools
//!
//! Owns command buffers and hands out typed ids for them.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use v3dv_core::{Error, Handle, Result, UsageError};

use crate::buffer::{CommandBuffer, CommandBufferLevel};
use crate::device::Device;

/// Command buffer id
pub type CommandBufferId = Handle<CommandBuffer>;

const UNKNOWN: Error = Error::Usage(UsageError::UnknownCommandBuffer);

/// Pool of command buffers of one device
#[derive(Debug)]
pub struct CommandPool {
    device: Arc<Device>,
    buffers: BTreeMap<CommandBufferId, CommandBuffer>,
    next_id: u64,
}

impl CommandPool {
    /// Create an empty pool
    pub fn new(device: Arc<Device>) -> Self {
        Self {
            device,
            buffers: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Number of live command buffers
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Check if the pool holds no command buffers
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Allocate `count` command buffers of `level`
    pub fn allocate(&mut self, level: CommandBufferLevel, count: u32) -> Result<Vec<CommandBufferId>> {
        let mut ids = Vec::new();
        ids.try_reserve(count as usize)?;
        for _ in 0..count {
            let id = CommandBufferId::new(self.next_id);
            self.next_id += 1;
            self.buffers
                .insert(id, CommandBuffer::new(Arc::clone(&self.device), level));
            ids.push(id);
        }
        log::debug!("pool: allocated {} {:?} buffers", count, level);
        Ok(ids)
    }

    /// Get a command buffer
    pub fn get(&self, id: CommandBufferId) -> Option<&CommandBuffer> {
        self.buffers.get(&id)
    }

    /// Get a command buffer mutably
    pub fn get_mut(&mut self, id: CommandBufferId) -> Option<&mut CommandBuffer> {
        self.buffers.get_mut(&id)
    }

    /// Destroy command buffers; unknown ids are ignored
    pub fn free(&mut self, ids: &[CommandBufferId]) {
        for id in ids {
            self.buffers.remove(id);
        }
    }

    /// Reset every command buffer of the pool
    pub fn reset(&mut self) {
        for cb in self.buffers.values_mut() {
            cb.reset();
        }
    }

    /// Return unused memory to the system
    ///
    /// Command buffers free their jobs on reset, so there is nothing to trim.
    pub fn trim(&mut self) {}

    /// Replay `secondaries` into `primary`
    ///
    /// Recording errors land in the primary's sticky error; only unknown
    /// ids are reported here.
    pub fn execute_commands(
        &mut self,
        primary: CommandBufferId,
        secondaries: &[CommandBufferId],
    ) -> Result<()> {
        let mut cb = self.buffers.remove(&primary).ok_or(UNKNOWN)?;

        let result = self.collect(secondaries).map(|list| cb.execute_commands(&list));

        self.buffers.insert(primary, cb);
        result
    }

    fn collect(&self, ids: &[CommandBufferId]) -> Result<Vec<&CommandBuffer>> {
        let mut list = Vec::new();
        list.try_reserve(ids.len())?;
        for id in ids {
            list.push(self.buffers.get(id).ok_or(UNKNOWN)?);
        }
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BeginInfo, CommandBufferStatus};
    use crate::job::JobType;
    use crate::testing::{compute_pipeline, test_device};

    #[test]
    fn test_allocate_and_free() {
        let (device, _bo) = test_device();
        let mut pool = CommandPool::new(device);
        let ids = pool.allocate(CommandBufferLevel::Primary, 3).unwrap();
        assert_eq!(ids.len(), 3);
        assert!(ids.iter().all(|id| !id.is_null()));
        assert_ne!(ids[0], ids[1]);
        assert_eq!(pool.len(), 3);

        pool.free(&ids[..2]);
        assert_eq!(pool.len(), 1);
        assert!(pool.get(ids[0]).is_none());
        assert!(pool.get(ids[2]).unwrap().is_primary());
    }

    #[test]
    fn test_reset_returns_to_initial() {
        let (device, _bo) = test_device();
        let mut pool = CommandPool::new(device);
        let ids = pool.allocate(CommandBufferLevel::Primary, 1).unwrap();
        let cb = pool.get_mut(ids[0]).unwrap();
        cb.begin(&BeginInfo::default()).unwrap();
        cb.end().unwrap();

        pool.reset();
        pool.trim();
        assert_eq!(pool.get(ids[0]).unwrap().status(), CommandBufferStatus::Initialized);
    }

    #[test]
    fn test_execute_by_id() {
        let (device, _bo) = test_device();
        let mut pool = CommandPool::new(device);
        let primary = pool.allocate(CommandBufferLevel::Primary, 1).unwrap()[0];
        let secondary = pool.allocate(CommandBufferLevel::Secondary, 1).unwrap()[0];

        let cb = pool.get_mut(secondary).unwrap();
        cb.begin(&BeginInfo::default()).unwrap();
        cb.bind_compute_pipeline(&Arc::new(compute_pipeline([8, 1, 1])));
        cb.dispatch(2, 1, 1);
        cb.end().unwrap();

        pool.get_mut(primary).unwrap().begin(&BeginInfo::default()).unwrap();
        pool.execute_commands(primary, &[secondary]).unwrap();
        let cb = pool.get(primary).unwrap();
        assert_eq!(cb.job_types(), [JobType::GpuCsd]);

        assert_eq!(pool.execute_commands(primary, &[primary]), Err(UNKNOWN));
        assert!(pool.get(primary).is_some());
        let gone = CommandBufferId::new(99);
        assert_eq!(pool.execute_commands(gone, &[]), Err(UNKNOWN));
    }
}
