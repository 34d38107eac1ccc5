//! # Buffer Object Sets
//!
//! The set of buffer objects a job may touch while it executes. The kernel
//! needs every one of them pinned for the lifetime of the submission.

use alloc::vec::Vec;

use hashbrown::HashSet;
use v3dv_core::{Bo, BoHandle, Error, Result};

/// De-duplicating set of buffer objects referenced by one job
///
/// References only: the set never frees what it holds. Insertion order is
/// preserved so the submission's handle array is deterministic.
#[derive(Debug, Clone, Default)]
pub struct BufferObjectSet {
    seen: HashSet<BoHandle>,
    bos: Vec<Bo>,
}

impl BufferObjectSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `bo` unless a buffer object with the same handle is present
    pub fn add(&mut self, bo: Bo) -> Result<()> {
        if self.seen.contains(&bo.handle) {
            return Ok(());
        }
        self.add_new(bo)
    }

    /// Add a buffer object the caller knows is not in the set yet
    ///
    /// Used for objects allocated by the job itself.
    pub fn add_new(&mut self, bo: Bo) -> Result<()> {
        debug_assert!(!self.seen.contains(&bo.handle));
        self.seen
            .try_reserve(1)
            .map_err(|_| Error::OutOfHostMemory)?;
        self.bos.try_reserve(1)?;
        self.seen.insert(bo.handle);
        self.bos.push(bo);
        Ok(())
    }

    /// Add every object of `other`
    pub fn extend_from(&mut self, other: &BufferObjectSet) -> Result<()> {
        for bo in other.iter() {
            self.add(*bo)?;
        }
        Ok(())
    }

    /// Whether a buffer object with `handle` is present
    pub fn contains(&self, handle: BoHandle) -> bool {
        self.seen.contains(&handle)
    }

    /// Number of buffer objects
    pub fn len(&self) -> usize {
        self.bos.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.bos.is_empty()
    }

    /// Buffer objects in insertion order
    pub fn iter(&self) -> core::slice::Iter<'_, Bo> {
        self.bos.iter()
    }

    /// Buffer objects in insertion order
    pub fn as_slice(&self) -> &[Bo] {
        &self.bos
    }
}
