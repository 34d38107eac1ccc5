//! # V3DV Core Traits
//!
//! Collaborator interfaces implemented outside the recording core.

use crate::error::Result;
use crate::types::Bo;

// =============================================================================
// BUFFER OBJECT MANAGER
// =============================================================================

/// Kernel-side buffer object management
///
/// Implemented by the DRM shim in a real driver and by an in-memory fake in
/// tests. All methods take `&self`; implementations synchronize internally.
pub trait BoManager: Send + Sync {
    /// Allocate a buffer object of at least `size` bytes
    ///
    /// `name` is a debug label shown by kernel tooling.
    fn alloc(&self, size: u32, name: &'static str) -> Result<Bo>;

    /// Release a buffer object
    fn free(&self, bo: Bo);

    /// Block until the GPU no longer accesses `bo`
    fn wait(&self, bo: Bo, timeout_ns: u64) -> Result<()>;

    /// Copy `dst.len()` bytes starting at `offset` out of `bo`
    fn read(&self, bo: Bo, offset: u32, dst: &mut [u8]) -> Result<()>;

    /// Copy `src` into `bo` starting at `offset`
    fn write(&self, bo: Bo, offset: u32, src: &[u8]) -> Result<()>;

    /// Current GPU timestamp in nanoseconds
    fn timestamp_ns(&self) -> u64;
}

/// Timeout used when the caller has no deadline
pub const WAIT_FOREVER: u64 = u64::MAX;
