//! # Device
//!
//! Collaborators and configuration shared by every command buffer created
//! from one logical device.

use alloc::sync::Arc;
use core::fmt;

use v3dv_core::BoManager;

use crate::packet::PacketEncoder;

/// Driver tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceOptions {
    /// Merge compatible consecutive subpasses into one job
    pub merge_jobs: bool,
    /// Flush after every draw call (one draw per job)
    pub always_flush: bool,
    /// Minimum size of a control list chunk
    pub cl_chunk_size: u32,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            merge_jobs: true,
            always_flush: false,
            cl_chunk_size: 4096,
        }
    }
}

/// Hardware facts the recorder needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Number of QPUs
    pub qpu_count: u32,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self { qpu_count: 8 }
    }
}

/// Logical device
pub struct Device {
    bo: Arc<dyn BoManager>,
    encoder: Arc<dyn PacketEncoder>,
    /// Driver tunables
    pub options: DeviceOptions,
    /// Hardware facts
    pub info: DeviceInfo,
}

impl Device {
    /// Create a device with default options
    pub fn new(bo: Arc<dyn BoManager>, encoder: Arc<dyn PacketEncoder>) -> Self {
        Self {
            bo,
            encoder,
            options: DeviceOptions::default(),
            info: DeviceInfo::default(),
        }
    }

    /// Replace the options
    pub fn with_options(mut self, options: DeviceOptions) -> Self {
        self.options = options;
        self
    }

    /// Replace the hardware info
    pub fn with_info(mut self, info: DeviceInfo) -> Self {
        self.info = info;
        self
    }

    /// Buffer object manager
    #[inline]
    pub fn bo(&self) -> &dyn BoManager {
        &*self.bo
    }

    /// Packet encoder
    #[inline]
    pub fn encoder(&self) -> &dyn PacketEncoder {
        &*self.encoder
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("encoder", &self.encoder.name())
            .field("options", &self.options)
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}
