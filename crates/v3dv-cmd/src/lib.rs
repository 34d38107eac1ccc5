//! # V3DV Command Recording
//!
//! Turns recorded Vulkan-style commands into an ordered list of typed jobs
//! for a tile-based V3D GPU.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                         CommandPool                               │
//! │  ┌─────────────────────────────────────────────────────────────┐  │
//! │  │                      CommandBuffer                          │  │
//! │  │  ┌──────────────────┐     ┌──────────────────────────────┐  │  │
//! │  │  │ CommandBuffer-   │     │  jobs: [Job, Job, Clone, ..] │  │  │
//! │  │  │ State (open job, │────▶│  (append-only, in order)     │  │  │
//! │  │  │ pass, dirty, ..) │     └──────────────────────────────┘  │  │
//! │  │  └────────┬─────────┘                                       │  │
//! │  └───────────┼─────────────────────────────────────────────────┘  │
//! │              ▼                                                    │
//! │  ┌──────────────────┐  ┌──────────────┐  ┌────────────────────┐   │
//! │  │ Job              │  │ FrameTiling  │  │ PacketEncoder      │   │
//! │  │  bcl / rcl /     │  │ (tile and    │  │ (hardware packets, │   │
//! │  │  indirect CLs,   │  │  supertile   │  │  external)         │   │
//! │  │  BufferObjectSet │  │  sizing)     │  │                    │   │
//! │  └──────────────────┘  └──────────────┘  └────────────────────┘   │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Job Flow
//!
//! 1. Recording commands open a job or continue the open one
//! 2. Render pass changes, barriers and CPU work finish the open job
//! 3. Finished jobs are appended to the command buffer in order
//! 4. The queue walks the list; CPU jobs run through [`cpu::execute`]

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod barrier;
pub mod bind;
pub mod bo_set;
pub mod buffer;
pub mod cl;
pub mod compute;
pub mod cpu;
pub mod device;
pub mod draw;
pub mod event;
pub mod job;
pub mod meta;
pub mod packet;
pub mod pass;
pub mod pipeline;
pub mod pool;
pub mod query;
pub mod secondary;
pub mod state;
pub mod subpass;
pub mod tiling;
pub mod transfer;
pub mod uniforms;

#[cfg(test)]
mod testing;

// Re-exports
pub use barrier::PipelineStageFlags;
pub use bo_set::BufferObjectSet;
pub use buffer::{
    BeginInfo, CommandBuffer, CommandBufferLevel, CommandBufferStatus, CommandBufferUsage,
    InheritanceInfo,
};
pub use cl::{ControlList, PatchSite};
pub use cpu::CpuJobStatus;
pub use device::{Device, DeviceInfo, DeviceOptions};
pub use event::Event;
pub use job::{ClonedJob, Job, JobEntry, JobKind, JobType};
pub use packet::{Packet, PacketEncoder, RclInfo};
pub use pass::{Framebuffer, RenderPass, RenderPassBeginInfo, Subpass};
pub use pipeline::{ComputePipeline, GraphicsPipeline, ShaderStageFlags, Uniform};
pub use pool::{CommandBufferId, CommandPool};
pub use query::{QueryPool, QueryResultFlags, QueryType};
pub use state::{CommandBufferState, DirtyFlags, DynamicState};
pub use tiling::{FrameTiling, InternalBpp};
