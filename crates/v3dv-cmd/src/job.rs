//! # Jobs
//!
//! A job is the unit of work the queue submits: a binning/render control
//! list pair, a compute dispatch, a TFU transfer, or a piece of CPU work
//! that must run at a defined point between GPU jobs.
//!
//! Finished jobs are shared behind an [`Arc`] so that executing a
//! secondary command buffer can reference them without copying control
//! list contents. A [`ClonedJob`] never frees what its source owns.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use arrayvec::ArrayVec;
use v3dv_core::{Bo, Error, Result, UsageError};

use crate::bo_set::BufferObjectSet;
use crate::cl::{ControlList, PatchSite};
use crate::device::Device;
use crate::event::Event;
use crate::packet::Packet;
use crate::query::{QueryPool, QueryResultFlags};
use crate::tiling::FrameTiling;

// =============================================================================
// JOB TYPES
// =============================================================================

/// Job type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobType {
    /// Binning and render control lists
    GpuCl,
    /// Partial binning list of a secondary, branched to from a primary
    GpuClSecondary,
    /// Compute shader dispatch
    GpuCsd,
    /// Texture formatting unit transfer
    GpuTfu,
    /// Reset a query range
    CpuResetQueries,
    /// Make queries available
    CpuEndQuery,
    /// Copy query results to a buffer
    CpuCopyQueryResults,
    /// Set or reset an event
    CpuSetEvent,
    /// Wait for events
    CpuWaitEvents,
    /// Resolve an indirect dispatch
    CpuCsdIndirect,
    /// Write a timestamp
    CpuTimestampQuery,
}

impl JobType {
    /// Whether the job runs on the GPU
    #[inline]
    pub const fn is_gpu(self) -> bool {
        matches!(
            self,
            Self::GpuCl | Self::GpuClSecondary | Self::GpuCsd | Self::GpuTfu
        )
    }

    /// Whether the job has a binning control list
    #[inline]
    pub const fn has_bcl(self) -> bool {
        matches!(self, Self::GpuCl | Self::GpuClSecondary)
    }
}

/// Payload of control list jobs
#[derive(Debug, Default)]
pub struct ClJob {
    /// Binning control list
    pub bcl: ControlList,
    /// Render control list
    pub rcl: ControlList,
    /// Shader records and uniform streams
    pub indirect: ControlList,
    /// Tiling of the frame
    pub frame_tiling: FrameTiling,
    /// Tile allocation memory, owned
    pub tile_alloc: Option<Bo>,
    /// Tile state memory, owned
    pub tile_state: Option<Bo>,
}

/// Payload of compute jobs
#[derive(Debug, Default)]
pub struct CsdJob {
    /// Uniform streams
    pub indirect: ControlList,
    /// Workgroup counts
    pub wg_count: [u32; 3],
    /// First workgroup
    pub wg_base: [u32; 3],
    /// Dispatch configuration words
    pub cfg: [u32; 7],
    /// Shared memory scratch, owned
    pub shared_memory: Option<Bo>,
}

/// Register values of a TFU transfer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TfuSubmit {
    /// Input image address
    pub iia: u32,
    /// Input image stride
    pub iis: u32,
    /// Input chroma address
    pub ica: u32,
    /// Input chroma U address
    pub iua: u32,
    /// Output image address
    pub ioa: u32,
    /// Output image size
    pub ios: u32,
    /// Coefficients
    pub coef: [u32; 4],
    /// Buffer objects read or written
    pub bos: ArrayVec<Bo, 4>,
}

/// A query that becomes available when its render pass job finishes
#[derive(Debug, Clone)]
pub struct EndQueryInfo {
    /// Pool
    pub pool: Arc<QueryPool>,
    /// First query
    pub query: u32,
    /// Consecutive queries, one per view
    pub count: u32,
}

/// Arguments of a query result copy
#[derive(Debug, Clone)]
pub struct CopyQueryResultsInfo {
    /// Pool
    pub pool: Arc<QueryPool>,
    /// First query
    pub first: u32,
    /// Number of queries
    pub count: u32,
    /// Destination buffer object
    pub dst: Bo,
    /// Offset of the first result
    pub offset: u32,
    /// Distance between results
    pub stride: u32,
    /// Result flags
    pub flags: QueryResultFlags,
}

/// Indirect dispatch resolved on the CPU at submit time
#[derive(Debug)]
pub struct CsdIndirectInfo {
    /// Buffer holding the workgroup counts
    pub buffer: Bo,
    /// Offset of the counts
    pub offset: u32,
    /// Invocations per workgroup
    pub wg_size: u32,
    /// Workgroup count uniforms per axis
    pub wg_uniform_offsets: [Option<PatchSite>; 3],
    /// The shader reads the workgroup count
    pub needs_wg_uniform_rewrite: bool,
    /// Dispatch built with placeholder counts
    pub csd_job: spin::Mutex<Job>,
}

/// Job payload
#[derive(Debug)]
pub enum JobKind {
    /// Binning and render control lists
    GpuCl(ClJob),
    /// Partial binning list of a secondary
    GpuClSecondary(ClJob),
    /// Compute dispatch
    GpuCsd(CsdJob),
    /// TFU transfer
    GpuTfu(TfuSubmit),
    /// Reset a query range
    CpuResetQueries {
        /// Pool
        pool: Arc<QueryPool>,
        /// First query
        first: u32,
        /// Number of queries
        count: u32,
    },
    /// Make queries available
    CpuEndQuery(EndQueryInfo),
    /// Copy query results
    CpuCopyQueryResults(CopyQueryResultsInfo),
    /// Set or reset an event
    CpuSetEvent {
        /// Event
        event: Arc<Event>,
        /// New state
        state: bool,
    },
    /// Wait for every event
    CpuWaitEvents {
        /// Events
        events: Vec<Arc<Event>>,
    },
    /// Resolve an indirect dispatch
    CpuCsdIndirect(Box<CsdIndirectInfo>),
    /// Write a timestamp
    CpuTimestampQuery {
        /// Pool
        pool: Arc<QueryPool>,
        /// First query
        query: u32,
        /// Consecutive queries, one per view
        count: u32,
    },
}

impl JobKind {
    /// Empty control list payload
    pub fn gpu_cl() -> Self {
        Self::GpuCl(ClJob::default())
    }

    /// Empty secondary control list payload
    pub fn gpu_cl_secondary() -> Self {
        Self::GpuClSecondary(ClJob::default())
    }

    /// Empty compute payload
    pub fn gpu_csd() -> Self {
        Self::GpuCsd(CsdJob::default())
    }

    /// Type tag
    pub fn job_type(&self) -> JobType {
        match self {
            Self::GpuCl(_) => JobType::GpuCl,
            Self::GpuClSecondary(_) => JobType::GpuClSecondary,
            Self::GpuCsd(_) => JobType::GpuCsd,
            Self::GpuTfu(_) => JobType::GpuTfu,
            Self::CpuResetQueries { .. } => JobType::CpuResetQueries,
            Self::CpuEndQuery(_) => JobType::CpuEndQuery,
            Self::CpuCopyQueryResults(_) => JobType::CpuCopyQueryResults,
            Self::CpuSetEvent { .. } => JobType::CpuSetEvent,
            Self::CpuWaitEvents { .. } => JobType::CpuWaitEvents,
            Self::CpuCsdIndirect(_) => JobType::CpuCsdIndirect,
            Self::CpuTimestampQuery { .. } => JobType::CpuTimestampQuery,
        }
    }
}

// =============================================================================
// JOB
// =============================================================================

/// A unit of GPU or CPU work
#[derive(Debug)]
pub struct Job {
    device: Arc<Device>,
    /// Payload
    pub kind: JobKind,
    /// Buffer objects the job may touch
    pub bos: BufferObjectSet,
    /// Must not overlap the GPU jobs before it
    pub serialize: bool,
    /// Binning must wait for earlier binning to drain
    pub needs_bcl_sync: bool,
    /// One draw per job
    pub always_flush: bool,
    /// First subpass recorded into the job
    pub first_subpass: u32,
    /// Continues a subpass begun by an earlier job
    pub is_subpass_continue: bool,
    /// Ends the last subpass it records
    pub is_subpass_finish: bool,
    /// Draws recorded
    pub draw_count: u32,
}

impl Job {
    /// Create a job with no ordering constraints
    pub fn new(device: Arc<Device>, kind: JobKind) -> Self {
        let always_flush = matches!(
            kind.job_type(),
            JobType::GpuCl | JobType::GpuClSecondary | JobType::GpuCsd
        ) && device.options.always_flush;
        Self {
            device,
            kind,
            bos: BufferObjectSet::new(),
            serialize: false,
            needs_bcl_sync: false,
            always_flush,
            first_subpass: 0,
            is_subpass_continue: false,
            is_subpass_finish: false,
            draw_count: 0,
        }
    }

    /// Device the job was recorded for
    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Type tag
    #[inline]
    pub fn job_type(&self) -> JobType {
        self.kind.job_type()
    }

    /// Control list payload
    pub fn cl(&self) -> Option<&ClJob> {
        match &self.kind {
            JobKind::GpuCl(cl) | JobKind::GpuClSecondary(cl) => Some(cl),
            _ => None,
        }
    }

    /// Compute payload
    pub fn csd(&self) -> Option<&CsdJob> {
        match &self.kind {
            JobKind::GpuCsd(csd) => Some(csd),
            _ => None,
        }
    }

    /// Mutable compute payload
    pub fn csd_mut(&mut self) -> Option<&mut CsdJob> {
        match &mut self.kind {
            JobKind::GpuCsd(csd) => Some(csd),
            _ => None,
        }
    }

    /// Split borrow of a control list job
    pub(crate) fn cl_parts(&mut self) -> Result<(&Device, &mut ClJob, &mut BufferObjectSet)> {
        let Job {
            device, kind, bos, ..
        } = self;
        match kind {
            JobKind::GpuCl(cl) | JobKind::GpuClSecondary(cl) => Ok((device, cl, bos)),
            _ => Err(Error::Usage(UsageError::NoOpenJob)),
        }
    }

    /// Split borrow of a compute job
    pub(crate) fn csd_parts(&mut self) -> Result<(&Device, &mut CsdJob, &mut BufferObjectSet)> {
        let Job {
            device, kind, bos, ..
        } = self;
        match kind {
            JobKind::GpuCsd(csd) => Ok((device, csd, bos)),
            _ => Err(Error::Usage(UsageError::NoOpenJob)),
        }
    }

    /// Split borrow of the indirect list of a control list or compute job
    pub(crate) fn indirect_parts(
        &mut self,
    ) -> Result<(&Device, &mut ControlList, &mut BufferObjectSet)> {
        let Job {
            device, kind, bos, ..
        } = self;
        match kind {
            JobKind::GpuCl(cl) | JobKind::GpuClSecondary(cl) => {
                Ok((device, &mut cl.indirect, bos))
            }
            JobKind::GpuCsd(csd) => Ok((device, &mut csd.indirect, bos)),
            _ => Err(Error::Usage(UsageError::NoOpenJob)),
        }
    }

    /// Reference a buffer object from the job
    #[inline]
    pub fn add_bo(&mut self, bo: Bo) -> Result<()> {
        self.bos.add(bo)
    }

    /// Append a packet to the binning list
    pub fn emit_bcl(&mut self, packet: &Packet<'_>) -> Result<()> {
        let (device, cl, bos) = self.cl_parts()?;
        cl.bcl.emit(device, bos, packet)
    }

    /// Make room in the binning list for `space` bytes and a branch
    pub fn ensure_bcl_space(&mut self, space: u32) -> Result<()> {
        let (device, cl, bos) = self.cl_parts()?;
        cl.bcl.ensure_space_with_branch(device, bos, space)
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        let bo_mgr = self.device.bo();
        match &mut self.kind {
            JobKind::GpuCl(cl) | JobKind::GpuClSecondary(cl) => {
                cl.bcl.release(bo_mgr);
                cl.rcl.release(bo_mgr);
                cl.indirect.release(bo_mgr);
                for bo in [cl.tile_alloc.take(), cl.tile_state.take()].into_iter().flatten() {
                    bo_mgr.free(bo);
                }
            }
            JobKind::GpuCsd(csd) => {
                csd.indirect.release(bo_mgr);
                if let Some(bo) = csd.shared_memory.take() {
                    bo_mgr.free(bo);
                }
            }
            _ => {}
        }
        log::trace!("job: destroyed {:?}", self.kind.job_type());
    }
}

// =============================================================================
// JOB LIST ENTRIES
// =============================================================================

/// A job replayed from a secondary command buffer
///
/// Shares its source's control lists and buffer object set. Only the
/// per-list buffer object arrays are copied, so editing them never reaches
/// the source or another clone.
#[derive(Debug, Clone)]
pub struct ClonedJob {
    source: Arc<Job>,
    /// Binning list chunks
    pub bcl_bos: Vec<Bo>,
    /// Render list chunks
    pub rcl_bos: Vec<Bo>,
    /// Indirect list chunks
    pub indirect_bos: Vec<Bo>,
    /// Must not overlap the GPU jobs before it
    pub serialize: bool,
    /// Binning must wait for earlier binning to drain
    pub needs_bcl_sync: bool,
}

fn copy_bos(src: &[Bo]) -> Result<Vec<Bo>> {
    let mut dst = Vec::new();
    dst.try_reserve(src.len())?;
    dst.extend_from_slice(src);
    Ok(dst)
}

impl ClonedJob {
    /// Job whose resources the clone references
    #[inline]
    pub fn source(&self) -> &Arc<Job> {
        &self.source
    }
}

/// Entry of a command buffer's job list
#[derive(Debug)]
pub enum JobEntry {
    /// Job recorded into this command buffer
    Owned(Arc<Job>),
    /// Job replayed from a secondary
    Cloned(ClonedJob),
}

impl JobEntry {
    /// The job itself
    #[inline]
    pub fn job(&self) -> &Job {
        match self {
            Self::Owned(job) => job,
            Self::Cloned(clone) => &clone.source,
        }
    }

    /// Type tag
    #[inline]
    pub fn job_type(&self) -> JobType {
        self.job().job_type()
    }

    /// Whether the entry references another command buffer's job
    #[inline]
    pub fn is_clone(&self) -> bool {
        matches!(self, Self::Cloned(_))
    }

    /// Must not overlap the GPU jobs before it
    pub fn serialize(&self) -> bool {
        match self {
            Self::Owned(job) => job.serialize,
            Self::Cloned(clone) => clone.serialize,
        }
    }

    /// Binning must wait for earlier binning to drain
    pub fn needs_bcl_sync(&self) -> bool {
        match self {
            Self::Owned(job) => job.needs_bcl_sync,
            Self::Cloned(clone) => clone.needs_bcl_sync,
        }
    }

    /// Binning list chunks
    pub fn bcl_bos(&self) -> &[Bo] {
        match self {
            Self::Owned(job) => job.cl().map_or(&[], |cl| cl.bcl.bos()),
            Self::Cloned(clone) => &clone.bcl_bos,
        }
    }

    /// Render list chunks
    pub fn rcl_bos(&self) -> &[Bo] {
        match self {
            Self::Owned(job) => job.cl().map_or(&[], |cl| cl.rcl.bos()),
            Self::Cloned(clone) => &clone.rcl_bos,
        }
    }

    /// Indirect list chunks
    pub fn indirect_bos(&self) -> &[Bo] {
        match self {
            Self::Owned(job) => match &job.kind {
                JobKind::GpuCl(cl) | JobKind::GpuClSecondary(cl) => cl.indirect.bos(),
                JobKind::GpuCsd(csd) => csd.indirect.bos(),
                _ => &[],
            },
            Self::Cloned(clone) => &clone.indirect_bos,
        }
    }

    /// Shallow copy for replay in another command buffer
    pub fn clone_job(&self) -> Result<ClonedJob> {
        let source = match self {
            Self::Owned(job) => Arc::clone(job),
            Self::Cloned(clone) => Arc::clone(&clone.source),
        };
        let deep = source.job_type() == JobType::GpuCl;
        let (bcl_bos, rcl_bos, indirect_bos) = if deep {
            (
                copy_bos(self.bcl_bos())?,
                copy_bos(self.rcl_bos())?,
                copy_bos(self.indirect_bos())?,
            )
        } else {
            (Vec::new(), Vec::new(), Vec::new())
        };
        Ok(ClonedJob {
            source,
            bcl_bos,
            rcl_bos,
            indirect_bos,
            serialize: self.serialize(),
            needs_bcl_sync: self.needs_bcl_sync(),
        })
    }
}
