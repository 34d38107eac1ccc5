//! # Command Buffers
//!
//! The public recording surface. A command buffer owns its finished jobs
//! in recording order plus the state of the job being recorded, and drives
//! the job lifecycle: start (or merge), record, finish, append.
//!
//! Recording entry points return nothing. A failure is stored as the
//! buffer's sticky error, the open job is discarded and every later
//! recording call becomes a no-op until the buffer is reset. [`CommandBuffer::end`]
//! reports the error.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use v3dv_core::{Error, Rect2D, Result, UsageError};

use crate::device::Device;
use crate::job::{Job, JobEntry, JobKind, JobType};
use crate::pass::{Framebuffer, RenderPass};
use crate::pipeline::ShaderStageFlags;
use crate::state::{CommandBufferState, DirtyFlags};

/// Render area of a secondary that does not know its framebuffer
const MAX_FRAMEBUFFER_SIZE: u32 = 4096;

/// Command buffer level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandBufferLevel {
    /// Submitted to a queue
    Primary,
    /// Executed from a primary
    Secondary,
}

/// Command buffer status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandBufferStatus {
    /// Reset, nothing recorded
    Initialized,
    /// Between `begin` and `end`
    Recording,
    /// Recorded successfully
    Executable,
}

bitflags::bitflags! {
    /// How a recording will be used
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct CommandBufferUsage: u32 {
        /// Submitted once, then reset
        const ONE_TIME_SUBMIT = 1 << 0;
        /// Secondary executed entirely inside a render pass
        const RENDER_PASS_CONTINUE = 1 << 1;
        /// May be pending on several queues at once
        const SIMULTANEOUS_USE = 1 << 2;
    }
}

/// Render pass state a secondary inherits
#[derive(Debug, Clone, Default)]
pub struct InheritanceInfo {
    /// Render pass the secondary will execute in
    pub pass: Option<Arc<RenderPass>>,
    /// Subpass index
    pub subpass: u32,
    /// Framebuffer, if known
    pub framebuffer: Option<Arc<Framebuffer>>,
    /// The primary may have an occlusion query active
    pub occlusion_query_enable: bool,
}

/// Arguments of [`CommandBuffer::begin`]
#[derive(Debug, Clone, Default)]
pub struct BeginInfo {
    /// Usage flags
    pub usage: CommandBufferUsage,
    /// Inherited state, secondaries only
    pub inheritance: Option<InheritanceInfo>,
}

// =============================================================================
// COMMAND BUFFER
// =============================================================================

/// Command buffer
#[derive(Debug)]
pub struct CommandBuffer {
    device: Arc<Device>,
    level: CommandBufferLevel,
    usage: CommandBufferUsage,
    status: CommandBufferStatus,
    pub(crate) jobs: Vec<JobEntry>,
    pub(crate) state: CommandBufferState,
}

impl CommandBuffer {
    /// Create a command buffer in the initial state
    pub fn new(device: Arc<Device>, level: CommandBufferLevel) -> Self {
        Self {
            device,
            level,
            usage: CommandBufferUsage::empty(),
            status: CommandBufferStatus::Initialized,
            jobs: Vec::new(),
            state: CommandBufferState::default(),
        }
    }

    /// Device
    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Level
    #[inline]
    pub fn level(&self) -> CommandBufferLevel {
        self.level
    }

    /// Whether this is a primary command buffer
    #[inline]
    pub fn is_primary(&self) -> bool {
        self.level == CommandBufferLevel::Primary
    }

    /// Usage flags given at `begin`
    #[inline]
    pub fn usage(&self) -> CommandBufferUsage {
        self.usage
    }

    /// Status
    #[inline]
    pub fn status(&self) -> CommandBufferStatus {
        self.status
    }

    /// Finished jobs in submission order
    #[inline]
    pub fn jobs(&self) -> &[JobEntry] {
        &self.jobs
    }

    /// Recording state
    #[inline]
    pub fn state(&self) -> &CommandBufferState {
        &self.state
    }

    /// Whether recording ran out of memory
    #[inline]
    pub fn is_out_of_memory(&self) -> bool {
        self.state.is_out_of_memory()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Drop every job and return to the initial state
    pub fn reset(&mut self) {
        if self.status != CommandBufferStatus::Initialized {
            log::debug!(
                "cmd: reset {:?} buffer with {} jobs",
                self.level,
                self.jobs.len()
            );
        }
        self.jobs = Vec::new();
        self.state = CommandBufferState::default();
        self.usage = CommandBufferUsage::empty();
        self.status = CommandBufferStatus::Initialized;
    }

    /// Start recording
    ///
    /// Any previous recording is discarded first.
    pub fn begin(&mut self, info: &BeginInfo) -> Result<()> {
        self.reset();
        self.usage = info.usage;
        self.status = CommandBufferStatus::Recording;

        if self.level == CommandBufferLevel::Secondary
            && info.usage.contains(CommandBufferUsage::RENDER_PASS_CONTINUE)
        {
            if let Err(e) = self.begin_render_pass_secondary(info.inheritance.as_ref()) {
                self.flag_error(e);
                return Err(e);
            }
        }
        Ok(())
    }

    fn begin_render_pass_secondary(&mut self, inheritance: Option<&InheritanceInfo>) -> Result<()> {
        let inheritance = inheritance.ok_or(Error::Usage(UsageError::IncompatibleSecondary))?;
        let pass = inheritance
            .pass
            .clone()
            .ok_or(Error::Usage(UsageError::IncompatibleSecondary))?;
        if pass.subpass(inheritance.subpass).is_none() {
            return Err(Error::Usage(UsageError::InvalidSubpass));
        }

        self.state.pass = Some(pass);
        self.state.framebuffer = inheritance.framebuffer.clone();
        self.state.subpass_idx = Some(inheritance.subpass);
        self.state.inheritance.occlusion_query_enable = inheritance.occlusion_query_enable;

        // Secondaries inside a render pass never start subpasses themselves
        self.start_job(Some(inheritance.subpass), JobKind::gpu_cl_secondary())?;

        // Large enough not to constrain anything the scissor allows
        let (width, height) = match &self.state.framebuffer {
            Some(fb) => (fb.width, fb.height),
            None => (MAX_FRAMEBUFFER_SIZE, MAX_FRAMEBUFFER_SIZE),
        };
        self.state.render_area = Rect2D::new(0, 0, width, height);
        Ok(())
    }

    /// Finish recording
    ///
    /// Returns the sticky error if any recording call failed.
    pub fn end(&mut self) -> Result<()> {
        if let Some(e) = self.state.error {
            return Err(e);
        }
        if self.status != CommandBufferStatus::Recording {
            return Err(Error::Usage(UsageError::NotRecording));
        }

        if self.is_primary() && self.state.pass.is_some() {
            let e = Error::Usage(UsageError::InsideRenderPass);
            self.flag_error(e);
            return Err(e);
        }

        // Only secondaries inside a render pass still have a job open here
        if self.state.job.is_some() {
            if let Err(e) = self.finish_job() {
                self.flag_error(e);
                return Err(e);
            }
        }

        self.status = CommandBufferStatus::Executable;
        Ok(())
    }

    // =========================================================================
    // Error Handling
    // =========================================================================

    /// Run a recording operation, folding its failure into the sticky error
    pub(crate) fn record<F>(&mut self, f: F)
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        if self.state.error.is_some() {
            return;
        }
        if self.status != CommandBufferStatus::Recording {
            self.flag_error(Error::Usage(UsageError::NotRecording));
            return;
        }
        if let Err(e) = f(self) {
            self.flag_error(e);
        }
    }

    /// Raise the sticky error and discard the open job
    pub(crate) fn flag_error(&mut self, error: Error) {
        if self.state.error.is_none() {
            log::error!("cmd: recording failed: {}", error);
            self.state.error = Some(error);
        }
        if let Some(job) = self.state.job.take() {
            log::debug!("cmd: discarded open {:?} job", job.job_type());
        }
    }

    // =========================================================================
    // Job Lifecycle
    // =========================================================================

    /// Move pending barrier state into a new job
    ///
    /// CPU jobs run in queue order anyway and leave the barrier pending.
    fn serialize_if_needed(&mut self, job: &mut Job) {
        if !self.state.has_barrier {
            return;
        }
        let ty = job.job_type();
        if !ty.is_gpu() {
            return;
        }

        job.serialize = true;
        if self.state.has_bcl_barrier && ty.has_bcl() {
            job.needs_bcl_sync = true;
        }
        self.state.has_barrier = false;
        self.state.has_bcl_barrier = false;
    }

    /// Create a job bound to this command buffer's state
    ///
    /// Marks all state dirty, since every new job re-emits it, and consumes
    /// pending barriers.
    pub(crate) fn job_init(&mut self, kind: JobKind, subpass_idx: Option<u32>) -> Result<Job> {
        let mut job = Job::new(Arc::clone(&self.device), kind);

        self.state.dirty = DirtyFlags::all();
        self.state.dirty_descriptor_stages = ShaderStageFlags::all();

        if self.level == CommandBufferLevel::Secondary
            && self.state.inheritance.occlusion_query_enable
        {
            self.state.dirty.remove(DirtyFlags::OCCLUSION_QUERY);
        }

        if self.state.pass.is_some() {
            if let Some(idx) = subpass_idx {
                job.first_subpass = idx;
            }
        }

        self.serialize_if_needed(&mut job);
        Ok(job)
    }

    /// Create a CPU job outside of any subpass
    pub(crate) fn create_cpu_job(&mut self, kind: JobKind) -> Result<Job> {
        debug_assert!(!kind.job_type().is_gpu());
        self.job_init(kind, None)
    }

    /// Open a job for `subpass_idx`, or keep the open one if the subpass
    /// can be merged into it
    pub(crate) fn start_job(&mut self, subpass_idx: Option<u32>, kind: JobKind) -> Result<()> {
        if self.state.pass.is_some() {
            if let Some(idx) = subpass_idx {
                if self.can_merge_subpass(idx) {
                    if let Some(job) = self.state.job.as_deref_mut() {
                        job.is_subpass_finish = false;
                        log::debug!("cmd: merged subpass {} into open job", idx);
                        return Ok(());
                    }
                }
            }
        }

        self.finish_job()?;
        debug_assert!(self.state.job.is_none());

        let job = self.job_init(kind, subpass_idx)?;
        log::debug!("cmd: started {:?} job", job.job_type());
        self.state.job = Some(Box::new(job));
        Ok(())
    }

    /// Append a finished job to the job list
    pub(crate) fn append_job(&mut self, job: Job) -> Result<()> {
        self.jobs.try_reserve(1)?;
        self.jobs.push(JobEntry::Owned(Arc::new(job)));
        Ok(())
    }

    /// Finish the open job, if any, and append it
    pub(crate) fn finish_job(&mut self) -> Result<()> {
        let Some(mut job) = self.state.job.take() else {
            return Ok(());
        };

        if self.state.error.is_some() {
            log::debug!("cmd: dropped {:?} job after error", job.job_type());
            return Ok(());
        }

        if self.state.pass.is_some() {
            match job.job_type() {
                JobType::GpuCl => self.end_render_pass_frame(&mut job)?,
                JobType::GpuClSecondary => self.end_render_pass_secondary(&mut job)?,
                _ => {}
            }
        }

        log::debug!(
            "cmd: finished {:?} job with {} draws",
            job.job_type(),
            job.draw_count
        );
        self.append_job(*job)?;

        // Secondaries inside a render pass hand their end queries to the
        // primary instead
        if self.level == CommandBufferLevel::Primary || self.state.pass.is_none() {
            self.add_cpu_jobs_for_pending_state()?;
        }
        Ok(())
    }

    /// Turn deferred end-query records into CPU jobs
    fn add_cpu_jobs_for_pending_state(&mut self) -> Result<()> {
        let pending = core::mem::take(&mut self.state.query.end);
        for info in pending {
            let job = self.create_cpu_job(JobKind::CpuEndQuery(info))?;
            self.append_job(job)?;
        }
        Ok(())
    }

    /// The open job
    pub(crate) fn job_mut(&mut self) -> Result<&mut Job> {
        self.state
            .job
            .as_deref_mut()
            .ok_or(Error::Usage(UsageError::NoOpenJob))
    }

    /// Active subpass index
    pub(crate) fn current_subpass_idx(&self) -> Result<u32> {
        self.state
            .subpass_idx
            .ok_or(Error::Usage(UsageError::NotInRenderPass))
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        log::debug!(
            "cmd: destroyed {:?} buffer with {} jobs",
            self.level,
            self.jobs.len()
        );
    }
}
