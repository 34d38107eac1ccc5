//! # Compute Dispatch
//!
//! A dispatch becomes one compute job. The dispatch configuration words
//! describe the workgroup grid and how workgroups are packed into
//! supergroups of 16-lane batches.
//!
//! Indirect dispatches read their counts from a buffer the GPU may still be
//! writing, so the compute job is built with placeholder counts and
//! wrapped in a CPU job that patches it at submit time.

use alloc::boxed::Box;
use alloc::sync::Arc;

use bytemuck::{Pod, Zeroable};
use v3dv_core::{Bo, Error, Result, UsageError};

use crate::buffer::CommandBuffer;
use crate::cl::PatchSite;
use crate::job::{CsdIndirectInfo, Job, JobKind};
use crate::pipeline::{ComputePipeline, ShaderStageFlags};
use crate::state::DirtyFlags;
use crate::uniforms::{write_uniforms, UniformContext};

/// Largest workgroup count per axis
pub const MAX_WORKGROUP_COUNT: u32 = 0xffff;

/// Lanes per batch
const BATCH_LANES: u32 = 16;

/// Most workgroups a supergroup can hold
const MAX_WGS_PER_SG: u32 = 16;

const CFG012_WG_COUNT_SHIFT: u32 = 16;
const CFG3_BATCHES_PER_SG_M1_SHIFT: u32 = 12;
const CFG3_WGS_PER_SG_SHIFT: u32 = 8;
const CFG5_PROPAGATE_NANS: u32 = 1 << 2;
const CFG5_SINGLE_SEG: u32 = 1 << 1;
const CFG5_THREADING: u32 = 1 << 0;

/// Workgroup counts as stored in an indirect dispatch buffer
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct DispatchIndirectCommand {
    /// Workgroups along X
    pub x: u32,
    /// Workgroups along Y
    pub y: u32,
    /// Workgroups along Z
    pub z: u32,
}

static_assertions::const_assert_eq!(core::mem::size_of::<DispatchIndirectCommand>(), 12);

impl DispatchIndirectCommand {
    /// Counts as an array
    #[inline]
    pub const fn counts(&self) -> [u32; 3] {
        [self.x, self.y, self.z]
    }
}

/// Workgroups packed into one supergroup
///
/// Picks the packing that leaves the fewest idle lanes in the last batch.
pub fn workgroups_per_supergroup(
    qpu_count: u32,
    pipeline: &ComputePipeline,
    num_wgs: u32,
    wg_size: u32,
) -> u32 {
    if pipeline.has_subgroups {
        return 1;
    }

    let mut max_wgs = MAX_WGS_PER_SG;

    // Threads stall at a barrier until the whole supergroup reaches it;
    // keep at least two supergroups in flight
    if pipeline.has_control_barrier {
        let max_threads = qpu_count * pipeline.threads;
        max_wgs = max_wgs.min((max_threads / 2).max(1));
    }

    let mut best = 1;
    let mut best_unused = BATCH_LANES;
    for wgs in 1..=max_wgs {
        if wgs > num_wgs {
            break;
        }
        let unused = (BATCH_LANES - (wgs * wg_size) % BATCH_LANES) & 0xf;
        if unused == 0 {
            return wgs;
        }
        if unused < best_unused {
            best = wgs;
            best_unused = unused;
        }
    }
    best
}

/// Total workgroups of a dispatch, `None` if it does not fit in 32 bits
#[inline]
pub(crate) fn total_workgroups(wg_count: [u32; 3]) -> Option<u32> {
    wg_count[0].checked_mul(wg_count[1])?.checked_mul(wg_count[2])
}

/// Batches needed for `wg_count` workgroups of `wg_size` invocations
/// without supergroup packing
#[inline]
pub(crate) fn unpacked_batch_count(wg_size: u32, wg_count: [u32; 3]) -> Option<u32> {
    total_workgroups(wg_count)?.checked_mul(wg_size.div_ceil(BATCH_LANES))
}

/// A compute job and what an indirect dispatch needs to patch it
struct CsdSetup {
    job: Job,
    wg_uniform_sites: [Option<PatchSite>; 3],
    wg_size: u32,
}

impl CommandBuffer {
    /// Bind the compute pipeline used by later dispatches
    pub fn bind_compute_pipeline(&mut self, pipeline: &Arc<ComputePipeline>) {
        self.record(|cb| {
            if cb
                .state
                .compute
                .pipeline
                .as_ref()
                .is_some_and(|bound| Arc::ptr_eq(bound, pipeline))
            {
                return Ok(());
            }
            cb.state.compute.pipeline = Some(Arc::clone(pipeline));
            cb.state.dirty |= DirtyFlags::COMPUTE_PIPELINE;
            Ok(())
        });
    }

    /// Consume the compute dirty state; every dispatch writes its uniforms
    fn pre_dispatch(&mut self) -> Result<()> {
        if self.state.compute.pipeline.is_none() {
            return Err(Error::Usage(UsageError::NoPipelineBound));
        }
        let state = &mut self.state;
        state
            .dirty
            .remove(DirtyFlags::COMPUTE_PIPELINE | DirtyFlags::COMPUTE_DESCRIPTOR_SETS);
        state.dirty_descriptor_stages.remove(ShaderStageFlags::COMPUTE);
        state.dirty_push_constants_stages.remove(ShaderStageFlags::COMPUTE);
        Ok(())
    }

    /// Build a compute job for `count` workgroups starting at `base`
    fn create_csd_job(&mut self, base: [u32; 3], count: [u32; 3]) -> Result<CsdSetup> {
        let pipeline = self
            .state
            .compute
            .pipeline
            .clone()
            .ok_or(Error::Usage(UsageError::NoPipelineBound))?;
        // The batch count register is 32 bits wide
        let num_wgs = total_workgroups(count).ok_or(Error::Unsupported)?;
        let wg_size = pipeline.workgroup_size();
        let wgs_per_sg = workgroups_per_supergroup(
            self.device().info.qpu_count,
            &pipeline,
            num_wgs,
            wg_size,
        );

        let batches_per_sg = (wgs_per_sg * wg_size).div_ceil(BATCH_LANES);
        let whole_sgs = num_wgs / wgs_per_sg;
        let rem_wgs = num_wgs - whole_sgs * wgs_per_sg;
        let num_batches = batches_per_sg
            .checked_mul(whole_sgs)
            .and_then(|n| n.checked_add((rem_wgs * wg_size).div_ceil(BATCH_LANES)))
            .ok_or(Error::Unsupported)?;
        if num_batches == 0 {
            return Err(Error::Usage(UsageError::InvalidWorkgroupCount));
        }

        let mut job = self.job_init(JobKind::gpu_csd(), None)?;

        let shared_memory = if pipeline.shared_size > 0 {
            let bo = self
                .device()
                .bo()
                .alloc(pipeline.shared_size * wgs_per_sg, "shared_vars")?;
            Some(bo)
        } else {
            None
        };

        {
            let csd = job
                .csd_mut()
                .ok_or(Error::Usage(UsageError::NoOpenJob))?;
            csd.wg_count = count;
            csd.wg_base = base;
            for (cfg, c) in csd.cfg.iter_mut().zip(count) {
                *cfg = c << CFG012_WG_COUNT_SHIFT;
            }
            csd.cfg[3] = ((wgs_per_sg & 0xf) << CFG3_WGS_PER_SG_SHIFT)
                | ((batches_per_sg - 1) << CFG3_BATCHES_PER_SG_M1_SHIFT)
                | (wg_size & 0xff);
            csd.cfg[4] = num_batches - 1;

            let mut cfg5 = (pipeline.assembly_bo.offset.raw() + pipeline.cs.assembly_offset)
                | CFG5_PROPAGATE_NANS;
            if pipeline.single_seg {
                cfg5 |= CFG5_SINGLE_SEG;
            }
            if pipeline.threads == 4 {
                cfg5 |= CFG5_THREADING;
            }
            csd.cfg[5] = cfg5;
            csd.shared_memory = shared_memory;
        }
        if let Some(bo) = shared_memory {
            job.bos.add_new(bo)?;
        }
        job.add_bo(pipeline.assembly_bo)?;

        let state = &self.state;
        let ctx = UniformContext {
            push_constants: &state.push_constants,
            descriptors: &state.compute.descriptor_state,
            dynamic: &state.dynamic,
            view_index: 0,
            wg_count: count,
            shared_memory,
        };
        let stream = write_uniforms(&mut job, &ctx, &pipeline.cs)?;
        if let Some(csd) = job.csd_mut() {
            csd.cfg[6] = stream.address.raw();
        }

        log::trace!(
            "dispatch: {:?} workgroups of {}, {} per supergroup, {} batches",
            count,
            wg_size,
            wgs_per_sg,
            num_batches
        );
        Ok(CsdSetup {
            job,
            wg_uniform_sites: stream.wg_count_sites,
            wg_size,
        })
    }

    /// Dispatch `count` workgroups starting at `base`
    pub fn dispatch_base(&mut self, base: [u32; 3], count: [u32; 3]) {
        self.record(|cb| {
            cb.require_between_jobs()?;
            cb.pre_dispatch()?;
            if count.contains(&0) {
                return Ok(());
            }
            if count.iter().any(|&c| c > MAX_WORKGROUP_COUNT) {
                return Err(Error::Usage(UsageError::InvalidWorkgroupCount));
            }
            let setup = cb.create_csd_job(base, count)?;
            cb.append_job(setup.job)
        });
    }

    /// Dispatch `x * y * z` workgroups
    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.dispatch_base([0; 3], [x, y, z]);
    }

    /// Dispatch with workgroup counts read from `buffer` at submit time
    pub fn dispatch_indirect(&mut self, buffer: Bo, offset: u32) {
        self.record(|cb| {
            cb.require_between_jobs()?;
            cb.pre_dispatch()?;

            let setup = cb.create_csd_job([0; 3], [1; 3])?;
            let wg_uniform_offsets = setup.wg_uniform_sites;
            let info = CsdIndirectInfo {
                buffer,
                offset,
                wg_size: setup.wg_size,
                wg_uniform_offsets,
                needs_wg_uniform_rewrite: wg_uniform_offsets.iter().any(Option::is_some),
                csd_job: spin::Mutex::new(setup.job),
            };
            let mut job = cb.create_cpu_job(JobKind::CpuCsdIndirect(Box::new(info)))?;
            job.add_bo(buffer)?;
            cb.append_job(job)
        });
    }
}
