//! # Secondary Command Buffers
//!
//! Outside a render pass a secondary's jobs are cloned into the primary's
//! job list. Inside one, the primary's binning list branches into each
//! secondary binning list, which returns with a return-from-sub-list packet.
//!
//! Barrier state left pending at the end of a secondary carries over to
//! whatever job comes next, in the next secondary or in the primary.

use alloc::vec::Vec;

use v3dv_core::{Error, Result, UsageError};

use crate::buffer::{CommandBuffer, CommandBufferStatus, CommandBufferUsage};
use crate::job::{JobEntry, JobType};
use crate::packet::Packet;
use crate::state::DirtyFlags;

/// Barrier state waiting for the next job
#[derive(Debug, Clone, Copy, Default)]
struct PendingBarrier {
    barrier: bool,
    bcl: bool,
}

impl PendingBarrier {
    fn of(secondary: &CommandBuffer) -> Self {
        debug_assert!(secondary.state.has_barrier || !secondary.state.has_bcl_barrier);
        Self {
            barrier: secondary.state.has_barrier,
            bcl: secondary.state.has_bcl_barrier,
        }
    }
}

impl CommandBuffer {
    /// Replay `secondaries` in order
    pub fn execute_commands(&mut self, secondaries: &[&CommandBuffer]) {
        self.record(|cb| {
            if !cb.is_primary() {
                return Err(Error::Usage(UsageError::WrongLevel));
            }
            let in_pass = cb.state.pass.is_some();
            for secondary in secondaries {
                if secondary.is_primary() {
                    return Err(Error::Usage(UsageError::WrongLevel));
                }
                let continues = secondary
                    .usage()
                    .contains(CommandBufferUsage::RENDER_PASS_CONTINUE);
                if secondary.status() != CommandBufferStatus::Executable || continues != in_pass {
                    return Err(Error::Usage(UsageError::IncompatibleSecondary));
                }
            }

            if in_pass {
                cb.execute_inside_pass(secondaries)
            } else {
                cb.execute_outside_pass(secondaries)
            }
        });
    }

    fn push_clone(&mut self, entry: &JobEntry, pending: PendingBarrier) -> Result<()> {
        let mut clone = entry.clone_job()?;
        if pending.barrier {
            clone.serialize = true;
            if pending.bcl {
                clone.needs_bcl_sync = true;
            }
        }
        self.jobs.try_reserve(1)?;
        self.jobs.push(JobEntry::Cloned(clone));
        Ok(())
    }

    fn take_pending_barrier(&mut self, pending: PendingBarrier) {
        if pending.barrier {
            self.state.has_barrier = true;
            self.state.has_bcl_barrier |= pending.bcl;
        }
    }

    fn execute_outside_pass(&mut self, secondaries: &[&CommandBuffer]) -> Result<()> {
        let mut pending = PendingBarrier::default();
        for secondary in secondaries {
            for entry in secondary.jobs() {
                debug_assert_ne!(entry.job_type(), JobType::GpuClSecondary);
                self.push_clone(entry, pending)?;
                pending = PendingBarrier::default();
            }
            pending = PendingBarrier::of(secondary);
        }
        self.take_pending_barrier(pending);
        log::debug!(
            "secondary: cloned {} buffers, {} jobs total",
            secondaries.len(),
            self.jobs.len()
        );
        Ok(())
    }

    /// Continue the subpass in a new job, serialized if a barrier asks for it
    fn subpass_split_for_barrier(&mut self, barrier: bool, bcl_barrier: bool) -> Result<()> {
        let idx = self.current_subpass_idx()?;
        self.finish_job()?;
        self.subpass_resume(idx)?;
        if barrier {
            let job = self.job_mut()?;
            job.serialize = true;
            job.needs_bcl_sync |= bcl_barrier;
        }
        Ok(())
    }

    fn execute_inside_pass(&mut self, secondaries: &[&CommandBuffer]) -> Result<()> {
        // Draws inside the secondaries count into the active query
        let has_occlusion_query = self.state.dirty.contains(DirtyFlags::OCCLUSION_QUERY);
        if has_occlusion_query && self.state.job.is_some() {
            self.emit_occlusion_query()?;
        }

        let return_opcode = self.device().encoder().return_from_sub_list_opcode();
        let mut pending = PendingBarrier::default();
        for secondary in secondaries {
            for entry in secondary.jobs() {
                if entry.job_type() != JobType::GpuClSecondary {
                    self.finish_job()?;
                    self.push_clone(entry, pending)?;
                    pending = PendingBarrier::default();
                    continue;
                }

                let src = entry.job();
                debug_assert!(src.cl().is_some_and(|cl| cl.rcl.is_empty()));
                debug_assert_eq!(
                    src.cl().and_then(|cl| cl.bcl.last_byte()),
                    Some(return_opcode)
                );

                let barrier = entry.serialize() || pending.barrier;
                if self.state.job.is_none() || barrier {
                    let bcl_barrier = entry.needs_bcl_sync() || pending.bcl;
                    self.subpass_split_for_barrier(barrier, bcl_barrier)?;
                    if has_occlusion_query {
                        self.emit_occlusion_query()?;
                    }
                }

                let job = self.job_mut()?;
                for &bo in src.bos.iter() {
                    job.add_bo(bo)?;
                }
                for bcl_bo in entry.bcl_bos() {
                    job.emit_bcl(&Packet::BranchToSubList(bcl_bo.address(0)))?;
                }
                pending = PendingBarrier::default();
            }

            // Ended queries become CPU jobs when the primary's job finishes
            let ended = &secondary.state.query.end;
            let mut end = Vec::new();
            end.try_reserve(ended.len())?;
            end.extend(ended.iter().cloned());
            self.state.query.end.try_reserve(end.len())?;
            self.state.query.end.append(&mut end);

            pending = PendingBarrier::of(secondary);
        }
        self.take_pending_barrier(pending);
        Ok(())
    }
}
