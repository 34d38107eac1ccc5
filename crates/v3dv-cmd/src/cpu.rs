//! # CPU Jobs
//!
//! Host-side work the queue runs between GPU jobs. Everything here runs at
//! submit time, after the GPU work recorded before the job was handed to
//! the kernel.

use v3dv_core::{Bo, BoManager, Error, Result, UsageError, WAIT_FOREVER};

use crate::compute::{unpacked_batch_count, DispatchIndirectCommand, MAX_WORKGROUP_COUNT};
use crate::job::{CopyQueryResultsInfo, CsdIndirectInfo, Job, JobKind};
use crate::query::{QueryPool, QueryResultFlags, QueryType};

/// Outcome of running a CPU job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuJobStatus {
    /// Finished
    Done,
    /// Waiting on events; run again later
    Pending,
    /// Indirect dispatch with a zero count; nothing to submit
    Skipped,
    /// Indirect dispatch resolved; submit its compute job next
    Dispatch,
}

/// Run a CPU job
pub fn execute(job: &Job) -> Result<CpuJobStatus> {
    let bo_mgr = job.device().bo();
    match &job.kind {
        JobKind::CpuResetQueries { pool, first, count } => {
            reset_queries(pool, *first, *count, bo_mgr)?;
            Ok(CpuJobStatus::Done)
        }
        JobKind::CpuEndQuery(info) => {
            info.pool.with_slots(info.query, info.count, |slots| {
                for slot in slots {
                    slot.available = true;
                }
            })?;
            Ok(CpuJobStatus::Done)
        }
        JobKind::CpuCopyQueryResults(info) => {
            copy_query_results(info, bo_mgr)?;
            Ok(CpuJobStatus::Done)
        }
        JobKind::CpuSetEvent { event, state } => {
            event.set(*state);
            Ok(CpuJobStatus::Done)
        }
        JobKind::CpuWaitEvents { events } => {
            if events.iter().all(|e| e.is_set()) {
                Ok(CpuJobStatus::Done)
            } else {
                Ok(CpuJobStatus::Pending)
            }
        }
        JobKind::CpuCsdIndirect(info) => csd_indirect(info, bo_mgr),
        JobKind::CpuTimestampQuery { pool, query, count } => {
            let now = bo_mgr.timestamp_ns();
            // Multiview writes one query per view; only the first gets a time
            pool.with_slots(*query, *count, |slots| {
                for (i, slot) in slots.iter_mut().enumerate() {
                    slot.value = if i == 0 { now } else { 0 };
                    slot.available = true;
                }
            })?;
            Ok(CpuJobStatus::Done)
        }
        JobKind::GpuCl(_) | JobKind::GpuClSecondary(_) | JobKind::GpuCsd(_) | JobKind::GpuTfu(_) => {
            log::error!("cpu: {:?} job is submitted to the GPU", job.job_type());
            Err(Error::Unsupported)
        }
    }
}

// =============================================================================
// QUERIES
// =============================================================================

fn reset_queries(pool: &QueryPool, first: u32, count: u32, bo_mgr: &dyn BoManager) -> Result<()> {
    pool.with_slots(first, count, |slots| {
        for slot in slots {
            *slot = Default::default();
        }
    })?;

    if pool.query_type() == QueryType::Occlusion {
        let bo = pool.bo().ok_or(Error::InvalidBuffer)?;
        let start = QueryPool::query_offset(first);
        let end = QueryPool::query_offset(first + count);
        for offset in (start..end).step_by(4) {
            bo_mgr.write(bo, offset, &0u32.to_le_bytes())?;
        }
    }
    Ok(())
}

fn write_result(bo_mgr: &dyn BoManager, dst: Bo, offset: u32, value: u64, wide: bool) -> Result<()> {
    if wide {
        bo_mgr.write(dst, offset, &value.to_le_bytes())
    } else {
        bo_mgr.write(dst, offset, &(value as u32).to_le_bytes())
    }
}

fn copy_query_results(info: &CopyQueryResultsInfo, bo_mgr: &dyn BoManager) -> Result<()> {
    let pool = &info.pool;
    let flags = info.flags;
    let wide = flags.contains(QueryResultFlags::RESULT_64);
    let word = if wide { 8 } else { 4 };

    for i in 0..info.count {
        let query = info.first + i;
        let slot = pool
            .slot(query)
            .ok_or(Error::Usage(UsageError::QueryOutOfRange))?;

        // Nothing recorded before this job can make the query available
        if !slot.available && flags.contains(QueryResultFlags::WAIT) {
            return Err(Error::NotReady);
        }

        let value = match pool.query_type() {
            QueryType::Occlusion => {
                let bo = pool.bo().ok_or(Error::InvalidBuffer)?;
                if flags.contains(QueryResultFlags::WAIT) {
                    bo_mgr.wait(bo, WAIT_FOREVER)?;
                }
                let mut counter = [0u8; 4];
                bo_mgr.read(bo, QueryPool::query_offset(query), &mut counter)?;
                u64::from(u32::from_le_bytes(counter))
            }
            QueryType::Timestamp => slot.value,
        };

        let at = info.offset + i * info.stride;
        if slot.available || flags.contains(QueryResultFlags::PARTIAL) {
            write_result(bo_mgr, info.dst, at, value, wide)?;
        }
        if flags.contains(QueryResultFlags::WITH_AVAILABILITY) {
            write_result(bo_mgr, info.dst, at + word, u64::from(slot.available), wide)?;
        }
    }
    Ok(())
}

// =============================================================================
// INDIRECT DISPATCH
// =============================================================================

fn csd_indirect(info: &CsdIndirectInfo, bo_mgr: &dyn BoManager) -> Result<CpuJobStatus> {
    // The counts may be written by earlier GPU work
    bo_mgr.wait(info.buffer, WAIT_FOREVER)?;
    let mut bytes = [0u8; core::mem::size_of::<DispatchIndirectCommand>()];
    bo_mgr.read(info.buffer, info.offset, &mut bytes)?;
    let cmd: DispatchIndirectCommand = bytemuck::pod_read_unaligned(&bytes);
    let counts = cmd.counts();

    if counts.contains(&0) {
        log::debug!("cpu: indirect dispatch of {:?} skipped", counts);
        return Ok(CpuJobStatus::Skipped);
    }

    let batches = unpacked_batch_count(info.wg_size, counts);
    if counts.iter().any(|&c| c > MAX_WORKGROUP_COUNT) || batches.is_none() {
        log::error!("cpu: indirect dispatch of {:?} out of range", counts);
        return Err(Error::Usage(UsageError::InvalidWorkgroupCount));
    }

    let mut job = info.csd_job.lock();
    let unchanged = job.csd().is_some_and(|csd| csd.wg_count == counts);
    if !unchanged {
        rewrite_indirect_csd_job(info, &mut job, counts, bo_mgr)?;
    }
    Ok(CpuJobStatus::Dispatch)
}

/// Patch a compute job built with placeholder counts for the real ones
pub fn rewrite_indirect_csd_job(
    info: &CsdIndirectInfo,
    job: &mut Job,
    counts: [u32; 3],
    bo_mgr: &dyn BoManager,
) -> Result<()> {
    let num_batches = unpacked_batch_count(info.wg_size, counts)
        .ok_or(Error::Usage(UsageError::InvalidWorkgroupCount))?;
    let (_, csd, _) = job.csd_parts()?;

    csd.wg_count = counts;
    for (cfg, c) in csd.cfg.iter_mut().zip(counts) {
        *cfg = c << 16;
    }
    csd.cfg[4] = num_batches - 1;

    if info.needs_wg_uniform_rewrite {
        for (site, count) in info.wg_uniform_offsets.iter().zip(counts) {
            let Some(site) = *site else { continue };
            // The GPU must be done reading the uniforms we are about to change
            let bo = csd.indirect.site_bo(site).ok_or(Error::InvalidBuffer)?;
            bo_mgr.wait(bo, WAIT_FOREVER)?;
            csd.indirect.patch_u32(bo_mgr, site, count)?;
        }
    }

    log::trace!("cpu: indirect dispatch rewritten for {:?}", counts);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::CommandBuffer;
    use crate::event::Event;
    use crate::testing::{begin_primary, compute_pipeline, FakeBoManager, RenderTarget};
    use alloc::sync::Arc;
    use alloc::vec::Vec;

    fn run_all(cb: &CommandBuffer) -> Vec<CpuJobStatus> {
        cb.jobs()
            .iter()
            .filter(|e| !e.job_type().is_gpu())
            .map(|e| execute(e.job()).unwrap())
            .collect()
    }

    fn occlusion_pool(cb: &CommandBuffer, count: u32) -> Arc<QueryPool> {
        Arc::new(QueryPool::new(cb.device().clone(), QueryType::Occlusion, count).unwrap())
    }

    #[test]
    fn test_reset_then_end_availability() {
        let (mut cb, bo) = begin_primary();
        let pool = occlusion_pool(&cb, 4);
        let counters = pool.bo().unwrap();
        bo.write_word(counters, QueryPool::query_offset(1), 77);

        cb.reset_queries(&pool, 0, 4);
        cb.begin_query(&pool, 1);
        cb.end_query(&pool, 1);
        cb.end().unwrap();

        let statuses = run_all(&cb);
        assert!(statuses.iter().all(|&s| s == CpuJobStatus::Done));
        assert_eq!(bo.read_word(counters, QueryPool::query_offset(1)), 0);
        assert!(pool.slot(1).unwrap().available);
        assert!(!pool.slot(0).unwrap().available);
    }

    #[test]
    fn test_timestamp_first_view_only() {
        let (mut cb, bo) = begin_primary();
        bo.set_timestamp(123_456);
        let pool = Arc::new(QueryPool::new(cb.device().clone(), QueryType::Timestamp, 4).unwrap());
        let rt = RenderTarget::multiview(&cb, &[0b11]);
        cb.begin_render_pass(&rt.begin_info());
        cb.write_timestamp(&pool, 1);
        cb.end_render_pass();
        cb.end().unwrap();

        run_all(&cb);
        assert_eq!(pool.slot(1).unwrap().value, 123_456);
        assert_eq!(pool.slot(2).unwrap().value, 0);
        assert!(pool.slot(2).unwrap().available);
        assert!(!pool.slot(3).unwrap().available);
    }

    fn copy_job(cb: &mut CommandBuffer, pool: &Arc<QueryPool>, dst: Bo, flags: QueryResultFlags) {
        cb.copy_query_results(pool, 0, 2, dst, 8, 16, flags);
    }

    #[test]
    fn test_copy_results_with_availability() {
        let (mut cb, bo) = begin_primary();
        let pool = occlusion_pool(&cb, 2);
        let dst = bo.alloc_raw(64);
        bo.write_word(pool.bo().unwrap(), 0, 42);
        bo.write_word(pool.bo().unwrap(), 4, 9);

        cb.begin_query(&pool, 0);
        cb.end_query(&pool, 0);
        copy_job(&mut cb, &pool, dst, QueryResultFlags::WITH_AVAILABILITY);
        cb.end().unwrap();
        run_all(&cb);

        // Query 0 available, query 1 not
        assert_eq!(bo.read_word(dst, 8), 42);
        assert_eq!(bo.read_word(dst, 12), 1);
        assert_eq!(bo.read_word(dst, 24), 0);
        assert_eq!(bo.read_word(dst, 28), 0);
        bo.free(dst);
    }

    #[test]
    fn test_copy_results_partial_64bit() {
        let (mut cb, bo) = begin_primary();
        let pool = occlusion_pool(&cb, 2);
        let dst = bo.alloc_raw(64);
        bo.write_word(pool.bo().unwrap(), 4, 9);

        copy_job(
            &mut cb,
            &pool,
            dst,
            QueryResultFlags::RESULT_64 | QueryResultFlags::PARTIAL,
        );
        cb.end().unwrap();
        run_all(&cb);

        assert_eq!(bo.read_u64(dst, 24), 9);
        bo.free(dst);
    }

    #[test]
    fn test_copy_results_wait_on_unavailable_fails() {
        let (mut cb, bo) = begin_primary();
        let pool = occlusion_pool(&cb, 2);
        let dst = bo.alloc_raw(64);
        copy_job(&mut cb, &pool, dst, QueryResultFlags::WAIT);
        cb.end().unwrap();
        assert_eq!(execute(cb.jobs()[0].job()), Err(Error::NotReady));
        bo.free(dst);
    }

    #[test]
    fn test_events() {
        let (mut cb, _bo) = begin_primary();
        let event = Arc::new(Event::new());
        cb.wait_events(&[event.clone()]);
        cb.set_event(&event);
        cb.end().unwrap();

        let wait = cb.jobs()[0].job();
        assert_eq!(execute(wait), Ok(CpuJobStatus::Pending));
        assert_eq!(execute(cb.jobs()[1].job()), Ok(CpuJobStatus::Done));
        assert_eq!(execute(wait), Ok(CpuJobStatus::Done));
    }

    fn indirect_cb(bo: &FakeBoManager, cb: &mut CommandBuffer, counts: [u32; 3]) -> Bo {
        let params = bo.alloc_raw(64);
        for (i, c) in counts.iter().enumerate() {
            bo.write_word(params, 16 + i as u32 * 4, *c);
        }
        cb.bind_compute_pipeline(&Arc::new(compute_pipeline([8, 1, 1])));
        cb.dispatch_indirect(params, 16);
        cb.end().unwrap();
        params
    }

    fn indirect_info(cb: &CommandBuffer) -> &CsdIndirectInfo {
        match &cb.jobs()[0].job().kind {
            JobKind::CpuCsdIndirect(info) => info,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_indirect_dispatch_rewrites_counts() {
        let (mut cb, bo) = begin_primary();
        let params = indirect_cb(&bo, &mut cb, [4, 1, 1]);

        assert_eq!(execute(cb.jobs()[0].job()), Ok(CpuJobStatus::Dispatch));

        let info = indirect_info(&cb);
        let job = info.csd_job.lock();
        let csd = job.csd().unwrap();
        assert_eq!(csd.wg_count, [4, 1, 1]);
        assert_eq!(csd.cfg[0], 4 << 16);
        assert_eq!(csd.cfg[4], 3);

        let x = info.wg_uniform_offsets[0].unwrap();
        assert_eq!(csd.indirect.read_u32(x), Some(4));
        let chunk = csd.indirect.site_bo(x).unwrap();
        assert_eq!(bo.read_word(chunk, x.offset()), 4);
        drop(job);
        bo.free(params);
    }

    #[test]
    fn test_indirect_dispatch_counts_out_of_range() {
        for counts in [[0xffff, 0xffff, 2], [0x1_0000, 1, 1]] {
            let (mut cb, bo) = begin_primary();
            let params = indirect_cb(&bo, &mut cb, counts);
            assert_eq!(
                execute(cb.jobs()[0].job()),
                Err(Error::Usage(UsageError::InvalidWorkgroupCount))
            );
            // The placeholder job is left as recorded
            let info = indirect_info(&cb);
            let job = info.csd_job.lock();
            let csd = job.csd().unwrap();
            assert_eq!(csd.wg_count, [1, 1, 1]);
            assert_eq!(csd.cfg[0], 1 << 16);
            drop(job);
            bo.free(params);
        }
    }

    #[test]
    fn test_indirect_dispatch_zero_count_skipped() {
        let (mut cb, bo) = begin_primary();
        let params = indirect_cb(&bo, &mut cb, [4, 0, 1]);
        assert_eq!(execute(cb.jobs()[0].job()), Ok(CpuJobStatus::Skipped));
        let info = indirect_info(&cb);
        assert_eq!(info.csd_job.lock().csd().unwrap().wg_count, [1, 1, 1]);
        bo.free(params);
    }

    #[test]
    fn test_indirect_dispatch_matching_counts_untouched() {
        let (mut cb, bo) = begin_primary();
        let params = indirect_cb(&bo, &mut cb, [1, 1, 1]);
        let waits = bo.wait_count();
        assert_eq!(execute(cb.jobs()[0].job()), Ok(CpuJobStatus::Dispatch));
        // Only the parameter buffer was waited on
        assert_eq!(bo.wait_count(), waits + 1);
        bo.free(params);
    }

    #[test]
    fn test_gpu_job_is_rejected() {
        let (mut cb, _bo) = begin_primary();
        cb.bind_compute_pipeline(&Arc::new(compute_pipeline([8, 1, 1])));
        cb.dispatch(1, 1, 1);
        assert_eq!(execute(cb.jobs()[0].job()), Err(Error::Unsupported));
    }
}
