//! # Queries
//!
//! Query pools and the recording side of occlusion and timestamp queries.
//!
//! Availability is host-side bookkeeping updated by CPU jobs: an occlusion
//! query ended inside a render pass only becomes available once the job
//! that counted it has finished, so the end is deferred until that job is
//! appended.

use alloc::sync::Arc;
use alloc::vec::Vec;

use v3dv_core::{Bo, Error, Result, UsageError};

use crate::buffer::CommandBuffer;
use crate::device::Device;
use crate::job::{CopyQueryResultsInfo, EndQueryInfo, JobKind};
use crate::state::{ActiveQuery, DirtyFlags};

/// Bytes of counter memory per occlusion query
const OCCLUSION_COUNTER_SIZE: u32 = 4;

/// Query type of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryType {
    /// Samples passing the depth and stencil tests
    Occlusion,
    /// GPU timestamps
    Timestamp,
}

bitflags::bitflags! {
    /// How query results are copied
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct QueryResultFlags: u32 {
        /// 64-bit results instead of 32-bit
        const RESULT_64 = 1 << 0;
        /// Wait for each result to become available
        const WAIT = 1 << 1;
        /// Follow each result with its availability
        const WITH_AVAILABILITY = 1 << 2;
        /// Write unavailable results too
        const PARTIAL = 1 << 3;
    }
}

/// Host-side state of one query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QuerySlot {
    /// The result can be read
    pub available: bool,
    /// Result, for queries not backed by counter memory
    pub value: u64,
}

/// Query pool
#[derive(Debug)]
pub struct QueryPool {
    device: Arc<Device>,
    ty: QueryType,
    bo: Option<Bo>,
    slots: spin::Mutex<Vec<QuerySlot>>,
}

impl QueryPool {
    /// Create a pool of `count` queries
    ///
    /// Occlusion pools own one buffer object holding every counter.
    pub fn new(device: Arc<Device>, ty: QueryType, count: u32) -> Result<Self> {
        let mut slots = Vec::new();
        slots.try_reserve(count as usize)?;
        slots.resize(count as usize, QuerySlot::default());

        let bo = match ty {
            QueryType::Occlusion => {
                let size = (count * OCCLUSION_COUNTER_SIZE).max(OCCLUSION_COUNTER_SIZE);
                Some(device.bo().alloc(size, "query")?)
            }
            QueryType::Timestamp => None,
        };
        Ok(Self {
            device,
            ty,
            bo,
            slots: spin::Mutex::new(slots),
        })
    }

    /// Query type
    #[inline]
    pub fn query_type(&self) -> QueryType {
        self.ty
    }

    /// Number of queries
    pub fn count(&self) -> u32 {
        self.slots.lock().len() as u32
    }

    /// Counter memory of occlusion pools
    #[inline]
    pub fn bo(&self) -> Option<Bo> {
        self.bo
    }

    /// Offset of the counter of `query` in the pool's buffer object
    #[inline]
    pub const fn query_offset(query: u32) -> u32 {
        query * OCCLUSION_COUNTER_SIZE
    }

    /// Snapshot of one query
    pub fn slot(&self, query: u32) -> Option<QuerySlot> {
        self.slots.lock().get(query as usize).copied()
    }

    /// Fail unless `[first, first + count)` lies inside the pool
    pub fn check_range(&self, first: u32, count: u32) -> Result<()> {
        let len = self.slots.lock().len() as u64;
        if first as u64 + count as u64 > len {
            return Err(Error::Usage(UsageError::QueryOutOfRange));
        }
        Ok(())
    }

    /// Run `f` over the slots `[first, first + count)`
    pub(crate) fn with_slots<R>(
        &self,
        first: u32,
        count: u32,
        f: impl FnOnce(&mut [QuerySlot]) -> R,
    ) -> Result<R> {
        let mut slots = self.slots.lock();
        let start = first as usize;
        let end = start + count as usize;
        match slots.get_mut(start..end) {
            Some(range) => Ok(f(range)),
            None => Err(Error::Usage(UsageError::QueryOutOfRange)),
        }
    }

    pub(crate) fn device(&self) -> &Device {
        &self.device
    }
}

impl Drop for QueryPool {
    fn drop(&mut self) {
        if let Some(bo) = self.bo.take() {
            self.device.bo().free(bo);
        }
    }
}

// =============================================================================
// RECORDING
// =============================================================================

impl CommandBuffer {
    /// Consecutive queries an end or timestamp uses in the current subpass
    fn multiview_query_count(&self) -> u32 {
        match (&self.state.pass, self.state.subpass_idx) {
            (Some(pass), Some(idx)) if pass.multiview_enabled => pass
                .subpass(idx)
                .map_or(1, |subpass| subpass.view_mask.count_ones()),
            _ => 1,
        }
    }

    /// Start counting samples into `query`
    pub fn begin_query(&mut self, pool: &Arc<QueryPool>, query: u32) {
        self.record(|cb| {
            if cb.state.query.active.is_some() {
                return Err(Error::Usage(UsageError::QueryAlreadyActive));
            }
            pool.check_range(query, 1)?;
            let bo = pool.bo().ok_or(Error::Unsupported)?;
            cb.state.query.active = Some(ActiveQuery {
                bo,
                offset: QueryPool::query_offset(query),
            });
            cb.state.dirty |= DirtyFlags::OCCLUSION_QUERY;
            Ok(())
        });
    }

    /// Stop counting into `query`
    pub fn end_query(&mut self, pool: &Arc<QueryPool>, query: u32) {
        self.record(|cb| {
            if cb.state.query.active.is_none() {
                return Err(Error::Usage(UsageError::QueryNotActive));
            }
            pool.check_range(query, 1)?;

            if cb.state.pass.is_some() {
                // Available once the render pass job has run, one query per view
                let count = cb.multiview_query_count();
                pool.check_range(query, count)?;
                cb.state.query.end.try_reserve(1)?;
                cb.state.query.end.push(EndQueryInfo {
                    pool: Arc::clone(pool),
                    query,
                    count,
                });
            } else {
                // Multiview queries cannot cross subpass boundaries
                let info = EndQueryInfo {
                    pool: Arc::clone(pool),
                    query,
                    count: 1,
                };
                let job = cb.create_cpu_job(JobKind::CpuEndQuery(info))?;
                cb.append_job(job)?;
            }

            cb.state.query.active = None;
            cb.state.dirty |= DirtyFlags::OCCLUSION_QUERY;
            Ok(())
        });
    }

    /// Make `count` queries from `first` unavailable
    pub fn reset_queries(&mut self, pool: &Arc<QueryPool>, first: u32, count: u32) {
        self.record(|cb| {
            cb.require_between_jobs()?;
            pool.check_range(first, count)?;
            let kind = JobKind::CpuResetQueries {
                pool: Arc::clone(pool),
                first,
                count,
            };
            let job = cb.create_cpu_job(kind)?;
            cb.append_job(job)
        });
    }

    /// Copy `count` results from `first` into `dst`
    #[allow(clippy::too_many_arguments)]
    pub fn copy_query_results(
        &mut self,
        pool: &Arc<QueryPool>,
        first: u32,
        count: u32,
        dst: Bo,
        offset: u32,
        stride: u32,
        flags: QueryResultFlags,
    ) {
        self.record(|cb| {
            cb.require_between_jobs()?;
            pool.check_range(first, count)?;
            let info = CopyQueryResultsInfo {
                pool: Arc::clone(pool),
                first,
                count,
                dst,
                offset,
                stride,
                flags,
            };
            let job = cb.create_cpu_job(JobKind::CpuCopyQueryResults(info))?;
            cb.append_job(job)
        });
    }

    /// Write the time all earlier work completed into `query`
    pub fn write_timestamp(&mut self, pool: &Arc<QueryPool>, query: u32) {
        self.record(|cb| {
            pool.check_range(query, 1)?;
            let in_pass = cb.state.pass.is_some();
            if in_pass {
                cb.finish_job()?;
            }

            let kind = JobKind::CpuTimestampQuery {
                pool: Arc::clone(pool),
                query,
                count: cb.multiview_query_count(),
            };
            let job = cb.create_cpu_job(kind)?;
            cb.append_job(job)?;

            if in_pass {
                let idx = cb.current_subpass_idx()?;
                cb.subpass_resume(idx)?;
            }
            Ok(())
        });
    }

    /// Fail unless recording is outside a render pass with no open job
    pub(crate) fn require_between_jobs(&self) -> Result<()> {
        if self.state.pass.is_some() {
            return Err(Error::Usage(UsageError::InsideRenderPass));
        }
        if self.state.job.is_some() {
            return Err(Error::Usage(UsageError::JobInProgress));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobType;
    use crate::testing::{begin_primary, draw_setup, test_device, RenderTarget};

    fn end_query_count(job: &crate::job::Job) -> u32 {
        match &job.kind {
            JobKind::CpuEndQuery(info) => info.count,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_pool_owns_counter_memory() {
        let (device, bo) = test_device();
        let pool = QueryPool::new(device.clone(), QueryType::Occlusion, 8).unwrap();
        assert_eq!(pool.bo().unwrap().size, 32);
        assert_eq!(bo.live_count(), 1);
        drop(pool);
        assert_eq!(bo.live_count(), 0);

        let ts = QueryPool::new(device, QueryType::Timestamp, 8).unwrap();
        assert!(ts.bo().is_none());
    }

    #[test]
    fn test_check_range() {
        let (device, _bo) = test_device();
        let pool = QueryPool::new(device, QueryType::Timestamp, 4).unwrap();
        assert!(pool.check_range(0, 4).is_ok());
        assert!(pool.check_range(3, 2).is_err());
        assert!(pool.check_range(u32::MAX, 2).is_err());
    }

    #[test]
    fn test_end_query_outside_pass_is_immediate() {
        let (mut cb, _bo) = begin_primary();
        let pool = Arc::new(QueryPool::new(cb.device().clone(), QueryType::Occlusion, 2).unwrap());
        cb.begin_query(&pool, 1);
        assert!(cb.state().dirty().contains(DirtyFlags::OCCLUSION_QUERY));
        cb.end_query(&pool, 1);
        assert_eq!(cb.job_types(), [JobType::CpuEndQuery]);
        assert_eq!(end_query_count(cb.jobs()[0].job()), 1);
        assert!(cb.end().is_ok());
    }

    #[test]
    fn test_end_query_deferred_until_pass_job_finishes() {
        let (mut cb, _bo) = begin_primary();
        let pool = Arc::new(QueryPool::new(cb.device().clone(), QueryType::Occlusion, 2).unwrap());
        let rt = RenderTarget::new(&cb);
        cb.begin_render_pass(&rt.begin_info());
        cb.begin_query(&pool, 0);
        draw_setup(&mut cb);
        cb.draw(3, 1, 0, 0);
        cb.end_query(&pool, 0);
        assert!(cb.jobs().is_empty());
        assert_eq!(cb.state().pending_end_queries().len(), 1);

        cb.end_render_pass();
        assert_eq!(cb.job_types(), [JobType::GpuCl, JobType::CpuEndQuery]);
        assert!(cb.state().pending_end_queries().is_empty());
    }

    #[test]
    fn test_multiview_end_query_count() {
        let (mut cb, _bo) = begin_primary();
        let pool = Arc::new(QueryPool::new(cb.device().clone(), QueryType::Occlusion, 4).unwrap());
        let rt = RenderTarget::multiview(&cb, &[0b101]);
        cb.begin_render_pass(&rt.begin_info());
        cb.begin_query(&pool, 0);
        cb.end_query(&pool, 0);
        cb.end_render_pass();
        let end = cb.jobs().last().unwrap().job();
        assert_eq!(end_query_count(end), 2);
    }

    #[test]
    fn test_multiview_end_query_past_pool_end() {
        let (mut cb, _bo) = begin_primary();
        let pool = Arc::new(QueryPool::new(cb.device().clone(), QueryType::Occlusion, 4).unwrap());
        let rt = RenderTarget::multiview(&cb, &[0b101]);
        cb.begin_render_pass(&rt.begin_info());
        // Query 3 is in range, but its second view would be query 4
        cb.begin_query(&pool, 3);
        cb.end_query(&pool, 3);
        assert!(cb.state().pending_end_queries().is_empty());
        assert_eq!(cb.end(), Err(Error::Usage(UsageError::QueryOutOfRange)));
    }

    #[test]
    fn test_second_begin_is_usage_error() {
        let (mut cb, _bo) = begin_primary();
        let pool = Arc::new(QueryPool::new(cb.device().clone(), QueryType::Occlusion, 2).unwrap());
        cb.begin_query(&pool, 0);
        cb.begin_query(&pool, 1);
        assert_eq!(cb.end(), Err(Error::Usage(UsageError::QueryAlreadyActive)));
    }

    #[test]
    fn test_end_without_begin_is_usage_error() {
        let (mut cb, _bo) = begin_primary();
        let pool = Arc::new(QueryPool::new(cb.device().clone(), QueryType::Occlusion, 2).unwrap());
        cb.end_query(&pool, 0);
        assert_eq!(cb.end(), Err(Error::Usage(UsageError::QueryNotActive)));
        assert!(cb.jobs().is_empty());
    }

    #[test]
    fn test_reset_inside_pass_is_usage_error() {
        let (mut cb, _bo) = begin_primary();
        let pool = Arc::new(QueryPool::new(cb.device().clone(), QueryType::Occlusion, 2).unwrap());
        let rt = RenderTarget::new(&cb);
        cb.begin_render_pass(&rt.begin_info());
        cb.reset_queries(&pool, 0, 2);
        assert_eq!(cb.end(), Err(Error::Usage(UsageError::InsideRenderPass)));
    }

    #[test]
    fn test_timestamp_inside_pass_splits_and_resumes() {
        let (mut cb, _bo) = begin_primary();
        let pool = Arc::new(QueryPool::new(cb.device().clone(), QueryType::Timestamp, 1).unwrap());
        let rt = RenderTarget::new(&cb);
        cb.begin_render_pass(&rt.begin_info());
        draw_setup(&mut cb);
        cb.draw(3, 1, 0, 0);
        cb.write_timestamp(&pool, 0);
        assert_eq!(cb.job_types(), [JobType::GpuCl, JobType::CpuTimestampQuery]);

        let resumed = cb.state().job().unwrap();
        assert!(resumed.is_subpass_continue);
        cb.end_render_pass();
        assert_eq!(cb.jobs().len(), 3);
        assert!(cb.end().is_ok());
    }

    #[test]
    fn test_copy_and_reset_outside_pass() {
        let (mut cb, bo) = begin_primary();
        let pool = Arc::new(QueryPool::new(cb.device().clone(), QueryType::Occlusion, 2).unwrap());
        let dst = bo.alloc_raw(64);
        cb.reset_queries(&pool, 0, 2);
        cb.copy_query_results(&pool, 0, 2, dst, 0, 8, QueryResultFlags::RESULT_64);
        assert_eq!(
            cb.job_types(),
            [JobType::CpuResetQueries, JobType::CpuCopyQueryResults]
        );
    }
}
