//! # Transfer Jobs
//!
//! Image copies the texture formatting unit can do on its own are recorded
//! as TFU jobs, one per transfer.

use crate::buffer::CommandBuffer;
use crate::job::{JobKind, TfuSubmit};

impl CommandBuffer {
    /// Append a TFU transfer
    pub fn add_tfu_job(&mut self, tfu: &TfuSubmit) {
        self.record(|cb| {
            cb.require_between_jobs()?;
            let mut job = cb.job_init(JobKind::GpuTfu(tfu.clone()), None)?;
            for &bo in &tfu.bos {
                job.add_bo(bo)?;
            }
            log::trace!("transfer: tfu {:#x} -> {:#x}", tfu.iia, tfu.ioa);
            cb.append_job(job)
        });
    }
}
