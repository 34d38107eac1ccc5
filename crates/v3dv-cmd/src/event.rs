//! # Events
//!
//! Host-visible signal objects set, reset and waited on by CPU jobs.

use alloc::sync::Arc;
use alloc::vec::Vec;

use v3dv_core::{Error, Result, UsageError};

use crate::buffer::CommandBuffer;
use crate::job::JobKind;

/// Event object
#[derive(Debug, Default)]
pub struct Event {
    state: spin::Mutex<bool>,
}

impl Event {
    /// Create an unsignalled event
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the event is signalled
    pub fn is_set(&self) -> bool {
        *self.state.lock()
    }

    /// Signal or unsignal the event
    pub fn set(&self, state: bool) {
        *self.state.lock() = state;
    }
}

impl CommandBuffer {
    fn set_event_state(&mut self, event: &Arc<Event>, state: bool) {
        self.record(|cb| {
            // Events are host-side work between jobs
            if cb.state.pass.is_some() {
                return Err(Error::Usage(UsageError::InsideRenderPass));
            }
            if cb.state.job.is_some() {
                return Err(Error::Usage(UsageError::JobInProgress));
            }
            let kind = JobKind::CpuSetEvent {
                event: Arc::clone(event),
                state,
            };
            let job = cb.create_cpu_job(kind)?;
            cb.append_job(job)
        });
    }

    /// Signal `event` once every earlier job has completed
    pub fn set_event(&mut self, event: &Arc<Event>) {
        self.set_event_state(event, true);
    }

    /// Unsignal `event` once every earlier job has completed
    pub fn reset_event(&mut self, event: &Arc<Event>) {
        self.set_event_state(event, false);
    }

    /// Block later jobs until every event in `events` is signalled
    ///
    /// The wait lands in the job list ahead of the job currently open, if
    /// any, since that job has not been appended yet.
    pub fn wait_events(&mut self, events: &[Arc<Event>]) {
        self.record(|cb| {
            if events.is_empty() {
                return Err(Error::Usage(UsageError::NoEvents));
            }
            let mut list = Vec::new();
            list.try_reserve(events.len())?;
            list.extend(events.iter().cloned());
            let job = cb.create_cpu_job(JobKind::CpuWaitEvents { events: list })?;
            cb.append_job(job)
        });
    }
}
