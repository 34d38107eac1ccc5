//! # Meta Operations
//!
//! Copies, blits and clears implemented with internal draws replace the
//! bound pipeline, dynamic state and possibly the render pass. Their state
//! is saved before and restored after; saves do not nest.

use alloc::boxed::Box;
use alloc::vec::Vec;

use v3dv_core::{Error, UsageError};

use crate::buffer::CommandBuffer;
use crate::state::{DirtyFlags, MetaState, SavedSubpass};

impl CommandBuffer {
    /// Save the state a meta operation is about to replace
    pub fn meta_state_push(&mut self, push_descriptor_state: bool) {
        self.record(|cb| {
            if cb.state.meta.is_some() {
                return Err(Error::Usage(UsageError::MetaStateUnbalanced));
            }
            let state = &cb.state;

            let subpass = match state.subpass_idx {
                Some(subpass_idx) => {
                    let mut attachments = Vec::new();
                    attachments.try_reserve(state.attachments.len())?;
                    attachments.extend_from_slice(&state.attachments);
                    Some(SavedSubpass {
                        subpass_idx,
                        pass: state.pass.clone(),
                        framebuffer: state.framebuffer.clone(),
                        attachments,
                        tile_aligned_render_area: state.tile_aligned_render_area,
                        render_area: state.render_area,
                    })
                }
                None => None,
            };

            // Meta operations only draw, so compute state is left alone
            let meta = MetaState {
                subpass,
                gfx_pipeline: state.gfx.pipeline.clone(),
                dynamic: state.dynamic,
                descriptor_state: push_descriptor_state
                    .then(|| state.gfx.descriptor_state.clone()),
                push_constants: state.push_constants,
            };
            cb.state.meta = Some(Box::new(meta));
            Ok(())
        });
    }

    /// Restore the state saved by [`meta_state_push`](Self::meta_state_push)
    ///
    /// Dynamic state comes back only for the `dirty_dynamic` bits, which are
    /// marked dirty. With `needs_subpass_resume` the saved subpass continues
    /// in a new job.
    pub fn meta_state_pop(&mut self, dirty_dynamic: DirtyFlags, needs_subpass_resume: bool) {
        self.record(|cb| {
            let meta = cb
                .state
                .meta
                .take()
                .ok_or(Error::Usage(UsageError::MetaStateUnbalanced))?;
            let meta = *meta;

            match meta.subpass {
                Some(saved) => {
                    cb.state.pass = saved.pass;
                    cb.state.framebuffer = saved.framebuffer;
                    cb.state.attachments = saved.attachments;
                    cb.state.tile_aligned_render_area = saved.tile_aligned_render_area;
                    cb.state.render_area = saved.render_area;
                    cb.state.subpass_idx = Some(saved.subpass_idx);
                    if needs_subpass_resume {
                        cb.subpass_resume(saved.subpass_idx)?;
                    }
                }
                None => cb.state.subpass_idx = None,
            }

            cb.rebind_graphics_pipeline(meta.gfx_pipeline);

            if !dirty_dynamic.is_empty() {
                cb.state.dynamic = meta.dynamic;
                cb.state.dirty |= dirty_dynamic;
            }

            if let Some(descriptors) = meta.descriptor_state {
                cb.state.gfx.descriptor_state = descriptors;
            }
            cb.state.push_constants = meta.push_constants;
            Ok(())
        });
    }

    /// Whether a meta operation's state is saved
    pub fn in_meta_operation(&self) -> bool {
        self.state.meta.is_some()
    }
}
