//! # Bindings and Dynamic State
//!
//! Pipeline, vertex, index and descriptor binding plus the dynamic state
//! setters. Nothing is emitted here: each command updates the recorded
//! state and raises a dirty bit when the value actually changed, and the
//! next draw or dispatch re-emits what is dirty.

use alloc::sync::Arc;

use v3dv_core::{Bo, Error, Rect2D, Result, UsageError, Viewport};

use crate::buffer::CommandBuffer;
use crate::pipeline::{
    DescriptorSet, GraphicsPipeline, PipelineBindPoint, PipelineLayout, ShaderStageFlags,
    MAX_DYNAMIC_BUFFERS, MAX_SETS, MAX_VERTEX_BINDINGS,
};
use crate::state::{
    viewport_xform, DirtyFlags, DynamicState, DynamicStateMask, StencilFaceFlags,
    MAX_PUSH_CONSTANTS_SIZE, MAX_VIEWPORTS,
};

/// Color render targets addressable by the color write enables
pub const MAX_DRAW_BUFFERS: usize = 4;

impl CommandBuffer {
    /// Copy the state `pipeline` bakes in, dirtying what changed
    fn bind_pipeline_static_state(&mut self, src: &DynamicState) {
        let dynamic = &mut self.state.dynamic;
        let mask = src.mask;
        let mut dirty = DirtyFlags::empty();

        if !mask.contains(DynamicStateMask::VIEWPORT) {
            let dst = &mut dynamic.viewport;
            let n = src.viewport.count as usize;
            if dst.count != src.viewport.count
                || dst.viewports[..n] != src.viewport.viewports[..n]
            {
                dst.count = src.viewport.count;
                dst.viewports[..n].copy_from_slice(&src.viewport.viewports[..n]);
                dst.scale[..n].copy_from_slice(&src.viewport.scale[..n]);
                dst.translate[..n].copy_from_slice(&src.viewport.translate[..n]);
                dirty |= DirtyFlags::VIEWPORT;
            }
        }

        if !mask.contains(DynamicStateMask::SCISSOR) {
            let dst = &mut dynamic.scissor;
            let n = src.scissor.count as usize;
            if dst.count != src.scissor.count || dst.scissors[..n] != src.scissor.scissors[..n] {
                dst.count = src.scissor.count;
                dst.scissors[..n].copy_from_slice(&src.scissor.scissors[..n]);
                dirty |= DirtyFlags::SCISSOR;
            }
        }

        macro_rules! copy_static {
            ($mask:ident, $field:ident, $dirty:ident) => {
                if !mask.contains(DynamicStateMask::$mask) && dynamic.$field != src.$field {
                    dynamic.$field = src.$field;
                    dirty |= DirtyFlags::$dirty;
                }
            };
        }
        copy_static!(STENCIL_COMPARE_MASK, stencil_compare_mask, STENCIL_COMPARE_MASK);
        copy_static!(STENCIL_WRITE_MASK, stencil_write_mask, STENCIL_WRITE_MASK);
        copy_static!(STENCIL_REFERENCE, stencil_reference, STENCIL_REFERENCE);
        copy_static!(BLEND_CONSTANTS, blend_constants, BLEND_CONSTANTS);
        copy_static!(DEPTH_BIAS, depth_bias, DEPTH_BIAS);
        copy_static!(LINE_WIDTH, line_width, LINE_WIDTH);
        copy_static!(COLOR_WRITE_ENABLE, color_write_enable, COLOR_WRITE_ENABLE);

        dynamic.mask = mask;
        self.state.dirty |= dirty;
    }

    /// Bind the graphics pipeline used by later draws
    pub fn bind_graphics_pipeline(&mut self, pipeline: &Arc<GraphicsPipeline>) {
        self.record(|cb| {
            if cb
                .state
                .gfx
                .pipeline
                .as_ref()
                .is_some_and(|bound| Arc::ptr_eq(bound, pipeline))
            {
                return Ok(());
            }
            cb.state.gfx.pipeline = Some(Arc::clone(pipeline));
            cb.bind_pipeline_static_state(&pipeline.dynamic_state);
            cb.state.dirty |= DirtyFlags::PIPELINE;
            Ok(())
        });
    }

    /// Rebind `pipeline` after a meta operation replaced the bound one
    pub(crate) fn rebind_graphics_pipeline(&mut self, pipeline: Option<Arc<GraphicsPipeline>>) {
        if let Some(p) = &pipeline {
            self.bind_pipeline_static_state(&p.dynamic_state);
            self.state.dirty |= DirtyFlags::PIPELINE;
        }
        self.state.gfx.pipeline = pipeline;
    }

    // =========================================================================
    // Viewports and Scissors
    // =========================================================================

    /// Set viewports `first..first + viewports.len()`
    pub fn set_viewport(&mut self, first: u32, viewports: &[Viewport]) {
        self.record(|cb| {
            let start = first as usize;
            let total = start + viewports.len();
            if total > MAX_VIEWPORTS {
                return Err(Error::Usage(UsageError::TooManyViewports));
            }
            let state = &mut cb.state.dynamic.viewport;
            state.count = state.count.max(total as u32);

            if state.viewports[start..total] == *viewports {
                return Ok(());
            }
            state.viewports[start..total].copy_from_slice(viewports);
            for i in start..total {
                let (scale, translate) = viewport_xform(&state.viewports[i]);
                state.scale[i] = scale;
                state.translate[i] = translate;
            }
            cb.state.dirty |= DirtyFlags::VIEWPORT;
            Ok(())
        });
    }

    /// Set scissors `first..first + scissors.len()`
    pub fn set_scissor(&mut self, first: u32, scissors: &[Rect2D]) {
        self.record(|cb| {
            let start = first as usize;
            let total = start + scissors.len();
            if total > MAX_VIEWPORTS {
                return Err(Error::Usage(UsageError::TooManyViewports));
            }
            let state = &mut cb.state.dynamic.scissor;
            state.count = state.count.max(total as u32);

            if state.scissors[start..total] == *scissors {
                return Ok(());
            }
            state.scissors[start..total].copy_from_slice(scissors);
            cb.state.dirty |= DirtyFlags::SCISSOR;
            Ok(())
        });
    }

    // =========================================================================
    // Fixed Function State
    // =========================================================================

    /// Set the stencil compare mask of `faces`
    pub fn set_stencil_compare_mask(&mut self, faces: StencilFaceFlags, mask: u32) {
        self.record(|cb| {
            cb.state.dynamic.stencil_compare_mask.set(faces, mask);
            cb.state.dirty |= DirtyFlags::STENCIL_COMPARE_MASK;
            Ok(())
        });
    }

    /// Set the stencil write mask of `faces`
    pub fn set_stencil_write_mask(&mut self, faces: StencilFaceFlags, mask: u32) {
        self.record(|cb| {
            cb.state.dynamic.stencil_write_mask.set(faces, mask);
            cb.state.dirty |= DirtyFlags::STENCIL_WRITE_MASK;
            Ok(())
        });
    }

    /// Set the stencil reference of `faces`
    pub fn set_stencil_reference(&mut self, faces: StencilFaceFlags, reference: u32) {
        self.record(|cb| {
            cb.state.dynamic.stencil_reference.set(faces, reference);
            cb.state.dirty |= DirtyFlags::STENCIL_REFERENCE;
            Ok(())
        });
    }

    /// Set the depth bias factors
    pub fn set_depth_bias(&mut self, constant_factor: f32, clamp: f32, slope_factor: f32) {
        self.record(|cb| {
            let bias = &mut cb.state.dynamic.depth_bias;
            bias.constant_factor = constant_factor;
            bias.depth_bias_clamp = clamp;
            bias.slope_factor = slope_factor;
            cb.state.dirty |= DirtyFlags::DEPTH_BIAS;
            Ok(())
        });
    }

    /// Depth bounds testing is not supported; the call is accepted and ignored
    pub fn set_depth_bounds(&mut self, min: f32, max: f32) {
        log::trace!("depth bounds {}..{} ignored", min, max);
    }

    /// Set the rasterized line width
    pub fn set_line_width(&mut self, width: f32) {
        self.record(|cb| {
            cb.state.dynamic.line_width = width;
            cb.state.dirty |= DirtyFlags::LINE_WIDTH;
            Ok(())
        });
    }

    /// Set the blend constant color
    pub fn set_blend_constants(&mut self, constants: [f32; 4]) {
        self.record(|cb| {
            if cb.state.dynamic.blend_constants == constants {
                return Ok(());
            }
            cb.state.dynamic.blend_constants = constants;
            cb.state.dirty |= DirtyFlags::BLEND_CONSTANTS;
            Ok(())
        });
    }

    /// Enable or disable color writes per render target
    pub fn set_color_write_enable(&mut self, enables: &[bool]) {
        self.record(|cb| {
            if enables.len() > MAX_DRAW_BUFFERS {
                return Err(Error::Usage(UsageError::TooManyBindings));
            }
            let mask = enables
                .iter()
                .enumerate()
                .fold(0u32, |acc, (i, &on)| if on { acc | (0xf << (i * 4)) } else { acc });
            if cb.state.dynamic.color_write_enable == mask {
                return Ok(());
            }
            cb.state.dynamic.color_write_enable = mask;
            cb.state.dirty |= DirtyFlags::COLOR_WRITE_ENABLE;
            Ok(())
        });
    }

    // =========================================================================
    // Buffers and Descriptors
    // =========================================================================

    /// Bind vertex buffers to `first..first + buffers.len()`
    ///
    /// Each entry is a buffer object and the offset of the binding in it.
    pub fn bind_vertex_buffers(&mut self, first: u32, buffers: &[(Bo, u32)]) {
        self.record(|cb| {
            let start = first as usize;
            if start + buffers.len() > MAX_VERTEX_BINDINGS {
                return Err(Error::Usage(UsageError::TooManyBindings));
            }
            let mut changed = false;
            for (slot, &(bo, offset)) in cb.state.vertex_bindings[start..].iter_mut().zip(buffers) {
                if slot.buffer != Some(bo) || slot.offset != offset {
                    slot.buffer = Some(bo);
                    slot.offset = offset;
                    changed = true;
                }
            }
            if changed {
                cb.state.dirty |= DirtyFlags::VERTEX_BUFFER;
            }
            Ok(())
        });
    }

    /// Bind the index buffer of indexed draws
    pub fn bind_index_buffer(&mut self, bo: Bo, offset: u32, index_size: u32) {
        self.record(|cb| {
            let ib = &mut cb.state.index_buffer;
            if ib.buffer == Some(bo) && ib.offset == offset && ib.index_size == index_size {
                return Ok(());
            }
            ib.buffer = Some(bo);
            ib.offset = offset;
            ib.index_size = index_size;
            cb.state.dirty |= DirtyFlags::INDEX_BUFFER;
            Ok(())
        });
    }

    /// Bind descriptor sets starting at set `first`
    ///
    /// `dynamic_offsets` supplies one offset per dynamic buffer of the sets,
    /// in set order.
    pub fn bind_descriptor_sets(
        &mut self,
        bind_point: PipelineBindPoint,
        layout: &PipelineLayout,
        first: u32,
        sets: &[Arc<DescriptorSet>],
        dynamic_offsets: &[u32],
    ) {
        self.record(|cb| {
            if first as usize + sets.len() > MAX_SETS {
                return Err(Error::Usage(UsageError::TooManyBindings));
            }
            let descriptors = match bind_point {
                PipelineBindPoint::Graphics => &mut cb.state.gfx.descriptor_state,
                PipelineBindPoint::Compute => &mut cb.state.compute.descriptor_state,
            };

            let mut dirty_stages = ShaderStageFlags::empty();
            let mut changed = false;
            let mut dyn_index = 0usize;
            for (i, set) in sets.iter().enumerate() {
                let index = first as usize + i;
                descriptors.valid |= 1 << index;
                if !descriptors.sets[index]
                    .as_ref()
                    .is_some_and(|bound| Arc::ptr_eq(bound, set))
                {
                    descriptors.sets[index] = Some(Arc::clone(set));
                    dirty_stages |= set.layout.stages;
                    changed = true;
                }

                let start = layout.dynamic_offset_start.get(index).copied().unwrap_or(0);
                descriptors.dynamic_offset_start[index] = start;
                for j in 0..set.layout.dynamic_offset_count {
                    let slot = (start + j) as usize;
                    if slot >= MAX_DYNAMIC_BUFFERS {
                        return Err(Error::Usage(UsageError::TooManyBindings));
                    }
                    let value = *dynamic_offsets
                        .get(dyn_index)
                        .ok_or(Error::Usage(UsageError::TooManyBindings))?;
                    dyn_index += 1;
                    if descriptors.dynamic_offsets[slot] != value {
                        descriptors.dynamic_offsets[slot] = value;
                        dirty_stages |= set.layout.stages;
                        changed = true;
                    }
                }
            }

            if changed {
                match bind_point {
                    PipelineBindPoint::Graphics => {
                        cb.state.dirty |= DirtyFlags::DESCRIPTOR_SETS;
                        cb.state.dirty_descriptor_stages |=
                            dirty_stages & ShaderStageFlags::ALL_GRAPHICS;
                    }
                    PipelineBindPoint::Compute => {
                        cb.state.dirty |= DirtyFlags::COMPUTE_DESCRIPTOR_SETS;
                        cb.state.dirty_descriptor_stages |= ShaderStageFlags::COMPUTE;
                    }
                }
            }
            Ok(())
        });
    }

    /// Update push constant bytes `offset..offset + data.len()`
    pub fn push_constants(&mut self, stages: ShaderStageFlags, offset: u32, data: &[u8]) {
        self.record(|cb| {
            let start = offset as usize;
            let end = start + data.len();
            if end > MAX_PUSH_CONSTANTS_SIZE {
                return Err(Error::Usage(UsageError::PushConstantRange));
            }
            if cb.state.push_constants[start..end] == *data {
                return Ok(());
            }
            cb.state.push_constants[start..end].copy_from_slice(data);
            cb.state.dirty |= DirtyFlags::PUSH_CONSTANTS;
            cb.state.dirty_push_constants_stages |= stages;
            Ok(())
        });
    }
}
