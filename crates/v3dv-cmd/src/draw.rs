//! # Draw Recording
//!
//! Every draw first brings the open job up to date: it resumes the subpass
//! if a barrier ended the job, restarts the frame when the pipeline needs
//! multisampling the frame was not set up for, splits the job when every
//! draw must be flushed, and then re-emits whatever state is dirty. The
//! draw packet follows.

use arrayvec::ArrayVec;

use v3dv_core::{Bo, Error, GpuAddr, Rect2D, Result, UsageError};

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::buffer::{CommandBuffer, CommandBufferLevel};
use crate::job::JobKind;
use crate::packet::{AttributeRecord, DrawCall, Packet, ShaderStateInfo, StencilFace};
use crate::pipeline::{GraphicsPipeline, ShaderStageFlags, ShaderVariant, MAX_VERTEX_BINDINGS};
use crate::state::{DirtyFlags, ScissorState, ViewportState};
use crate::subpass::FrameSetup;
use crate::uniforms::{write_uniforms, UniformContext};

/// Alignment of shader state records in the indirect list
const SHADER_STATE_ALIGNMENT: u32 = 32;

/// State feeding the uniform streams of the graphics stages
const DIRTY_UNIFORMS: DirtyFlags = DirtyFlags::PIPELINE
    .union(DirtyFlags::PUSH_CONSTANTS)
    .union(DirtyFlags::DESCRIPTOR_SETS)
    .union(DirtyFlags::VIEWPORT)
    .union(DirtyFlags::VIEW_INDEX);

const DIRTY_STENCIL: DirtyFlags = DirtyFlags::STENCIL_COMPARE_MASK
    .union(DirtyFlags::STENCIL_WRITE_MASK)
    .union(DirtyFlags::STENCIL_REFERENCE);

/// Clip window of the first viewport, intersected with the first scissor
fn clip_window(viewport: &ViewportState, scissor: &ScissorState) -> Option<Rect2D> {
    if viewport.count == 0 {
        return None;
    }
    let scale = viewport.scale[0];
    let translate = viewport.translate[0];

    let mut minx = translate[0] - scale[0].abs();
    let mut maxx = translate[0] + scale[0].abs();
    let mut miny = translate[1] - scale[1].abs();
    let mut maxy = translate[1] + scale[1].abs();

    if scissor.count > 0 {
        let s = scissor.scissors[0];
        minx = minx.max(s.offset.x as f32);
        miny = miny.max(s.offset.y as f32);
        maxx = maxx.min(s.offset.x as f32 + s.extent.width as f32);
        maxy = maxy.min(s.offset.y as f32 + s.extent.height as f32);
    }

    // An empty intersection still needs a valid window
    if minx > maxx {
        maxx = minx;
    }
    if miny > maxy {
        maxy = miny;
    }

    let minx = minx.max(0.0);
    let miny = miny.max(0.0);
    let maxx = maxx.max(0.0);
    let maxy = maxy.max(0.0);
    Some(Rect2D::new(
        minx as i32,
        miny as i32,
        (maxx - minx) as u32,
        (maxy - miny) as u32,
    ))
}

impl CommandBuffer {
    // =========================================================================
    // Job Preparation
    // =========================================================================

    /// Replace a frame without draws by one set up for 4x multisampling
    fn restart_job_for_msaa_if_needed(&mut self, pipeline: &GraphicsPipeline, idx: u32) -> Result<()> {
        // Secondaries inherit the frame of the primary
        if self.level() == CommandBufferLevel::Secondary || !pipeline.msaa {
            return Ok(());
        }
        let old = self.job_mut()?;
        if old.draw_count > 0 {
            return Ok(());
        }
        let Some(tiling) = old.cl().map(|cl| cl.frame_tiling) else {
            return Ok(());
        };
        if tiling.msaa {
            return Ok(());
        }

        let Some(old) = self.state.job.take() else {
            return Err(Error::Usage(UsageError::NoOpenJob));
        };
        let mut job = self.job_init(JobKind::gpu_cl(), Some(idx))?;
        job.serialize |= old.serialize;
        job.needs_bcl_sync |= old.needs_bcl_sync;
        job.is_subpass_continue = old.is_subpass_continue;
        job.always_flush = old.always_flush;
        job.start_frame(&FrameSetup {
            width: tiling.width,
            height: tiling.height,
            layers: tiling.layers,
            allocate_tile_state_for_all_layers: true,
            render_target_count: tiling.render_target_count,
            max_internal_bpp: tiling.internal_bpp,
            msaa: true,
        })?;

        log::warn!(
            "draw: restarted {}x{} frame of subpass {} for multisampling",
            tiling.width,
            tiling.height,
            idx
        );
        self.state.job = Some(Box::new(job));
        drop(old);
        Ok(())
    }

    /// Put every draw after the first in its own job when flushing always
    fn split_job_if_needed(&mut self, idx: u32) -> Result<()> {
        let job = self.job_mut()?;
        if !job.always_flush || job.draw_count == 0 {
            return Ok(());
        }
        job.is_subpass_finish = false;
        self.subpass_resume(idx)?;
        self.job_mut()?.always_flush = true;
        Ok(())
    }

    // =========================================================================
    // Uniforms and Shader State
    // =========================================================================

    /// Write the uniform stream of `variant` into the open job
    fn write_gfx_uniforms(&mut self, variant: &ShaderVariant) -> Result<GpuAddr> {
        let state = &mut self.state;
        let job = state
            .job
            .as_deref_mut()
            .ok_or(Error::Usage(UsageError::NoOpenJob))?;
        let ctx = UniformContext {
            push_constants: &state.push_constants,
            descriptors: &state.gfx.descriptor_state,
            dynamic: &state.dynamic,
            view_index: state.view_index,
            wg_count: [0; 3],
            shared_memory: None,
        };
        Ok(write_uniforms(job, &ctx, variant)?.address)
    }

    /// Rewrite the uniform streams the `dirty` state feeds
    fn update_gfx_uniform_state(&mut self, pipeline: &GraphicsPipeline, dirty: DirtyFlags) -> Result<()> {
        let new_pipeline = dirty.contains(DirtyFlags::PIPELINE);
        let new_viewport = dirty.contains(DirtyFlags::VIEWPORT);
        let new_view_index = dirty.contains(DirtyFlags::VIEW_INDEX);
        let new_descriptors = dirty.contains(DirtyFlags::DESCRIPTOR_SETS);
        let new_push_constants = dirty.contains(DirtyFlags::PUSH_CONSTANTS);

        let descriptor_stages = self.state.dirty_descriptor_stages;
        let push_stages = self.state.dirty_push_constants_stages;
        let stage_dirty = |stage: ShaderStageFlags| {
            (new_descriptors && descriptor_stages.contains(stage))
                || (new_push_constants && push_stages.contains(stage))
        };

        if new_pipeline || new_view_index || stage_dirty(ShaderStageFlags::FRAGMENT) {
            self.state.uniforms.fs = self.write_gfx_uniforms(&pipeline.fs)?;
        }

        if let Some(gs) = &pipeline.gs {
            if new_pipeline
                || new_viewport
                || new_view_index
                || stage_dirty(ShaderStageFlags::GEOMETRY)
            {
                self.state.uniforms.gs = self.write_gfx_uniforms(&gs.gs)?;
                self.state.uniforms.gs_bin = self.write_gfx_uniforms(&gs.gs_bin)?;
            }
        }

        if new_pipeline || new_viewport || new_view_index || stage_dirty(ShaderStageFlags::VERTEX) {
            self.state.uniforms.vs = self.write_gfx_uniforms(&pipeline.vs)?;
            self.state.uniforms.vs_bin = self.write_gfx_uniforms(&pipeline.vs_bin)?;
        }

        self.state.dirty.remove(DirtyFlags::VIEW_INDEX);
        Ok(())
    }

    /// Write the shader state record and point the binner at it
    fn emit_gl_shader_state(&mut self, pipeline: &GraphicsPipeline) -> Result<()> {
        let uniforms = self.state.uniforms;
        let mut attributes = ArrayVec::<AttributeRecord, MAX_VERTEX_BINDINGS>::new();
        let mut referenced = ArrayVec::<Bo, MAX_VERTEX_BINDINGS>::new();

        for attr in &pipeline.attributes {
            let binding = self
                .state
                .vertex_bindings
                .get(attr.binding as usize)
                .ok_or(Error::Usage(UsageError::TooManyBindings))?;
            let bo = binding.buffer.ok_or(Error::InvalidBuffer)?;
            let stride = pipeline
                .vertex_bindings
                .get(attr.binding as usize)
                .map_or(0, |b| b.stride);
            let record = AttributeRecord {
                address: bo.address(binding.offset + attr.offset),
                stride,
            };
            attributes
                .try_push(record)
                .map_err(|_| Error::Usage(UsageError::TooManyBindings))?;
            referenced
                .try_push(bo)
                .map_err(|_| Error::Usage(UsageError::TooManyBindings))?;
        }

        // The hardware needs at least one attribute
        if attributes.is_empty() {
            attributes.push(AttributeRecord {
                address: uniforms.fs,
                stride: 0,
            });
        }

        let info = ShaderStateInfo {
            pipeline,
            assembly: pipeline.assembly_bo.map_or(GpuAddr::NULL, |bo| bo.offset),
            uniforms: [
                uniforms.vs,
                uniforms.vs_bin,
                uniforms.gs,
                uniforms.gs_bin,
                uniforms.fs,
            ],
            attributes,
        };
        let mut record = Vec::new();
        self.device().encoder().encode_shader_state(&info, &mut record)?;

        let job = self.job_mut()?;
        for bo in referenced {
            job.add_bo(bo)?;
        }
        if let Some(bo) = pipeline.assembly_bo {
            job.add_bo(bo)?;
        }

        let (device, cl, bos) = job.cl_parts()?;
        let site = cl
            .indirect
            .ensure_space(device, bos, record.len() as u32, SHADER_STATE_ALIGNMENT)?;
        cl.indirect.write_at(site, &record)?;
        let address = cl.indirect.site_address(site);

        job.emit_bcl(&Packet::GlShaderState {
            address,
            attribute_count: info.attributes.len() as u32,
        })?;

        let state = &mut self.state;
        state.dirty.remove(
            DirtyFlags::VERTEX_BUFFER | DirtyFlags::DESCRIPTOR_SETS | DirtyFlags::PUSH_CONSTANTS,
        );
        state.dirty_descriptor_stages.remove(ShaderStageFlags::ALL_GRAPHICS);
        state.dirty_push_constants_stages.remove(ShaderStageFlags::ALL_GRAPHICS);
        Ok(())
    }

    // =========================================================================
    // Fixed Function State
    // =========================================================================

    fn emit_scissor(&mut self) -> Result<()> {
        let Some(window) = clip_window(&self.state.dynamic.viewport, &self.state.dynamic.scissor)
        else {
            return Ok(());
        };
        self.state.clip_window = window;
        self.job_mut()?.emit_bcl(&Packet::ClipWindow(window))?;
        self.state.dirty.remove(DirtyFlags::SCISSOR);
        Ok(())
    }

    fn emit_viewport(&mut self) -> Result<()> {
        let viewport = &self.state.dynamic.viewport;
        let packet = Packet::Viewport {
            scale: viewport.scale[0],
            translate: viewport.translate[0],
        };
        self.job_mut()?.emit_bcl(&packet)?;
        self.state.dirty.remove(DirtyFlags::VIEWPORT);
        Ok(())
    }

    fn emit_index_buffer(&mut self) -> Result<()> {
        let ib = self.state.index_buffer;
        if let Some(bo) = ib.buffer {
            let job = self.job_mut()?;
            job.emit_bcl(&Packet::IndexBuffer {
                address: bo.address(ib.offset),
                size: bo.size.saturating_sub(ib.offset),
            })?;
            job.add_bo(bo)?;
        }
        self.state.dirty.remove(DirtyFlags::INDEX_BUFFER);
        Ok(())
    }

    fn emit_stencil(&mut self, pipeline: &GraphicsPipeline) -> Result<()> {
        let d = &self.state.dynamic;
        let front = StencilFace {
            compare_mask: d.stencil_compare_mask.front,
            write_mask: d.stencil_write_mask.front,
            reference: d.stencil_reference.front,
        };
        let back = StencilFace {
            compare_mask: d.stencil_compare_mask.back,
            write_mask: d.stencil_write_mask.back,
            reference: d.stencil_reference.back,
        };
        self.job_mut()?.emit_bcl(&Packet::Stencil {
            pipeline,
            front,
            back,
        })?;
        self.state.dirty.remove(DIRTY_STENCIL);
        Ok(())
    }

    fn emit_depth_bias(&mut self, pipeline: &GraphicsPipeline) -> Result<()> {
        if pipeline.depth_bias_enabled {
            let bias = self.state.dynamic.depth_bias;
            self.job_mut()?.emit_bcl(&Packet::DepthOffset {
                constant_factor: bias.constant_factor,
                slope_factor: bias.slope_factor,
                clamp: bias.depth_bias_clamp,
            })?;
        }
        self.state.dirty.remove(DirtyFlags::DEPTH_BIAS);
        Ok(())
    }

    /// Point the occlusion counter at the active query, or disable it
    pub(crate) fn emit_occlusion_query(&mut self) -> Result<()> {
        let active = self.state.query.active;
        let job = self.job_mut()?;
        job.emit_bcl(&Packet::OcclusionQueryCounter(
            active.map(|q| q.bo.address(q.offset)),
        ))?;
        if let Some(q) = active {
            job.add_bo(q.bo)?;
        }
        self.state.dirty.remove(DirtyFlags::OCCLUSION_QUERY);
        Ok(())
    }

    /// Re-emit the dirty state ahead of a draw
    fn emit_dirty_state(&mut self, pipeline: &GraphicsPipeline) -> Result<()> {
        let dirty = self.state.dirty;

        let dirty_uniforms = dirty & DIRTY_UNIFORMS;
        if !dirty_uniforms.is_empty() {
            self.update_gfx_uniform_state(pipeline, dirty_uniforms)?;
        }
        if !dirty_uniforms.is_empty() || dirty.contains(DirtyFlags::VERTEX_BUFFER) {
            self.emit_gl_shader_state(pipeline)?;
        }

        if dirty.contains(DirtyFlags::PIPELINE) {
            let job = self.job_mut()?;
            job.emit_bcl(&Packet::ConfigBits(pipeline))?;
            job.emit_bcl(&Packet::Varyings(pipeline))?;
        }

        if dirty.intersects(DirtyFlags::VIEWPORT | DirtyFlags::SCISSOR) {
            self.emit_scissor()?;
        }
        if dirty.contains(DirtyFlags::VIEWPORT) {
            self.emit_viewport()?;
        }
        if dirty.contains(DirtyFlags::INDEX_BUFFER) {
            self.emit_index_buffer()?;
        }
        if dirty.intersects(DirtyFlags::PIPELINE | DIRTY_STENCIL) {
            self.emit_stencil(pipeline)?;
        }
        if dirty.intersects(DirtyFlags::PIPELINE | DirtyFlags::DEPTH_BIAS) {
            self.emit_depth_bias(pipeline)?;
        }
        if dirty.intersects(DirtyFlags::PIPELINE | DirtyFlags::BLEND_CONSTANTS) {
            let color = self.state.dynamic.blend_constants;
            self.job_mut()?.emit_bcl(&Packet::BlendConstantColor(color))?;
            self.state.dirty.remove(DirtyFlags::BLEND_CONSTANTS);
        }
        if dirty.contains(DirtyFlags::OCCLUSION_QUERY) {
            self.emit_occlusion_query()?;
        }
        if dirty.contains(DirtyFlags::LINE_WIDTH) {
            let width = self.state.dynamic.line_width;
            self.job_mut()?.emit_bcl(&Packet::LineWidth(width))?;
            self.state.dirty.remove(DirtyFlags::LINE_WIDTH);
        }
        if dirty.contains(DirtyFlags::PIPELINE) {
            self.job_mut()?.emit_bcl(&Packet::SampleState {
                mask: pipeline.sample_mask,
            })?;
        }
        if dirty.intersects(DirtyFlags::PIPELINE | DirtyFlags::COLOR_WRITE_ENABLE) {
            // Disable bits: the pipeline's plus every disabled target
            let masks = (pipeline.color_write_masks | !self.state.dynamic.color_write_enable) & 0xffff;
            self.job_mut()?.emit_bcl(&Packet::ColorWriteMasks(masks))?;
            self.state.dirty.remove(DirtyFlags::COLOR_WRITE_ENABLE);
        }

        self.state.dirty.remove(DirtyFlags::PIPELINE);
        Ok(())
    }

    /// Prepare the open job for a draw with the bound pipeline
    fn pre_draw(&mut self) -> Result<()> {
        let pipeline = self
            .state
            .gfx
            .pipeline
            .clone()
            .ok_or(Error::Usage(UsageError::NoPipelineBound))?;
        let idx = self.current_subpass_idx()?;

        // A barrier inside the subpass ended the job
        if self.state.job.is_none() {
            self.subpass_resume(idx)?;
        }

        self.restart_job_for_msaa_if_needed(&pipeline, idx)?;
        self.split_job_if_needed(idx)?;
        self.job_mut()?.draw_count += 1;

        self.emit_dirty_state(&pipeline)
    }

    /// Emit `call` once, or once per view of a multiview subpass
    fn record_draw<F>(&mut self, make_call: F, indirect: Option<Bo>) -> Result<()>
    where
        F: Fn(&GraphicsPipeline) -> DrawCall,
    {
        let pass = self
            .state
            .pass
            .clone()
            .ok_or(Error::Usage(UsageError::NotInRenderPass))?;
        let idx = self.current_subpass_idx()?;

        let view_mask = if pass.multiview_enabled {
            pass.subpass(idx)
                .ok_or(Error::Usage(UsageError::InvalidSubpass))?
                .view_mask
        } else {
            0
        };

        let emit_one = |cb: &mut Self| -> Result<()> {
            cb.pre_draw()?;
            let pipeline = cb
                .state
                .gfx
                .pipeline
                .clone()
                .ok_or(Error::Usage(UsageError::NoPipelineBound))?;
            let job = cb.job_mut()?;
            if let Some(bo) = indirect {
                job.add_bo(bo)?;
            }
            job.emit_bcl(&Packet::Draw(make_call(&pipeline)))
        };

        if view_mask == 0 {
            return emit_one(self);
        }
        let mut views = view_mask;
        while views != 0 {
            let view = views.trailing_zeros();
            views &= views - 1;
            self.state.view_index = view;
            self.state.dirty |= DirtyFlags::VIEW_INDEX;
            emit_one(self)?;
        }
        Ok(())
    }

    // =========================================================================
    // Draw Commands
    // =========================================================================

    /// Draw `vertex_count` vertices of `instance_count` instances
    pub fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        self.record(|cb| {
            if vertex_count == 0 || instance_count == 0 {
                return Ok(());
            }
            cb.record_draw(
                |p| DrawCall::Arrays {
                    topology: p.topology,
                    vertex_count,
                    instance_count,
                    first_vertex,
                    first_instance,
                },
                None,
            )
        });
    }

    /// Draw `index_count` indices from the bound index buffer
    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        self.record(|cb| {
            if index_count == 0 || instance_count == 0 {
                return Ok(());
            }
            let index_size = cb.state.index_buffer.index_size;
            cb.record_draw(
                |p| DrawCall::Indexed {
                    topology: p.topology,
                    index_size,
                    index_count,
                    instance_count,
                    first_index,
                    vertex_offset,
                    first_instance,
                },
                None,
            )
        });
    }

    fn draw_indirect_common(&mut self, buffer: Bo, offset: u32, draw_count: u32, stride: u32, index_size: u32) {
        self.record(|cb| {
            if draw_count == 0 {
                return Ok(());
            }
            let address = buffer.address(offset);
            cb.record_draw(
                |p| DrawCall::Indirect {
                    topology: p.topology,
                    index_size,
                    address,
                    draw_count,
                    stride,
                },
                Some(buffer),
            )
        });
    }

    /// Draw with parameters read from `buffer`
    pub fn draw_indirect(&mut self, buffer: Bo, offset: u32, draw_count: u32, stride: u32) {
        self.draw_indirect_common(buffer, offset, draw_count, stride, 0);
    }

    /// Indexed draw with parameters read from `buffer`
    pub fn draw_indexed_indirect(&mut self, buffer: Bo, offset: u32, draw_count: u32, stride: u32) {
        let index_size = self.state.index_buffer.index_size;
        self.draw_indirect_common(buffer, offset, draw_count, stride, index_size);
    }
}
