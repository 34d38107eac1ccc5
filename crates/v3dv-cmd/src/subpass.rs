//! # Render Pass Recording
//!
//! Subpass start, resume and finish, the subpass merge decision, and the
//! frame setup of control list jobs.
//!
//! A render pass normally yields one job per subpass. Consecutive subpasses
//! that render to the same attachments share a job so that only one render
//! control list (and one end-of-rendering interrupt) is emitted for them.

use alloc::vec::Vec;

use v3dv_core::{Error, GpuAddr, Rect2D, Result, UsageError};

use crate::buffer::CommandBuffer;
use crate::job::{Job, JobKind};
use crate::packet::{Packet, RclInfo};
use crate::pass::{
    ClearValue, Framebuffer, ImageAspectFlags, LoadOp, RenderPassBeginInfo, Subpass,
    ATTACHMENT_UNUSED,
};
use crate::state::DirtyFlags;
use crate::tiling::{tile_size, FrameTiling, InternalBpp};

/// Binning list space reserved for the frame prolog
const BINNING_PROLOG_SPACE: u32 = 256;

// =============================================================================
// FRAME SETUP
// =============================================================================

/// Geometry of a binned frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSetup {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Layers
    pub layers: u32,
    /// The binner writes to every layer, not just the first
    pub allocate_tile_state_for_all_layers: bool,
    /// Color render targets
    pub render_target_count: u32,
    /// Maximum internal bpp over all render targets
    pub max_internal_bpp: InternalBpp,
    /// 4x multisampling
    pub msaa: bool,
}

impl Job {
    /// Compute the tiling, allocate binning memory and emit the binning
    /// prolog
    pub fn start_frame(&mut self, setup: &FrameSetup) -> Result<()> {
        let (device, cl, bos) = self.cl_parts()?;

        let tiling = FrameTiling::compute(
            setup.width,
            setup.height,
            setup.layers,
            setup.render_target_count,
            setup.max_internal_bpp,
            setup.msaa,
        );
        cl.frame_tiling = tiling;

        cl.bcl
            .ensure_space_with_branch(device, bos, BINNING_PROLOG_SPACE)?;

        // Layered rendering is the only way the binner reaches other layers
        let layers = if setup.allocate_tile_state_for_all_layers {
            setup.layers
        } else {
            1
        };

        let tile_alloc = device.bo().alloc(tiling.tile_alloc_size()?, "tile_alloc")?;
        cl.tile_alloc = Some(tile_alloc);
        bos.add_new(tile_alloc)?;

        let tile_state = device.bo().alloc(tiling.tile_state_size()?, "TSDA")?;
        cl.tile_state = Some(tile_state);
        bos.add_new(tile_state)?;

        log::trace!(
            "frame: {}x{}x{} in {}x{} tiles of {}x{}",
            tiling.width,
            tiling.height,
            tiling.layers,
            tiling.draw_tiles_x,
            tiling.draw_tiles_y,
            tiling.tile_width,
            tiling.tile_height
        );

        // The layer count must precede the binning mode configuration
        cl.bcl.emit(device, bos, &Packet::NumberOfLayers(layers))?;
        cl.bcl.emit(
            device,
            bos,
            &Packet::TileBinningModeCfg {
                width: tiling.width,
                height: tiling.height,
                render_target_count: tiling.render_target_count.max(1),
                msaa: tiling.msaa,
                max_internal_bpp: tiling.internal_bpp,
            },
        )?;
        cl.bcl.emit(device, bos, &Packet::FlushVcdCache)?;
        cl.bcl.emit(device, bos, &Packet::StartTileBinning)
    }
}

/// Internal bpp and multisampling of the attachments a subpass renders to
pub fn compute_internal_bpp_msaa(fb: &Framebuffer, subpass: &Subpass) -> (InternalBpp, bool) {
    let mut max_bpp = InternalBpp::Bpp32;
    let mut msaa = false;

    for &idx in &subpass.color_attachments {
        if idx == ATTACHMENT_UNUSED {
            continue;
        }
        let Some(att) = fb.attachments.get(idx as usize) else {
            continue;
        };
        if att.aspects.contains(ImageAspectFlags::COLOR) {
            max_bpp = max_bpp.max(att.internal_bpp);
        }
        if att.samples > 1 {
            msaa = true;
        }
    }

    if !msaa && subpass.ds_attachment != ATTACHMENT_UNUSED {
        if let Some(att) = fb.attachments.get(subpass.ds_attachment as usize) {
            msaa = att.samples > 1;
        }
    }

    (max_bpp, msaa)
}

/// Whether `area` starts on a tile and ends on a tile or the padded edge
pub fn area_is_tile_aligned(area: &Rect2D, fb: &Framebuffer, granularity: (u32, u32)) -> bool {
    let (gw, gh) = (granularity.0 as i64, granularity.1 as i64);
    let x = area.offset.x as i64;
    let y = area.offset.y as i64;
    let w = area.extent.width as i64;
    let h = area.extent.height as i64;

    x % gw == 0
        && y % gh == 0
        && (w % gw == 0 || (fb.has_edge_padding && x + w >= fb.width as i64))
        && (h % gh == 0 || (fb.has_edge_padding && y + h >= fb.height as i64))
}

// =============================================================================
// RECORDING
// =============================================================================

impl CommandBuffer {
    /// Whether subpass `idx` can continue in the open job
    pub(crate) fn can_merge_subpass(&self, idx: u32) -> bool {
        if !self.is_primary() {
            return false;
        }
        let Some(job) = self.state.job.as_deref() else {
            return false;
        };
        if job.always_flush || !self.device().options.merge_jobs {
            return false;
        }

        // Each render pass starts a new job
        if idx == 0 {
            return false;
        }

        let (Some(pass), Some(prev_idx)) = (&self.state.pass, self.state.subpass_idx) else {
            return false;
        };
        let (Some(prev), Some(next)) = (pass.subpass(prev_idx), pass.subpass(idx)) else {
            return false;
        };

        // A different view mask needs a different frame setup
        if prev.view_mask != next.view_mask {
            return false;
        }
        if !prev.colors_subset_of(next) || !next.colors_subset_of(prev) {
            return false;
        }
        if prev.ds_attachment != next.ds_attachment {
            return false;
        }

        // Resolves happen at the end of the job, so every merged subpass
        // would need them
        !prev.has_resolves() && !next.has_resolves()
    }

    fn subpass_create_job(&mut self, idx: u32, kind: JobKind) -> Result<()> {
        let pass = self
            .state
            .pass
            .clone()
            .ok_or(Error::Usage(UsageError::NotInRenderPass))?;
        let subpass = pass
            .subpass(idx)
            .ok_or(Error::Usage(UsageError::InvalidSubpass))?;
        let is_cl = matches!(kind, JobKind::GpuCl(_));

        // Starting may finish the open job, which still needs the old index
        self.start_job(Some(idx), kind)?;
        self.state.subpass_idx = Some(idx);

        let framebuffer = self.state.framebuffer.clone();
        let job = self.job_mut()?;
        if !is_cl || job.first_subpass != idx {
            return Ok(());
        }

        let fb = framebuffer.ok_or(Error::Usage(UsageError::NotInRenderPass))?;
        let (max_internal_bpp, msaa) = compute_internal_bpp_msaa(&fb, subpass);

        // With multiview the framebuffer has one layer and the view mask
        // picks the layers
        let layers = if subpass.view_mask != 0 {
            32 - subpass.view_mask.leading_zeros()
        } else {
            fb.layers
        };

        job.start_frame(&FrameSetup {
            width: fb.width,
            height: fb.height,
            layers,
            allocate_tile_state_for_all_layers: true,
            render_target_count: subpass.color_attachments.len() as u32,
            max_internal_bpp,
            msaa,
        })
    }

    fn update_tile_alignment(&mut self) -> Result<()> {
        let (Some(pass), Some(fb), Some(idx)) = (
            &self.state.pass,
            &self.state.framebuffer,
            self.state.subpass_idx,
        ) else {
            return Err(Error::Usage(UsageError::NotInRenderPass));
        };
        let subpass = pass
            .subpass(idx)
            .ok_or(Error::Usage(UsageError::InvalidSubpass))?;

        let (bpp, msaa) = compute_internal_bpp_msaa(fb, subpass);
        let granularity = tile_size(subpass.color_attachments.len() as u32, msaa, bpp);
        let aligned = area_is_tile_aligned(&self.state.render_area, fb, granularity);
        if !aligned {
            log::warn!(
                "render area {:?} of subpass {} is not aligned to {}x{} tiles",
                self.state.render_area,
                idx,
                granularity.0,
                granularity.1
            );
        }
        self.state.tile_aligned_render_area = aligned;
        Ok(())
    }

    /// Open (or merge into) the job of subpass `idx`
    pub(crate) fn subpass_start(&mut self, idx: u32) -> Result<()> {
        self.subpass_create_job(idx, JobKind::gpu_cl())?;

        // The tile size can change with the subset of attachments in use
        self.update_tile_alignment()
    }

    /// Continue subpass `idx` in a new job
    pub(crate) fn subpass_resume(&mut self, idx: u32) -> Result<()> {
        let kind = if self.is_primary() {
            JobKind::gpu_cl()
        } else {
            JobKind::gpu_cl_secondary()
        };
        self.subpass_create_job(idx, kind)?;
        self.job_mut()?.is_subpass_continue = true;
        Ok(())
    }

    /// Mark the open job as ending its subpass
    ///
    /// Without an open job (a barrier finished it) there is nothing to mark.
    pub(crate) fn subpass_finish(&mut self) {
        if let Some(job) = self.state.job.as_deref_mut() {
            job.is_subpass_finish = true;
        }
    }

    fn set_clear_values(&mut self, values: &[ClearValue]) {
        let Some(pass) = self.state.pass.clone() else {
            return;
        };
        let count = values.len().min(pass.attachments.len());
        for (i, desc) in pass.attachments.iter().enumerate().take(count) {
            if desc.load_op != LoadOp::Clear {
                continue;
            }
            let value = values[i];
            let matches_aspect = match value {
                ClearValue::Color(_) => desc.aspects.contains(ImageAspectFlags::COLOR),
                ClearValue::DepthStencil { .. } => desc
                    .aspects
                    .intersects(ImageAspectFlags::DEPTH | ImageAspectFlags::STENCIL),
                ClearValue::None => false,
            };
            if matches_aspect {
                self.state.attachments[i].clear_value = value;
            }
        }
    }

    /// Begin a render pass instance and its first subpass
    pub fn begin_render_pass(&mut self, info: &RenderPassBeginInfo) {
        self.record(|cb| {
            cb.state.pass = Some(info.pass.clone());
            cb.state.framebuffer = Some(info.framebuffer.clone());

            let count = info.pass.attachments.len();
            let mut attachments = Vec::new();
            attachments.try_reserve(count)?;
            attachments.resize(count, Default::default());
            cb.state.attachments = attachments;
            cb.set_clear_values(&info.clear_values);

            cb.state.render_area = info.render_area;

            // Constrain rendering to a render area smaller than the clip window
            if cb.state.render_area.is_smaller_than(&cb.state.clip_window) {
                cb.state.dirty |= DirtyFlags::SCISSOR;
            }

            cb.subpass_start(0)
        });
    }

    /// Finish the current subpass and start the next one
    pub fn next_subpass(&mut self) {
        self.record(|cb| {
            let idx = cb.current_subpass_idx()?;
            let count = cb.state.pass.as_ref().map_or(0, |p| p.subpasses.len()) as u32;
            if idx + 1 >= count {
                return Err(Error::Usage(UsageError::InvalidSubpass));
            }
            cb.subpass_finish();
            cb.subpass_start(idx + 1)
        });
    }

    /// Finish the last subpass and leave the render pass
    pub fn end_render_pass(&mut self) {
        self.record(|cb| {
            if cb.state.pass.is_none() {
                return Err(Error::Usage(UsageError::NotInRenderPass));
            }
            cb.subpass_finish();
            cb.finish_job()?;

            cb.state.framebuffer = None;
            cb.state.pass = None;
            cb.state.subpass_idx = None;
            Ok(())
        });
    }

    /// Close the frame of a primary render pass job
    ///
    /// Jobs that recorded their own render list keep it.
    pub(crate) fn end_render_pass_frame(&self, job: &mut Job) -> Result<()> {
        let rcl_empty = job.cl().is_some_and(|cl| cl.rcl.is_empty());
        if rcl_empty {
            self.emit_render_pass_rcl(job)?;
        }
        job.emit_bcl(&Packet::Flush)
    }

    /// Close the partial binning list of a secondary
    pub(crate) fn end_render_pass_secondary(&self, job: &mut Job) -> Result<()> {
        job.emit_bcl(&Packet::ReturnFromSubList)
    }

    fn emit_render_pass_rcl(&self, job: &mut Job) -> Result<()> {
        let (Some(pass), Some(fb)) = (&self.state.pass, &self.state.framebuffer) else {
            return Err(Error::Usage(UsageError::NotInRenderPass));
        };
        let first_subpass = job.first_subpass;
        let is_subpass_continue = job.is_subpass_continue;
        let is_subpass_finish = job.is_subpass_finish;
        let (device, cl, bos) = job.cl_parts()?;

        let mut bytes = Vec::new();
        {
            let info = RclInfo {
                tiling: &cl.frame_tiling,
                pass,
                framebuffer: fb,
                first_subpass,
                last_subpass: self.state.subpass_idx.unwrap_or(first_subpass),
                is_subpass_continue,
                is_subpass_finish,
                render_area: self.state.render_area,
                tile_aligned: self.state.tile_aligned_render_area,
                attachments: &self.state.attachments,
                tile_alloc: cl.tile_alloc.map_or(GpuAddr::NULL, |bo| bo.offset),
            };
            device.encoder().encode_rcl(&info, &mut bytes)?;
        }
        cl.rcl.emit_bytes(device, bos, &bytes)
    }
}
