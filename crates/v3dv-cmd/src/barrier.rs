//! # Pipeline Barriers
//!
//! A barrier ends the open job and leaves a pending flag that the next GPU
//! job consumes: it must not overlap earlier GPU work, and if the barrier
//! guards stages that run during binning, binning must wait too.

use crate::buffer::CommandBuffer;

bitflags::bitflags! {
    /// Pipeline stages
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PipelineStageFlags: u32 {
        /// Start of the pipeline
        const TOP_OF_PIPE = 1 << 0;
        /// Indirect command reads
        const DRAW_INDIRECT = 1 << 1;
        /// Vertex and index fetch
        const VERTEX_INPUT = 1 << 2;
        /// Vertex shader
        const VERTEX_SHADER = 1 << 3;
        /// Tessellation control shader
        const TESSELLATION_CONTROL_SHADER = 1 << 4;
        /// Tessellation evaluation shader
        const TESSELLATION_EVALUATION_SHADER = 1 << 5;
        /// Geometry shader
        const GEOMETRY_SHADER = 1 << 6;
        /// Fragment shader
        const FRAGMENT_SHADER = 1 << 7;
        /// Early depth and stencil tests
        const EARLY_FRAGMENT_TESTS = 1 << 8;
        /// Late depth and stencil tests
        const LATE_FRAGMENT_TESTS = 1 << 9;
        /// Color attachment writes
        const COLOR_ATTACHMENT_OUTPUT = 1 << 10;
        /// Compute shader
        const COMPUTE_SHADER = 1 << 11;
        /// Copies, blits and clears
        const TRANSFER = 1 << 12;
        /// End of the pipeline
        const BOTTOM_OF_PIPE = 1 << 13;
        /// Host access
        const HOST = 1 << 14;
        /// Every graphics stage
        const ALL_GRAPHICS = 1 << 15;
        /// Every stage
        const ALL_COMMANDS = 1 << 16;

        /// Stages executed while binning
        const BINNING = Self::DRAW_INDIRECT.bits()
            | Self::VERTEX_INPUT.bits()
            | Self::VERTEX_SHADER.bits()
            | Self::TESSELLATION_CONTROL_SHADER.bits()
            | Self::TESSELLATION_EVALUATION_SHADER.bits()
            | Self::GEOMETRY_SHADER.bits();
    }
}

impl CommandBuffer {
    /// Order the work recorded before the barrier against the work after it
    ///
    /// Host-side dependencies are satisfied by the queue and ignored.
    pub fn pipeline_barrier(&mut self, src: PipelineStageFlags, dst: PipelineStageFlags) {
        self.record(|cb| {
            if src == PipelineStageFlags::HOST || dst == PipelineStageFlags::HOST {
                return Ok(());
            }

            // Inside a render pass the next draw resumes the subpass
            cb.finish_job()?;

            cb.state.has_barrier = true;
            if dst.intersects(PipelineStageFlags::BINNING) {
                cb.state.has_bcl_barrier = true;
            }
            log::trace!(
                "barrier: {:?} -> {:?}, binning {}",
                src,
                dst,
                cb.state.has_bcl_barrier
            );
            Ok(())
        });
    }
}
