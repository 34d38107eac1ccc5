//! # Command Buffer State
//!
//! Everything a command buffer tracks between recording calls: the open
//! job, render pass scope, dynamic state with its dirty bits, bindings,
//! pending barriers, query bookkeeping and the meta-operation snapshot.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use v3dv_core::{Bo, Error, GpuAddr, Rect2D, Viewport};

use crate::job::{EndQueryInfo, Job};
use crate::pass::{AttachmentState, Framebuffer, RenderPass};
use crate::pipeline::{
    ComputePipeline, DescriptorSet, GraphicsPipeline, ShaderStageFlags, MAX_DYNAMIC_BUFFERS,
    MAX_SETS, MAX_VERTEX_BINDINGS,
};

/// Maximum number of viewports and scissors
pub const MAX_VIEWPORTS: usize = 16;

/// Size of the push constant block in bytes
pub const MAX_PUSH_CONSTANTS_SIZE: usize = 128;

/// Smallest viewport depth scale the clipper handles correctly
const MIN_ABS_Z_SCALE: f32 = 0.000009;

bitflags::bitflags! {
    /// State that must be re-emitted before the next draw or dispatch
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DirtyFlags: u32 {
        /// Viewports
        const VIEWPORT = 1 << 0;
        /// Scissors
        const SCISSOR = 1 << 1;
        /// Stencil compare masks
        const STENCIL_COMPARE_MASK = 1 << 2;
        /// Stencil write masks
        const STENCIL_WRITE_MASK = 1 << 3;
        /// Stencil references
        const STENCIL_REFERENCE = 1 << 4;
        /// Graphics pipeline
        const PIPELINE = 1 << 5;
        /// Compute pipeline
        const COMPUTE_PIPELINE = 1 << 6;
        /// Vertex buffers
        const VERTEX_BUFFER = 1 << 7;
        /// Index buffer
        const INDEX_BUFFER = 1 << 8;
        /// Graphics descriptor sets
        const DESCRIPTOR_SETS = 1 << 9;
        /// Compute descriptor sets
        const COMPUTE_DESCRIPTOR_SETS = 1 << 10;
        /// Push constants
        const PUSH_CONSTANTS = 1 << 11;
        /// Blend constants
        const BLEND_CONSTANTS = 1 << 12;
        /// Occlusion query counter
        const OCCLUSION_QUERY = 1 << 13;
        /// Depth bias
        const DEPTH_BIAS = 1 << 14;
        /// Line width
        const LINE_WIDTH = 1 << 15;
        /// Multiview view index
        const VIEW_INDEX = 1 << 16;
        /// Color write enables
        const COLOR_WRITE_ENABLE = 1 << 17;
    }
}

bitflags::bitflags! {
    /// Pieces of pipeline state set by commands instead of the pipeline
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DynamicStateMask: u32 {
        /// Viewports
        const VIEWPORT = 1 << 0;
        /// Scissors
        const SCISSOR = 1 << 1;
        /// Stencil compare masks
        const STENCIL_COMPARE_MASK = 1 << 2;
        /// Stencil write masks
        const STENCIL_WRITE_MASK = 1 << 3;
        /// Stencil references
        const STENCIL_REFERENCE = 1 << 4;
        /// Blend constants
        const BLEND_CONSTANTS = 1 << 5;
        /// Depth bias
        const DEPTH_BIAS = 1 << 6;
        /// Line width
        const LINE_WIDTH = 1 << 7;
        /// Color write enables
        const COLOR_WRITE_ENABLE = 1 << 8;
    }
}

bitflags::bitflags! {
    /// Stencil faces
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct StencilFaceFlags: u32 {
        /// Front face
        const FRONT = 1 << 0;
        /// Back face
        const BACK = 1 << 1;
        /// Both faces
        const FRONT_AND_BACK = 0x3;
    }
}

// =============================================================================
// DYNAMIC STATE
// =============================================================================

/// Viewports and their precomputed transforms
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportState {
    /// Viewports in use
    pub count: u32,
    /// Viewports
    pub viewports: [Viewport; MAX_VIEWPORTS],
    /// Scale per viewport
    pub scale: [[f32; 3]; MAX_VIEWPORTS],
    /// Translation per viewport
    pub translate: [[f32; 3]; MAX_VIEWPORTS],
}

impl Default for ViewportState {
    fn default() -> Self {
        Self {
            count: 0,
            viewports: [Viewport::default(); MAX_VIEWPORTS],
            scale: [[0.0; 3]; MAX_VIEWPORTS],
            translate: [[0.0; 3]; MAX_VIEWPORTS],
        }
    }
}

/// Compute the clipper scale and translation of a viewport
pub fn viewport_xform(viewport: &Viewport) -> ([f32; 3], [f32; 3]) {
    let half_width = 0.5 * viewport.width;
    let half_height = 0.5 * viewport.height;
    let n = viewport.min_depth;
    let f = viewport.max_depth;

    let mut scale = [half_width, half_height, f - n];
    let translate = [half_width + viewport.x, half_height + viewport.y, n];

    if scale[2].abs() < MIN_ABS_Z_SCALE {
        scale[2] = if scale[2] < 0.0 {
            -MIN_ABS_Z_SCALE
        } else {
            MIN_ABS_Z_SCALE
        };
    }
    (scale, translate)
}

/// Scissor rectangles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScissorState {
    /// Scissors in use
    pub count: u32,
    /// Scissors
    pub scissors: [Rect2D; MAX_VIEWPORTS],
}

impl Default for ScissorState {
    fn default() -> Self {
        Self {
            count: 0,
            scissors: [Rect2D::default(); MAX_VIEWPORTS],
        }
    }
}

/// A value per stencil face
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StencilPair {
    /// Front face
    pub front: u32,
    /// Back face
    pub back: u32,
}

impl StencilPair {
    const fn splat(value: u32) -> Self {
        Self {
            front: value,
            back: value,
        }
    }

    pub(crate) fn set(&mut self, faces: StencilFaceFlags, value: u32) {
        if faces.contains(StencilFaceFlags::FRONT) {
            self.front = value & 0xff;
        }
        if faces.contains(StencilFaceFlags::BACK) {
            self.back = value & 0xff;
        }
    }
}

/// Depth bias factors
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DepthBias {
    /// Constant factor
    pub constant_factor: f32,
    /// Clamp
    pub depth_bias_clamp: f32,
    /// Slope factor
    pub slope_factor: f32,
}

/// Pipeline state that can be set dynamically
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DynamicState {
    /// Which pieces the pipeline leaves to commands
    pub mask: DynamicStateMask,
    /// Viewports
    pub viewport: ViewportState,
    /// Scissors
    pub scissor: ScissorState,
    /// Stencil compare masks
    pub stencil_compare_mask: StencilPair,
    /// Stencil write masks
    pub stencil_write_mask: StencilPair,
    /// Stencil references
    pub stencil_reference: StencilPair,
    /// Blend constants
    pub blend_constants: [f32; 4],
    /// Depth bias
    pub depth_bias: DepthBias,
    /// Line width
    pub line_width: f32,
    /// Four enable bits per render target
    pub color_write_enable: u32,
}

impl Default for DynamicState {
    fn default() -> Self {
        Self {
            mask: DynamicStateMask::empty(),
            viewport: ViewportState::default(),
            scissor: ScissorState::default(),
            stencil_compare_mask: StencilPair::splat(!0),
            stencil_write_mask: StencilPair::splat(!0),
            stencil_reference: StencilPair::splat(0),
            blend_constants: [0.0; 4],
            depth_bias: DepthBias::default(),
            line_width: 1.0,
            color_write_enable: (1 << 16) - 1,
        }
    }
}

// =============================================================================
// BINDINGS
// =============================================================================

const NO_SET: Option<Arc<DescriptorSet>> = None;

/// Descriptor sets bound at one bind point
#[derive(Debug, Clone)]
pub struct DescriptorState {
    /// Bit per bound set
    pub valid: u32,
    /// Bound sets
    pub sets: [Option<Arc<DescriptorSet>>; MAX_SETS],
    /// First dynamic offset index of each bound set
    pub dynamic_offset_start: [u32; MAX_SETS],
    /// Dynamic offsets
    pub dynamic_offsets: [u32; MAX_DYNAMIC_BUFFERS],
}

impl Default for DescriptorState {
    fn default() -> Self {
        Self {
            valid: 0,
            sets: [NO_SET; MAX_SETS],
            dynamic_offset_start: [0; MAX_SETS],
            dynamic_offsets: [0; MAX_DYNAMIC_BUFFERS],
        }
    }
}

/// A bound vertex buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VertexBinding {
    /// Buffer object, `None` when unbound
    pub buffer: Option<Bo>,
    /// Offset in the buffer object
    pub offset: u32,
}

/// The bound index buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexBufferState {
    /// Buffer object
    pub buffer: Option<Bo>,
    /// Offset in the buffer object
    pub offset: u32,
    /// Index size in bytes
    pub index_size: u32,
}

/// Graphics bind point
#[derive(Debug, Clone, Default)]
pub struct GfxState {
    /// Bound pipeline
    pub pipeline: Option<Arc<GraphicsPipeline>>,
    /// Bound descriptor sets
    pub descriptor_state: DescriptorState,
}

/// Compute bind point
#[derive(Debug, Clone, Default)]
pub struct ComputeState {
    /// Bound pipeline
    pub pipeline: Option<Arc<ComputePipeline>>,
    /// Bound descriptor sets
    pub descriptor_state: DescriptorState,
}

/// Uniform stream addresses of the graphics stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GfxUniforms {
    /// Vertex shader
    pub vs: GpuAddr,
    /// Vertex shader, binning variant
    pub vs_bin: GpuAddr,
    /// Geometry shader
    pub gs: GpuAddr,
    /// Geometry shader, binning variant
    pub gs_bin: GpuAddr,
    /// Fragment shader
    pub fs: GpuAddr,
}

// =============================================================================
// QUERIES AND META STATE
// =============================================================================

/// The occlusion counter slot of the active query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveQuery {
    /// Counter buffer object
    pub bo: Bo,
    /// Offset of the counter
    pub offset: u32,
}

/// Query bookkeeping
#[derive(Debug, Clone, Default)]
pub struct QueryState {
    /// Query being counted, at most one
    pub active: Option<ActiveQuery>,
    /// End-query records waiting for the render pass job to finish
    pub end: Vec<EndQueryInfo>,
}

/// Render pass scope saved around a meta operation
#[derive(Debug, Clone)]
pub struct SavedSubpass {
    /// Subpass index
    pub subpass_idx: u32,
    /// Render pass
    pub pass: Option<Arc<RenderPass>>,
    /// Framebuffer
    pub framebuffer: Option<Arc<Framebuffer>>,
    /// Attachment clear state
    pub attachments: Vec<AttachmentState>,
    /// Render area covers whole tiles
    pub tile_aligned_render_area: bool,
    /// Render area
    pub render_area: Rect2D,
}

/// State snapshot taken before a meta operation
#[derive(Debug, Clone)]
pub struct MetaState {
    /// Render pass scope, if inside a subpass
    pub subpass: Option<SavedSubpass>,
    /// Graphics pipeline
    pub gfx_pipeline: Option<Arc<GraphicsPipeline>>,
    /// Dynamic state
    pub dynamic: DynamicState,
    /// Graphics descriptor state, when requested
    pub descriptor_state: Option<DescriptorState>,
    /// Push constant data
    pub push_constants: [u8; MAX_PUSH_CONSTANTS_SIZE],
}

/// Inherited from the primary when a secondary continues a render pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Inheritance {
    /// The primary may have an occlusion query active
    pub occlusion_query_enable: bool,
}

// =============================================================================
// COMMAND BUFFER STATE
// =============================================================================

/// Mutable recording state of one command buffer
#[derive(Debug)]
pub struct CommandBufferState {
    /// Job accepting commands
    pub(crate) job: Option<Box<Job>>,

    /// Active render pass
    pub(crate) pass: Option<Arc<RenderPass>>,
    /// Active framebuffer
    pub(crate) framebuffer: Option<Arc<Framebuffer>>,
    /// Active subpass
    pub(crate) subpass_idx: Option<u32>,
    /// Render area
    pub(crate) render_area: Rect2D,
    /// Last emitted clip window
    pub(crate) clip_window: Rect2D,
    /// Render area covers whole tiles
    pub(crate) tile_aligned_render_area: bool,
    /// Per attachment clear state
    pub(crate) attachments: Vec<AttachmentState>,

    /// Dynamic state
    pub(crate) dynamic: DynamicState,
    /// State to re-emit
    pub(crate) dirty: DirtyFlags,
    /// Stages whose descriptors changed
    pub(crate) dirty_descriptor_stages: ShaderStageFlags,
    /// Stages whose push constants changed
    pub(crate) dirty_push_constants_stages: ShaderStageFlags,

    /// Graphics bindings
    pub(crate) gfx: GfxState,
    /// Compute bindings
    pub(crate) compute: ComputeState,
    /// Vertex buffers
    pub(crate) vertex_bindings: [VertexBinding; MAX_VERTEX_BINDINGS],
    /// Index buffer
    pub(crate) index_buffer: IndexBufferState,
    /// Push constant data
    pub(crate) push_constants: [u8; MAX_PUSH_CONSTANTS_SIZE],
    /// Uniform streams of the last shader state
    pub(crate) uniforms: GfxUniforms,
    /// Multiview view index of the next draw
    pub(crate) view_index: u32,

    /// A barrier is waiting for the next GPU job
    pub(crate) has_barrier: bool,
    /// The pending barrier also blocks binning
    pub(crate) has_bcl_barrier: bool,

    /// Query bookkeeping
    pub(crate) query: QueryState,
    /// Inherited render pass state
    pub(crate) inheritance: Inheritance,
    /// Meta-operation snapshot
    pub(crate) meta: Option<Box<MetaState>>,

    /// Sticky recording error
    pub(crate) error: Option<Error>,
}

impl Default for CommandBufferState {
    fn default() -> Self {
        Self {
            job: None,
            pass: None,
            framebuffer: None,
            subpass_idx: None,
            render_area: Rect2D::default(),
            clip_window: Rect2D::default(),
            tile_aligned_render_area: false,
            attachments: Vec::new(),
            dynamic: DynamicState::default(),
            dirty: DirtyFlags::empty(),
            dirty_descriptor_stages: ShaderStageFlags::empty(),
            dirty_push_constants_stages: ShaderStageFlags::empty(),
            gfx: GfxState::default(),
            compute: ComputeState::default(),
            vertex_bindings: [VertexBinding::default(); MAX_VERTEX_BINDINGS],
            index_buffer: IndexBufferState::default(),
            push_constants: [0; MAX_PUSH_CONSTANTS_SIZE],
            uniforms: GfxUniforms::default(),
            view_index: 0,
            has_barrier: false,
            has_bcl_barrier: false,
            query: QueryState::default(),
            inheritance: Inheritance::default(),
            meta: None,
            error: None,
        }
    }
}

impl CommandBufferState {
    /// The open job
    pub fn job(&self) -> Option<&Job> {
        self.job.as_deref()
    }

    /// Active subpass
    pub fn subpass_idx(&self) -> Option<u32> {
        self.subpass_idx
    }

    /// Dynamic state
    pub fn dynamic(&self) -> &DynamicState {
        &self.dynamic
    }

    /// Dirty bits
    pub fn dirty(&self) -> DirtyFlags {
        self.dirty
    }

    /// Pending barrier flags: (any, binning)
    pub fn pending_barrier(&self) -> (bool, bool) {
        (self.has_barrier, self.has_bcl_barrier)
    }

    /// Deferred end-query records
    pub fn pending_end_queries(&self) -> &[EndQueryInfo] {
        &self.query.end
    }

    /// Last emitted clip window
    pub fn clip_window(&self) -> Rect2D {
        self.clip_window
    }

    /// Render area
    pub fn render_area(&self) -> Rect2D {
        self.render_area
    }

    /// Render area covers whole tiles
    pub fn tile_aligned_render_area(&self) -> bool {
        self.tile_aligned_render_area
    }

    /// Sticky recording error
    pub fn error(&self) -> Option<Error> {
        self.error
    }

    /// Whether recording failed to allocate memory
    pub fn is_out_of_memory(&self) -> bool {
        self.error.is_some_and(|e| e.is_out_of_memory())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_viewport_xform() {
        let vp = Viewport {
            x: 10.0,
            y: 20.0,
            width: 100.0,
            height: 50.0,
            min_depth: 0.25,
            max_depth: 0.75,
        };
        let (scale, translate) = viewport_xform(&vp);
        assert_eq!(scale, [50.0, 25.0, 0.5]);
        assert_eq!(translate, [60.0, 45.0, 0.25]);
    }

    #[test]
    fn test_viewport_xform_clamps_depth_scale() {
        let flat = Viewport {
            width: 8.0,
            height: 8.0,
            min_depth: 0.5,
            max_depth: 0.5,
            ..Viewport::default()
        };
        assert_eq!(viewport_xform(&flat).0[2], MIN_ABS_Z_SCALE);

        let inverted = Viewport {
            min_depth: 0.5,
            max_depth: 0.499999,
            ..flat
        };
        assert_eq!(viewport_xform(&inverted).0[2], -MIN_ABS_Z_SCALE);
    }

    #[test]
    fn test_dynamic_state_defaults() {
        let d = DynamicState::default();
        assert_eq!(d.line_width, 1.0);
        assert_eq!(d.color_write_enable, 0xffff);
        assert_eq!(d.stencil_compare_mask.front, !0);
        assert_eq!(d.stencil_reference.back, 0);
        assert_eq!(d.viewport.count, 0);
    }

    #[test]
    fn test_stencil_pair_masks_to_eight_bits() {
        let mut p = StencilPair::default();
        p.set(StencilFaceFlags::FRONT, 0x1ff);
        assert_eq!(p, StencilPair { front: 0xff, back: 0 });
        p.set(StencilFaceFlags::FRONT_AND_BACK, 0x42);
        assert_eq!(p, StencilPair { front: 0x42, back: 0x42 });
    }
}
