//! # Pipelines and Descriptors
//!
//! The parts of compiled pipelines and descriptor sets the recorder
//! consumes. Pipelines are built by the shader compiler; the uniform
//! layout of each shader variant tells the recorder what to write into
//! its uniform stream.

use alloc::sync::Arc;
use alloc::vec::Vec;

use v3dv_core::Bo;

use crate::state::DynamicState;

/// Maximum number of bound descriptor sets
pub const MAX_SETS: usize = 16;

/// Maximum number of dynamic buffer descriptors over all sets
pub const MAX_DYNAMIC_BUFFERS: usize = 24;

/// Maximum number of vertex buffer bindings
pub const MAX_VERTEX_BINDINGS: usize = 16;

bitflags::bitflags! {
    /// Shader stages
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ShaderStageFlags: u32 {
        /// Vertex shader
        const VERTEX = 1 << 0;
        /// Tessellation control shader
        const TESSELLATION_CONTROL = 1 << 1;
        /// Tessellation evaluation shader
        const TESSELLATION_EVALUATION = 1 << 2;
        /// Geometry shader
        const GEOMETRY = 1 << 3;
        /// Fragment shader
        const FRAGMENT = 1 << 4;
        /// Compute shader
        const COMPUTE = 1 << 5;
        /// All graphics stages
        const ALL_GRAPHICS = 0x1f;
    }
}

/// Pipeline bind point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineBindPoint {
    /// Graphics
    Graphics,
    /// Compute
    Compute,
}

/// Primitive topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PrimitiveTopology {
    /// Points
    PointList,
    /// Independent lines
    LineList,
    /// Line strip
    LineStrip,
    /// Independent triangles
    #[default]
    TriangleList,
    /// Triangle strip
    TriangleStrip,
    /// Triangle fan
    TriangleFan,
}

// =============================================================================
// UNIFORM LAYOUT
// =============================================================================

/// One entry of a shader variant's uniform stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Uniform {
    /// Literal value
    Constant(u32),
    /// Word of push constant data at a byte offset
    PushConstant {
        /// Byte offset into the push constant block
        offset: u32,
    },
    /// Viewport X scale in 1/256 pixel units
    ViewportXScale,
    /// Viewport Y scale in 1/256 pixel units
    ViewportYScale,
    /// Viewport Z translation
    ViewportZOffset,
    /// Viewport Z scale
    ViewportZScale,
    /// Line width
    LineWidth,
    /// Address of a buffer descriptor
    BufferAddress {
        /// Descriptor set index
        set: u32,
        /// Descriptor index in the set
        binding: u32,
    },
    /// Workgroup count along an axis
    WorkgroupCount(u8),
    /// Address of the workgroup shared memory
    SharedOffset,
    /// Multiview view index
    ViewIndex,
}

/// A compiled shader variant
#[derive(Debug, Clone, Default)]
pub struct ShaderVariant {
    /// Offset of the code in the pipeline's assembly buffer
    pub assembly_offset: u32,
    /// Uniform stream layout
    pub uniforms: Vec<Uniform>,
}

// =============================================================================
// GRAPHICS PIPELINE
// =============================================================================

/// Geometry shader variants
#[derive(Debug, Clone, Default)]
pub struct GeometryShaders {
    /// Render variant
    pub gs: ShaderVariant,
    /// Binning variant
    pub gs_bin: ShaderVariant,
}

/// Vertex buffer binding description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VertexInputBinding {
    /// Stride in bytes
    pub stride: u32,
    /// Advance per instance instead of per vertex
    pub per_instance: bool,
}

/// Vertex attribute description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VertexAttribute {
    /// Source binding
    pub binding: u32,
    /// Offset inside the element
    pub offset: u32,
}

/// Compiled graphics pipeline
#[derive(Debug, Clone, Default)]
pub struct GraphicsPipeline {
    /// Shader code of all variants
    pub assembly_bo: Option<Bo>,
    /// Vertex shader, render variant
    pub vs: ShaderVariant,
    /// Vertex shader, binning variant
    pub vs_bin: ShaderVariant,
    /// Fragment shader
    pub fs: ShaderVariant,
    /// Geometry shader variants
    pub gs: Option<GeometryShaders>,
    /// State baked into the pipeline, with the mask of what stays dynamic
    pub dynamic_state: DynamicState,
    /// Rasterizes with 4x multisampling
    pub msaa: bool,
    /// Multisample mask
    pub sample_mask: u32,
    /// Per render target color write disable bits
    pub color_write_masks: u32,
    /// Depth bias enabled
    pub depth_bias_enabled: bool,
    /// Topology
    pub topology: PrimitiveTopology,
    /// Vertex buffer bindings
    pub vertex_bindings: Vec<VertexInputBinding>,
    /// Vertex attributes
    pub attributes: Vec<VertexAttribute>,
}

impl GraphicsPipeline {
    /// Whether the pipeline has a geometry shader
    #[inline]
    pub fn has_gs(&self) -> bool {
        self.gs.is_some()
    }
}

// =============================================================================
// COMPUTE PIPELINE
// =============================================================================

/// Compiled compute pipeline
#[derive(Debug, Clone)]
pub struct ComputePipeline {
    /// Shader code
    pub assembly_bo: Bo,
    /// Compute shader
    pub cs: ShaderVariant,
    /// Workgroup size
    pub local_size: [u32; 3],
    /// Threads per QPU (1, 2 or 4)
    pub threads: u32,
    /// Runs in a single segment
    pub single_seg: bool,
    /// Uses subgroup operations
    pub has_subgroups: bool,
    /// Uses a control barrier
    pub has_control_barrier: bool,
    /// Shared memory per workgroup in bytes
    pub shared_size: u32,
}

impl ComputePipeline {
    /// Invocations per workgroup
    #[inline]
    pub fn workgroup_size(&self) -> u32 {
        self.local_size[0] * self.local_size[1] * self.local_size[2]
    }
}

// =============================================================================
// DESCRIPTORS
// =============================================================================

/// Descriptor set layout
#[derive(Debug, Clone, Default)]
pub struct DescriptorSetLayout {
    /// Stages that read the set
    pub stages: ShaderStageFlags,
    /// Dynamic buffer descriptors in the set
    pub dynamic_offset_count: u32,
}

/// A buffer bound in a descriptor set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDescriptor {
    /// Buffer object
    pub bo: Bo,
    /// Offset of the range in the buffer object
    pub offset: u32,
    /// Index among the set's dynamic descriptors
    pub dynamic_index: Option<u32>,
}

/// Descriptor set
#[derive(Debug, Clone)]
pub struct DescriptorSet {
    /// Layout
    pub layout: Arc<DescriptorSetLayout>,
    /// Buffer descriptors by binding
    pub buffers: Vec<BufferDescriptor>,
}

/// Pipeline layout
#[derive(Debug, Clone, Default)]
pub struct PipelineLayout {
    /// First dynamic offset index of each set
    pub dynamic_offset_start: Vec<u32>,
}
