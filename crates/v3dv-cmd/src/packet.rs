//! # Packet Encoding
//!
//! The boundary to the hardware packet layer. The recorder decides which
//! packets go where and when; the encoder decides their bit layout.

use alloc::vec::Vec;

use arrayvec::ArrayVec;
use v3dv_core::{GpuAddr, Rect2D, Result};

use crate::pass::{AttachmentState, Framebuffer, RenderPass};
use crate::pipeline::{GraphicsPipeline, PrimitiveTopology};
use crate::tiling::{FrameTiling, InternalBpp};

/// Maximum encoded size of a single fixed packet
pub const MAX_PACKET_SIZE: usize = 64;

/// Encoded bytes of one fixed packet
pub type PacketBytes = ArrayVec<u8, MAX_PACKET_SIZE>;

// =============================================================================
// PACKETS
// =============================================================================

/// Per-face stencil values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StencilFace {
    /// Compare mask
    pub compare_mask: u32,
    /// Write mask
    pub write_mask: u32,
    /// Reference value
    pub reference: u32,
}

/// A draw call packet
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DrawCall {
    /// Non-indexed draw
    Arrays {
        /// Topology
        topology: PrimitiveTopology,
        /// Vertices per instance
        vertex_count: u32,
        /// Instances
        instance_count: u32,
        /// First vertex
        first_vertex: u32,
        /// First instance
        first_instance: u32,
    },
    /// Indexed draw
    Indexed {
        /// Topology
        topology: PrimitiveTopology,
        /// Index size in bytes
        index_size: u32,
        /// Indices per instance
        index_count: u32,
        /// Instances
        instance_count: u32,
        /// First index
        first_index: u32,
        /// Added to every index
        vertex_offset: i32,
        /// First instance
        first_instance: u32,
    },
    /// Indirect draw reading its parameters from memory
    Indirect {
        /// Topology
        topology: PrimitiveTopology,
        /// Index size in bytes, zero for non-indexed
        index_size: u32,
        /// Address of the first record
        address: GpuAddr,
        /// Number of records
        draw_count: u32,
        /// Distance between records
        stride: u32,
    },
}

/// Fixed-size control list packets
#[derive(Debug, Clone, Copy)]
pub enum Packet<'a> {
    // Binning prolog
    /// Layer count of the frame
    NumberOfLayers(u32),
    /// Binning mode configuration
    TileBinningModeCfg {
        /// Frame width in pixels
        width: u32,
        /// Frame height in pixels
        height: u32,
        /// Render targets, at least one
        render_target_count: u32,
        /// 4x multisampling
        msaa: bool,
        /// Maximum internal bpp of all render targets
        max_internal_bpp: InternalBpp,
    },
    /// Flush the vertex cache
    FlushVcdCache,
    /// Binning list proper starts here
    StartTileBinning,

    // Flow control
    /// End of the binning list
    Flush,
    /// Return from a sub list
    ReturnFromSubList,
    /// Call a sub list
    BranchToSubList(GpuAddr),
    /// Jump
    Branch(GpuAddr),

    // Draw state
    /// Clip window
    ClipWindow(Rect2D),
    /// Clipper scaling and viewport offset
    Viewport {
        /// Viewport scale
        scale: [f32; 3],
        /// Viewport translation
        translate: [f32; 3],
    },
    /// Shader state record pointer
    GlShaderState {
        /// Address of the record in the indirect list
        address: GpuAddr,
        /// Attribute records following it
        attribute_count: u32,
    },
    /// Pipeline configuration bits
    ConfigBits(&'a GraphicsPipeline),
    /// Flat shade and centroid flags of the varyings
    Varyings(&'a GraphicsPipeline),
    /// Index buffer setup
    IndexBuffer {
        /// Address of the first index
        address: GpuAddr,
        /// Bytes remaining in the buffer
        size: u32,
    },
    /// Stencil configuration for both faces
    Stencil {
        /// Pipeline whose static stencil setup applies
        pipeline: &'a GraphicsPipeline,
        /// Front face values
        front: StencilFace,
        /// Back face values
        back: StencilFace,
    },
    /// Depth offset
    DepthOffset {
        /// Constant factor
        constant_factor: f32,
        /// Slope factor
        slope_factor: f32,
        /// Clamp
        clamp: f32,
    },
    /// Blend constant color
    BlendConstantColor([f32; 4]),
    /// Line width
    LineWidth(f32),
    /// Per render target color write disable bits
    ColorWriteMasks(u32),
    /// Occlusion counter address, `None` disables counting
    OcclusionQueryCounter(Option<GpuAddr>),
    /// Multisample mask
    SampleState {
        /// Sample mask
        mask: u32,
    },
    /// Draw
    Draw(DrawCall),
}

// =============================================================================
// VARIABLE SIZE RECORDS
// =============================================================================

/// Inputs of the render control list
#[derive(Debug, Clone, Copy)]
pub struct RclInfo<'a> {
    /// Tiling of the frame
    pub tiling: &'a FrameTiling,
    /// Render pass
    pub pass: &'a RenderPass,
    /// Framebuffer
    pub framebuffer: &'a Framebuffer,
    /// First subpass rendered by the job
    pub first_subpass: u32,
    /// Last subpass rendered by the job
    pub last_subpass: u32,
    /// The job continues a subpass begun by a previous job
    pub is_subpass_continue: bool,
    /// The job ends its last subpass
    pub is_subpass_finish: bool,
    /// Render area
    pub render_area: Rect2D,
    /// The render area covers whole tiles
    pub tile_aligned: bool,
    /// Per attachment clear values
    pub attachments: &'a [AttachmentState],
    /// Base of the tile allocation memory
    pub tile_alloc: GpuAddr,
}

/// One vertex attribute record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeRecord {
    /// Address of the first element
    pub address: GpuAddr,
    /// Stride of the binding
    pub stride: u32,
}

/// Inputs of a shader state record
#[derive(Debug, Clone)]
pub struct ShaderStateInfo<'a> {
    /// Bound pipeline
    pub pipeline: &'a GraphicsPipeline,
    /// Address of the shader code
    pub assembly: GpuAddr,
    /// Uniform streams: vs, vs_bin, gs, gs_bin, fs
    pub uniforms: [GpuAddr; 5],
    /// Attribute records
    pub attributes: ArrayVec<AttributeRecord, 16>,
}

// =============================================================================
// ENCODER TRAIT
// =============================================================================

/// Hardware packet encoder
pub trait PacketEncoder: Send + Sync {
    /// Encode a fixed packet
    fn encode(&self, packet: &Packet<'_>, out: &mut PacketBytes);

    /// Encode the render control list of a frame
    fn encode_rcl(&self, info: &RclInfo<'_>, out: &mut Vec<u8>) -> Result<()>;

    /// Encode a shader state record and its attribute records
    fn encode_shader_state(&self, info: &ShaderStateInfo<'_>, out: &mut Vec<u8>) -> Result<()>;

    /// Opcode byte of the one-byte return-from-sub-list packet
    fn return_from_sub_list_opcode(&self) -> u8;

    /// Encoder name
    fn name(&self) -> &'static str;
}

/// Encoded length of `packet`
pub fn packet_len(encoder: &dyn PacketEncoder, packet: &Packet<'_>) -> u32 {
    let mut bytes = PacketBytes::new();
    encoder.encode(packet, &mut bytes);
    bytes.len() as u32
}
