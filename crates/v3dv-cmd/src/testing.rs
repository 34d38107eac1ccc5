//! In-memory buffer object manager, a byte-per-field packet encoder and
//! fixtures shared by the unit tests.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use hashbrown::HashMap;
use v3dv_core::{
    align_u32, Bo, BoHandle, BoManager, Error, GpuAddr, Rect2D, Result, Viewport,
};

use crate::buffer::{
    BeginInfo, CommandBuffer, CommandBufferLevel, CommandBufferUsage, InheritanceInfo,
};
use crate::device::{Device, DeviceOptions};
use crate::job::JobType;
use crate::packet::{
    DrawCall, Packet, PacketBytes, PacketEncoder, RclInfo, ShaderStateInfo,
};
use crate::pass::{
    AttachmentDescription, ClearValue, Framebuffer, FramebufferAttachment, ImageAspectFlags,
    LoadOp, RenderPass, RenderPassBeginInfo, Subpass, ATTACHMENT_UNUSED,
};
use crate::pipeline::{ComputePipeline, GraphicsPipeline, ShaderVariant, Uniform};
use crate::state::{DynamicState, DynamicStateMask};
use crate::tiling::InternalBpp;

// =============================================================================
// BUFFER OBJECTS
// =============================================================================

const FIRST_ADDRESS: u32 = 0x10000;

#[derive(Debug)]
struct FakeBo {
    data: Vec<u8>,
    name: &'static str,
}

#[derive(Debug)]
struct Inner {
    next_handle: u32,
    next_addr: u32,
    live: HashMap<BoHandle, FakeBo>,
    fail_after: u32,
    timestamp: u64,
    waits: u32,
}

/// Buffer objects backed by host memory
#[derive(Debug)]
pub struct FakeBoManager {
    inner: spin::Mutex<Inner>,
}

impl FakeBoManager {
    pub fn new() -> Self {
        Self {
            inner: spin::Mutex::new(Inner {
                next_handle: 1,
                next_addr: FIRST_ADDRESS,
                live: HashMap::new(),
                fail_after: u32::MAX,
                timestamp: 0,
                waits: 0,
            }),
        }
    }

    /// Buffer objects allocated and not freed
    pub fn live_count(&self) -> usize {
        self.inner.lock().live.len()
    }

    /// Let `n` more allocations succeed, then fail; `u32::MAX` never fails
    pub fn fail_after(&self, n: u32) {
        self.inner.lock().fail_after = n;
    }

    pub fn set_timestamp(&self, ns: u64) {
        self.inner.lock().timestamp = ns;
    }

    /// Number of `wait` calls so far
    pub fn wait_count(&self) -> u32 {
        self.inner.lock().waits
    }

    pub fn name_of(&self, bo: Bo) -> Option<&'static str> {
        self.inner.lock().live.get(&bo.handle).map(|b| b.name)
    }

    /// Allocate outside of any failure injection
    pub fn alloc_raw(&self, size: u32) -> Bo {
        let mut inner = self.inner.lock();
        let saved = inner.fail_after;
        inner.fail_after = u32::MAX;
        drop(inner);
        let bo = self.alloc(size, "test").unwrap();
        self.inner.lock().fail_after = saved;
        bo
    }

    pub fn read_word(&self, bo: Bo, offset: u32) -> u32 {
        let mut bytes = [0u8; 4];
        self.read(bo, offset, &mut bytes).unwrap();
        u32::from_le_bytes(bytes)
    }

    pub fn write_word(&self, bo: Bo, offset: u32, value: u32) {
        self.write(bo, offset, &value.to_le_bytes()).unwrap();
    }

    pub fn read_u64(&self, bo: Bo, offset: u32) -> u64 {
        let mut bytes = [0u8; 8];
        self.read(bo, offset, &mut bytes).unwrap();
        u64::from_le_bytes(bytes)
    }
}

impl BoManager for FakeBoManager {
    fn alloc(&self, size: u32, name: &'static str) -> Result<Bo> {
        let mut inner = self.inner.lock();
        match inner.fail_after {
            0 => return Err(Error::OutOfDeviceMemory),
            u32::MAX => {}
            _ => inner.fail_after -= 1,
        }

        let size = size.max(1);
        let bo = Bo {
            handle: BoHandle::new(inner.next_handle),
            offset: GpuAddr::new(inner.next_addr),
            size,
        };
        inner.next_handle += 1;
        inner.next_addr += align_u32(size, 4096);
        inner.live.insert(
            bo.handle,
            FakeBo {
                data: vec![0; size as usize],
                name,
            },
        );
        Ok(bo)
    }

    fn free(&self, bo: Bo) {
        let removed = self.inner.lock().live.remove(&bo.handle);
        assert!(removed.is_some(), "double free of {:?}", bo);
    }

    fn wait(&self, _bo: Bo, _timeout_ns: u64) -> Result<()> {
        self.inner.lock().waits += 1;
        Ok(())
    }

    fn read(&self, bo: Bo, offset: u32, dst: &mut [u8]) -> Result<()> {
        let inner = self.inner.lock();
        let fake = inner.live.get(&bo.handle).ok_or(Error::InvalidBuffer)?;
        let start = offset as usize;
        let src = fake
            .data
            .get(start..start + dst.len())
            .ok_or(Error::InvalidBuffer)?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn write(&self, bo: Bo, offset: u32, src: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        let fake = inner.live.get_mut(&bo.handle).ok_or(Error::InvalidBuffer)?;
        let start = offset as usize;
        let dst = fake
            .data
            .get_mut(start..start + src.len())
            .ok_or(Error::InvalidBuffer)?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn timestamp_ns(&self) -> u64 {
        self.inner.lock().timestamp
    }
}

// =============================================================================
// ENCODER
// =============================================================================

/// Opcodes of the test encoder
pub mod opcode {
    pub const NUMBER_OF_LAYERS: u8 = 1;
    pub const TILE_BINNING_MODE_CFG: u8 = 2;
    pub const FLUSH_VCD_CACHE: u8 = 3;
    pub const START_TILE_BINNING: u8 = 4;
    pub const FLUSH: u8 = 5;
    pub const RETURN_FROM_SUB_LIST: u8 = 6;
    pub const BRANCH_TO_SUB_LIST: u8 = 7;
    pub const BRANCH: u8 = 8;
    pub const CLIP_WINDOW: u8 = 9;
    pub const VIEWPORT: u8 = 10;
    pub const GL_SHADER_STATE: u8 = 11;
    pub const CONFIG_BITS: u8 = 12;
    pub const VARYINGS: u8 = 13;
    pub const INDEX_BUFFER: u8 = 14;
    pub const STENCIL: u8 = 15;
    pub const DEPTH_OFFSET: u8 = 16;
    pub const BLEND_CONSTANT_COLOR: u8 = 17;
    pub const LINE_WIDTH: u8 = 18;
    pub const COLOR_WRITE_MASKS: u8 = 19;
    pub const OCCLUSION_QUERY_COUNTER: u8 = 20;
    pub const SAMPLE_STATE: u8 = 21;
    pub const DRAW_ARRAYS: u8 = 22;
    pub const DRAW_INDEXED: u8 = 23;
    pub const DRAW_INDIRECT: u8 = 24;
    pub const RCL: u8 = 25;
    pub const SHADER_RECORD: u8 = 26;
}

/// Encoded length of the packet starting with `op`
fn encoded_len(op: u8) -> usize {
    use opcode::*;
    match op {
        NUMBER_OF_LAYERS | CONFIG_BITS => 2,
        TILE_BINNING_MODE_CFG => 8,
        FLUSH_VCD_CACHE | START_TILE_BINNING | FLUSH | RETURN_FROM_SUB_LIST | VARYINGS => 1,
        BRANCH_TO_SUB_LIST | BRANCH | LINE_WIDTH | COLOR_WRITE_MASKS | OCCLUSION_QUERY_COUNTER
        | SAMPLE_STATE => 5,
        CLIP_WINDOW | INDEX_BUFFER => 9,
        VIEWPORT => 25,
        GL_SHADER_STATE => 6,
        STENCIL => 7,
        DEPTH_OFFSET | DRAW_ARRAYS | DRAW_INDIRECT => 13,
        BLEND_CONSTANT_COLOR | DRAW_INDEXED => 17,
        other => panic!("unknown opcode {other}"),
    }
}

/// Split a control list chunk into its packet opcodes
pub fn opcodes(bytes: &[u8]) -> Vec<u8> {
    let mut ops = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        ops.push(bytes[i]);
        i += encoded_len(bytes[i]);
    }
    ops
}

/// Payload bytes of the first packet with opcode `op`
pub fn find_packet(bytes: &[u8], op: u8) -> Option<&[u8]> {
    let mut i = 0;
    while i < bytes.len() {
        let len = encoded_len(bytes[i]);
        if bytes[i] == op {
            return Some(&bytes[i + 1..i + len]);
        }
        i += len;
    }
    None
}

fn put(out: &mut PacketBytes, bytes: &[u8]) {
    out.try_extend_from_slice(bytes).unwrap();
}

fn put_u32(out: &mut PacketBytes, value: u32) {
    put(out, &value.to_le_bytes());
}

fn put_f32(out: &mut PacketBytes, value: f32) {
    put(out, &value.to_le_bytes());
}

/// One opcode byte followed by little-endian fields
#[derive(Debug)]
pub struct TestEncoder;

impl PacketEncoder for TestEncoder {
    fn encode(&self, packet: &Packet<'_>, out: &mut PacketBytes) {
        use opcode::*;
        match *packet {
            Packet::NumberOfLayers(layers) => put(out, &[NUMBER_OF_LAYERS, layers as u8]),
            Packet::TileBinningModeCfg {
                width,
                height,
                render_target_count,
                msaa,
                max_internal_bpp,
            } => {
                put(out, &[TILE_BINNING_MODE_CFG]);
                put(out, &(width as u16).to_le_bytes());
                put(out, &(height as u16).to_le_bytes());
                put(
                    out,
                    &[render_target_count as u8, msaa as u8, max_internal_bpp as u8],
                );
            }
            Packet::FlushVcdCache => put(out, &[FLUSH_VCD_CACHE]),
            Packet::StartTileBinning => put(out, &[START_TILE_BINNING]),
            Packet::Flush => put(out, &[FLUSH]),
            Packet::ReturnFromSubList => put(out, &[RETURN_FROM_SUB_LIST]),
            Packet::BranchToSubList(addr) => {
                put(out, &[BRANCH_TO_SUB_LIST]);
                put_u32(out, addr.raw());
            }
            Packet::Branch(addr) => {
                put(out, &[BRANCH]);
                put_u32(out, addr.raw());
            }
            Packet::ClipWindow(rect) => {
                put(out, &[CLIP_WINDOW]);
                for v in [
                    rect.offset.x as u16,
                    rect.offset.y as u16,
                    rect.extent.width as u16,
                    rect.extent.height as u16,
                ] {
                    put(out, &v.to_le_bytes());
                }
            }
            Packet::Viewport { scale, translate } => {
                put(out, &[VIEWPORT]);
                for v in scale.iter().chain(translate.iter()) {
                    put_f32(out, *v);
                }
            }
            Packet::GlShaderState {
                address,
                attribute_count,
            } => {
                put(out, &[GL_SHADER_STATE]);
                put_u32(out, address.raw());
                put(out, &[attribute_count as u8]);
            }
            Packet::ConfigBits(pipeline) => put(out, &[CONFIG_BITS, pipeline.msaa as u8]),
            Packet::Varyings(_) => put(out, &[VARYINGS]),
            Packet::IndexBuffer { address, size } => {
                put(out, &[INDEX_BUFFER]);
                put_u32(out, address.raw());
                put_u32(out, size);
            }
            Packet::Stencil { front, back, .. } => {
                put(out, &[STENCIL]);
                for face in [front, back] {
                    put(
                        out,
                        &[
                            face.compare_mask as u8,
                            face.write_mask as u8,
                            face.reference as u8,
                        ],
                    );
                }
            }
            Packet::DepthOffset {
                constant_factor,
                slope_factor,
                clamp,
            } => {
                put(out, &[DEPTH_OFFSET]);
                put_f32(out, constant_factor);
                put_f32(out, slope_factor);
                put_f32(out, clamp);
            }
            Packet::BlendConstantColor(color) => {
                put(out, &[BLEND_CONSTANT_COLOR]);
                for c in color {
                    put_f32(out, c);
                }
            }
            Packet::LineWidth(width) => {
                put(out, &[LINE_WIDTH]);
                put_f32(out, width);
            }
            Packet::ColorWriteMasks(masks) => {
                put(out, &[COLOR_WRITE_MASKS]);
                put_u32(out, masks);
            }
            Packet::OcclusionQueryCounter(addr) => {
                put(out, &[OCCLUSION_QUERY_COUNTER]);
                put_u32(out, addr.map_or(0, |a| a.raw()));
            }
            Packet::SampleState { mask } => {
                put(out, &[SAMPLE_STATE]);
                put_u32(out, mask);
            }
            Packet::Draw(DrawCall::Arrays {
                vertex_count,
                instance_count,
                first_vertex,
                ..
            }) => {
                put(out, &[DRAW_ARRAYS]);
                put_u32(out, vertex_count);
                put_u32(out, instance_count);
                put_u32(out, first_vertex);
            }
            Packet::Draw(DrawCall::Indexed {
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                ..
            }) => {
                put(out, &[DRAW_INDEXED]);
                put_u32(out, index_count);
                put_u32(out, instance_count);
                put_u32(out, first_index);
                put(out, &vertex_offset.to_le_bytes());
            }
            Packet::Draw(DrawCall::Indirect {
                address,
                draw_count,
                stride,
                ..
            }) => {
                put(out, &[DRAW_INDIRECT]);
                put_u32(out, address.raw());
                put_u32(out, draw_count);
                put_u32(out, stride);
            }
        }
    }

    fn encode_rcl(&self, info: &RclInfo<'_>, out: &mut Vec<u8>) -> Result<()> {
        out.try_reserve(5)?;
        out.extend_from_slice(&[
            opcode::RCL,
            info.first_subpass as u8,
            info.last_subpass as u8,
            info.is_subpass_continue as u8,
            info.is_subpass_finish as u8,
        ]);
        Ok(())
    }

    fn encode_shader_state(&self, info: &ShaderStateInfo<'_>, out: &mut Vec<u8>) -> Result<()> {
        out.push(opcode::SHADER_RECORD);
        out.push(info.attributes.len() as u8);
        out.extend_from_slice(&info.assembly.raw().to_le_bytes());
        for addr in info.uniforms {
            out.extend_from_slice(&addr.raw().to_le_bytes());
        }
        for attr in &info.attributes {
            out.extend_from_slice(&attr.address.raw().to_le_bytes());
            out.extend_from_slice(&attr.stride.to_le_bytes());
        }
        Ok(())
    }

    fn return_from_sub_list_opcode(&self) -> u8 {
        opcode::RETURN_FROM_SUB_LIST
    }

    fn name(&self) -> &'static str {
        "test"
    }
}

// =============================================================================
// FIXTURES
// =============================================================================

pub fn test_device() -> (Arc<Device>, Arc<FakeBoManager>) {
    test_device_with(DeviceOptions::default())
}

pub fn test_device_with(options: DeviceOptions) -> (Arc<Device>, Arc<FakeBoManager>) {
    let bo = Arc::new(FakeBoManager::new());
    let device = Device::new(bo.clone(), Arc::new(TestEncoder)).with_options(options);
    (Arc::new(device), bo)
}

pub fn begin_primary() -> (CommandBuffer, Arc<FakeBoManager>) {
    begin_primary_with(DeviceOptions::default())
}

pub fn begin_primary_with(options: DeviceOptions) -> (CommandBuffer, Arc<FakeBoManager>) {
    let (device, bo) = test_device_with(options);
    let mut cb = CommandBuffer::new(device, CommandBufferLevel::Primary);
    cb.begin(&BeginInfo::default()).unwrap();
    (cb, bo)
}

/// A recording secondary, continuing a render pass when given inheritance
pub fn begin_secondary(device: &Arc<Device>, inheritance: Option<InheritanceInfo>) -> CommandBuffer {
    let mut cb = CommandBuffer::new(device.clone(), CommandBufferLevel::Secondary);
    let usage = if inheritance.is_some() {
        CommandBufferUsage::RENDER_PASS_CONTINUE
    } else {
        CommandBufferUsage::empty()
    };
    cb.begin(&BeginInfo { usage, inheritance }).unwrap();
    cb
}

impl CommandBuffer {
    /// Type tags of the job list
    pub(crate) fn job_types(&self) -> Vec<JobType> {
        self.jobs().iter().map(|e| e.job_type()).collect()
    }
}

/// A buffer object the tests reference without owning
pub fn external_bo(handle: u32) -> Bo {
    Bo {
        handle: BoHandle::new(0x8000 + handle),
        offset: GpuAddr::new(0x8000_0000 + handle * 0x10_0000),
        size: 0x10_0000,
    }
}

/// A 64x64 single-layer framebuffer with one cleared color attachment
#[derive(Debug, Clone)]
pub struct RenderTarget {
    pub pass: Arc<RenderPass>,
    pub framebuffer: Arc<Framebuffer>,
}

fn color_subpass(view_mask: u32) -> Subpass {
    Subpass {
        color_attachments: vec![0],
        resolve_attachments: Vec::new(),
        ds_attachment: ATTACHMENT_UNUSED,
        view_mask,
    }
}

impl RenderTarget {
    pub fn new(cb: &CommandBuffer) -> Self {
        Self::with_device(cb.device())
    }

    pub fn with_device(device: &Arc<Device>) -> Self {
        let _ = device;
        Self::build(&[0])
    }

    /// One subpass per view mask
    pub fn multiview(cb: &CommandBuffer, masks: &[u32]) -> Self {
        let _ = cb;
        Self::build(masks)
    }

    fn build(masks: &[u32]) -> Self {
        let pass = RenderPass {
            attachments: vec![AttachmentDescription {
                samples: 1,
                load_op: LoadOp::Clear,
                stencil_load_op: LoadOp::DontCare,
                aspects: ImageAspectFlags::COLOR,
            }],
            subpasses: masks.iter().map(|&m| color_subpass(m)).collect(),
            multiview_enabled: masks.iter().any(|&m| m != 0),
        };
        let framebuffer = Framebuffer {
            width: 64,
            height: 64,
            layers: 1,
            has_edge_padding: false,
            attachments: vec![FramebufferAttachment {
                bo: external_bo(1),
                internal_bpp: InternalBpp::Bpp32,
                samples: 1,
                aspects: ImageAspectFlags::COLOR,
            }],
        };
        Self {
            pass: Arc::new(pass),
            framebuffer: Arc::new(framebuffer),
        }
    }

    pub fn begin_info(&self) -> RenderPassBeginInfo {
        RenderPassBeginInfo {
            pass: self.pass.clone(),
            framebuffer: self.framebuffer.clone(),
            render_area: Rect2D::new(0, 0, 64, 64),
            clear_values: vec![ClearValue::Color([0; 4])],
        }
    }

    pub fn inheritance(&self, subpass: u32) -> InheritanceInfo {
        InheritanceInfo {
            pass: Some(self.pass.clone()),
            subpass,
            framebuffer: Some(self.framebuffer.clone()),
            occlusion_query_enable: false,
        }
    }
}

fn variant(uniforms: &[Uniform]) -> ShaderVariant {
    ShaderVariant {
        assembly_offset: 0,
        uniforms: uniforms.to_vec(),
    }
}

/// A pipeline with dynamic viewport and scissor
pub fn test_pipeline() -> GraphicsPipeline {
    GraphicsPipeline {
        assembly_bo: Some(external_bo(2)),
        vs: variant(&[Uniform::ViewportXScale, Uniform::ViewportYScale]),
        vs_bin: variant(&[Uniform::ViewportXScale]),
        fs: variant(&[Uniform::Constant(0x3f80_0000)]),
        gs: None,
        dynamic_state: DynamicState {
            mask: DynamicStateMask::VIEWPORT | DynamicStateMask::SCISSOR,
            ..DynamicState::default()
        },
        msaa: false,
        sample_mask: 0xf,
        color_write_masks: 0,
        depth_bias_enabled: false,
        topology: Default::default(),
        vertex_bindings: Vec::new(),
        attributes: Vec::new(),
    }
}

/// A compute pipeline reading the X and Y workgroup counts
pub fn compute_pipeline(local_size: [u32; 3]) -> ComputePipeline {
    ComputePipeline {
        assembly_bo: external_bo(9),
        cs: ShaderVariant {
            assembly_offset: 0x40,
            uniforms: vec![
                Uniform::Constant(1),
                Uniform::WorkgroupCount(0),
                Uniform::WorkgroupCount(1),
            ],
        },
        local_size,
        threads: 4,
        single_seg: false,
        has_subgroups: false,
        has_control_barrier: false,
        shared_size: 0,
    }
}

pub fn full_viewport() -> Viewport {
    Viewport {
        x: 0.0,
        y: 0.0,
        width: 64.0,
        height: 64.0,
        min_depth: 0.0,
        max_depth: 1.0,
    }
}

/// Bind [`test_pipeline`] with a viewport and scissor covering 64x64
pub fn draw_setup(cb: &mut CommandBuffer) {
    cb.bind_graphics_pipeline(&Arc::new(test_pipeline()));
    cb.set_viewport(0, &[full_viewport()]);
    cb.set_scissor(0, &[Rect2D::new(0, 0, 64, 64)]);
}

/// Packet bytes of the binning list of `cb`'s job `index`
pub fn bcl_bytes(cb: &CommandBuffer, index: usize) -> Vec<u8> {
    let cl = cb.jobs()[index].job().cl().unwrap();
    let mut bytes = Vec::new();
    for i in 0..cl.bcl.bos().len() {
        bytes.extend_from_slice(cl.bcl.chunk(i));
    }
    bytes
}

/// Opcodes recorded after the binning prolog
pub fn draw_opcodes(bytes: &[u8]) -> Vec<u8> {
    let ops = opcodes(bytes);
    let start = ops
        .iter()
        .position(|&op| op == opcode::START_TILE_BINNING)
        .map_or(0, |p| p + 1);
    ops[start..].to_vec()
}
