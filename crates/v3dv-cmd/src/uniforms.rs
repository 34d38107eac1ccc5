//! # Uniform Streams
//!
//! Fills the uniform stream of a shader variant from command buffer state
//! and places it in the job's indirect list. Workgroup count words are
//! reported back so an indirect dispatch can rewrite them once the real
//! counts are known.

use alloc::vec::Vec;

use v3dv_core::{Bo, Error, GpuAddr, Result, UsageError};

use crate::cl::PatchSite;
use crate::job::Job;
use crate::pipeline::{ShaderVariant, Uniform};
use crate::state::{DescriptorState, DynamicState, MAX_PUSH_CONSTANTS_SIZE};

/// Alignment of uniform streams
const UNIFORM_ALIGNMENT: u32 = 4;

/// State the uniform values are read from
#[derive(Debug, Clone, Copy)]
pub struct UniformContext<'a> {
    /// Push constant block
    pub push_constants: &'a [u8; MAX_PUSH_CONSTANTS_SIZE],
    /// Descriptor sets of the bind point
    pub descriptors: &'a DescriptorState,
    /// Dynamic state, for viewport and line width uniforms
    pub dynamic: &'a DynamicState,
    /// Multiview view index
    pub view_index: u32,
    /// Workgroup counts of a dispatch
    pub wg_count: [u32; 3],
    /// Workgroup shared memory of a dispatch
    pub shared_memory: Option<Bo>,
}

/// A written uniform stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformStream {
    /// First word
    pub site: PatchSite,
    /// GPU address of the first word
    pub address: GpuAddr,
    /// Word holding the workgroup count of each axis, if read
    pub wg_count_sites: [Option<PatchSite>; 3],
}

fn push_constant_word(data: &[u8; MAX_PUSH_CONSTANTS_SIZE], offset: u32) -> Result<u32> {
    let start = offset as usize;
    let bytes = data
        .get(start..start + 4)
        .ok_or(Error::Usage(UsageError::PushConstantRange))?;
    Ok(bytemuck::pod_read_unaligned(bytes))
}

/// Resolve a buffer descriptor and reference its buffer object from `job`
fn buffer_address(
    job: &mut Job,
    descriptors: &DescriptorState,
    set: u32,
    binding: u32,
) -> Result<u32> {
    if set as usize >= descriptors.sets.len() || descriptors.valid & (1 << set) == 0 {
        return Err(Error::InvalidBuffer);
    }
    let bound = descriptors.sets[set as usize]
        .as_ref()
        .ok_or(Error::InvalidBuffer)?;
    let desc = bound
        .buffers
        .get(binding as usize)
        .ok_or(Error::InvalidBuffer)?;

    let mut offset = desc.offset;
    if let Some(index) = desc.dynamic_index {
        let slot = descriptors.dynamic_offset_start[set as usize] + index;
        offset += descriptors
            .dynamic_offsets
            .get(slot as usize)
            .copied()
            .ok_or(Error::InvalidBuffer)?;
    }

    job.add_bo(desc.bo)?;
    Ok(desc.bo.address(offset).raw())
}

/// Write the uniform stream of `variant` into `job`'s indirect list
pub fn write_uniforms(
    job: &mut Job,
    ctx: &UniformContext<'_>,
    variant: &ShaderVariant,
) -> Result<UniformStream> {
    let mut words: Vec<u32> = Vec::new();
    words.try_reserve(variant.uniforms.len())?;
    let mut wg_words = [None; 3];

    let viewport = &ctx.dynamic.viewport;
    for (i, uniform) in variant.uniforms.iter().enumerate() {
        let word = match *uniform {
            Uniform::Constant(value) => value,
            Uniform::PushConstant { offset } => push_constant_word(ctx.push_constants, offset)?,
            Uniform::ViewportXScale => (viewport.scale[0][0] * 256.0).to_bits(),
            Uniform::ViewportYScale => (viewport.scale[0][1] * 256.0).to_bits(),
            Uniform::ViewportZOffset => viewport.translate[0][2].to_bits(),
            Uniform::ViewportZScale => viewport.scale[0][2].to_bits(),
            Uniform::LineWidth => ctx.dynamic.line_width.to_bits(),
            Uniform::BufferAddress { set, binding } => {
                buffer_address(job, ctx.descriptors, set, binding)?
            }
            Uniform::WorkgroupCount(axis) => {
                let axis = axis as usize;
                let count = *ctx
                    .wg_count
                    .get(axis)
                    .ok_or(Error::Usage(UsageError::InvalidWorkgroupCount))?;
                wg_words[axis] = Some(i as u32);
                count
            }
            Uniform::SharedOffset => {
                let bo = ctx.shared_memory.ok_or(Error::InvalidBuffer)?;
                job.add_bo(bo)?;
                bo.offset.raw()
            }
            Uniform::ViewIndex => ctx.view_index,
        };
        words.push(word);
    }

    // Even an empty stream needs a valid address
    let size = ((words.len() as u32) * 4).max(4);
    let (device, indirect, bos) = job.indirect_parts()?;
    let site = indirect.ensure_space(device, bos, size, UNIFORM_ALIGNMENT)?;
    if !words.is_empty() {
        indirect.write_at(site, bytemuck::cast_slice(&words))?;
    }

    Ok(UniformStream {
        site,
        address: indirect.site_address(site),
        wg_count_sites: wg_words.map(|w| w.map(|i| site.add(i * 4))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobKind;
    use crate::pipeline::{BufferDescriptor, DescriptorSet, DescriptorSetLayout};
    use crate::state::viewport_xform;
    use crate::testing::{external_bo, full_viewport, test_device};
    use alloc::sync::Arc;
    use alloc::vec;

    fn variant(uniforms: &[Uniform]) -> ShaderVariant {
        ShaderVariant {
            assembly_offset: 0,
            uniforms: uniforms.to_vec(),
        }
    }

    fn read(job: &Job, site: PatchSite) -> u32 {
        let list = match &job.kind {
            JobKind::GpuCl(cl) => &cl.indirect,
            JobKind::GpuCsd(csd) => &csd.indirect,
            other => panic!("unexpected {other:?}"),
        };
        list.read_u32(site).unwrap()
    }

    #[test]
    fn test_constants_push_constants_and_viewport() {
        let (device, _bo) = test_device();
        let mut job = Job::new(device, JobKind::gpu_cl());

        let mut push = [0u8; MAX_PUSH_CONSTANTS_SIZE];
        push[8..12].copy_from_slice(&0xdead_beefu32.to_le_bytes());
        let mut dynamic = DynamicState::default();
        dynamic.viewport.count = 1;
        let (scale, translate) = viewport_xform(&full_viewport());
        dynamic.viewport.scale[0] = scale;
        dynamic.viewport.translate[0] = translate;
        let descriptors = DescriptorState::default();

        let ctx = UniformContext {
            push_constants: &push,
            descriptors: &descriptors,
            dynamic: &dynamic,
            view_index: 2,
            wg_count: [0; 3],
            shared_memory: None,
        };
        let stream = write_uniforms(
            &mut job,
            &ctx,
            &variant(&[
                Uniform::Constant(7),
                Uniform::PushConstant { offset: 8 },
                Uniform::ViewportXScale,
                Uniform::ViewIndex,
            ]),
        )
        .unwrap();

        assert_eq!(read(&job, stream.site), 7);
        assert_eq!(read(&job, stream.site.add(4)), 0xdead_beef);
        assert_eq!(read(&job, stream.site.add(8)), (32.0f32 * 256.0).to_bits());
        assert_eq!(read(&job, stream.site.add(12)), 2);
        assert!(!stream.address.is_null());
        assert_eq!(stream.wg_count_sites, [None; 3]);
    }

    #[test]
    fn test_buffer_address_applies_dynamic_offset() {
        let (device, _bo) = test_device();
        let mut job = Job::new(device, JobKind::gpu_cl());
        let buffer = external_bo(5);

        let mut descriptors = DescriptorState::default();
        descriptors.valid = 1 << 1;
        descriptors.sets[1] = Some(Arc::new(DescriptorSet {
            layout: Arc::new(DescriptorSetLayout::default()),
            buffers: vec![BufferDescriptor {
                bo: buffer,
                offset: 0x40,
                dynamic_index: Some(1),
            }],
        }));
        descriptors.dynamic_offset_start[1] = 2;
        descriptors.dynamic_offsets[3] = 0x100;

        let push = [0u8; MAX_PUSH_CONSTANTS_SIZE];
        let dynamic = DynamicState::default();
        let ctx = UniformContext {
            push_constants: &push,
            descriptors: &descriptors,
            dynamic: &dynamic,
            view_index: 0,
            wg_count: [0; 3],
            shared_memory: None,
        };
        let stream = write_uniforms(
            &mut job,
            &ctx,
            &variant(&[Uniform::BufferAddress { set: 1, binding: 0 }]),
        )
        .unwrap();

        assert_eq!(read(&job, stream.site), buffer.address(0x140).raw());
        assert!(job.bos.contains(buffer.handle));
    }

    #[test]
    fn test_unbound_set_is_rejected() {
        let (device, _bo) = test_device();
        let mut job = Job::new(device, JobKind::gpu_cl());
        let push = [0u8; MAX_PUSH_CONSTANTS_SIZE];
        let dynamic = DynamicState::default();
        let descriptors = DescriptorState::default();
        let ctx = UniformContext {
            push_constants: &push,
            descriptors: &descriptors,
            dynamic: &dynamic,
            view_index: 0,
            wg_count: [0; 3],
            shared_memory: None,
        };
        let err = write_uniforms(
            &mut job,
            &ctx,
            &variant(&[Uniform::BufferAddress { set: 0, binding: 0 }]),
        )
        .unwrap_err();
        assert_eq!(err, Error::InvalidBuffer);
    }

    #[test]
    fn test_workgroup_count_sites() {
        let (device, bo) = test_device();
        let mut job = Job::new(device.clone(), JobKind::gpu_csd());
        let push = [0u8; MAX_PUSH_CONSTANTS_SIZE];
        let dynamic = DynamicState::default();
        let descriptors = DescriptorState::default();
        let ctx = UniformContext {
            push_constants: &push,
            descriptors: &descriptors,
            dynamic: &dynamic,
            view_index: 0,
            wg_count: [4, 5, 6],
            shared_memory: None,
        };
        let stream = write_uniforms(
            &mut job,
            &ctx,
            &variant(&[
                Uniform::Constant(0),
                Uniform::WorkgroupCount(0),
                Uniform::WorkgroupCount(2),
            ]),
        )
        .unwrap();

        let [x, y, z] = stream.wg_count_sites;
        assert_eq!(x, Some(stream.site.add(4)));
        assert_eq!(y, None);
        assert_eq!(read(&job, z.unwrap()), 6);

        let csd = job.csd_mut().unwrap();
        csd.indirect.patch_u32(&*bo, x.unwrap(), 9).unwrap();
        assert_eq!(csd.indirect.read_u32(x.unwrap()), Some(9));
        let chunk = csd.indirect.site_bo(x.unwrap()).unwrap();
        assert_eq!(bo.read_word(chunk, x.unwrap().offset()), 9);
    }

    #[test]
    fn test_empty_stream_has_an_address() {
        let (device, _bo) = test_device();
        let mut job = Job::new(device, JobKind::gpu_cl());
        let push = [0u8; MAX_PUSH_CONSTANTS_SIZE];
        let dynamic = DynamicState::default();
        let descriptors = DescriptorState::default();
        let ctx = UniformContext {
            push_constants: &push,
            descriptors: &descriptors,
            dynamic: &dynamic,
            view_index: 0,
            wg_count: [0; 3],
            shared_memory: None,
        };
        let a = write_uniforms(&mut job, &ctx, &ShaderVariant::default()).unwrap();
        let b = write_uniforms(&mut job, &ctx, &ShaderVariant::default()).unwrap();
        assert!(!a.address.is_null());
        assert_eq!(b.site.offset(), a.site.offset() + 4);
    }
}
