//! # Control Lists
//!
//! A control list is a chain of buffer-object backed chunks that packets
//! are appended to. Binning and render lists chain chunks with a branch
//! packet; the indirect list hands out aligned regions for shader records
//! and uniform streams, which never need to be contiguous.
//!
//! Chunk contents are kept in a CPU shadow until [`ControlList::upload`]
//! copies them into their buffer objects.

use alloc::vec::Vec;

use v3dv_core::{align_u32, Bo, BoManager, Error, GpuAddr, Result};

use crate::bo_set::BufferObjectSet;
use crate::device::Device;
use crate::packet::{packet_len, Packet, PacketBytes};

/// A location inside a control list that can be rewritten later
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PatchSite {
    chunk: u32,
    offset: u32,
}

impl PatchSite {
    /// Site `delta` bytes further into the same chunk
    #[inline]
    pub const fn add(self, delta: u32) -> Self {
        Self {
            chunk: self.chunk,
            offset: self.offset + delta,
        }
    }

    /// Byte offset inside its chunk
    #[inline]
    pub const fn offset(self) -> u32 {
        self.offset
    }
}

/// Chained control list
#[derive(Debug, Default)]
pub struct ControlList {
    bo_list: Vec<Bo>,
    chunks: Vec<Vec<u8>>,
}

impl ControlList {
    /// Create an empty list; no memory is allocated until first use
    pub const fn new() -> Self {
        Self {
            bo_list: Vec::new(),
            chunks: Vec::new(),
        }
    }

    /// Bytes written into the current chunk
    pub fn offset(&self) -> u32 {
        self.chunks.last().map_or(0, |c| c.len() as u32)
    }

    /// Whether nothing has been written
    pub fn is_empty(&self) -> bool {
        self.chunks.iter().all(|c| c.is_empty())
    }

    /// Total bytes written over all chunks
    pub fn size(&self) -> u32 {
        self.chunks.iter().map(|c| c.len() as u32).sum()
    }

    /// Address of the first byte of the list
    pub fn start(&self) -> Option<GpuAddr> {
        self.bo_list.first().map(|bo| bo.offset)
    }

    /// Address the next packet will be written to
    pub fn address(&self) -> GpuAddr {
        match self.bo_list.last() {
            Some(bo) => bo.address(self.offset()),
            None => GpuAddr::NULL,
        }
    }

    /// Backing buffer objects, one per chunk
    pub fn bos(&self) -> &[Bo] {
        &self.bo_list
    }

    /// Contents of chunk `index`
    pub fn chunk(&self, index: usize) -> &[u8] {
        self.chunks.get(index).map_or(&[], |c| c.as_slice())
    }

    /// Last byte written
    pub fn last_byte(&self) -> Option<u8> {
        self.chunks.last().and_then(|c| c.last().copied())
    }

    fn remaining(&self) -> u32 {
        match self.bo_list.last() {
            Some(bo) => bo.size - self.offset(),
            None => 0,
        }
    }

    fn alloc_chunk(
        &mut self,
        device: &Device,
        bos: &mut BufferObjectSet,
        space: u32,
        branch: Option<u32>,
    ) -> Result<()> {
        let unaligned = space + branch.unwrap_or(0);
        let size = align_u32(unaligned, 4096).max(device.options.cl_chunk_size);

        self.bo_list.try_reserve(1)?;
        self.chunks.try_reserve(1)?;

        let bo = device.bo().alloc(size, "CL")?;
        let mut data = Vec::new();
        let tracked = data
            .try_reserve(size as usize)
            .map_err(Error::from)
            .and_then(|()| bos.add_new(bo));
        if let Err(e) = tracked {
            device.bo().free(bo);
            return Err(e);
        }

        // Chain the previous chunk to the new one
        if branch.is_some() && !self.chunks.is_empty() {
            let mut bytes = PacketBytes::new();
            device.encoder().encode(&Packet::Branch(bo.offset), &mut bytes);
            self.push_unchecked(&bytes);
        }

        log::trace!("cl: new {} byte chunk at {}", size, bo.offset);
        self.bo_list.push(bo);
        self.chunks.push(data);
        Ok(())
    }

    fn push_unchecked(&mut self, bytes: &[u8]) {
        if let Some(chunk) = self.chunks.last_mut() {
            chunk.extend_from_slice(bytes);
        }
    }

    /// Make room for `space` bytes plus a trailing branch packet
    pub fn ensure_space_with_branch(
        &mut self,
        device: &Device,
        bos: &mut BufferObjectSet,
        space: u32,
    ) -> Result<()> {
        let branch = packet_len(device.encoder(), &Packet::Branch(GpuAddr::NULL));
        if !self.chunks.is_empty() && space + branch <= self.remaining() {
            return Ok(());
        }
        self.alloc_chunk(device, bos, space, Some(branch))
    }

    /// Claim `space` zeroed bytes at `alignment`, without chaining
    ///
    /// Returns the site of the first claimed byte.
    pub fn ensure_space(
        &mut self,
        device: &Device,
        bos: &mut BufferObjectSet,
        space: u32,
        alignment: u32,
    ) -> Result<PatchSite> {
        let aligned = align_u32(self.offset(), alignment);
        let fits = self
            .bo_list
            .last()
            .is_some_and(|bo| aligned + space <= bo.size);
        let start = if fits {
            aligned
        } else {
            self.alloc_chunk(device, bos, space, None)?;
            0
        };

        let chunk_index = self.chunks.len() - 1;
        let chunk = &mut self.chunks[chunk_index];
        chunk.resize((start + space) as usize, 0);
        Ok(PatchSite {
            chunk: chunk_index as u32,
            offset: start,
        })
    }

    /// Append a packet, growing the list if needed
    pub fn emit(
        &mut self,
        device: &Device,
        bos: &mut BufferObjectSet,
        packet: &Packet<'_>,
    ) -> Result<()> {
        let mut bytes = PacketBytes::new();
        device.encoder().encode(packet, &mut bytes);
        self.emit_bytes(device, bos, &bytes)
    }

    /// Append pre-encoded bytes, growing the list if needed
    pub fn emit_bytes(
        &mut self,
        device: &Device,
        bos: &mut BufferObjectSet,
        bytes: &[u8],
    ) -> Result<()> {
        self.ensure_space_with_branch(device, bos, bytes.len() as u32)?;
        self.push_unchecked(bytes);
        Ok(())
    }

    /// GPU address of `site`
    pub fn site_address(&self, site: PatchSite) -> GpuAddr {
        match self.bo_list.get(site.chunk as usize) {
            Some(bo) => bo.address(site.offset),
            None => GpuAddr::NULL,
        }
    }

    /// Copy `bytes` over previously claimed space at `site`
    pub fn write_at(&mut self, site: PatchSite, bytes: &[u8]) -> Result<()> {
        let start = site.offset as usize;
        let end = start + bytes.len();
        match self.chunks.get_mut(site.chunk as usize) {
            Some(chunk) if end <= chunk.len() => {
                chunk[start..end].copy_from_slice(bytes);
                Ok(())
            }
            _ => Err(Error::InvalidBuffer),
        }
    }

    /// Read the word at `site`
    pub fn read_u32(&self, site: PatchSite) -> Option<u32> {
        let start = site.offset as usize;
        let chunk = self.chunks.get(site.chunk as usize)?;
        let bytes = chunk.get(start..start + 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Rewrite the word at `site` in the shadow and in its buffer object
    ///
    /// The caller must have waited for the GPU to stop reading the chunk.
    pub fn patch_u32(&mut self, bo_mgr: &dyn BoManager, site: PatchSite, value: u32) -> Result<()> {
        let bytes = value.to_le_bytes();
        self.write_at(site, &bytes)?;
        let bo = self
            .bo_list
            .get(site.chunk as usize)
            .copied()
            .ok_or(Error::InvalidBuffer)?;
        bo_mgr.write(bo, site.offset, &bytes)
    }

    /// Buffer object backing `site`
    pub fn site_bo(&self, site: PatchSite) -> Option<Bo> {
        self.bo_list.get(site.chunk as usize).copied()
    }

    /// Copy every chunk into its buffer object
    pub fn upload(&self, bo_mgr: &dyn BoManager) -> Result<()> {
        for (bo, data) in self.bo_list.iter().zip(self.chunks.iter()) {
            if !data.is_empty() {
                bo_mgr.write(*bo, 0, data)?;
            }
        }
        Ok(())
    }

    /// Free every chunk
    pub(crate) fn release(&mut self, bo_mgr: &dyn BoManager) {
        for bo in self.bo_list.drain(..) {
            bo_mgr.free(bo);
        }
        self.chunks.clear();
    }
}
