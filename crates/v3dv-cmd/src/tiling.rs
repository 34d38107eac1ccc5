//! # Frame Tiling
//!
//! Tile and supertile sizing for one binned frame, and the binning memory
//! it needs.

use v3dv_core::{Error, Result};

/// Internal bits per pixel of a tile buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum InternalBpp {
    /// 32 bits per pixel
    #[default]
    Bpp32 = 0,
    /// 64 bits per pixel
    Bpp64 = 1,
    /// 128 bits per pixel
    Bpp128 = 2,
}

/// Tile sizes, largest first: (width, height)
const TILE_SIZES: [(u32, u32); 7] = [
    (64, 64),
    (64, 32),
    (32, 32),
    (32, 16),
    (16, 16),
    (16, 8),
    (8, 8),
];

/// The supertile grid of a frame must stay below this many cells
pub const MAX_SUPERTILES: u32 = 256;

/// Tile state data per tile, in bytes
pub const TILE_STATE_PER_TILE: u32 = 256;

/// Tile allocation bytes per tile requested at binning start
const TILE_ALLOC_PER_TILE: u32 = 64;

/// First two 4K chunk allocations the binner performs on its own
const TILE_ALLOC_HEADROOM: u32 = 8192;

/// Extra initial memory to avoid out-of-memory interrupts
const TILE_ALLOC_EXTRA: u32 = 512 * 1024;

// Worst case index: 3+ targets, MSAA, 128bpp
static_assertions::const_assert_eq!(2 + 2 + InternalBpp::Bpp128 as usize, TILE_SIZES.len() - 1);

/// Tile size for a render target configuration
pub fn tile_size(render_target_count: u32, msaa: bool, max_internal_bpp: InternalBpp) -> (u32, u32) {
    let mut index = 0usize;
    if render_target_count > 2 {
        index += 2;
    } else if render_target_count > 1 {
        index += 1;
    }
    if msaa {
        index += 2;
    }
    index += max_internal_bpp as usize;
    TILE_SIZES[index]
}

/// Tiling of one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FrameTiling {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Layers
    pub layers: u32,
    /// Color render targets
    pub render_target_count: u32,
    /// Maximum internal bpp over all render targets
    pub internal_bpp: InternalBpp,
    /// 4x multisampling
    pub msaa: bool,
    /// Tile width in pixels
    pub tile_width: u32,
    /// Tile height in pixels
    pub tile_height: u32,
    /// Tiles across
    pub draw_tiles_x: u32,
    /// Tiles down
    pub draw_tiles_y: u32,
    /// Supertile width in tiles
    pub supertile_width: u32,
    /// Supertile height in tiles
    pub supertile_height: u32,
    /// Supertiles across
    pub frame_width_in_supertiles: u32,
    /// Supertiles down
    pub frame_height_in_supertiles: u32,
}

impl FrameTiling {
    /// Compute the tiling of a frame
    pub fn compute(
        width: u32,
        height: u32,
        layers: u32,
        render_target_count: u32,
        max_internal_bpp: InternalBpp,
        msaa: bool,
    ) -> Self {
        let (tile_width, tile_height) = tile_size(render_target_count, msaa, max_internal_bpp);
        let draw_tiles_x = width.div_ceil(tile_width);
        let draw_tiles_y = height.div_ceil(tile_height);

        // Grow the smaller supertile side until the grid fits
        let mut supertile_width = 1u32;
        let mut supertile_height = 1u32;
        let (frame_width_in_supertiles, frame_height_in_supertiles) = loop {
            let fw = draw_tiles_x.div_ceil(supertile_width);
            let fh = draw_tiles_y.div_ceil(supertile_height);
            if u64::from(fw) * u64::from(fh) < u64::from(MAX_SUPERTILES) {
                break (fw, fh);
            }
            if supertile_width < supertile_height {
                supertile_width += 1;
            } else {
                supertile_height += 1;
            }
        };

        Self {
            width,
            height,
            layers,
            render_target_count,
            internal_bpp: max_internal_bpp,
            msaa,
            tile_width,
            tile_height,
            draw_tiles_x,
            draw_tiles_y,
            supertile_width,
            supertile_height,
            frame_width_in_supertiles,
            frame_height_in_supertiles,
        }
    }

    /// Number of tiles in one layer
    #[inline]
    pub const fn tile_count(&self) -> u64 {
        self.draw_tiles_x as u64 * self.draw_tiles_y as u64
    }

    /// Bytes for `per_tile` bytes of every tile of every layer
    fn per_tile_bytes(&self, per_tile: u32) -> Option<u64> {
        self.tile_count()
            .checked_mul(u64::from(self.layers))?
            .checked_mul(u64::from(per_tile))
    }

    /// Initial size of the tile allocation buffer
    ///
    /// Fails with [`Error::OutOfDeviceMemory`] when the frame needs more than
    /// a buffer object can hold.
    pub fn tile_alloc_size(&self) -> Result<u32> {
        self.per_tile_bytes(TILE_ALLOC_PER_TILE)
            .and_then(|bytes| bytes.checked_next_multiple_of(4096))
            .and_then(|bytes| bytes.checked_add(u64::from(TILE_ALLOC_HEADROOM + TILE_ALLOC_EXTRA)))
            .and_then(|bytes| u32::try_from(bytes).ok())
            .ok_or(Error::OutOfDeviceMemory)
    }

    /// Size of the tile state buffer
    pub fn tile_state_size(&self) -> Result<u32> {
        self.per_tile_bytes(TILE_STATE_PER_TILE)
            .and_then(|bytes| u32::try_from(bytes).ok())
            .ok_or(Error::OutOfDeviceMemory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_size_table() {
        assert_eq!(tile_size(1, false, InternalBpp::Bpp32), (64, 64));
        assert_eq!(tile_size(2, false, InternalBpp::Bpp32), (64, 32));
        assert_eq!(tile_size(3, false, InternalBpp::Bpp32), (32, 32));
        assert_eq!(tile_size(1, true, InternalBpp::Bpp32), (32, 32));
        assert_eq!(tile_size(1, false, InternalBpp::Bpp64), (64, 32));
        assert_eq!(tile_size(4, true, InternalBpp::Bpp128), (8, 8));
        // Zero targets behaves like one
        assert_eq!(tile_size(0, false, InternalBpp::Bpp32), (64, 64));
    }

    #[test]
    fn test_draw_tiles_round_up() {
        let t = FrameTiling::compute(1920, 1080, 1, 1, InternalBpp::Bpp32, false);
        assert_eq!(t.draw_tiles_x, 30);
        assert_eq!(t.draw_tiles_y, 17);
    }

    #[test]
    fn test_compute_is_deterministic() {
        let a = FrameTiling::compute(1280, 720, 2, 2, InternalBpp::Bpp64, true);
        let b = FrameTiling::compute(1280, 720, 2, 2, InternalBpp::Bpp64, true);
        assert_eq!(a, b);
    }

    #[test]
    fn test_supertile_grid_below_cap() {
        for &(w, h) in &[(1, 1), (64, 64), (1920, 1080), (4096, 4096), (4096, 16), (7, 4000)] {
            for rt in 0..5 {
                for &msaa in &[false, true] {
                    for bpp in [InternalBpp::Bpp32, InternalBpp::Bpp64, InternalBpp::Bpp128] {
                        let t = FrameTiling::compute(w, h, 1, rt, bpp, msaa);
                        let cells = t.frame_width_in_supertiles * t.frame_height_in_supertiles;
                        assert!(cells < MAX_SUPERTILES, "{w}x{h} rt={rt} msaa={msaa}");
                        assert_eq!(
                            t.frame_width_in_supertiles,
                            t.draw_tiles_x.div_ceil(t.supertile_width)
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_small_frame_uses_unit_supertiles() {
        let t = FrameTiling::compute(256, 256, 1, 1, InternalBpp::Bpp32, false);
        assert_eq!((t.supertile_width, t.supertile_height), (1, 1));
        assert_eq!(t.tile_count(), 16);
    }

    #[test]
    fn test_binning_memory_sizes() {
        let t = FrameTiling::compute(1920, 1080, 1, 1, InternalBpp::Bpp32, false);
        // 30 * 17 tiles * 64 bytes = 32640, rounded to 32768
        assert_eq!(t.tile_alloc_size(), Ok(32768 + 8192 + 512 * 1024));
        assert_eq!(t.tile_state_size(), Ok(30 * 17 * 256));

        let layered = FrameTiling { layers: 3, ..t };
        assert_eq!(layered.tile_state_size(), Ok(3 * 30 * 17 * 256));
    }

    #[test]
    fn test_binning_memory_too_large() {
        // 512 x 512 tiles of 8x8
        let t = FrameTiling::compute(4096, 4096, 256, 4, InternalBpp::Bpp128, true);
        assert_eq!(t.tile_count(), 262_144);
        assert_eq!(t.tile_state_size(), Err(Error::OutOfDeviceMemory));
        assert_eq!(t.tile_alloc_size(), Err(Error::OutOfDeviceMemory));

        let single = FrameTiling { layers: 1, ..t };
        assert_eq!(single.tile_state_size(), Ok(262_144 * 256));
        assert_eq!(single.tile_alloc_size(), Ok(262_144 * 64 + 8192 + 512 * 1024));
    }
}
