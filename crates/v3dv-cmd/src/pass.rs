//! # Render Passes and Framebuffers
//!
//! The render pass description the recorder walks subpass by subpass, the
//! framebuffer it renders into, and the per-attachment clear state kept
//! while a pass is active.

use alloc::sync::Arc;
use alloc::vec::Vec;

use v3dv_core::{Bo, Rect2D};

use crate::tiling::InternalBpp;

/// Attachment index meaning "no attachment"
pub const ATTACHMENT_UNUSED: u32 = u32::MAX;

bitflags::bitflags! {
    /// Image aspects of an attachment
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ImageAspectFlags: u32 {
        /// Color
        const COLOR = 1 << 0;
        /// Depth
        const DEPTH = 1 << 1;
        /// Stencil
        const STENCIL = 1 << 2;
    }
}

/// What happens to an attachment at the start of its first subpass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadOp {
    /// Keep the contents
    #[default]
    Load,
    /// Clear to the supplied value
    Clear,
    /// Contents undefined
    DontCare,
}

/// Render pass attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttachmentDescription {
    /// Sample count
    pub samples: u32,
    /// Load op of color or depth
    pub load_op: LoadOp,
    /// Load op of stencil
    pub stencil_load_op: LoadOp,
    /// Aspects of the attachment's format
    pub aspects: ImageAspectFlags,
}

/// One subpass of a render pass
#[derive(Debug, Clone, Default)]
pub struct Subpass {
    /// Color attachment indices, [`ATTACHMENT_UNUSED`] for holes
    pub color_attachments: Vec<u32>,
    /// Resolve attachment indices
    pub resolve_attachments: Vec<u32>,
    /// Depth/stencil attachment index
    pub ds_attachment: u32,
    /// Multiview mask, zero without multiview
    pub view_mask: u32,
}

impl Subpass {
    /// Whether any resolve attachment is in use
    pub fn has_resolves(&self) -> bool {
        self.resolve_attachments
            .iter()
            .any(|&a| a != ATTACHMENT_UNUSED)
    }

    fn used_colors(&self) -> impl Iterator<Item = u32> + '_ {
        self.color_attachments
            .iter()
            .copied()
            .filter(|&a| a != ATTACHMENT_UNUSED)
    }

    /// Whether every used color attachment of `self` is used by `other`
    pub fn colors_subset_of(&self, other: &Subpass) -> bool {
        self.used_colors()
            .all(|a| other.color_attachments.contains(&a))
    }
}

/// Render pass
#[derive(Debug, Clone, Default)]
pub struct RenderPass {
    /// Attachments
    pub attachments: Vec<AttachmentDescription>,
    /// Subpasses
    pub subpasses: Vec<Subpass>,
    /// Any subpass has a non-zero view mask
    pub multiview_enabled: bool,
}

impl RenderPass {
    /// Subpass `idx`
    pub fn subpass(&self, idx: u32) -> Option<&Subpass> {
        self.subpasses.get(idx as usize)
    }
}

/// Image view bound to a framebuffer slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferAttachment {
    /// Backing buffer object
    pub bo: Bo,
    /// Internal bpp of the view's format in the tile buffer
    pub internal_bpp: InternalBpp,
    /// Sample count of the image
    pub samples: u32,
    /// Aspects of the view
    pub aspects: ImageAspectFlags,
}

/// Framebuffer
#[derive(Debug, Clone, Default)]
pub struct Framebuffer {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Layers
    pub layers: u32,
    /// Every attachment is padded out to whole tiles
    pub has_edge_padding: bool,
    /// Attachments
    pub attachments: Vec<FramebufferAttachment>,
}

/// Clear value
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ClearValue {
    /// Not cleared
    #[default]
    None,
    /// Color
    Color([u32; 4]),
    /// Depth and stencil
    DepthStencil {
        /// Depth
        depth: f32,
        /// Stencil
        stencil: u32,
    },
}

/// Per-attachment state while a render pass is active
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AttachmentState {
    /// Value applied by the first subpass that uses the attachment
    pub clear_value: ClearValue,
}

/// Arguments of `begin_render_pass`
#[derive(Debug, Clone)]
pub struct RenderPassBeginInfo {
    /// Render pass
    pub pass: Arc<RenderPass>,
    /// Framebuffer
    pub framebuffer: Arc<Framebuffer>,
    /// Render area
    pub render_area: Rect2D,
    /// Clear values indexed by attachment
    pub clear_values: Vec<ClearValue>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn subpass(colors: &[u32]) -> Subpass {
        Subpass {
            color_attachments: colors.to_vec(),
            ds_attachment: ATTACHMENT_UNUSED,
            ..Subpass::default()
        }
    }

    #[test]
    fn test_colors_subset_ignores_unused() {
        let a = subpass(&[0, ATTACHMENT_UNUSED]);
        let b = subpass(&[ATTACHMENT_UNUSED, 0]);
        assert!(a.colors_subset_of(&b));
        assert!(b.colors_subset_of(&a));

        let c = subpass(&[0, 1]);
        assert!(a.colors_subset_of(&c));
        assert!(!c.colors_subset_of(&a));
    }

    #[test]
    fn test_has_resolves() {
        let mut s = subpass(&[0]);
        assert!(!s.has_resolves());
        s.resolve_attachments = vec![ATTACHMENT_UNUSED];
        assert!(!s.has_resolves());
        s.resolve_attachments = vec![1];
        assert!(s.has_resolves());
    }
}
