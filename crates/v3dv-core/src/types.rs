//! # V3DV Core Types
//!
//! Addresses, buffer objects, typed handles and the small geometry types
//! shared by every layer of the recording stack.

use core::fmt;
use core::marker::PhantomData;
use core::ops::Add;

// =============================================================================
// ADDRESS TYPES
// =============================================================================

/// GPU virtual address
///
/// V3D has a 32-bit address space; every address a control list can
/// reference fits in a `u32`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct GpuAddr(u32);

impl GpuAddr {
    /// Null address
    pub const NULL: Self = Self(0);

    /// Create a new GPU address
    #[inline]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// Get the raw address value
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Check if this is a null address
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Align address up to the given power-of-two alignment
    #[inline]
    pub const fn align_up(self, alignment: u32) -> Self {
        Self(align_u32(self.0, alignment))
    }

    /// Check if address is aligned
    #[inline]
    pub const fn is_aligned(self, alignment: u32) -> bool {
        self.0 & (alignment - 1) == 0
    }
}

impl Add<u32> for GpuAddr {
    type Output = Self;

    fn add(self, rhs: u32) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl fmt::Debug for GpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GpuAddr(0x{:08x})", self.0)
    }
}

impl fmt::Display for GpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// Round `value` up to a power-of-two `alignment`
#[inline]
pub const fn align_u32(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) & !(alignment - 1)
}

// =============================================================================
// BUFFER OBJECTS
// =============================================================================

/// Kernel handle of a buffer object
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct BoHandle(u32);

impl BoHandle {
    /// Wrap a raw kernel handle
    #[inline]
    pub const fn new(handle: u32) -> Self {
        Self(handle)
    }

    /// Raw kernel handle
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// A buffer object as seen by the recorder
///
/// This is a descriptor, not an owner: dropping a `Bo` releases nothing.
/// Whoever allocated it through a [`BoManager`](crate::BoManager) frees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Bo {
    /// Kernel handle
    pub handle: BoHandle,
    /// GPU address of the first byte
    pub offset: GpuAddr,
    /// Size in bytes
    pub size: u32,
}

impl Bo {
    /// Address of `offset` bytes into the object
    #[inline]
    pub fn address(&self, offset: u32) -> GpuAddr {
        self.offset + offset
    }

    /// Whether `[offset, offset + len)` lies inside the object
    #[inline]
    pub const fn contains(&self, offset: u32, len: u32) -> bool {
        match offset.checked_add(len) {
            Some(end) => end <= self.size,
            None => false,
        }
    }
}

// =============================================================================
// HANDLE TYPES
// =============================================================================

/// Generic typed handle
///
/// Ids are allocated by the owning container; zero is never handed out.
pub struct Handle<T> {
    id: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    /// Create a new handle
    #[inline]
    pub const fn new(id: u64) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    /// Create a null handle
    #[inline]
    pub const fn null() -> Self {
        Self::new(0)
    }

    /// Get the raw ID
    #[inline]
    pub const fn id(self) -> u64 {
        self.id
    }

    /// Check if null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.id == 0
    }
}

// Manual impls: derives would require `T: Clone` etc.
impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Handle<T> {}

impl<T> PartialOrd for Handle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Handle<T> {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

impl<T> core::hash::Hash for Handle<T> {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Handle<{}>(0x{:x})",
            core::any::type_name::<T>(),
            self.id
        )
    }
}

// =============================================================================
// GEOMETRY
// =============================================================================

/// Signed 2D offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Offset2D {
    /// X
    pub x: i32,
    /// Y
    pub y: i32,
}

/// Unsigned 2D extent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent2D {
    /// Width
    pub width: u32,
    /// Height
    pub height: u32,
}

impl Extent2D {
    /// Create an extent
    #[inline]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Rectangle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect2D {
    /// Top-left corner
    pub offset: Offset2D,
    /// Size
    pub extent: Extent2D,
}

impl Rect2D {
    /// Create a rectangle
    #[inline]
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            offset: Offset2D { x, y },
            extent: Extent2D { width, height },
        }
    }

    /// Exclusive right edge
    #[inline]
    pub const fn right(&self) -> i64 {
        self.offset.x as i64 + self.extent.width as i64
    }

    /// Exclusive bottom edge
    #[inline]
    pub const fn bottom(&self) -> i64 {
        self.offset.y as i64 + self.extent.height as i64
    }

    /// Whether `self` covers strictly less area than `other` on any edge
    pub const fn is_smaller_than(&self, other: &Rect2D) -> bool {
        self.offset.x > other.offset.x
            || self.offset.y > other.offset.y
            || self.right() < other.right()
            || self.bottom() < other.bottom()
    }
}

/// Viewport as supplied by the application
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Viewport {
    /// Left edge
    pub x: f32,
    /// Top edge
    pub y: f32,
    /// Width
    pub width: f32,
    /// Height
    pub height: f32,
    /// Near depth
    pub min_depth: f32,
    /// Far depth
    pub max_depth: f32,
}

// =============================================================================
// STATIC ASSERTIONS
// =============================================================================

static_assertions::assert_eq_size!(GpuAddr, u32);
static_assertions::assert_impl_all!(Bo: Send, Sync, Copy);
static_assertions::assert_impl_all!(Handle<Bo>: Send, Sync, Copy);
