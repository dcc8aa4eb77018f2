//! Reusable pixel buffers and their metadata.
//!
//! A [`PooledBuffer`] is the unit of cache storage: decoded RGBA8 pixels
//! plus logical dimensions, source orientation, and a reference count. The
//! reference count bounds the buffer's in-use window — a buffer with a
//! nonzero count is pinned: it is never mutated, never evicted, and its
//! storage is never handed back to the free pool.
//!
//! The handle is a cheap clone over shared storage. Cloning does NOT touch
//! the reference count; only cache checkout/insert/release do. The count
//! tracks logical holders (binding slots), not handle copies.

use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

/// Bytes per pixel for the RGBA8 storage format.
pub const BYTES_PER_PIXEL: usize = 4;

/// Logical pixel dimensions of a buffer or decode target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dimensions {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Dimensions {
    /// Creates a new dimensions value.
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Returns true if either dimension is zero.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Returns the RGBA8 storage size in bytes.
    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * BYTES_PER_PIXEL
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Source orientation of the decoded image, in clockwise quarter turns.
///
/// Orientation is metadata only: buffers store pixels as decoded, and the
/// rendering collaborator applies the rotation when drawing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Orientation {
    /// Upright.
    #[default]
    Deg0,
    /// Rotated 90 degrees clockwise.
    Deg90,
    /// Rotated 180 degrees.
    Deg180,
    /// Rotated 270 degrees clockwise.
    Deg270,
}

impl Orientation {
    /// Returns the rotation in degrees.
    pub fn degrees(&self) -> u16 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg270 => 270,
        }
    }
}

struct BufferInner {
    pixels: Vec<u8>,
    dims: Dimensions,
    orientation: Orientation,
    refs: AtomicI32,
}

/// A reference-counted, reusable pixel buffer.
///
/// Created by a decode worker on success, installed into the
/// [`BufferCache`](crate::cache::BufferCache) by the controller that
/// requested it, and destroyed (or its storage recycled) only once it has
/// been evicted with zero outstanding references.
#[derive(Clone)]
pub struct PooledBuffer {
    inner: Arc<BufferInner>,
}

impl PooledBuffer {
    /// Creates a buffer from decoded pixels. The reference count starts at
    /// zero; the cache seeds it on insert.
    ///
    /// `pixels` must hold exactly `dims.byte_len()` bytes of RGBA8 data.
    pub fn new(pixels: Vec<u8>, dims: Dimensions, orientation: Orientation) -> Self {
        debug_assert_eq!(pixels.len(), dims.byte_len());
        Self {
            inner: Arc::new(BufferInner {
                pixels,
                dims,
                orientation,
                refs: AtomicI32::new(0),
            }),
        }
    }

    /// Returns the raw RGBA8 pixel data.
    pub fn pixels(&self) -> &[u8] {
        &self.inner.pixels
    }

    /// Returns the logical dimensions.
    pub fn dims(&self) -> Dimensions {
        self.inner.dims
    }

    /// Returns the logical width in pixels.
    pub fn logical_width(&self) -> u32 {
        self.inner.dims.width
    }

    /// Returns the logical height in pixels.
    pub fn logical_height(&self) -> u32 {
        self.inner.dims.height
    }

    /// Returns the source orientation.
    pub fn orientation(&self) -> Orientation {
        self.inner.orientation
    }

    /// Returns the storage size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.inner.pixels.len()
    }

    /// Returns the current reference count.
    pub fn ref_count(&self) -> i32 {
        self.inner.refs.load(Ordering::Acquire)
    }

    /// Returns true if the two handles share the same storage.
    pub fn same_buffer(&self, other: &PooledBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Increments the reference count, pinning the buffer.
    pub(crate) fn acquire(&self) {
        self.inner.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrements the reference count.
    ///
    /// Returns the new count, or `None` if the count was already zero — an
    /// over-release, which the caller must surface as a reference-counting
    /// bug rather than tolerate.
    pub(crate) fn release(&self) -> Option<i32> {
        let mut current = self.inner.refs.load(Ordering::Acquire);
        loop {
            if current <= 0 {
                return None;
            }
            match self.inner.refs.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(current - 1),
                Err(observed) => current = observed,
            }
        }
    }

    /// Consumes the handle and reclaims the pixel storage for reuse.
    ///
    /// Succeeds only if this is the last handle and the reference count is
    /// zero; otherwise the handle is simply dropped and `None` is returned.
    pub(crate) fn try_reclaim_storage(self) -> Option<Vec<u8>> {
        if self.ref_count() != 0 {
            return None;
        }
        match Arc::try_unwrap(self.inner) {
            Ok(inner) => Some(inner.pixels),
            Err(_) => None,
        }
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("dims", &self.inner.dims)
            .field("orientation", &self.inner.orientation)
            .field("refs", &self.ref_count())
            .field("size_bytes", &self.size_bytes())
            .finish()
    }
}
