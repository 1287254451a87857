//! Aligned I/O buffers.
//!
//! Direct I/O requires the buffer address, the file offset and the length
//! to be multiples of the device's logical block size. `AlignedBuf` owns a
//! zeroed heap allocation with a caller-chosen alignment so the same buffer
//! can be handed to `pread`/`pwrite` on an `O_DIRECT` descriptor or to the
//! kernel AIO engines.
//!
//! The allocation never moves while the `AlignedBuf` is alive, even when the
//! `AlignedBuf` value itself is moved. The AIO path relies on this: the
//! kernel holds the raw pointer until the operation completes.

use std::alloc::{self, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

/// Heap buffer with a fixed alignment.
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

// Safety: AlignedBuf uniquely owns its allocation, like Vec<u8>.
unsafe impl Send for AlignedBuf {}
unsafe impl Sync for AlignedBuf {}

impl AlignedBuf {
    /// Allocate `len` zeroed bytes aligned to `align` (a power of two).
    ///
    /// Panics if `align` is not a power of two, like `Layout` itself.
    pub fn zeroed(len: usize, align: usize) -> Self {
        // Zero-length allocations are not allowed; keep one aligned unit.
        let size = len.max(align).max(1);
        let layout = Layout::from_size_align(size, align).expect("invalid buffer alignment");
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = match NonNull::new(raw) {
            Some(p) => p,
            None => alloc::handle_alloc_error(layout),
        };
        Self { ptr, len, layout }
    }

    /// Allocate an aligned copy of `data`.
    pub fn copy_from(data: &[u8], align: usize) -> Self {
        let mut buf = Self::zeroed(data.len(), align);
        buf.copy_from_slice(data);
        buf
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn align(&self) -> usize {
        self.layout.align()
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Deref for AlignedBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for AlignedBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl std::fmt::Debug for AlignedBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuf")
            .field("len", &self.len)
            .field("align", &self.layout.align())
            .finish()
    }
}

/// Round `v` down to a multiple of `align` (a power of two).
#[inline]
pub fn align_down(v: u64, align: u64) -> u64 {
    v & !(align - 1)
}

/// Round `v` up to a multiple of `align` (a power of two).
#[inline]
pub fn align_up(v: u64, align: u64) -> u64 {
    (v + align - 1) & !(align - 1)
}
