//! Bulk memory sources
use core::{
    alloc::{GlobalAlloc, Layout},
    fmt,
    marker::PhantomData,
    mem::MaybeUninit,
    ptr::{self, NonNull},
};

use crate::{utils::round_up_to_granularity, GRANULARITY};

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use self::unix::MmapSource;
    }
}

/// Provides a constant default value.
///
/// This makes it possible to build a [`FreeList`](crate::FreeList) and its
/// bulk source in a `const` context.
pub trait Init {
    /// `Self`'s default value.
    const INIT: Self;
}

#[cfg(any(test, feature = "std"))]
#[cfg_attr(feature = "doc_cfg", doc(cfg(feature = "std")))]
impl Init for std::alloc::System {
    const INIT: Self = Self;
}

/// The trait for bulk memory sources, from which a
/// [`FreeList`](crate::FreeList) obtains new backing storage when no free
/// block can satisfy a request.
///
/// Memory blocks are never returned to the source.
///
/// # Safety
///
/// A memory block returned by [`Self::alloc`] must be valid for reads and
/// writes, must not overlap any other block returned by `self`, and must
/// remain valid until `self` is dropped. Its ownership is transferred to the
/// caller.
pub unsafe trait BulkSource {
    /// Allocate a memory block of at least `min_size` bytes.
    ///
    /// Blocks should start at a [`GRANULARITY`]-byte boundary and have a
    /// length that is a multiple of [`GRANULARITY`]. Anything outside the
    /// largest such sub-range is left unused.
    ///
    /// # Safety
    ///
    /// `min_size` must not be zero.
    unsafe fn alloc(&mut self, min_size: usize) -> Option<NonNull<[u8]>>;
}

/// Carves memory blocks out of a caller-provided memory pool, front to back.
///
/// Consecutive memory blocks are contiguous, so they coalesce with each
/// other once they are on a free list.
pub struct PoolSource<'pool> {
    base: NonNull<u8>,
    capacity: usize,
    used: usize,
    _phantom: PhantomData<&'pool mut [MaybeUninit<u8>]>,
}

// Safety: `PoolSource` logically owns the unused part of the pool
unsafe impl Send for PoolSource<'_> {}

impl<'pool> PoolSource<'pool> {
    /// Construct a `PoolSource` serving memory from `pool`.
    ///
    /// Up to `GRANULARITY - 1` bytes at each end of `pool` may go unused so
    /// that every memory block is aligned.
    pub fn new(pool: &'pool mut [MaybeUninit<u8>]) -> Self {
        let len = pool.len();
        let start = pool.as_mut_ptr() as *mut u8;
        let offset = start.align_offset(GRANULARITY);

        let (base, capacity) = if offset <= len {
            (
                start.wrapping_add(offset),
                (len - offset) & !(GRANULARITY - 1),
            )
        } else {
            (start, 0)
        };

        Self {
            // A slice pointer is never null
            base: NonNull::new(base).unwrap_or_else(NonNull::dangling),
            capacity,
            used: 0,
            _phantom: PhantomData,
        }
    }

    /// Get the number of bytes that have not been handed out yet.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.capacity - self.used
    }
}

impl fmt::Debug for PoolSource<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolSource")
            .field("base", &self.base)
            .field("capacity", &self.capacity)
            .field("used", &self.used)
            .finish()
    }
}

unsafe impl BulkSource for PoolSource<'_> {
    unsafe fn alloc(&mut self, min_size: usize) -> Option<NonNull<[u8]>> {
        let len = round_up_to_granularity(min_size)?;
        if len > self.remaining() {
            return None;
        }

        let start = self.base.as_ptr().add(self.used);
        self.used += len;

        NonNull::new(ptr::slice_from_raw_parts_mut(start, len))
    }
}

/// Wraps [`core::alloc::GlobalAlloc`] to implement [`BulkSource`].
///
/// Memory blocks are allocated with an alignment of
/// `max(ALIGN, GRANULARITY)` bytes and are never deallocated.
#[derive(Debug, Default)]
pub struct GlobalAllocAsBulkSource<T, const ALIGN: usize>(pub T);

impl<T: Init, const ALIGN: usize> Init for GlobalAllocAsBulkSource<T, ALIGN> {
    const INIT: Self = Self(Init::INIT);
}

impl<T, const ALIGN: usize> GlobalAllocAsBulkSource<T, ALIGN> {
    const BLOCK_ALIGN: usize = if ALIGN > GRANULARITY {
        ALIGN
    } else {
        GRANULARITY
    };
}

unsafe impl<T: GlobalAlloc, const ALIGN: usize> BulkSource for GlobalAllocAsBulkSource<T, ALIGN> {
    unsafe fn alloc(&mut self, min_size: usize) -> Option<NonNull<[u8]>> {
        let len = round_up_to_granularity(min_size)?;
        let layout = Layout::from_size_align(len, Self::BLOCK_ALIGN).ok()?;
        let start = NonNull::new(self.0.alloc(layout))?;
        NonNull::new(ptr::slice_from_raw_parts_mut(start.as_ptr(), len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_source_hands_out_contiguous_blocks() {
        let mut pool = std::vec![MaybeUninit::<u8>::uninit(); 256];
        let mut source = PoolSource::new(&mut pool);
        let capacity = source.remaining();
        assert!(capacity >= 256 - 2 * GRANULARITY);
        assert_eq!(capacity % GRANULARITY, 0);

        let first = unsafe { source.alloc(20) }.unwrap();
        let second = unsafe { source.alloc(16) }.unwrap();
        log::trace!("first = {:?}, second = {:?}", first, second);

        assert_eq!(first.len(), 32);
        assert_eq!(second.len(), 16);
        assert_eq!(first.cast::<u8>().as_ptr() as usize % GRANULARITY, 0);
        assert_eq!(
            first.cast::<u8>().as_ptr() as usize + 32,
            second.cast::<u8>().as_ptr() as usize
        );
        assert_eq!(source.remaining(), capacity - 48);
    }

    #[test]
    fn pool_source_exhaustion() {
        let mut pool = std::vec![MaybeUninit::<u8>::uninit(); 128];
        let mut source = PoolSource::new(&mut pool);
        let capacity = source.remaining();

        assert!(unsafe { source.alloc(capacity + 1) }.is_none());
        assert_eq!(source.remaining(), capacity);
        assert!(unsafe { source.alloc(capacity) }.is_some());
        assert_eq!(source.remaining(), 0);
        assert!(unsafe { source.alloc(1) }.is_none());
    }

    #[test]
    fn pool_source_empty_pool() {
        let mut pool: [MaybeUninit<u8>; 0] = [];
        let mut source = PoolSource::new(&mut pool);
        assert_eq!(source.remaining(), 0);
        assert!(unsafe { source.alloc(1) }.is_none());
    }

    #[test]
    fn global_alloc_source_alignment() {
        let mut source = GlobalAllocAsBulkSource::<std::alloc::System, 64>::INIT;
        let block = unsafe { source.alloc(100) }.unwrap();
        assert_eq!(block.len(), 112);
        assert_eq!(block.cast::<u8>().as_ptr() as usize % 64, 0);
        unsafe {
            std::alloc::System.dealloc(
                block.cast().as_ptr(),
                Layout::from_size_align(112, 64).unwrap(),
            )
        };
    }

    #[test]
    fn global_alloc_source_overflow() {
        let mut source = GlobalAllocAsBulkSource::<std::alloc::System, 1>::INIT;
        assert!(unsafe { source.alloc(usize::MAX - 8) }.is_none());
    }
}
