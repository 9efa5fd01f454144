//! The free list allocator core
use core::{
    debug_assert, debug_assert_eq, debug_assert_ne, fmt, iter::FusedIterator,
    marker::PhantomData, mem, ptr::NonNull,
};

use crate::{
    source::{BulkSource, Init},
    utils::{granular_subrange, round_up_to_granularity},
};

/// The allocation granularity.
///
/// Every payload size is rounded up to a multiple of this value, and every
/// block starts at a `GRANULARITY`-byte boundary.
pub const GRANULARITY: usize = 16;

/// The size of the header preceding every payload.
pub const HEADER_SIZE: usize = mem::size_of::<BlockHdr>();

/// The default number of bytes requested from a bulk source at once.
pub const DEFAULT_CHUNK_SIZE: usize = 16_000;

/// The header of a memory block.
///
/// The payload immediately follows this header.
#[repr(C, align(16))]
#[derive(Debug)]
struct BlockHdr {
    /// The payload size, which is a multiple of [`GRANULARITY`].
    size: usize,
    /// The next free block. Only meaningful while the block is on the free
    /// list. Set to [`ALLOCATED_MARK`] while the block is allocated.
    next: Option<NonNull<BlockHdr>>,
}

/// The value of [`BlockHdr::next`] for allocated blocks. The tag can never be
/// the address of a header because headers are aligned.
const ALLOCATED_MARK: Option<NonNull<BlockHdr>> = if cfg!(debug_assertions) {
    // Safety: `usize::MAX` is not zero
    Some(unsafe { NonNull::new_unchecked(usize::MAX as *mut BlockHdr) })
} else {
    None
};

impl BlockHdr {
    /// Get the address one past the end of the block's payload.
    #[inline]
    fn end_addr(&self) -> usize {
        self as *const Self as usize + HEADER_SIZE + self.size
    }

    /// Get the payload of a block.
    ///
    /// # Safety
    ///
    /// `block` must point to a block header inside a bulk source grant.
    #[inline]
    unsafe fn payload(block: NonNull<Self>) -> NonNull<u8> {
        NonNull::new_unchecked(block.as_ptr().cast::<u8>().add(HEADER_SIZE))
    }

    /// Get the header of the block owning `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be the payload of an allocated block.
    #[inline]
    unsafe fn from_payload(ptr: NonNull<u8>) -> NonNull<Self> {
        NonNull::new_unchecked(ptr.as_ptr().sub(HEADER_SIZE)).cast()
    }
}

/// An address-ordered, first-fit free list allocator.
///
/// # Data Structure Overview
///
#[cfg_attr(doc, doc = svgbobdoc::transform!(
/// <center>
/// ```svgbob
///   head
///    |
///    v
///   +------+------+---------+   +------+------+-----+   +------+------+---------------+
///   | size | next | payload |   | size |  -   | ... |   | size | next | payload       |
///   +------+--+---+---------+   +------+------+-----+   +------+--+---+---------------+
///             |                    allocated             ^        |
///             '------------------------------------------'        v
///                                                                None
///   low address                                                       high address
/// ```
/// </center>
))]
///
/// Every block, free or allocated, starts with a header holding the payload
/// size. Free blocks are chained through the header's `next` field in
/// ascending address order, and no two free blocks on the list are adjacent
/// in memory; such pairs are merged as soon as they appear.
///
/// # Properties
///
/// Payload sizes are rounded up to [`GRANULARITY`] bytes, and every block
/// costs an additional [`HEADER_SIZE`] bytes. When no free block is large
/// enough, the allocator obtains `CHUNK_SIZE` bytes (or exactly the needed
/// amount if the request does not fit in `CHUNK_SIZE`) from `Source`. Memory
/// is never returned to `Source`.
///
/// Allocation and deallocation take time linear in the number of free blocks.
///
/// `FreeList` is not thread-safe. All operations take `&mut self`, so shared
/// use requires external synchronization.
pub struct FreeList<Source, const CHUNK_SIZE: usize = DEFAULT_CHUNK_SIZE> {
    head: Option<NonNull<BlockHdr>>,
    total_obtained: usize,
    source: Source,
}

// Safety: All memory blocks reachable from a `FreeList` are logically owned
//         by that `FreeList`.
unsafe impl<Source: Send, const CHUNK_SIZE: usize> Send for FreeList<Source, CHUNK_SIZE> {}

/// A snapshot of a [`FreeList`]'s bookkeeping, returned by
/// [`FreeList::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
    /// The total number of bytes ever obtained from the bulk source.
    pub total_obtained: usize,
    /// The total number of bytes on the free list, including headers.
    pub total_free: usize,
    /// The number of free blocks.
    pub free_block_count: usize,
}

/// A free block, as reported by [`FreeList::free_blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlock {
    /// The address of the block header.
    pub start: usize,
    /// The payload size.
    pub size: usize,
}

impl FreeBlock {
    /// Get the address one past the end of the block.
    #[inline]
    pub fn end(&self) -> usize {
        self.start + HEADER_SIZE + self.size
    }
}

/// The error type for [`FreeList::try_acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
    /// The requested size was zero.
    ZeroSize,
    /// The bulk source could not provide enough memory, or the requested size
    /// is too large to represent.
    Exhausted,
}

impl fmt::Display for AcquireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroSize => f.write_str("requested a zero-sized block"),
            Self::Exhausted => f.write_str("the bulk memory source is exhausted"),
        }
    }
}

#[cfg(feature = "std")]
#[cfg_attr(feature = "doc_cfg", doc(cfg(feature = "std")))]
impl std::error::Error for AcquireError {}

impl<Source: Init, const CHUNK_SIZE: usize> Init for FreeList<Source, CHUNK_SIZE> {
    const INIT: Self = Self::new(Source::INIT);
}

impl<Source: Init, const CHUNK_SIZE: usize> const_default1::ConstDefault
    for FreeList<Source, CHUNK_SIZE>
{
    const DEFAULT: Self = Self::INIT;
}

impl<Source: Default, const CHUNK_SIZE: usize> Default for FreeList<Source, CHUNK_SIZE> {
    fn default() -> Self {
        Self::new(Source::default())
    }
}

impl<Source: fmt::Debug, const CHUNK_SIZE: usize> fmt::Debug for FreeList<Source, CHUNK_SIZE> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FreeList")
            .field("total_obtained", &self.total_obtained)
            .field("free_blocks", &self.free_blocks())
            .field("source", &self.source)
            .finish()
    }
}

impl<Source, const CHUNK_SIZE: usize> FreeList<Source, CHUNK_SIZE> {
    /// Evaluates successfully if the parameters are valid.
    const VALID: () = {
        assert!(
            CHUNK_SIZE % GRANULARITY == 0,
            "`CHUNK_SIZE` must be a multiple of `GRANULARITY`"
        );
        assert!(
            CHUNK_SIZE > HEADER_SIZE,
            "`CHUNK_SIZE` must be larger than `HEADER_SIZE`"
        );
    };

    /// Construct an empty `FreeList` that grows into memory provided by
    /// `source`.
    pub const fn new(source: Source) -> Self {
        let () = Self::VALID;
        Self {
            head: None,
            total_obtained: 0,
            source,
        }
    }

    /// Get a reference to the bulk source.
    #[inline]
    pub fn source(&self) -> &Source {
        &self.source
    }

    /// Get a mutable reference to the bulk source.
    ///
    /// # Safety
    ///
    /// The caller must not invalidate the memory blocks the source has
    /// already handed out.
    #[inline]
    pub unsafe fn source_mut_unchecked(&mut self) -> &mut Source {
        &mut self.source
    }

    /// Iterate over the free blocks in ascending address order.
    #[inline]
    pub fn free_blocks(&self) -> FreeBlocks<'_> {
        FreeBlocks {
            next: self.head,
            _phantom: PhantomData,
        }
    }

    /// Get the current statistics.
    ///
    /// # Time Complexity
    ///
    /// This method will complete in linear time (`O(free_block_count)`).
    pub fn stats(&self) -> Stats {
        self.free_blocks().fold(
            Stats {
                total_obtained: self.total_obtained,
                ..Stats::default()
            },
            |mut stats, block| {
                stats.total_free += HEADER_SIZE + block.size;
                stats.free_block_count += 1;
                stats
            },
        )
    }

    /// Get the usable size of an allocated block. This is the requested size
    /// rounded up to [`GRANULARITY`] bytes.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a memory block previously allocated via `self` and
    /// not released since.
    #[inline]
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        BlockHdr::from_payload(ptr).as_ref().size
    }

    /// Release a previously allocated memory block. Releasing `None` does
    /// nothing.
    ///
    /// The block is linked back in address order and merged with the
    /// neighboring free blocks it touches.
    ///
    /// # Time Complexity
    ///
    /// This method will complete in linear time (`O(free_block_count)`).
    ///
    /// # Safety
    ///
    /// `ptr` must denote a memory block previously allocated via `self` and
    /// not released since. Anything else is undefined behavior. Debug builds
    /// catch most violations with an assertion, release builds do not check.
    pub unsafe fn release(&mut self, ptr: impl Into<Option<NonNull<u8>>>) {
        let ptr = match ptr.into() {
            Some(ptr) => ptr,
            None => return,
        };

        let block = BlockHdr::from_payload(ptr);
        debug_assert_eq!(
            block.as_ref().next,
            ALLOCATED_MARK,
            "{:p} is not an allocated block",
            ptr
        );

        self.insert_and_coalesce(block);
    }

    /// Link a detached block into the free list, preserving address order,
    /// and merge it with its neighbors where they are adjacent in memory.
    ///
    /// # Safety
    ///
    /// `block` must have an initialized `size` and must not overlap any
    /// block on the free list. It becomes owned by `self`.
    unsafe fn insert_and_coalesce(&mut self, mut block: NonNull<BlockHdr>) {
        let addr = block.as_ptr() as usize;

        // Find the last free block below `block`
        let mut prev: Option<NonNull<BlockHdr>> = None;
        let mut cursor = self.head;
        while let Some(node) = cursor {
            if node.as_ptr() as usize > addr {
                break;
            }
            debug_assert_ne!(node, block, "{:p} is already free", block);
            prev = Some(node);
            cursor = node.as_ref().next;
        }

        block.as_mut().next = cursor;

        let mut current = block;
        if let Some(mut prev) = prev {
            prev.as_mut().next = Some(block);

            if prev.as_ref().end_addr() == addr {
                let size = block.as_ref().size;
                let prev = prev.as_mut();
                prev.size += HEADER_SIZE + size;
                prev.next = cursor;
                current = NonNull::from(prev);
            }
        } else {
            self.head = Some(block);
        }

        if let Some(next) = current.as_ref().next {
            if current.as_ref().end_addr() == next.as_ptr() as usize {
                let (next_size, next_next) = {
                    let next = next.as_ref();
                    (next.size, next.next)
                };
                let current = current.as_mut();
                current.size += HEADER_SIZE + next_size;
                current.next = next_next;
            }
        }
    }

    /// Find the first free block whose payload can hold `size` bytes. Returns
    /// the block and its predecessor on the list.
    fn first_fit(&self, size: usize) -> Option<(Option<NonNull<BlockHdr>>, NonNull<BlockHdr>)> {
        let mut prev = None;
        let mut cursor = self.head;
        while let Some(block) = cursor {
            // Safety: Every block on the list is owned by `self`
            let hdr = unsafe { block.as_ref() };
            if hdr.size >= size {
                return Some((prev, block));
            }
            prev = Some(block);
            cursor = hdr.next;
        }
        None
    }

    /// Shrink a free block to `size` bytes and turn the rest into a new free
    /// block following it on the list.
    ///
    /// # Safety
    ///
    /// `block` must be on the free list, and its size must exceed `size`.
    /// Both sizes must be multiples of [`GRANULARITY`].
    unsafe fn split(mut block: NonNull<BlockHdr>, size: usize) {
        let old_size = block.as_ref().size;
        debug_assert!(old_size > size);
        debug_assert_eq!((old_size - size) % GRANULARITY, 0);

        // Sizes are multiples of `GRANULARITY`, so `old_size - size` can hold
        // a header
        let remainder = BlockHdr::payload(block).as_ptr().add(size).cast::<BlockHdr>();
        remainder.write(BlockHdr {
            size: old_size - size - HEADER_SIZE,
            next: block.as_ref().next,
        });

        log::trace!(
            "split {:p} ({} bytes) into {} + {} bytes",
            block,
            old_size,
            size,
            old_size - size - HEADER_SIZE
        );

        let block = block.as_mut();
        block.size = size;
        block.next = Some(NonNull::new_unchecked(remainder));
    }

    /// Remove a block from the free list.
    ///
    /// # Safety
    ///
    /// `block` must be on the free list, and `prev` must be its predecessor.
    unsafe fn detach(&mut self, prev: Option<NonNull<BlockHdr>>, mut block: NonNull<BlockHdr>) {
        let next = block.as_ref().next;
        if let Some(mut prev) = prev {
            debug_assert_eq!(prev.as_ref().next, Some(block));
            prev.as_mut().next = next;
        } else {
            debug_assert_eq!(self.head, Some(block));
            self.head = next;
        }
        block.as_mut().next = ALLOCATED_MARK;
    }
}

impl<Source: BulkSource, const CHUNK_SIZE: usize> FreeList<Source, CHUNK_SIZE> {
    /// Attempt to allocate a block of memory with at least `size` usable
    /// bytes.
    ///
    /// Returns the starting address of the payload on success; `None` if
    /// `size` is zero or the bulk source is exhausted.
    ///
    /// # Time Complexity
    ///
    /// This method will complete in linear time (`O(free_block_count)`).
    ///
    /// # Examples
    ///
    /// ```
    /// use ffalloc::{FreeList, PoolSource};
    /// use std::mem::MaybeUninit;
    ///
    /// let mut pool = [MaybeUninit::uninit(); 65536];
    /// let mut heap: FreeList<PoolSource<'_>> = FreeList::new(PoolSource::new(&mut pool));
    ///
    /// let ptr = heap.acquire(100).unwrap();
    /// unsafe {
    ///     ptr.as_ptr().write_bytes(0x55, 100);
    ///     assert_eq!(heap.usable_size(ptr), 112);
    ///     heap.release(ptr);
    /// }
    /// assert_eq!(heap.acquire(0), None);
    /// ```
    #[inline]
    pub fn acquire(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.try_acquire(size).ok()
    }

    /// Like [`Self::acquire`] but distinguishes the reason of a failure.
    ///
    /// The free list is left untouched on failure.
    pub fn try_acquire(&mut self, size: usize) -> Result<NonNull<u8>, AcquireError> {
        if size == 0 {
            return Err(AcquireError::ZeroSize);
        }
        let size = round_up_to_granularity(size).ok_or(AcquireError::Exhausted)?;

        let (prev, block) = match self.first_fit(size) {
            Some(found) => found,
            None => {
                self.grow(size)?;
                // `grow` has inserted a block that can hold `size` bytes
                self.first_fit(size).ok_or(AcquireError::Exhausted)?
            }
        };

        // Safety: `block` is on the free list, and `prev` is its predecessor.
        //         Splitting inserts the remainder after `block`, so `prev`
        //         stays valid.
        unsafe {
            if block.as_ref().size > size {
                Self::split(block, size);
            }
            self.detach(prev, block);
            Ok(BlockHdr::payload(block))
        }
    }

    /// Obtain a memory block from the bulk source that can hold a payload of
    /// `size` bytes and put it on the free list.
    fn grow(&mut self, size: usize) -> Result<(), AcquireError> {
        let min_len = size
            .checked_add(HEADER_SIZE)
            .ok_or(AcquireError::Exhausted)?;
        let request = min_len.max(CHUNK_SIZE);

        // Safety: `request` is not zero
        let grant = match unsafe { self.source.alloc(request) } {
            Some(grant) => grant,
            None => {
                log::debug!("the bulk source could not provide {} bytes", request);
                return Err(AcquireError::Exhausted);
            }
        };

        // The bytes are taken from the source even if they turn out to be
        // unusable
        self.total_obtained += grant.len();

        let (start, len) = granular_subrange(grant);
        if len < min_len {
            log::debug!(
                "the bulk source provided {} bytes at {:p}, which is unusable for {} bytes",
                grant.len(),
                grant,
                min_len
            );
            return Err(AcquireError::Exhausted);
        }

        log::trace!(
            "obtained {} bytes at {:p} from the bulk source (requested {})",
            len,
            start,
            request
        );

        let block = start.cast::<BlockHdr>();
        // Safety: `start` is aligned and is followed by `len` bytes owned by
        //         `self`, which do not overlap any existing block
        unsafe {
            block.as_ptr().write(BlockHdr {
                size: len - HEADER_SIZE,
                next: None,
            });
            self.insert_and_coalesce(block);
        }

        Ok(())
    }
}

/// An iterator over the free blocks of a [`FreeList`], in ascending address
/// order. Created by [`FreeList::free_blocks`].
#[derive(Clone)]
pub struct FreeBlocks<'a> {
    next: Option<NonNull<BlockHdr>>,
    _phantom: PhantomData<&'a BlockHdr>,
}

impl Iterator for FreeBlocks<'_> {
    type Item = FreeBlock;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        let block = self.next?;
        // Safety: The `FreeList` is borrowed for `'a`, so its blocks are
        //         neither modified nor invalidated
        let hdr = unsafe { block.as_ref() };
        self.next = hdr.next;
        Some(FreeBlock {
            start: block.as_ptr() as usize,
            size: hdr.size,
        })
    }
}

impl FusedIterator for FreeBlocks<'_> {}

impl fmt::Debug for FreeBlocks<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.clone()).finish()
    }
}
