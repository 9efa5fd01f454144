//! This crate implements a dynamic memory allocator based on an
//! address-ordered free list with first-fit allocation and immediate
//! coalescing.
//!
//!  - **Simple and predictable.** Allocation picks the lowest-addressed free
//!    block that is large enough and splits off the rest. Deallocation puts
//!    the block back in address order and merges it with whichever neighbors
//!    it touches, so the free list never contains two adjacent blocks.
//!
//!  - **The backing memory is provided by a bulk source¹.** The allocator
//!    requests large chunks from a [`BulkSource`] when it runs out of free
//!    blocks. Examples of bulk sources include: a caller-provided memory
//!    pool ([`PoolSource`]), any global allocator
//!    ([`GlobalAllocAsBulkSource`]), anonymous memory mappings
//!    ([`MmapSource`], Unix only).
//!
//!  - **This crate supports `#![no_std]`.**
//!
//! <sub>¹ The allocator never returns memory to the bulk source. Each chunk,
//! once obtained, is managed by the allocator until the allocator itself is
//! dropped.</sub>
//!
//! # Examples
//!
//! ```rust
//! use ffalloc::{FreeList, PoolSource, Stats, DEFAULT_CHUNK_SIZE, HEADER_SIZE};
//! use std::mem::MaybeUninit;
//!
//! let mut pool = [MaybeUninit::uninit(); 65536];
//! let mut heap: FreeList<PoolSource<'_>> = FreeList::new(PoolSource::new(&mut pool));
//!
//! // 100 bytes are rounded up to 112 bytes. The first request makes the
//! // allocator obtain a chunk of `DEFAULT_CHUNK_SIZE` bytes.
//! let ptr = heap.acquire(100).unwrap();
//! assert_eq!(
//!     heap.stats(),
//!     Stats {
//!         total_obtained: DEFAULT_CHUNK_SIZE,
//!         total_free: DEFAULT_CHUNK_SIZE - 112 - HEADER_SIZE,
//!         free_block_count: 1,
//!     }
//! );
//!
//! unsafe {
//!     *ptr.cast::<u64>().as_mut() = 42;
//!     heap.release(ptr);
//! }
//!
//! // The block is merged back into the rest of the chunk. The only free
//! // block now spans the whole chunk, header included.
//! assert_eq!(heap.stats().total_free, DEFAULT_CHUNK_SIZE);
//! assert_eq!(heap.stats().free_block_count, 1);
//! ```
//!
//! # Details
//!
//! ## Misuse
//!
//! Releasing a pointer that was not returned by the same allocator, or
//! releasing a pointer twice, is undefined behavior. Builds with
//! `debug_assertions` tag allocated blocks and panic on most such calls.
//! Builds without them perform no checks.
//!
#![no_std]
#![cfg_attr(feature = "doc_cfg", feature(doc_cfg))]

mod free_list;
mod source;
mod utils;
pub use self::{free_list::*, source::*};

#[cfg(any(test, feature = "std"))]
extern crate std;
