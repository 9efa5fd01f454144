use core::ptr::NonNull;

use crate::GRANULARITY;

/// Round `size` up to the next multiple of [`GRANULARITY`]. Returns `None` on
/// overflow.
#[inline]
pub fn round_up_to_granularity(size: usize) -> Option<usize> {
    Some(size.checked_add(GRANULARITY - 1)? & !(GRANULARITY - 1))
}

/// Round `size` down to a multiple of [`GRANULARITY`].
#[inline]
pub fn round_down_to_granularity(size: usize) -> usize {
    size & !(GRANULARITY - 1)
}

/// Shrink a memory block so that it starts at a [`GRANULARITY`]-byte boundary
/// and its length is a multiple of [`GRANULARITY`].
///
/// Returns the new starting pointer and length. The length may be zero. The
/// returned pointer is derived from `ptr`.
#[inline]
pub fn granular_subrange(ptr: NonNull<[u8]>) -> (NonNull<u8>, usize) {
    let start = ptr.cast::<u8>();
    let len = ptr.len();
    let offset = start.as_ptr().align_offset(GRANULARITY);

    if offset > len {
        return (start, 0);
    }

    // Safety: `offset <= len`, so the result is inside `ptr` or one past its
    //         end, which cannot be null
    let aligned = unsafe { NonNull::new_unchecked(start.as_ptr().wrapping_add(offset)) };
    (aligned, round_down_to_granularity(len - offset))
}
