use core::ptr::{self, NonNull};

use super::{BulkSource, Init};
use crate::GRANULARITY;

/// Obtains memory blocks from the kernel through anonymous private memory
/// mappings.
///
/// Every request is rounded up to the system's memory page size. The
/// mappings are never unmapped.
#[derive(Debug, Default, Clone, Copy)]
pub struct MmapSource {
    /// The page size minus one, or zero until the first request.
    page_size_m1: usize,
}

impl Init for MmapSource {
    const INIT: Self = Self::new();
}

impl MmapSource {
    /// Construct an `MmapSource`.
    #[inline]
    pub const fn new() -> Self {
        Self { page_size_m1: 0 }
    }

    /// Get the memory page size, or `None` if it's unusable.
    #[cold]
    fn page_size() -> Option<usize> {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if page_size <= 0 {
            return None;
        }
        let page_size = page_size as usize;

        // Such a page size is quite unusual.
        if !page_size.is_power_of_two() || page_size < GRANULARITY {
            return None;
        }

        Some(page_size)
    }
}

unsafe impl BulkSource for MmapSource {
    unsafe fn alloc(&mut self, min_size: usize) -> Option<NonNull<[u8]>> {
        if self.page_size_m1 == 0 {
            self.page_size_m1 = Self::page_size()? - 1;
        }
        let page_size_m1 = self.page_size_m1;
        let num_bytes = min_size.checked_add(page_size_m1)? & !page_size_m1;

        let ptr = libc::mmap(
            ptr::null_mut(),
            num_bytes,
            libc::PROT_WRITE | libc::PROT_READ,
            libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
            -1,
            0,
        );

        if ptr == libc::MAP_FAILED {
            log::debug!("mmap({}) failed", num_bytes);
            return None;
        }

        NonNull::new(ptr::slice_from_raw_parts_mut(ptr as *mut u8, num_bytes))
    }
}
