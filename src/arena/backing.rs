//! Page backing for the kmem arena.
//!
//! The arena does not map memory itself. It reserves one region of address
//! space and asks a [`PageBacking`] for runs of mapped pages inside it.

use alloc::alloc::{alloc, dealloc};
use alloc::vec;
use alloc::vec::Vec;
use core::alloc::Layout;

#[cfg(feature = "log")]
use log::{debug, trace};

use crate::MallocFlags;

const BITS_PER_WORD: usize = u64::BITS as usize;

/// Why [`PageBacking::map_pages`] produced no run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// No free run of that length is left in the reserved region.
    NoSpace,
    /// The region has room but physical pages are short right now. A caller
    /// that may sleep waits for pages and retries.
    Shortage,
}

/// The virtual-memory collaborator behind the kmem arena.
///
/// Every method is called with the allocator lock held and interrupts off.
///
/// # Safety
///
/// `map_pages` must return the page-aligned start of `num_pages` pages that
/// lie inside the region returned by `reserve_region`, are not part of any
/// other live run, and stay valid for reads and writes until the same run is
/// passed to `unmap_pages`. No method may sleep.
pub unsafe trait PageBacking {
    /// Reserve `size` bytes of address space. Returns `[base, limit)`.
    fn reserve_region(&mut self, size: usize) -> Option<(usize, usize)>;

    /// Map `num_pages` contiguous pages somewhere in the region.
    ///
    /// Never waits. When physical memory is short the backing returns
    /// [`MapError::Shortage`] and the allocator sleeps outside its lock
    /// before asking again, if `flags` allow it.
    fn map_pages(&mut self, num_pages: usize, flags: MallocFlags) -> Result<usize, MapError>;

    /// Unmap a run previously returned by `map_pages`.
    fn unmap_pages(&mut self, addr: usize, num_pages: usize);
}

/// A hosted backing: the region comes from the global allocator and runs are
/// handed out first-fit from a page bitmap.
pub struct HeapBacking<const PAGE_SIZE: usize = { crate::DEFAULT_PAGE_SIZE }> {
    base: usize,
    layout: Option<Layout>,
    /// One bit per page, set when the page is free.
    free_map: Vec<u64>,
    pages: usize,
    resident: usize,
    resident_limit: Option<usize>,
}

impl<const PAGE_SIZE: usize> HeapBacking<PAGE_SIZE> {
    pub const fn new() -> Self {
        Self {
            base: 0,
            layout: None,
            free_map: Vec::new(),
            pages: 0,
            resident: 0,
            resident_limit: None,
        }
    }

    /// Cap the number of pages mapped at once, modelling scarce physical memory.
    pub const fn with_resident_limit(mut self, pages: usize) -> Self {
        self.resident_limit = Some(pages);
        self
    }

    /// Pages currently mapped.
    pub fn resident_pages(&self) -> usize {
        self.resident
    }

    fn is_free(&self, page: usize) -> bool {
        self.free_map[page / BITS_PER_WORD] & (1u64 << (page % BITS_PER_WORD)) != 0
    }

    fn set_free(&mut self, page: usize, free: bool) {
        let mask = 1u64 << (page % BITS_PER_WORD);
        if free {
            self.free_map[page / BITS_PER_WORD] |= mask;
        } else {
            self.free_map[page / BITS_PER_WORD] &= !mask;
        }
    }

    /// First page of the lowest run of `num_pages` free pages.
    fn find_run(&self, num_pages: usize) -> Option<usize> {
        let mut run_start = 0;
        let mut run_len = 0;
        let mut page = 0;
        while page < self.pages {
            if page % BITS_PER_WORD == 0 && self.free_map[page / BITS_PER_WORD] == 0 {
                run_len = 0;
                page += BITS_PER_WORD;
                continue;
            }
            if self.is_free(page) {
                if run_len == 0 {
                    run_start = page;
                }
                run_len += 1;
                if run_len == num_pages {
                    return Some(run_start);
                }
            } else {
                run_len = 0;
            }
            page += 1;
        }
        None
    }
}

impl<const PAGE_SIZE: usize> Default for HeapBacking<PAGE_SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: runs are carved from one live heap region that is only released on
// drop, and the bitmap keeps runs disjoint.
unsafe impl<const PAGE_SIZE: usize> PageBacking for HeapBacking<PAGE_SIZE> {
    fn reserve_region(&mut self, size: usize) -> Option<(usize, usize)> {
        if self.layout.is_some() || size == 0 || size % PAGE_SIZE != 0 {
            return None;
        }
        let layout = Layout::from_size_align(size, PAGE_SIZE).ok()?;
        let base = unsafe { alloc(layout) } as usize;
        if base == 0 {
            return None;
        }

        let pages = size / PAGE_SIZE;
        let mut free_map = vec![u64::MAX; pages.div_ceil(BITS_PER_WORD)];
        let rem_bits = pages % BITS_PER_WORD;
        if rem_bits != 0 {
            if let Some(last) = free_map.last_mut() {
                *last = (1u64 << rem_bits) - 1;
            }
        }

        debug!(
            "heap backing: reserved [{:#x}, {:#x}) ({} pages)",
            base,
            base + size,
            pages
        );
        self.base = base;
        self.layout = Some(layout);
        self.free_map = free_map;
        self.pages = pages;
        Some((base, base + size))
    }

    fn map_pages(&mut self, num_pages: usize, _flags: MallocFlags) -> Result<usize, MapError> {
        if num_pages == 0 || num_pages > self.pages {
            return Err(MapError::NoSpace);
        }
        if let Some(limit) = self.resident_limit {
            if num_pages > limit {
                return Err(MapError::NoSpace);
            }
            if self.resident + num_pages > limit {
                trace!(
                    "heap backing: {} + {} pages over resident limit {}",
                    self.resident,
                    num_pages,
                    limit
                );
                return Err(MapError::Shortage);
            }
        }

        let first = self.find_run(num_pages).ok_or(MapError::NoSpace)?;
        for page in first..first + num_pages {
            self.set_free(page, false);
        }
        self.resident += num_pages;
        Ok(self.base + first * PAGE_SIZE)
    }

    fn unmap_pages(&mut self, addr: usize, num_pages: usize) {
        let first = (addr - self.base) / PAGE_SIZE;
        for page in first..first + num_pages {
            debug_assert!(!self.is_free(page), "heap backing: page {} unmapped twice", page);
            self.set_free(page, true);
        }
        self.resident -= num_pages;
    }
}

impl<const PAGE_SIZE: usize> Drop for HeapBacking<PAGE_SIZE> {
    fn drop(&mut self) {
        if let Some(layout) = self.layout.take() {
            unsafe { dealloc(self.base as *mut u8, layout) };
        }
    }
}
