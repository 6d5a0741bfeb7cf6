//! Large objects: requests above `MAXALLOCSAVE`, served as whole page runs.

#[cfg(feature = "log")]
use log::trace;

use crate::arena::{MapError, PageArena, PageBacking, PageUsage};
use crate::{FreeFault, MallocFlags, MallocType, PageIndex};

/// Counters of the large-object path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LargeStats {
    /// Runs handed out, ever.
    pub calls: u64,
    pub live_runs: u64,
    pub live_pages: u64,
}

/// Allocates page runs and records them at their head page.
pub struct LargeObjectTracker {
    ceiling_pages: u32,
    stats: LargeStats,
}

impl LargeObjectTracker {
    /// A tracker refusing runs longer than `ceiling_pages`.
    pub const fn new(ceiling_pages: u32) -> Self {
        Self {
            ceiling_pages,
            stats: LargeStats {
                calls: 0,
                live_runs: 0,
                live_pages: 0,
            },
        }
    }

    pub fn stats(&self) -> LargeStats {
        self.stats
    }

    /// Largest request, in bytes, this tracker accepts.
    pub const fn ceiling_bytes(&self, page_size: usize) -> usize {
        self.ceiling_pages as usize * page_size
    }

    /// Whether a request of `size` bytes is within the ceiling.
    pub const fn admits(&self, size: usize, page_size: usize) -> bool {
        size <= self.ceiling_bytes(page_size)
    }

    /// Map `size` bytes rounded up to whole pages and record the run.
    ///
    /// Fails with [`MapError::NoSpace`] above the ceiling; otherwise passes on
    /// the arena's answer.
    pub fn alloc<B: PageBacking, const PAGE_SIZE: usize>(
        &mut self,
        arena: &mut PageArena<B, PAGE_SIZE>,
        size: usize,
        tag: MallocType,
        flags: MallocFlags,
    ) -> Result<usize, MapError> {
        if !self.admits(size, PAGE_SIZE) {
            return Err(MapError::NoSpace);
        }
        let pages = size.div_ceil(PAGE_SIZE);
        let head = arena.alloc_pages(pages, flags)?;
        *arena.usage_mut().entry_mut(head) = PageUsage::Large {
            pages: pages as u32,
            tag,
        };

        self.stats.calls += 1;
        self.stats.live_runs += 1;
        self.stats.live_pages += pages as u64;
        trace!(
            "large object: {} pages at page {} for {}",
            pages,
            head.get(),
            tag
        );
        Ok(arena.page_addr(head))
    }

    /// Unmap the run starting at `addr`. Returns the bytes released.
    ///
    /// `addr` must be the head of a run recorded by [`Self::alloc`] for `tag`.
    pub(crate) fn free<B: PageBacking, const PAGE_SIZE: usize>(
        &mut self,
        arena: &mut PageArena<B, PAGE_SIZE>,
        head: PageIndex,
        addr: usize,
        tag: MallocType,
    ) -> Result<usize, FreeFault> {
        let PageUsage::Large { pages, tag: owner } = *arena.usage().entry(head) else {
            return Err(FreeFault::NotAllocated);
        };
        if arena.page_addr(head) != addr {
            return Err(FreeFault::Unaligned);
        }
        if owner != tag {
            return Err(FreeFault::TypeMismatch(owner));
        }

        arena.free_pages(head, pages as usize);
        self.stats.live_runs -= 1;
        self.stats.live_pages -= pages as u64;
        Ok(pages as usize * PAGE_SIZE)
    }
}
