//! The kmem arena: one reserved range of kernel address space that backs
//! every slab and large object.
//!
//! Addresses are turned into [`PageIndex`] values on entry, so range checks
//! and usage lookups are plain index arithmetic.

pub mod backing;
pub mod sizer;
pub mod usage;

pub use backing::{HeapBacking, MapError, PageBacking};
pub use sizer::ArenaSizer;
pub use usage::{PageUsage, UsageTable};

#[cfg(feature = "log")]
use log::info;

use crate::{MallocFlags, PageIndex};

/// Bounds and occupancy of the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaInfo {
    pub base: usize,
    pub limit: usize,
    pub total_pages: usize,
    pub mapped_pages: usize,
}

/// The reserved range `[base, limit)` and its usage table.
pub struct PageArena<B: PageBacking, const PAGE_SIZE: usize = { crate::DEFAULT_PAGE_SIZE }> {
    backing: B,
    base: usize,
    limit: usize,
    usage: UsageTable,
    mapped_pages: usize,
}

impl<B: PageBacking, const PAGE_SIZE: usize> PageArena<B, PAGE_SIZE> {
    /// Reserve `page_count` pages from `backing`.
    ///
    /// # Panics
    ///
    /// Panics if the reservation cannot be satisfied; there is no recovery at boot.
    pub fn create(mut backing: B, page_count: u32) -> Self {
        let size = page_count as usize * PAGE_SIZE;
        let Some((base, limit)) = backing.reserve_region(size) else {
            kmem_panic!("kmeminit: cannot reserve {} pages for kmem arena", page_count);
        };
        if base == 0 || limit - base != size || !crate::is_aligned(base, PAGE_SIZE) {
            kmem_panic!(
                "kmeminit: bad kmem arena [{:#x}, {:#x}) for {} pages",
                base,
                limit,
                page_count
            );
        }

        info!(
            "kmem arena: [{:#x}, {:#x}), {} pages of {} bytes",
            base, limit, page_count, PAGE_SIZE
        );
        Self {
            backing,
            base,
            limit,
            usage: UsageTable::new(page_count as usize),
            mapped_pages: 0,
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn total_pages(&self) -> usize {
        self.usage.len()
    }

    pub fn mapped_pages(&self) -> usize {
        self.mapped_pages
    }

    pub fn info(&self) -> ArenaInfo {
        ArenaInfo {
            base: self.base,
            limit: self.limit,
            total_pages: self.total_pages(),
            mapped_pages: self.mapped_pages,
        }
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.limit
    }

    /// Page holding `addr`, or `None` outside the arena.
    pub fn page_index(&self, addr: usize) -> Option<PageIndex> {
        if !self.contains(addr) {
            return None;
        }
        Some(PageIndex::new(((addr - self.base) / PAGE_SIZE) as u32))
    }

    /// Start address of `page`.
    pub fn page_addr(&self, page: PageIndex) -> usize {
        self.base + page.as_usize() * PAGE_SIZE
    }

    pub fn usage(&self) -> &UsageTable {
        &self.usage
    }

    pub fn usage_mut(&mut self) -> &mut UsageTable {
        &mut self.usage
    }

    pub fn backing(&self) -> &B {
        &self.backing
    }

    /// Map `num_pages` contiguous pages and return the head of the run.
    ///
    /// Never waits. The caller decides from `flags` whether a
    /// [`MapError::Shortage`] is retried after sleeping, reported, or fatal.
    pub fn alloc_pages(
        &mut self,
        num_pages: usize,
        flags: MallocFlags,
    ) -> Result<PageIndex, MapError> {
        let addr = self.backing.map_pages(num_pages, flags)?;
        let end = addr + num_pages * PAGE_SIZE;
        if !self.contains(addr) || end > self.limit || !crate::is_aligned(addr, PAGE_SIZE) {
            kmem_panic!(
                "kmem arena: backing mapped {} pages at {:#x} outside [{:#x}, {:#x})",
                num_pages,
                addr,
                self.base,
                self.limit
            );
        }
        self.mapped_pages += num_pages;
        Ok(PageIndex::new(((addr - self.base) / PAGE_SIZE) as u32))
    }

    /// Unmap the run of `num_pages` starting at `page` and clear its usage.
    pub fn free_pages(&mut self, page: PageIndex, num_pages: usize) {
        self.usage.clear(page, num_pages);
        self.backing.unmap_pages(self.page_addr(page), num_pages);
        self.mapped_pages -= num_pages;
    }
}
