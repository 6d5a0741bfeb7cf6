//! Per-page usage table of the kmem arena (`kmemusage`).

use alloc::vec;
use alloc::vec::Vec;

use crate::slab::SlabNode;
use crate::{ClassIndex, MallocType, PageIndex};

/// What a page of the arena is used for.
///
/// Only the head page of a run carries an entry; the remaining pages of a
/// multi-page slab or large object stay `Unused` and are reached through the
/// head by page arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageUsage {
    Unused,
    /// Head of a slab carved into objects of one size class.
    Slab(SlabNode),
    /// Head of a large allocation spanning `pages` pages.
    Large { pages: u32, tag: MallocType },
}

impl PageUsage {
    /// The size class of the run, `None` for large objects and unused pages.
    pub fn class(&self) -> Option<ClassIndex> {
        match self {
            PageUsage::Slab(node) => Some(node.class()),
            _ => None,
        }
    }

    /// Length of the run headed by this page, 0 when unused.
    pub fn run_pages(&self) -> u32 {
        match self {
            PageUsage::Unused => 0,
            PageUsage::Slab(node) => node.pages() as u32,
            PageUsage::Large { pages, .. } => *pages,
        }
    }
}

/// One [`PageUsage`] per arena page, indexed by [`PageIndex`].
pub struct UsageTable {
    entries: Vec<PageUsage>,
}

impl UsageTable {
    pub fn new(pages: usize) -> Self {
        Self {
            entries: vec![PageUsage::Unused; pages],
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, page: PageIndex) -> &PageUsage {
        &self.entries[page.as_usize()]
    }

    pub fn entry_mut(&mut self, page: PageIndex) -> &mut PageUsage {
        &mut self.entries[page.as_usize()]
    }

    pub fn slab(&self, page: PageIndex) -> &SlabNode {
        match self.entry(page) {
            PageUsage::Slab(node) => node,
            other => kmem_panic!(
                "kmem usage table corrupted: page {} listed as slab but is {:?}",
                page.get(),
                other
            ),
        }
    }

    pub fn slab_mut(&mut self, page: PageIndex) -> &mut SlabNode {
        match self.entry_mut(page) {
            PageUsage::Slab(node) => node,
            other => kmem_panic!(
                "kmem usage table corrupted: page {} listed as slab but is {:?}",
                page.get(),
                other
            ),
        }
    }

    /// Forget the run starting at `page`.
    pub fn clear(&mut self, page: PageIndex, pages: usize) {
        let first = page.as_usize();
        for entry in &mut self.entries[first..first + pages] {
            *entry = PageUsage::Unused;
        }
    }
}
