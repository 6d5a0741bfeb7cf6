//! Slab pool implementation for a single size class.
//!
//! A pool keeps two intrusive lists of slabs, partial and empty, threaded
//! through the usage-table entries of the slabs' head pages. Full slabs are
//! not listed; they are found again through the usage table when an object
//! is returned.

#[cfg(feature = "log")]
use log::{debug, trace, warn};

use alloc::vec::Vec;

use crate::arena::{MapError, PageArena, PageBacking, PageUsage, UsageTable};
use crate::{ClassIndex, FreeFault, MallocFlags, MallocType, PageIndex, SizeClassTable};

use super::slab_node::SlabNode;

/// Counters of one size class (`kmembuckets`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketStats {
    pub object_size: usize,
    /// Objects handed out, ever.
    pub calls: u64,
    /// Objects carved into live slabs.
    pub total: u64,
    /// Of `total`, objects currently free.
    pub total_free: u64,
    pub elements_per_slab: u32,
    /// Free objects above which an emptied slab is returned to the arena.
    pub high_water: u64,
    /// Slabs returned to the arena.
    pub released: u64,
    /// Free objects found written to when handed out again.
    pub freelist_modified: u64,
}

/// Owner tag of every object in the pool's live slabs.
///
/// Each slab holds one slot of `chunk` entries; slots of released slabs are
/// reused by the next slab carved.
struct OwnerTable {
    owners: Vec<Option<MallocType>>,
    free_slots: Vec<usize>,
    chunk: usize,
}

impl OwnerTable {
    const fn new(chunk: usize) -> Self {
        Self {
            owners: Vec::new(),
            free_slots: Vec::new(),
            chunk,
        }
    }

    fn claim(&mut self) -> usize {
        if let Some(slot) = self.free_slots.pop() {
            return slot;
        }
        let slot = self.owners.len() / self.chunk;
        self.owners.resize(self.owners.len() + self.chunk, None);
        slot
    }

    fn release(&mut self, slot: usize) {
        let start = slot * self.chunk;
        self.owners[start..start + self.chunk].fill(None);
        self.free_slots.push(slot);
    }

    fn owner(&self, slot: usize, object_index: usize) -> Option<MallocType> {
        self.owners[slot * self.chunk + object_index]
    }

    fn set_owner(&mut self, slot: usize, object_index: usize, tag: Option<MallocType>) {
        self.owners[slot * self.chunk + object_index] = tag;
    }
}

struct SlabIntrusiveList {
    head: Option<PageIndex>,
    tail: Option<PageIndex>,
    len: usize,
}

impl SlabIntrusiveList {
    const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    fn len(&self) -> usize {
        self.len
    }

    fn back(&self) -> Option<PageIndex> {
        self.tail
    }

    fn push_back(&mut self, usage: &mut UsageTable, slab: PageIndex) {
        let node = usage.slab_mut(slab);
        node.set_prev(self.tail);
        node.set_next(None);

        if let Some(tail) = self.tail {
            usage.slab_mut(tail).set_next(Some(slab));
        } else {
            self.head = Some(slab);
        }

        self.tail = Some(slab);
        self.len += 1;
    }

    fn pop_back(&mut self, usage: &mut UsageTable) -> Option<PageIndex> {
        let tail = self.tail?;
        self.remove(usage, tail);
        Some(tail)
    }

    fn remove(&mut self, usage: &mut UsageTable, slab: PageIndex) {
        let node = usage.slab_mut(slab);
        let prev = node.prev();
        let next = node.next();
        node.set_prev(None);
        node.set_next(None);

        if let Some(prev) = prev {
            usage.slab_mut(prev).set_next(next);
        } else {
            self.head = next;
        }

        if let Some(next) = next {
            usage.slab_mut(next).set_prev(prev);
        } else {
            self.tail = prev;
        }

        self.len = self.len.saturating_sub(1);
    }
}

/// Fixed-size object pool of one size class.
pub struct SlabPool {
    class: ClassIndex,
    slab_pages: usize,
    partial: SlabIntrusiveList,
    empty: SlabIntrusiveList,
    object_limit: Option<usize>,
    owners: OwnerTable,
    stats: BucketStats,
}

impl SlabPool {
    /// A pool for `class`. With `object_limit`, `get` fails instead of
    /// carving a slab that would take the pool past that many objects.
    pub fn new(class: ClassIndex, table: &SizeClassTable, object_limit: Option<usize>) -> Self {
        let elements_per_slab = table.elements_per_slab(class);
        Self {
            class,
            slab_pages: table.slab_pages(class),
            partial: SlabIntrusiveList::new(),
            empty: SlabIntrusiveList::new(),
            object_limit,
            owners: OwnerTable::new(elements_per_slab.min(SlabNode::MAX_OBJECTS)),
            stats: BucketStats {
                object_size: class.object_size(),
                elements_per_slab: elements_per_slab as u32,
                high_water: 5 * elements_per_slab as u64,
                ..BucketStats::default()
            },
        }
    }

    pub fn class(&self) -> ClassIndex {
        self.class
    }

    pub fn stats(&self) -> BucketStats {
        self.stats
    }

    /// Slabs kept mapped with no object in use.
    pub fn empty_slabs(&self) -> usize {
        self.empty.len()
    }

    /// Hand out one object owned by `tag`, carving a new slab from `arena`
    /// if needed.
    ///
    /// Fails with [`MapError::NoSpace`] at the object limit; otherwise passes
    /// on the arena's answer.
    pub fn get<B: PageBacking, const PAGE_SIZE: usize>(
        &mut self,
        arena: &mut PageArena<B, PAGE_SIZE>,
        tag: MallocType,
        flags: MallocFlags,
    ) -> Result<usize, MapError> {
        let slab = match self.partial.back() {
            Some(slab) => slab,
            None => {
                let slab = match self.empty.pop_back(arena.usage_mut()) {
                    Some(slab) => slab,
                    None => self.grow(arena, flags)?,
                };
                self.partial.push_back(arena.usage_mut(), slab);
                slab
            }
        };

        let node = arena.usage_mut().slab_mut(slab);
        let Some(object_index) = node.alloc_object() else {
            kmem_panic!(
                "malloc: lost data: listed slab at page {} of {}-byte class has no free object",
                slab.get(),
                self.class.object_size()
            );
        };
        let offset = node.object_offset(object_index);
        self.owners.set_owner(node.owner_slot(), object_index, Some(tag));
        if node.is_full() {
            self.partial.remove(arena.usage_mut(), slab);
        }

        self.stats.calls += 1;
        self.stats.total_free -= 1;
        let addr = arena.page_addr(slab) + offset;

        #[cfg(feature = "diagnostic")]
        {
            // SAFETY: the object lies in a slab mapped by the arena backing.
            let modified =
                unsafe { crate::diagnostic::check_poison(addr, self.class.object_size()) };
            if modified.is_some() {
                self.stats.freelist_modified += 1;
            }
        }

        Ok(addr)
    }

    /// Take back the object at `addr`, which lies in the slab headed by `slab`
    /// and must be owned by `tag`.
    pub(crate) fn put<B: PageBacking, const PAGE_SIZE: usize>(
        &mut self,
        arena: &mut PageArena<B, PAGE_SIZE>,
        slab: PageIndex,
        addr: usize,
        tag: MallocType,
    ) -> Result<(), FreeFault> {
        let offset = addr - arena.page_addr(slab);
        let usage = arena.usage_mut();
        let node = usage.slab_mut(slab);
        let object_index = node
            .object_index_from_offset(offset)
            .ok_or(FreeFault::Unaligned)?;
        if !node.is_allocated(object_index) {
            return Err(FreeFault::DuplicateFree);
        }
        match self.owners.owner(node.owner_slot(), object_index) {
            Some(owner) if owner != tag => return Err(FreeFault::TypeMismatch(owner)),
            _ => {}
        }
        self.owners.set_owner(node.owner_slot(), object_index, None);

        #[cfg(feature = "diagnostic")]
        // SAFETY: the object is allocated, so its slab is still mapped.
        unsafe {
            crate::diagnostic::poison(addr, self.class.object_size());
        }

        let was_full = node.is_full();
        node.dealloc_object(object_index);
        let now_empty = node.is_empty();
        self.stats.total_free += 1;

        if !now_empty {
            if was_full {
                self.partial.push_back(usage, slab);
            }
            return Ok(());
        }

        if !was_full {
            self.partial.remove(usage, slab);
        }
        if self.stats.total_free > self.stats.high_water {
            self.release(arena, slab);
        } else {
            self.empty.push_back(usage, slab);
        }
        Ok(())
    }

    /// Map and carve a new slab. The slab is not on any list yet.
    fn grow<B: PageBacking, const PAGE_SIZE: usize>(
        &mut self,
        arena: &mut PageArena<B, PAGE_SIZE>,
        flags: MallocFlags,
    ) -> Result<PageIndex, MapError> {
        let mut node = SlabNode::new(self.class, self.slab_pages, PAGE_SIZE);
        let objects = node.object_count() as u64;

        if let Some(limit) = self.object_limit {
            if self.stats.total + objects > limit as u64 {
                warn!(
                    "slab pool: {}-byte class at its limit of {} objects",
                    self.class.object_size(),
                    limit
                );
                return Err(MapError::NoSpace);
            }
        }

        let slab = arena.alloc_pages(self.slab_pages, flags)?;
        node.set_owner_slot(self.owners.claim());
        *arena.usage_mut().entry_mut(slab) = PageUsage::Slab(node);
        self.stats.total += objects;
        self.stats.total_free += objects;

        #[cfg(feature = "diagnostic")]
        {
            let base = arena.page_addr(slab);
            for i in 0..node.object_count() {
                // SAFETY: the run was just mapped by the arena backing.
                unsafe {
                    crate::diagnostic::poison(
                        base + node.object_offset(i),
                        self.class.object_size(),
                    )
                };
            }
        }

        trace!(
            "slab pool: new {}-page slab at page {} for {}-byte objects",
            self.slab_pages,
            slab.get(),
            self.class.object_size()
        );
        Ok(slab)
    }

    /// Return an empty, unlisted slab to the arena.
    fn release<B: PageBacking, const PAGE_SIZE: usize>(
        &mut self,
        arena: &mut PageArena<B, PAGE_SIZE>,
        slab: PageIndex,
    ) {
        let node = arena.usage().slab(slab);
        let objects = node.object_count() as u64;
        self.owners.release(node.owner_slot());
        arena.free_pages(slab, self.slab_pages);
        self.stats.total -= objects;
        self.stats.total_free -= objects;
        self.stats.released += 1;
        debug!(
            "slab pool: released slab at page {} of {}-byte class",
            slab.get(),
            self.class.object_size()
        );
    }
}
