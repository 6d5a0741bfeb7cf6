//! Slab node implementation.
//!
//! A `SlabNode` tracks up to 256 objects of one size class with a fixed free
//! bitmap. It is stored in the usage-table entry of the slab's head page, so
//! a stray write into object memory cannot corrupt it.

use crate::{ClassIndex, PageIndex};

const FREE_BITMAP_WORDS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabNode {
    class: ClassIndex,
    pages: u16,
    object_count: u16,
    free_count: u16,
    free_bitmap: [u64; FREE_BITMAP_WORDS],
    /// Where the pool keeps the owner tags of this slab's objects.
    owner_slot: u32,
    prev: Option<PageIndex>,
    next: Option<PageIndex>,
}

impl SlabNode {
    pub const MAX_OBJECTS: usize = FREE_BITMAP_WORDS * 64;

    /// A slab of `pages` pages with every object free.
    ///
    /// With page sizes above 4 KiB the smallest classes have more room than
    /// [`Self::MAX_OBJECTS`]; the tail of such a slab is left unused.
    pub fn new(class: ClassIndex, pages: usize, page_size: usize) -> Self {
        let object_count = (pages * page_size / class.object_size()).min(Self::MAX_OBJECTS);

        let mut free_bitmap = [0u64; FREE_BITMAP_WORDS];
        let full_words = object_count / 64;
        let rem_bits = object_count % 64;
        for word in free_bitmap.iter_mut().take(full_words) {
            *word = u64::MAX;
        }
        if rem_bits != 0 {
            free_bitmap[full_words] = (1u64 << rem_bits) - 1;
        }

        Self {
            class,
            pages: pages as u16,
            object_count: object_count as u16,
            free_count: object_count as u16,
            free_bitmap,
            owner_slot: 0,
            prev: None,
            next: None,
        }
    }

    pub fn class(&self) -> ClassIndex {
        self.class
    }

    pub fn pages(&self) -> usize {
        self.pages as usize
    }

    pub fn object_count(&self) -> usize {
        self.object_count as usize
    }

    pub fn in_use(&self) -> u32 {
        self.object_count as u32 - self.free_count as u32
    }

    pub fn free_count(&self) -> u32 {
        self.free_count as u32
    }

    pub fn is_full(&self) -> bool {
        self.free_count == 0
    }

    pub fn is_empty(&self) -> bool {
        self.free_count == self.object_count
    }

    /// Claim the lowest free object.
    pub fn alloc_object(&mut self) -> Option<usize> {
        if self.free_count == 0 {
            return None;
        }
        for (word_idx, word) in self.free_bitmap.iter_mut().enumerate() {
            if *word != 0 {
                let bit_pos = word.trailing_zeros() as usize;
                *word &= !(1u64 << bit_pos);
                self.free_count -= 1;
                return Some(word_idx * 64 + bit_pos);
            }
        }
        None
    }

    /// Release `object_index`. Returns false if it was already free.
    pub fn dealloc_object(&mut self, object_index: usize) -> bool {
        if object_index >= self.object_count as usize {
            return false;
        }
        let word_idx = object_index / 64;
        let mask = 1u64 << (object_index % 64);
        if self.free_bitmap[word_idx] & mask != 0 {
            return false;
        }
        self.free_bitmap[word_idx] |= mask;
        self.free_count += 1;
        true
    }

    pub fn is_allocated(&self, object_index: usize) -> bool {
        object_index < self.object_count as usize
            && self.free_bitmap[object_index / 64] & (1u64 << (object_index % 64)) == 0
    }

    /// Byte offset of `object_index` from the slab base.
    pub fn object_offset(&self, object_index: usize) -> usize {
        object_index * self.class.object_size()
    }

    /// Object starting exactly `offset` bytes into the slab.
    pub fn object_index_from_offset(&self, offset: usize) -> Option<usize> {
        let object_size = self.class.object_size();
        if offset % object_size != 0 {
            return None;
        }
        let object_index = offset / object_size;
        if object_index < self.object_count as usize {
            Some(object_index)
        } else {
            None
        }
    }

    pub fn owner_slot(&self) -> usize {
        self.owner_slot as usize
    }

    pub fn set_owner_slot(&mut self, slot: usize) {
        self.owner_slot = slot as u32;
    }

    pub fn prev(&self) -> Option<PageIndex> {
        self.prev
    }

    pub fn next(&self) -> Option<PageIndex> {
        self.next
    }

    pub fn set_prev(&mut self, prev: Option<PageIndex>) {
        self.prev = prev;
    }

    pub fn set_next(&mut self, next: Option<PageIndex>) {
        self.next = next;
    }
}
