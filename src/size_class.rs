//! Size classes for bucketed allocation.
//!
//! Every request up to `MAXALLOCSAVE` (two pages) is rounded up to the next
//! power of two, starting at [`MIN_BUCKET_SIZE`]. A class therefore wastes
//! less than half of its object size, and the lookup is a bit scan.

/// log2 of the smallest bucket.
pub const MIN_BUCKET_SHIFT: u32 = 4;

/// Size of the smallest bucket in bytes.
pub const MIN_BUCKET_SIZE: usize = 1 << MIN_BUCKET_SHIFT;

/// Upper bound on the number of size classes for any page size.
pub const MAX_CLASSES: usize = 16;

/// Index of a size class, 0 being the [`MIN_BUCKET_SIZE`] class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClassIndex(u8);

impl ClassIndex {
    pub const fn new(index: u8) -> Self {
        Self(index)
    }

    pub const fn get(self) -> usize {
        self.0 as usize
    }

    /// Allocation granularity of this class.
    pub const fn object_size(self) -> usize {
        MIN_BUCKET_SIZE << self.0
    }
}

/// A size class: its index and the size of every object it hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClass {
    pub index: ClassIndex,
    pub object_size: usize,
}

/// Mapping between request sizes and size classes for one page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClassTable {
    count: u8,
    page_size: usize,
}

impl SizeClassTable {
    pub const fn new(page_size: usize) -> Self {
        assert!(page_size.is_power_of_two() && page_size >= MIN_BUCKET_SIZE);
        let count = (2 * page_size).trailing_zeros() - MIN_BUCKET_SHIFT + 1;
        assert!(count as usize <= MAX_CLASSES);
        Self {
            count: count as u8,
            page_size,
        }
    }

    /// Number of slab classes.
    pub const fn len(&self) -> usize {
        self.count as usize
    }

    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Largest request served from a slab pool (`MAXALLOCSAVE`).
    pub const fn max_alloc_save(&self) -> usize {
        2 * self.page_size
    }

    /// Smallest class whose object size is at least `size`.
    ///
    /// Returns `None` when `size` exceeds [`Self::max_alloc_save`]; such
    /// requests belong to the large-object path.
    pub const fn class_of(&self, size: usize) -> Option<ClassIndex> {
        if size > self.max_alloc_save() {
            return None;
        }
        let shift = if size <= MIN_BUCKET_SIZE {
            MIN_BUCKET_SHIFT
        } else {
            usize::BITS - (size - 1).leading_zeros()
        };
        Some(ClassIndex((shift - MIN_BUCKET_SHIFT) as u8))
    }

    pub const fn object_size_of(&self, class: ClassIndex) -> usize {
        class.object_size()
    }

    pub const fn size_class(&self, class: ClassIndex) -> SizeClass {
        SizeClass {
            index: class,
            object_size: class.object_size(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = SizeClass> + '_ {
        (0..self.count).map(|i| self.size_class(ClassIndex(i)))
    }

    /// Bytes a request of `size` actually occupies: the class object size,
    /// or whole pages beyond `MAXALLOCSAVE`.
    pub const fn roundup(&self, size: usize) -> usize {
        match self.class_of(size) {
            Some(class) => class.object_size(),
            None => crate::align_up(size, self.page_size),
        }
    }

    /// Objects carved from one slab of `class`.
    pub const fn elements_per_slab(&self, class: ClassIndex) -> usize {
        let object_size = class.object_size();
        if object_size >= self.page_size {
            1
        } else {
            self.page_size / object_size
        }
    }

    /// Pages backing one slab of `class`.
    pub const fn slab_pages(&self, class: ClassIndex) -> usize {
        let object_size = class.object_size();
        if object_size >= self.page_size {
            object_size / self.page_size
        } else {
            1
        }
    }
}
