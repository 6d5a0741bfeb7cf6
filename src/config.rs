//! Boot-time configuration of the kernel memory allocator.

/// Default allocation ceiling, in pages.
pub const DEFAULT_LARGE_CEILING_PAGES: u32 = 65535;

/// Default per-type limit, as a percentage of the arena.
pub const DEFAULT_TYPE_LIMIT_PERCENT: u8 = 60;

const NKMEMPAGES_MIN_BYTES: usize = 4 * 1024 * 1024;
const NKMEMPAGES_MAX_BYTES: usize = 64 * 1024 * 1024;

/// Inputs consumed once when the allocator is created.
///
/// A zero in `nkmempages`, `nkmempages_min` or `nkmempages_max` selects the
/// computed or default value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KmemConfig {
    /// Physical memory, in pages.
    pub physmem_pages: u32,
    /// Fixed arena size in pages; bypasses sizing when non-zero.
    pub nkmempages: u32,
    /// Floor for the computed arena size, in pages.
    pub nkmempages_min: u32,
    /// Cap for the computed arena size, in pages.
    pub nkmempages_max: u32,
    /// Largest single allocation, in pages.
    pub large_ceiling_pages: u32,
    /// Default byte limit of every malloc type, in percent of the arena.
    pub type_limit_percent: u8,
    /// Hard cap on the objects a single size-class pool may carve.
    pub pool_object_limit: Option<usize>,
}

impl KmemConfig {
    pub const fn new(physmem_pages: u32) -> Self {
        Self {
            physmem_pages,
            nkmempages: 0,
            nkmempages_min: 0,
            nkmempages_max: 0,
            large_ceiling_pages: DEFAULT_LARGE_CEILING_PAGES,
            type_limit_percent: DEFAULT_TYPE_LIMIT_PERCENT,
            pool_object_limit: None,
        }
    }

    pub const fn with_arena_bounds(mut self, min_pages: u32, max_pages: u32) -> Self {
        self.nkmempages_min = min_pages;
        self.nkmempages_max = max_pages;
        self
    }

    pub const fn with_fixed_arena(mut self, pages: u32) -> Self {
        self.nkmempages = pages;
        self
    }

    pub const fn with_large_ceiling(mut self, pages: u32) -> Self {
        self.large_ceiling_pages = pages;
        self
    }

    pub const fn with_type_limit_percent(mut self, percent: u8) -> Self {
        self.type_limit_percent = percent;
        self
    }

    pub const fn with_pool_object_limit(mut self, objects: usize) -> Self {
        self.pool_object_limit = Some(objects);
        self
    }

    /// `(min, max)` arena bounds in pages, with zeros replaced by defaults.
    pub const fn arena_bounds(&self, page_size: usize) -> (u32, u32) {
        let min = if self.nkmempages_min == 0 {
            (NKMEMPAGES_MIN_BYTES / page_size) as u32
        } else {
            self.nkmempages_min
        };
        let max = if self.nkmempages_max == 0 {
            (NKMEMPAGES_MAX_BYTES / page_size) as u32
        } else {
            self.nkmempages_max
        };
        (min, max)
    }

    /// Default byte limit applied to every malloc type.
    pub const fn type_limit(&self, arena_pages: u32, page_size: usize) -> usize {
        arena_pages as usize * page_size / 100 * self.type_limit_percent as usize
    }
}

impl Default for KmemConfig {
    fn default() -> Self {
        Self::new(0)
    }
}
