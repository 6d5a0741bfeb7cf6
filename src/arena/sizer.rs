//! Boot-time sizing of the kmem arena.

#[cfg(feature = "log")]
use log::info;

/// Decides, once, how many pages the kmem arena maps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaSizer {
    nkmempages: u32,
}

impl ArenaSizer {
    pub const fn new() -> Self {
        Self { nkmempages: 0 }
    }

    /// A sizer whose decision was made by configuration.
    pub const fn fixed(pages: u32) -> Self {
        Self { nkmempages: pages }
    }

    /// The decided page count, if any.
    pub const fn page_count(&self) -> Option<u32> {
        if self.nkmempages == 0 {
            None
        } else {
            Some(self.nkmempages)
        }
    }

    /// Start from a quarter of physical memory, clamp it down to `max_pages`,
    /// then round it up to `min_pages`.
    ///
    /// Once a non-zero count is established, later calls return it unchanged.
    pub fn compute_page_count(&mut self, physmem_pages: u32, min_pages: u32, max_pages: u32) -> u32 {
        if self.nkmempages != 0 {
            return self.nkmempages;
        }

        let mut npages = physmem_pages / 4;
        if npages > max_pages {
            npages = max_pages;
        }
        if npages < min_pages {
            npages = min_pages;
        }

        info!(
            "kmem arena: {} pages (physmem {}, min {}, max {})",
            npages, physmem_pages, min_pages, max_pages
        );
        self.nkmempages = npages;
        npages
    }
}
