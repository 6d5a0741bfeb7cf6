//! Kernel memory allocator
//!
//! This crate implements the general-purpose kernel `malloc`/`free` used for
//! kernel-internal data structures, featuring:
//! - Power-of-two size classes from 16 bytes up to two pages
//! - One slab pool per size class, carved from page runs of the kmem arena
//! - Page-granularity large objects recorded in a per-page usage table
//! - Boot-time arena sizing driven by physical memory
//! - Per-type accounting with limits (feature `kmemstats`)
//! - Free-object poisoning (feature `diagnostic`)

#![no_std]

extern crate alloc;

// Logging support - conditionally import log crate
#[cfg(feature = "log")]
extern crate log;

// Stub macros when log is disabled - these become no-ops
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! error {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! warn {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! info {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! debug {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! trace {
    ($($arg:tt)*) => {};
}

/// Report a corrupted heap and stop. Never returns.
macro_rules! kmem_panic {
    ($($arg:tt)*) => {{
        #[cfg(feature = "log")]
        log::error!($($arg)*);
        panic!($($arg)*)
    }};
}

/// Default page size for backward compatibility
pub const DEFAULT_PAGE_SIZE: usize = 0x1000;

/// The recoverable error type used for allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MallocError {
    /// The kmem arena (or a pool cap) cannot satisfy the request.
    #[error("out of space in kmem arena")]
    OutOfMemory,
    /// The request exceeds the absolute allocation ceiling.
    #[error("allocation too large")]
    AllocationTooLarge,
    /// The malloc type is at its limit and the caller asked not to wait.
    #[error("malloc type is over its limit")]
    RateLimited,
}

/// A [`Result`] type with [`MallocError`] as the error type.
pub type MallocResult<T = ()> = Result<T, MallocError>;

bitflags::bitflags! {
    /// Request flags passed to `malloc`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MallocFlags: u32 {
        /// The caller may sleep until memory is available.
        const WAITOK = 0x0001;
        /// The caller must not sleep.
        const NOWAIT = 0x0002;
        /// Return an error instead of panicking when memory cannot be found.
        const CANFAIL = 0x0004;
        /// Zero the returned memory.
        const ZERO = 0x0008;
    }
}

impl MallocFlags {
    /// Whether the request may sleep, on memory or on a type limit.
    pub const fn may_block(self) -> bool {
        !self.contains(Self::NOWAIT)
    }

    /// Whether the caller is prepared to handle an error return.
    pub const fn tolerates_failure(self) -> bool {
        self.intersects(Self::NOWAIT.union(Self::CANFAIL))
    }
}

/// Index of a page inside the kmem arena, counted from its base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageIndex(u32);

impl PageIndex {
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Why a `free` could not be honoured. Always escalated to a panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FreeFault {
    /// The page holds no allocation, or the address is not its head.
    NotAllocated,
    /// The address is not at an object boundary.
    Unaligned,
    /// The object is already free.
    DuplicateFree,
    /// The allocation belongs to another malloc type.
    TypeMismatch(MallocType),
    /// The malloc type has no live allocation of that size.
    #[cfg(feature = "kmemstats")]
    NotLive,
}

#[inline]
const fn align_up(pos: usize, align: usize) -> usize {
    (pos + align - 1) & !(align - 1)
}

/// Checks whether the address has the demanded alignment.
///
/// Equivalent to `addr % align == 0`, but the alignment must be a power of two.
#[inline]
const fn is_aligned(base_addr: usize, align: usize) -> bool {
    base_addr & (align - 1) == 0
}

pub mod config;
pub use config::KmemConfig;

pub mod size_class;
pub use size_class::{ClassIndex, SizeClass, SizeClassTable, MAX_CLASSES, MIN_BUCKET_SIZE};

pub mod malloc_type;
pub use malloc_type::MallocType;

pub mod arena;
pub use arena::{
    ArenaInfo, ArenaSizer, HeapBacking, MapError, PageArena, PageBacking, PageUsage,
};

#[cfg(feature = "diagnostic")]
mod diagnostic;

pub mod slab;
pub use slab::{BucketStats, SlabNode, SlabPool};

pub mod large;
pub use large::{LargeObjectTracker, LargeStats};

pub mod stats;
#[cfg(feature = "kmemstats")]
pub use stats::{KmemStats, StatsRegistry};
pub use stats::{SpinWait, WaitChannel};

pub mod kmem;
pub use kmem::KmemAllocator;
