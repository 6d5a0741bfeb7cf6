//! The kernel `malloc`/`free` entry points.
//!
//! [`KmemAllocator`] owns the kmem arena, one slab pool per size class, the
//! large-object tracker and the per-type statistics, all behind a single
//! `SpinNoIrq` lock. Requests up to `MAXALLOCSAVE` go to the pool of their
//! size class; larger ones are served as whole page runs.

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::{self, Write};
use core::ptr::NonNull;

use kspin::SpinNoIrq;
#[cfg(feature = "kmemstats")]
use kspin::SpinNoIrqGuard;

#[cfg(feature = "log")]
use log::{info, warn};

use crate::arena::{ArenaInfo, ArenaSizer, MapError, PageArena, PageBacking, PageUsage};
use crate::large::{LargeObjectTracker, LargeStats};
use crate::slab::{BucketStats, SlabPool};
#[cfg(feature = "kmemstats")]
use crate::stats::{KmemStats, StatsRegistry};
use crate::stats::{SpinWait, WaitChannel};
use crate::{
    ClassIndex, FreeFault, KmemConfig, MallocError, MallocFlags, MallocResult, MallocType,
    PageIndex, SizeClassTable,
};

static SPIN_WAIT: SpinWait = SpinWait;

struct KmemState<B: PageBacking, const PAGE_SIZE: usize> {
    arena: PageArena<B, PAGE_SIZE>,
    pools: Vec<SlabPool>,
    large: LargeObjectTracker,
    #[cfg(feature = "kmemstats")]
    stats: StatsRegistry,
}

/// The kernel memory allocator.
///
/// One instance serves the whole kernel; tests create as many as they like.
pub struct KmemAllocator<B: PageBacking, const PAGE_SIZE: usize = { crate::DEFAULT_PAGE_SIZE }> {
    state: SpinNoIrq<KmemState<B, PAGE_SIZE>>,
    classes: SizeClassTable,
    large_ceiling: usize,
    waiter: &'static dyn WaitChannel,
}

impl<B: PageBacking, const PAGE_SIZE: usize> KmemAllocator<B, PAGE_SIZE> {
    /// Size the arena from `config`, reserve it from `backing` and set up one
    /// pool per size class.
    ///
    /// # Panics
    ///
    /// Panics if the arena cannot be reserved.
    pub fn new(config: &KmemConfig, backing: B) -> Self {
        let mut sizer = if config.nkmempages != 0 {
            ArenaSizer::fixed(config.nkmempages)
        } else {
            ArenaSizer::new()
        };
        let (min_pages, max_pages) = config.arena_bounds(PAGE_SIZE);
        let npages = sizer.compute_page_count(config.physmem_pages, min_pages, max_pages);

        let classes = SizeClassTable::new(PAGE_SIZE);
        let arena = PageArena::create(backing, npages);
        let pools = classes
            .iter()
            .map(|class| SlabPool::new(class.index, &classes, config.pool_object_limit))
            .collect();
        let large = LargeObjectTracker::new(config.large_ceiling_pages);
        let large_ceiling = large.ceiling_bytes(PAGE_SIZE);

        info!(
            "kmem: {} size classes up to {} bytes, allocation ceiling {:#x}",
            classes.len(),
            classes.max_alloc_save(),
            large_ceiling
        );

        Self {
            state: SpinNoIrq::new(KmemState {
                arena,
                pools,
                large,
                #[cfg(feature = "kmemstats")]
                stats: StatsRegistry::new(config.type_limit(npages, PAGE_SIZE)),
            }),
            classes,
            large_ceiling,
            waiter: &SPIN_WAIT,
        }
    }

    /// Sleep on `waiter` instead of spinning when a type is over its limit.
    pub fn with_wait_channel(mut self, waiter: &'static dyn WaitChannel) -> Self {
        self.waiter = waiter;
        self
    }

    /// Allocate `size` bytes charged to `tag`.
    ///
    /// A zero `size` is served as one byte. Errors are only returned to
    /// callers that tolerate them (`NOWAIT` or `CANFAIL`); any other failure
    /// panics. A plain `WAITOK` request that meets a page shortage sleeps on
    /// the wait channel, without the lock, and tries again.
    pub fn malloc(
        &self,
        size: usize,
        tag: MallocType,
        flags: MallocFlags,
    ) -> MallocResult<NonNull<u8>> {
        let size = size.max(1);
        if size > self.large_ceiling {
            if flags.tolerates_failure() {
                warn!(
                    "malloc: {} bytes for {} above ceiling {:#x}",
                    size, tag, self.large_ceiling
                );
                return Err(MallocError::AllocationTooLarge);
            }
            kmem_panic!(
                "malloc: allocation too large, type = {}, size = {}",
                tag,
                size
            );
        }

        let class = self.classes.class_of(size);
        let mut guard = self.state.lock();

        #[cfg(feature = "kmemstats")]
        while guard.stats.over_limit(tag) {
            guard.stats.note_limit_block(tag);
            if !flags.may_block() {
                warn!("malloc: {} over its limit, refusing {} bytes", tag, size);
                return Err(MallocError::RateLimited);
            }
            drop(guard);
            self.waiter.sleep(tag);
            guard = self.state.lock();
        }

        let addr = loop {
            let kmem = &mut *guard;
            let result = match class {
                Some(class) => kmem.pools[class.get()].get(&mut kmem.arena, tag, flags),
                None => kmem.large.alloc(&mut kmem.arena, size, tag, flags),
            };
            match result {
                Ok(addr) => break addr,
                Err(MapError::Shortage) if !flags.tolerates_failure() => {
                    drop(guard);
                    self.waiter.page_wait();
                    guard = self.state.lock();
                }
                Err(_) => {
                    #[cfg(feature = "kmemstats")]
                    kmem.stats.note_map_block(tag);
                    drop(guard);
                    if flags.tolerates_failure() {
                        warn!("malloc: out of space in kmem arena for {} bytes of {}", size, tag);
                        return Err(MallocError::OutOfMemory);
                    }
                    kmem_panic!(
                        "malloc: out of space in kmem_map, type = {}, size = {}",
                        tag,
                        size
                    );
                }
            }
        };

        #[cfg(feature = "kmemstats")]
        guard.stats.record_alloc(tag, self.classes.roundup(size), class);
        drop(guard);

        if flags.contains(MallocFlags::ZERO) {
            // SAFETY: `addr` starts a fresh allocation of at least `size` bytes.
            unsafe { core::ptr::write_bytes(addr as *mut u8, 0, size) };
        }
        NonNull::new(addr as *mut u8).ok_or(MallocError::OutOfMemory)
    }

    /// Return `ptr`, previously allocated for `tag`.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` is not a live allocation of this allocator, or if it
    /// was allocated for another type.
    pub fn free(&self, ptr: NonNull<u8>, tag: MallocType) {
        self.free_checked(ptr, tag, None);
    }

    /// Like [`Self::free`], additionally checking that `size` is the size the
    /// allocation was requested with (up to rounding).
    pub fn free_sized(&self, ptr: NonNull<u8>, tag: MallocType, size: usize) {
        self.free_checked(ptr, tag, Some(self.classes.roundup(size.max(1))));
    }

    fn free_checked(&self, ptr: NonNull<u8>, tag: MallocType, expected: Option<usize>) {
        let addr = ptr.as_ptr() as usize;
        let mut guard = self.state.lock();
        let kmem = &mut *guard;

        let page = kmem.arena.page_index(addr);
        let usage = page.map(|page| *kmem.arena.usage().entry(page));
        let (page, usage) = match (page, usage) {
            (Some(page), Some(usage)) if usage != PageUsage::Unused => (page, usage),
            _ => {
                drop(guard);
                kmem_panic!("free: non-malloced addr {:#x} type {}", addr, tag);
            }
        };

        let bytes = match usage.class() {
            Some(class) => class.object_size(),
            None => usage.run_pages() as usize * PAGE_SIZE,
        };
        if let Some(expected) = expected {
            if expected != bytes {
                drop(guard);
                kmem_panic!(
                    "free: size mismatch, {} != {} ({:#x}) type {}",
                    expected,
                    bytes,
                    addr,
                    tag
                );
            }
        }

        let mapped = kmem.arena.mapped_pages();
        let result = match usage.class() {
            Some(class) => kmem.pools[class.get()].put(&mut kmem.arena, page, addr, tag),
            None => kmem.large.free(&mut kmem.arena, page, addr, tag).map(|_| ()),
        };
        if let Err(fault) = result {
            drop(guard);
            Self::free_fault(fault, addr, bytes, tag);
        }
        let unmapped = kmem.arena.mapped_pages() < mapped;

        #[cfg(feature = "kmemstats")]
        self.account_free(guard, addr, bytes, tag);
        #[cfg(not(feature = "kmemstats"))]
        drop(guard);

        if unmapped {
            self.waiter.page_wakeup();
        }
    }

    /// Credit a completed free to `tag` and wake its sleepers if it dropped
    /// under its limit.
    #[cfg(feature = "kmemstats")]
    fn account_free(
        &self,
        mut guard: SpinNoIrqGuard<'_, KmemState<B, PAGE_SIZE>>,
        addr: usize,
        bytes: usize,
        tag: MallocType,
    ) {
        if let Err(fault) = guard.stats.check_free(tag, bytes) {
            drop(guard);
            Self::free_fault(fault, addr, bytes, tag);
        }
        let wake = guard.stats.record_free(tag, bytes);
        drop(guard);
        if wake {
            self.waiter.wakeup(tag);
        }
    }

    fn free_fault(fault: FreeFault, addr: usize, bytes: usize, tag: MallocType) -> ! {
        match fault {
            FreeFault::NotAllocated => {
                kmem_panic!("free: non-malloced addr {:#x} type {}", addr, tag)
            }
            FreeFault::Unaligned => kmem_panic!(
                "free: unaligned addr {:#x}, size {}, type {}",
                addr,
                bytes,
                tag
            ),
            FreeFault::DuplicateFree => kmem_panic!(
                "free: duplicated free of {:#x}, size {}, type {}",
                addr,
                bytes,
                tag
            ),
            FreeFault::TypeMismatch(owner) => kmem_panic!(
                "free: type mismatch for {:#x}, size {}, freed as {} but allocated as {}",
                addr,
                bytes,
                tag,
                owner
            ),
            #[cfg(feature = "kmemstats")]
            FreeFault::NotLive => kmem_panic!(
                "free: {} has no live allocation of {} bytes at {:#x}",
                tag,
                bytes,
                addr
            ),
        }
    }

    /// Bytes a request of `size` occupies once allocated.
    pub fn roundup(&self, size: usize) -> usize {
        self.classes.roundup(size.max(1))
    }

    pub fn size_classes(&self) -> &SizeClassTable {
        &self.classes
    }

    /// Largest request `malloc` accepts.
    pub fn max_request(&self) -> usize {
        self.large_ceiling
    }

    /// Set the byte limit of `tag`, waking sleepers if it was raised.
    #[cfg(feature = "kmemstats")]
    pub fn set_type_limit(&self, tag: MallocType, bytes: usize) {
        let wake = {
            let mut guard = self.state.lock();
            let was_over = guard.stats.over_limit(tag);
            guard.stats.set_limit(tag, bytes);
            was_over && !guard.stats.over_limit(tag)
        };
        if wake {
            self.waiter.wakeup(tag);
        }
    }

    #[cfg(feature = "kmemstats")]
    pub fn type_stats(&self, tag: MallocType) -> KmemStats {
        self.state.lock().stats.record(tag)
    }

    /// Counters of `class`, or `None` past the last size class.
    pub fn bucket_stats(&self, class: ClassIndex) -> Option<BucketStats> {
        self.state.lock().pools.get(class.get()).map(SlabPool::stats)
    }

    pub fn large_stats(&self) -> LargeStats {
        self.state.lock().large.stats()
    }

    /// Comma-terminated list of bucket sizes, as read by `kern.malloc.buckets`.
    pub fn bucket_sizes(&self) -> String {
        let mut out = String::new();
        for class in self.classes.iter() {
            let _ = write!(out, "{},", class.object_size);
        }
        out
    }

    /// Comma-terminated list of malloc type names, as read by `kern.malloc.kmemnames`.
    pub fn type_names(&self) -> String {
        let mut out = String::new();
        for tag in MallocType::all() {
            out.push_str(tag.name());
            out.push(',');
        }
        out
    }

    pub fn arena_info(&self) -> ArenaInfo {
        self.state.lock().arena.info()
    }

    /// Whether `addr` lies in the kmem arena.
    pub fn contains(&self, addr: usize) -> bool {
        self.state.lock().arena.contains(addr)
    }

    /// Page of the arena holding `addr`.
    pub fn page_index(&self, addr: usize) -> Option<PageIndex> {
        self.state.lock().arena.page_index(addr)
    }

    /// Write the per-type table shown by ddb `show malloc`.
    #[cfg(feature = "kmemstats")]
    pub fn report<W: Write>(&self, out: &mut W) -> fmt::Result {
        // Snapshot first: `out` may itself allocate.
        let snapshot = self.state.lock().stats.clone();
        snapshot.write_report(out)
    }

    #[cfg(not(feature = "kmemstats"))]
    pub fn report<W: Write>(&self, out: &mut W) -> fmt::Result {
        crate::stats::write_disabled_report(out)
    }
}
