//! Integration tests for the kernel memory allocator
//!
//! Drives `malloc`/`free` through a hosted page backing and checks the
//! behaviour seen by callers: placement, failure modes and accounting.

#![no_std]

extern crate alloc;
extern crate kmem_allocator;

use alloc::string::String;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};
use kmem_allocator::{
    HeapBacking, KmemAllocator, KmemConfig, MallocError, MallocFlags, MallocType, MapError,
    PageBacking, WaitChannel,
};

const PAGE_SIZE: usize = 0x1000;
const MAXALLOCSAVE: usize = 2 * PAGE_SIZE;

type Kmem = KmemAllocator<HeapBacking<PAGE_SIZE>, PAGE_SIZE>;

fn kmem_with(config: KmemConfig) -> Kmem {
    KmemAllocator::new(&config, HeapBacking::new())
}

fn kmem(pages: u32) -> Kmem {
    kmem_with(KmemConfig::default().with_fixed_arena(pages))
}

fn addr(ptr: NonNull<u8>) -> usize {
    ptr.as_ptr() as usize
}

#[test]
fn test_round_trip_reuses_pages() {
    for size in [1, 16, 100, 2048, MAXALLOCSAVE, MAXALLOCSAVE + 1, 5 * PAGE_SIZE] {
        let kmem = kmem(64);
        let first = kmem.malloc(size, MallocType::TEMP, MallocFlags::WAITOK).unwrap();
        kmem.free(first, MallocType::TEMP);
        let second = kmem.malloc(size, MallocType::TEMP, MallocFlags::WAITOK).unwrap();
        assert_eq!(
            kmem.page_index(addr(first)),
            kmem.page_index(addr(second)),
            "size {}",
            size
        );
        kmem.free(second, MallocType::TEMP);
    }
}

#[test]
fn test_threshold_boundary() {
    let kmem = kmem(64);

    let slab = kmem
        .malloc(MAXALLOCSAVE, MallocType::DEVBUF, MallocFlags::WAITOK)
        .unwrap();
    assert_eq!(kmem.large_stats().calls, 0);
    let class = kmem.size_classes().class_of(MAXALLOCSAVE).unwrap();
    assert_eq!(kmem.bucket_stats(class).unwrap().calls, 1);

    let large = kmem
        .malloc(MAXALLOCSAVE + 1, MallocType::DEVBUF, MallocFlags::WAITOK)
        .unwrap();
    assert_eq!(kmem.large_stats().calls, 1);
    assert_eq!(kmem.large_stats().live_pages, 3);

    kmem.free(slab, MallocType::DEVBUF);
    kmem.free(large, MallocType::DEVBUF);
}

#[test]
fn test_ceiling_rejects_with_error() {
    let kmem = kmem_with(
        KmemConfig::default()
            .with_fixed_arena(64)
            .with_large_ceiling(16),
    );
    assert_eq!(kmem.max_request(), 16 * PAGE_SIZE);

    for flags in [MallocFlags::NOWAIT, MallocFlags::WAITOK | MallocFlags::CANFAIL] {
        assert_eq!(
            kmem.malloc(16 * PAGE_SIZE + 1, MallocType::TEMP, flags),
            Err(MallocError::AllocationTooLarge)
        );
    }
    assert_eq!(kmem.arena_info().mapped_pages, 0);

    let ptr = kmem
        .malloc(16 * PAGE_SIZE, MallocType::TEMP, MallocFlags::WAITOK)
        .unwrap();
    kmem.free(ptr, MallocType::TEMP);
}

#[test]
#[should_panic(expected = "malloc: allocation too large")]
fn test_ceiling_panics_without_canfail() {
    let kmem = kmem_with(
        KmemConfig::default()
            .with_fixed_arena(64)
            .with_large_ceiling(16),
    );
    let _ = kmem.malloc(16 * PAGE_SIZE + 1, MallocType::TEMP, MallocFlags::WAITOK);
}

#[test]
fn test_zero_size_requests() {
    let kmem = kmem(16);
    let a = kmem.malloc(0, MallocType::TEMP, MallocFlags::WAITOK).unwrap();
    let b = kmem.malloc(0, MallocType::TEMP, MallocFlags::WAITOK).unwrap();
    assert_ne!(a, b);
    assert_eq!(kmem.roundup(0), 16);
    kmem.free(a, MallocType::TEMP);
    kmem.free(b, MallocType::TEMP);
}

#[test]
fn test_zero_fill() {
    let kmem = kmem(16);
    let ptr = kmem.malloc(64, MallocType::TEMP, MallocFlags::WAITOK).unwrap();
    unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0xa5, 64) };
    kmem.free(ptr, MallocType::TEMP);

    let again = kmem
        .malloc(64, MallocType::TEMP, MallocFlags::WAITOK | MallocFlags::ZERO)
        .unwrap();
    assert_eq!(again, ptr);
    let bytes = unsafe { core::slice::from_raw_parts(again.as_ptr(), 64) };
    assert!(bytes.iter().all(|&b| b == 0));
    kmem.free(again, MallocType::TEMP);
}

#[test]
fn test_many_small_objects_distinct() {
    let kmem = kmem(2048);
    let mut addrs: Vec<usize> = (0..1000)
        .map(|i| {
            let size = 1 + (i * 37) % 3000;
            addr(kmem.malloc(size, MallocType::PCB, MallocFlags::WAITOK).unwrap())
        })
        .collect();
    let all = addrs.clone();
    addrs.sort_unstable();
    addrs.dedup();
    assert_eq!(addrs.len(), 1000);

    for (i, a) in all.into_iter().enumerate() {
        let size = 1 + (i * 37) % 3000;
        let ptr = NonNull::new(a as *mut u8).unwrap();
        kmem.free_sized(ptr, MallocType::PCB, size);
    }
}

#[test]
#[should_panic(expected = "free: duplicated free")]
fn test_double_free_slab() {
    let kmem = kmem(16);
    let ptr = kmem.malloc(64, MallocType::TEMP, MallocFlags::WAITOK).unwrap();
    let _keep = kmem.malloc(64, MallocType::TEMP, MallocFlags::WAITOK).unwrap();
    kmem.free(ptr, MallocType::TEMP);
    kmem.free(ptr, MallocType::TEMP);
}

#[test]
#[should_panic(expected = "free: non-malloced addr")]
fn test_double_free_large() {
    let kmem = kmem(16);
    let ptr = kmem
        .malloc(3 * PAGE_SIZE, MallocType::TEMP, MallocFlags::WAITOK)
        .unwrap();
    kmem.free(ptr, MallocType::TEMP);
    kmem.free(ptr, MallocType::TEMP);
}

#[test]
#[should_panic(expected = "free: non-malloced addr")]
fn test_free_inside_large_run() {
    let kmem = kmem(16);
    let ptr = kmem
        .malloc(3 * PAGE_SIZE, MallocType::TEMP, MallocFlags::WAITOK)
        .unwrap();
    let tail = NonNull::new(unsafe { ptr.as_ptr().add(PAGE_SIZE) }).unwrap();
    kmem.free(tail, MallocType::TEMP);
}

#[test]
#[should_panic(expected = "free: unaligned addr")]
fn test_unaligned_free() {
    let kmem = kmem(16);
    let ptr = kmem.malloc(64, MallocType::TEMP, MallocFlags::WAITOK).unwrap();
    let inner = NonNull::new(unsafe { ptr.as_ptr().add(8) }).unwrap();
    kmem.free(inner, MallocType::TEMP);
}

#[test]
#[should_panic(expected = "free: type mismatch")]
fn test_large_free_with_wrong_type() {
    let kmem = kmem(16);
    let ptr = kmem
        .malloc(4 * PAGE_SIZE, MallocType::VNODE, MallocFlags::WAITOK)
        .unwrap();
    kmem.free(ptr, MallocType::TEMP);
}

#[test]
#[should_panic(expected = "free: type mismatch")]
fn test_slab_free_with_wrong_type() {
    let kmem = kmem(16);
    let _pcb = kmem.malloc(64, MallocType::PCB, MallocFlags::WAITOK).unwrap();
    let temp = kmem.malloc(64, MallocType::TEMP, MallocFlags::WAITOK).unwrap();
    kmem.free(temp, MallocType::PCB);
}

#[test]
#[should_panic(expected = "free: size mismatch")]
fn test_free_sized_large_mismatch() {
    let kmem = kmem(16);
    let ptr = kmem
        .malloc(4 * PAGE_SIZE, MallocType::TEMP, MallocFlags::WAITOK)
        .unwrap();
    kmem.free_sized(ptr, MallocType::TEMP, 2 * PAGE_SIZE + 1);
}

#[test]
fn test_arena_exhaustion_nowait() {
    // Keep the type limit out of the way: only the arena may run out.
    let kmem = kmem_with(
        KmemConfig::default()
            .with_fixed_arena(8)
            .with_type_limit_percent(200),
    );
    let mut ptrs = Vec::new();
    loop {
        match kmem.malloc(PAGE_SIZE, MallocType::TEMP, MallocFlags::NOWAIT) {
            Ok(ptr) => ptrs.push(ptr),
            Err(err) => {
                assert_eq!(err, MallocError::OutOfMemory);
                break;
            }
        }
    }
    assert_eq!(ptrs.len(), 8);
    assert_eq!(kmem.arena_info().mapped_pages, 8);

    #[cfg(feature = "kmemstats")]
    assert_eq!(kmem.type_stats(MallocType::TEMP).map_blocks, 1);

    for ptr in ptrs {
        kmem.free(ptr, MallocType::TEMP);
    }
    // Three of the eight slabs went back to the arena.
    assert!(kmem
        .malloc(3 * PAGE_SIZE, MallocType::TEMP, MallocFlags::NOWAIT)
        .is_ok());
}

#[test]
#[should_panic(expected = "malloc: out of space in kmem_map")]
fn test_arena_exhaustion_waitok_panics() {
    let kmem = kmem(4);
    let _ = kmem.malloc(5 * PAGE_SIZE, MallocType::TEMP, MallocFlags::WAITOK);
}

#[test]
fn test_physical_pressure_fails_soft() {
    let kmem = KmemAllocator::<_, PAGE_SIZE>::new(
        &KmemConfig::default().with_fixed_arena(64),
        HeapBacking::<PAGE_SIZE>::new().with_resident_limit(2),
    );
    let a = kmem
        .malloc(2 * PAGE_SIZE, MallocType::TEMP, MallocFlags::WAITOK)
        .unwrap();
    assert_eq!(
        kmem.malloc(16, MallocType::TEMP, MallocFlags::WAITOK | MallocFlags::CANFAIL),
        Err(MallocError::OutOfMemory)
    );
    kmem.free(a, MallocType::TEMP);
}

/// Backing that is short of physical pages for its first few requests.
struct ShortBacking {
    inner: HeapBacking<PAGE_SIZE>,
    shortages: usize,
}

impl ShortBacking {
    fn new(shortages: usize) -> Self {
        Self {
            inner: HeapBacking::new(),
            shortages,
        }
    }
}

// SAFETY: every run comes from the wrapped `HeapBacking`.
unsafe impl PageBacking for ShortBacking {
    fn reserve_region(&mut self, size: usize) -> Option<(usize, usize)> {
        self.inner.reserve_region(size)
    }

    fn map_pages(&mut self, num_pages: usize, flags: MallocFlags) -> Result<usize, MapError> {
        if self.shortages > 0 {
            self.shortages -= 1;
            return Err(MapError::Shortage);
        }
        self.inner.map_pages(num_pages, flags)
    }

    fn unmap_pages(&mut self, addr: usize, num_pages: usize) {
        self.inner.unmap_pages(addr, num_pages)
    }
}

struct PageWaitCounter {
    waits: AtomicUsize,
    wakeups: AtomicUsize,
}

impl WaitChannel for PageWaitCounter {
    fn sleep(&self, _tag: MallocType) {}

    fn wakeup(&self, _tag: MallocType) {}

    fn page_wait(&self) {
        self.waits.fetch_add(1, Ordering::SeqCst);
    }

    fn page_wakeup(&self) {
        self.wakeups.fetch_add(1, Ordering::SeqCst);
    }
}

static PAGE_WAITS: PageWaitCounter = PageWaitCounter {
    waits: AtomicUsize::new(0),
    wakeups: AtomicUsize::new(0),
};

#[test]
fn test_page_shortage_waitok_retries() {
    let kmem = KmemAllocator::<_, PAGE_SIZE>::new(
        &KmemConfig::default().with_fixed_arena(64),
        ShortBacking::new(2),
    )
    .with_wait_channel(&PAGE_WAITS);

    let ptr = kmem
        .malloc(3 * PAGE_SIZE, MallocType::TEMP, MallocFlags::WAITOK)
        .unwrap();
    assert_eq!(PAGE_WAITS.waits.load(Ordering::SeqCst), 2);
    assert_eq!(kmem.arena_info().mapped_pages, 3);

    kmem.free(ptr, MallocType::TEMP);
    assert_eq!(PAGE_WAITS.wakeups.load(Ordering::SeqCst), 1);
}

#[test]
fn test_page_shortage_nowait_fails() {
    let kmem = KmemAllocator::<_, PAGE_SIZE>::new(
        &KmemConfig::default().with_fixed_arena(64),
        ShortBacking::new(1),
    );
    assert_eq!(
        kmem.malloc(32, MallocType::TEMP, MallocFlags::NOWAIT),
        Err(MallocError::OutOfMemory)
    );
    assert_eq!(kmem.arena_info().mapped_pages, 0);

    let ptr = kmem.malloc(32, MallocType::TEMP, MallocFlags::NOWAIT).unwrap();
    kmem.free(ptr, MallocType::TEMP);
}

#[test]
fn test_pool_object_limit() {
    let kmem = kmem_with(
        KmemConfig::default()
            .with_fixed_arena(64)
            .with_pool_object_limit(4),
    );
    let ptrs: Vec<_> = (0..4)
        .map(|_| kmem.malloc(2048, MallocType::TEMP, MallocFlags::NOWAIT).unwrap())
        .collect();
    assert_eq!(
        kmem.malloc(2048, MallocType::TEMP, MallocFlags::NOWAIT),
        Err(MallocError::OutOfMemory)
    );
    // Large requests do not go through the pools.
    let large = kmem
        .malloc(3 * PAGE_SIZE, MallocType::TEMP, MallocFlags::NOWAIT)
        .unwrap();

    kmem.free(large, MallocType::TEMP);
    for ptr in ptrs {
        kmem.free(ptr, MallocType::TEMP);
    }
}

#[test]
fn test_empty_slabs_return_to_arena() {
    let kmem = kmem(64);
    let ptrs: Vec<_> = (0..10)
        .map(|_| kmem.malloc(PAGE_SIZE, MallocType::TEMP, MallocFlags::WAITOK).unwrap())
        .collect();
    assert_eq!(kmem.arena_info().mapped_pages, 10);
    for ptr in ptrs {
        kmem.free(ptr, MallocType::TEMP);
    }

    let class = kmem.size_classes().class_of(PAGE_SIZE).unwrap();
    let stats = kmem.bucket_stats(class).unwrap();
    assert_eq!(stats.high_water, 5);
    assert_eq!(stats.total_free, 5);
    assert_eq!(stats.released, 5);
    assert_eq!(kmem.arena_info().mapped_pages, 5);
}

#[cfg(feature = "kmemstats")]
#[test]
fn test_stats_conservation() {
    let kmem = kmem(256);
    let sizes = [1, 17, 200, 1000, 4096, 8192, 8193, 20000];
    let ptrs: Vec<_> = sizes
        .iter()
        .map(|&size| kmem.malloc(size, MallocType::MOUNT, MallocFlags::WAITOK).unwrap())
        .collect();

    let expected: usize = sizes.iter().map(|&size| kmem.roundup(size)).sum();
    let stats = kmem.type_stats(MallocType::MOUNT);
    assert_eq!(stats.in_use, sizes.len() as u64);
    assert_eq!(stats.calls, sizes.len() as u64);
    assert_eq!(stats.bytes_in_use, expected);

    for (i, ptr) in ptrs.into_iter().enumerate().filter(|(i, _)| i % 2 == 0) {
        kmem.free_sized(ptr, MallocType::MOUNT, sizes[i]);
    }
    let live: usize = sizes
        .iter()
        .enumerate()
        .filter(|(i, _)| i % 2 == 1)
        .map(|(_, &size)| kmem.roundup(size))
        .sum();
    let stats = kmem.type_stats(MallocType::MOUNT);
    assert_eq!(stats.in_use, 4);
    assert_eq!(stats.bytes_in_use, live);
    assert_eq!(stats.max_bytes_used, expected);
    assert_eq!(kmem.type_stats(MallocType::TEMP).calls, 0);
}

#[cfg(feature = "kmemstats")]
#[test]
fn test_type_limit_refuses_nowait() {
    let kmem = kmem(64);
    kmem.set_type_limit(MallocType::SEM, 100);

    let a = kmem.malloc(128, MallocType::SEM, MallocFlags::NOWAIT).unwrap();
    assert_eq!(
        kmem.malloc(16, MallocType::SEM, MallocFlags::NOWAIT),
        Err(MallocError::RateLimited)
    );
    assert_eq!(kmem.type_stats(MallocType::SEM).limit_blocks, 1);
    // Other types are unaffected.
    let b = kmem.malloc(16, MallocType::TEMP, MallocFlags::NOWAIT).unwrap();

    kmem.free(a, MallocType::SEM);
    let c = kmem.malloc(16, MallocType::SEM, MallocFlags::NOWAIT).unwrap();
    kmem.free(b, MallocType::TEMP);
    kmem.free(c, MallocType::SEM);
}

#[cfg(feature = "kmemstats")]
#[test]
fn test_report() {
    let kmem = kmem(64);
    let a = kmem.malloc(3000, MallocType::DEVBUF, MallocFlags::WAITOK).unwrap();
    let b = kmem.malloc(40, MallocType::PIPE, MallocFlags::WAITOK).unwrap();

    let mut out = String::new();
    kmem.report(&mut out).unwrap();
    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].contains("Type") && lines[0].contains("Kern Lim"));
    assert!(lines[1].trim_start().starts_with("devbuf"));
    assert!(lines[2].trim_start().starts_with("pipe"));

    kmem.free(a, MallocType::DEVBUF);
    kmem.free(b, MallocType::PIPE);
}

#[cfg(not(feature = "kmemstats"))]
#[test]
fn test_report_without_stats() {
    let kmem = kmem(16);
    let mut out = String::new();
    kmem.report(&mut out).unwrap();
    assert_eq!(out, "No KMEMSTATS compiled in\n");
}
