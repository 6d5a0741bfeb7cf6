//! Per-type accounting (`kmemstats`) and the wait channel used when a type
//! is over its limit.

use core::fmt;

use crate::MallocType;
#[cfg(feature = "kmemstats")]
use crate::{ClassIndex, FreeFault};

/// Saturation point of the block counters.
#[cfg(feature = "kmemstats")]
const MAX_BLOCK_COUNT: u32 = 65535;

const SPIN_ROUNDS: usize = 1 << 10;

/// The sleep/wakeup primitive a blocked `malloc` waits on.
///
/// Every method is called without the allocator lock held. The sleeps may
/// return early; the caller re-checks its condition after every return.
pub trait WaitChannel: Sync {
    /// Wait until `wakeup(tag)` or for some bounded time.
    fn sleep(&self, tag: MallocType);

    /// Wake every sleeper on `tag`.
    fn wakeup(&self, tag: MallocType);

    /// Wait for physical pages after the backing reported a shortage.
    fn page_wait(&self) {
        for _ in 0..SPIN_ROUNDS {
            core::hint::spin_loop();
        }
    }

    /// Pages went back to the backing.
    fn page_wakeup(&self) {}
}

/// Busy-waiting channel for contexts without a scheduler.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpinWait;

impl WaitChannel for SpinWait {
    fn sleep(&self, _tag: MallocType) {
        for _ in 0..SPIN_ROUNDS {
            core::hint::spin_loop();
        }
    }

    fn wakeup(&self, _tag: MallocType) {}
}

/// Counters of one malloc type.
#[cfg(feature = "kmemstats")]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KmemStats {
    /// Live allocations.
    pub in_use: u64,
    /// Successful allocations, ever.
    pub calls: u64,
    /// Bytes in live allocations, after rounding.
    pub bytes_in_use: usize,
    /// High-water mark of `bytes_in_use`.
    pub max_bytes_used: usize,
    /// `malloc` waits or refuses while `bytes_in_use` is at or above this.
    pub bytes_limit: usize,
    /// Times a request found the type over its limit.
    pub limit_blocks: u32,
    /// Times a request found the arena exhausted.
    pub map_blocks: u32,
    /// Bit `i` set once a request was served from size class `i`.
    pub size_classes: u32,
}

/// Counters of every malloc type, indexed by type id.
#[cfg(feature = "kmemstats")]
#[derive(Clone)]
pub struct StatsRegistry {
    records: [KmemStats; MallocType::COUNT],
}

#[cfg(feature = "kmemstats")]
impl StatsRegistry {
    /// A registry with every type limited to `default_limit` bytes.
    pub fn new(default_limit: usize) -> Self {
        Self {
            records: [KmemStats {
                bytes_limit: default_limit,
                ..KmemStats::default()
            }; MallocType::COUNT],
        }
    }

    pub fn record(&self, tag: MallocType) -> KmemStats {
        self.records[tag.id()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (MallocType, &KmemStats)> {
        MallocType::all().zip(self.records.iter())
    }

    pub fn set_limit(&mut self, tag: MallocType, bytes: usize) {
        self.records[tag.id()].bytes_limit = bytes;
    }

    pub fn over_limit(&self, tag: MallocType) -> bool {
        let record = &self.records[tag.id()];
        record.bytes_in_use >= record.bytes_limit
    }

    /// Count a request that had to wait for, or was refused by, the limit.
    pub fn note_limit_block(&mut self, tag: MallocType) {
        let record = &mut self.records[tag.id()];
        if record.limit_blocks < MAX_BLOCK_COUNT {
            record.limit_blocks += 1;
        }
    }

    /// Count a request that found no room in the arena.
    pub fn note_map_block(&mut self, tag: MallocType) {
        let record = &mut self.records[tag.id()];
        if record.map_blocks < MAX_BLOCK_COUNT {
            record.map_blocks += 1;
        }
    }

    /// Charge `bytes` to `tag`. `class` is `None` for large objects.
    pub fn record_alloc(&mut self, tag: MallocType, bytes: usize, class: Option<ClassIndex>) {
        let record = &mut self.records[tag.id()];
        record.in_use += 1;
        record.calls += 1;
        record.bytes_in_use += bytes;
        if record.bytes_in_use > record.max_bytes_used {
            record.max_bytes_used = record.bytes_in_use;
        }
        if let Some(class) = class {
            record.size_classes |= 1 << class.get();
        }
    }

    /// Whether `tag` can give back an allocation of `bytes`.
    pub(crate) fn check_free(&self, tag: MallocType, bytes: usize) -> Result<(), FreeFault> {
        let record = &self.records[tag.id()];
        if record.in_use == 0 || record.bytes_in_use < bytes {
            return Err(FreeFault::NotLive);
        }
        Ok(())
    }

    /// Credit `bytes` back to `tag`.
    ///
    /// Returns true when this free took the type from at-or-over its limit to
    /// under it, i.e. when sleepers should be woken.
    pub fn record_free(&mut self, tag: MallocType, bytes: usize) -> bool {
        let record = &mut self.records[tag.id()];
        let was_over = record.bytes_in_use >= record.bytes_limit;
        record.in_use = record.in_use.saturating_sub(1);
        record.bytes_in_use = record.bytes_in_use.saturating_sub(bytes);
        was_over && record.bytes_in_use < record.bytes_limit
    }

    /// The ddb `show malloc` table: one row per type that was ever used.
    pub fn write_report<W: fmt::Write>(&self, out: &mut W) -> fmt::Result {
        writeln!(
            out,
            "{:>15} {:>5}  {:>6}  {:>7}  {:>6} {:>9} {:>8} {:>8}",
            "Type", "InUse", "MemUse", "HighUse", "Limit", "Requests", "Type Lim", "Kern Lim"
        )?;
        for (tag, record) in self.iter().filter(|(_, record)| record.calls != 0) {
            writeln!(
                out,
                "{:>15} {:>5} {:>6}K {:>7}K {:>6}K {:>9} {:>8} {:>8}",
                tag.name(),
                record.in_use,
                record.bytes_in_use / 1024,
                record.max_bytes_used / 1024,
                record.bytes_limit / 1024,
                record.calls,
                record.limit_blocks,
                record.map_blocks
            )?;
        }
        Ok(())
    }
}

/// Without per-type accounting there is nothing to report.
#[cfg(not(feature = "kmemstats"))]
pub(crate) fn write_disabled_report<W: fmt::Write>(out: &mut W) -> fmt::Result {
    writeln!(out, "No KMEMSTATS compiled in")
}
