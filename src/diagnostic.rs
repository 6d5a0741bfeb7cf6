//! Free-object poisoning.
//!
//! The first words of every free slab object hold a known pattern. Finding
//! anything else when the object is handed out again means someone wrote to
//! it after it was freed.

#[cfg(feature = "log")]
use log::error;

/// Pattern written into free objects.
pub(crate) const WEIRD_ADDR: u32 = 0xdead_beef;

/// Bytes of each free object that are poisoned.
pub(crate) const MAX_COPY: usize = 32;

const WORD: usize = core::mem::size_of::<u32>();

fn copy_words(object_size: usize) -> usize {
    object_size.min(MAX_COPY) / WORD
}

/// Fill the head of a free object with [`WEIRD_ADDR`].
///
/// # Safety
///
/// `addr` must point to at least `min(object_size, MAX_COPY)` writable bytes,
/// aligned for `u32`.
pub(crate) unsafe fn poison(addr: usize, object_size: usize) {
    let words = addr as *mut u32;
    for i in 0..copy_words(object_size) {
        unsafe { words.add(i).write_volatile(WEIRD_ADDR) };
    }
}

/// Check that the pattern written by [`poison`] is intact.
///
/// Returns the first modified word and its value. Modification is reported,
/// not fatal: the object is handed out regardless.
///
/// # Safety
///
/// Same as [`poison`], with readable instead of writable.
pub(crate) unsafe fn check_poison(addr: usize, object_size: usize) -> Option<(usize, u32)> {
    let words = addr as *const u32;
    for i in 0..copy_words(object_size) {
        let value = unsafe { words.add(i).read_volatile() };
        if value != WEIRD_ADDR {
            error!(
                "Data modified on freelist: word {} of object {:#x} size {:#x} ({:#x} != {:#x})",
                i, addr, object_size, value, WEIRD_ADDR
            );
            return Some((i, value));
        }
    }
    None
}
