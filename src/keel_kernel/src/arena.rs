//! The kernel memory arena.
//!
//! A process-wide byte pool with bump allocation: `alloc` rounds the
//! requested size up to 8 bytes, advances a cursor and hands out the
//! region. There is no free. Deterministic, fragmentation-free, bounded
//! WCET — and callers must treat every allocation as permanent.
//!
//! The arena itself is not synchronized; every operation takes the CPU
//! Lock token.
use core::cell::UnsafeCell;
use core::mem;
use core::ptr::NonNull;

use crate::{
    cfg,
    klock::{CpuLockCell, CpuLockTokenRefMut},
    utils::Init,
};

#[repr(align(8))]
struct Storage(UnsafeCell<[u8; cfg::TOTAL_HEAP_SIZE]>);

// Safety: the backing bytes are only handed out once, under the CPU Lock.
unsafe impl Sync for Storage {}

struct Arena {
    storage: Storage,
    next: CpuLockCell<usize>,
}

static ARENA: Arena = Arena {
    storage: Storage(UnsafeCell::new([0; cfg::TOTAL_HEAP_SIZE])),
    next: CpuLockCell::new(0),
};

const ALIGN: usize = 8;

fn align_up(x: usize) -> usize {
    (x + (ALIGN - 1)) & !(ALIGN - 1)
}

/// Allocate `size` bytes (rounded up to 8). Returns `None` when the pool
/// is exhausted; the pool is left unchanged in that case.
pub(crate) fn alloc_bytes(mut lock: CpuLockTokenRefMut<'_>, size: usize) -> Option<NonNull<u8>> {
    let size = align_up(size);
    let offset = ARENA.next.get(&*lock);

    if size > cfg::TOTAL_HEAP_SIZE - offset {
        log::error!(
            "arena exhausted: need {} bytes, {} free",
            size,
            cfg::TOTAL_HEAP_SIZE - offset
        );
        return None;
    }

    ARENA.next.replace(&mut *lock, offset + size);

    // Safety: `offset + size` is within the storage array, and this region
    // has never been handed out before (the cursor only grows).
    let ptr = unsafe { (ARENA.storage.0.get() as *mut u8).add(offset) };
    NonNull::new(ptr)
}

/// Allocate storage for a `T` and initialize it to `T::INIT`, returning a
/// `'static` reference. `T` must not need more than 8-byte alignment.
pub(crate) fn alloc<T: Init>(lock: CpuLockTokenRefMut<'_>) -> Option<&'static T> {
    const { assert!(mem::align_of::<T>() <= ALIGN) };

    let ptr = alloc_bytes(lock, mem::size_of::<T>())?.cast::<T>();
    // Safety: freshly allocated, properly aligned, never aliased, never
    // reclaimed
    unsafe {
        ptr.as_ptr().write(T::INIT);
        Some(&*ptr.as_ptr())
    }
}

/// Bytes currently allocated.
pub(crate) fn used(lock: CpuLockTokenRefMut<'_>) -> usize {
    ARENA.next.get(&*lock)
}

/// Total pool size.
pub(crate) fn capacity() -> usize {
    cfg::TOTAL_HEAP_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::klock;

    #[test]
    fn alignment_and_rounding() {
        let mut lock = klock::lock_cpu();

        let before = used(lock.borrow_mut());
        let p = alloc_bytes(lock.borrow_mut(), 3).unwrap();
        assert_eq!(p.as_ptr() as usize % 8, 0);
        assert_eq!(used(lock.borrow_mut()) - before, 8);

        let q = alloc_bytes(lock.borrow_mut(), 16).unwrap();
        assert_eq!(q.as_ptr() as usize % 8, 0);
        assert_eq!(used(lock.borrow_mut()) - before, 24);
        assert_ne!(p.as_ptr(), q.as_ptr());
    }

    #[test]
    fn exhaustion_reports_none_and_preserves_cursor() {
        let mut lock = klock::lock_cpu();

        let before = used(lock.borrow_mut());
        assert!(alloc_bytes(lock.borrow_mut(), cfg::TOTAL_HEAP_SIZE + 8).is_none());
        assert_eq!(used(lock.borrow_mut()), before);
    }

    #[test]
    fn typed_alloc_is_initialized() {
        let mut lock = klock::lock_cpu();

        let v: &'static CpuLockCell<u32> = alloc(lock.borrow_mut()).unwrap();
        assert_eq!(v.get(&*lock.borrow_mut()), 0);
    }
}
