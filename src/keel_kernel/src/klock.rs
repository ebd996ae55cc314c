//! Kernel state locking mechanism ("CPU Lock").
//!
//! The CPU Lock is the kernel critical section: interrupts at or below the
//! kernel priority threshold are masked while it is held. Holding it is
//! represented in the type system by [`CpuLockToken`]; every cell of
//! kernel-shared state is a [`CpuLockCell`] that can only be read or
//! written by presenting the token.
use core::{fmt, ops};
use tokenlock::UnsyncTokenLock;

use crate::{port, utils::Init};

pub(crate) struct CpuLockTag;

/// The key that "unlocks" [`CpuLockCell`].
pub(crate) type CpuLockToken = tokenlock::UnsyncSingletonToken<CpuLockTag>;

/// The keyhole type for [`UnsyncTokenLock`] that can be "unlocked" by
/// [`CpuLockToken`].
pub(crate) type CpuLockKeyhole = tokenlock::SingletonTokenId<CpuLockTag>;

/// Borrowed version of [`CpuLockGuard`]. This is equivalent to
/// `&'a mut CpuLockGuard` but does not consume memory.
///
/// Prefer this over `&mut CpuLockGuard` in function parameters. Unlike
/// `&mut _`, it is not automatically reborrowed across a call — use
/// [`borrow_mut`](tokenlock::UnsyncSingletonTokenRefMut::borrow_mut) when
/// the token is needed again after passing it on.
pub(crate) type CpuLockTokenRefMut<'a> = tokenlock::UnsyncSingletonTokenRefMut<'a, CpuLockTag>;

/// Cell type that can be accessed by [`CpuLockToken`] (which can be
/// obtained by [`lock_cpu`]).
pub(crate) struct CpuLockCell<T: ?Sized>(UnsyncTokenLock<T, CpuLockKeyhole>);

impl<T> CpuLockCell<T> {
    pub(crate) const fn new(x: T) -> Self {
        Self(UnsyncTokenLock::new(CpuLockKeyhole::INIT, x))
    }
}

impl<T: Init> Init for CpuLockCell<T> {
    const INIT: Self = Self::new(T::INIT);
}

impl<T: ?Sized> ops::Deref for CpuLockCell<T> {
    type Target = UnsyncTokenLock<T, CpuLockKeyhole>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T: ?Sized> ops::DerefMut for CpuLockCell<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<T: ?Sized> fmt::Debug for CpuLockCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("CpuLockCell(..)")
    }
}

/// Enter the CPU Lock state and get an RAII guard.
///
/// The port's critical-section primitive nests, so this is callable from
/// any context; kernel code is nonetheless written to acquire the lock once
/// at each entry point and pass the token down.
pub(crate) fn lock_cpu() -> CpuLockGuard {
    port::enter_critical();

    // Safety: the critical section was just entered; interrupts at kernel
    // priority cannot preempt us, and kernel code does not re-lock while
    // already holding a guard or token.
    CpuLockGuard {
        token: unsafe { CpuLockToken::new_unchecked() },
    }
}

/// Materialize a [`CpuLockToken`] in a context where the critical section
/// is already active (an interrupt path that used the ISR-variant
/// primitives).
///
/// # Safety
///
/// The critical section must really be active, and no other
/// `CpuLockToken`/`CpuLockGuard` may be live in this context.
pub(crate) unsafe fn assume_cpu_lock() -> CpuLockToken {
    debug_assert!(port::in_critical());

    // Safety: upheld by the caller
    unsafe { CpuLockToken::new_unchecked() }
}

/// RAII guard for the CPU Lock state.
///
/// [`CpuLockToken`] can be borrowed from this type.
pub(crate) struct CpuLockGuard {
    token: CpuLockToken,
}

impl CpuLockGuard {
    /// Construct a [`CpuLockTokenRefMut`] by borrowing `self`.
    pub(crate) fn borrow_mut(&mut self) -> CpuLockTokenRefMut<'_> {
        self.token.borrow_mut()
    }
}

impl Drop for CpuLockGuard {
    fn drop(&mut self) {
        port::exit_critical();
    }
}

impl ops::Deref for CpuLockGuard {
    type Target = CpuLockToken;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl ops::DerefMut for CpuLockGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}
