//! Counting semaphores.
//!
//! A signal with waiters present wakes the highest-priority waiter instead
//! of raising the count — the wakeup itself consumes the permit, so no
//! other task can slip in between.
use crate::{
    arena, kernel,
    klock::{self, CpuLockCell},
    utils::Init,
    wait::{BlockedOn, WaitQueue},
    Kind, NO_WAIT, Result, Tick,
};

/// *Semaphore control block*.
pub struct SemaphoreCb {
    pub(crate) count: CpuLockCell<u32>,
    /// Zero means unbounded.
    pub(crate) max: CpuLockCell<u32>,
    pub(crate) waiters: WaitQueue,
}

impl Init for SemaphoreCb {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        count: CpuLockCell::new(0),
        max: CpuLockCell::new(0),
        waiters: WaitQueue::INIT,
    };
}

/// A handle to a counting semaphore.
#[derive(Clone, Copy)]
pub struct Semaphore(&'static SemaphoreCb);

impl core::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("Semaphore")
            .field(&(self.0 as *const _))
            .finish()
    }
}

impl Semaphore {
    /// Allocate a semaphore with the given initial count. `max == 0`
    /// leaves the count unbounded; otherwise `initial` must not exceed
    /// `max`.
    pub fn create(initial: u32, max: u32) -> Result<Semaphore> {
        if max != 0 && initial > max {
            return Err(Kind::InvalidParam);
        }

        let mut guard = klock::lock_cpu();
        let cb = arena::alloc::<SemaphoreCb>(guard.borrow_mut()).ok_or(Kind::NoMemory)?;
        cb.count.replace(&mut *guard, initial);
        cb.max.replace(&mut *guard, max);
        Ok(Semaphore(cb))
    }

    /// Take one permit, waiting up to `timeout` ticks for one to appear.
    pub fn wait(&self, timeout: Tick) -> Result {
        let s = self.0;
        let mut guard = klock::lock_cpu();

        let count = s.count.get(&*guard);
        if count > 0 {
            s.count.replace(&mut *guard, count - 1);
            return Ok(());
        }

        if timeout == NO_WAIT {
            return Err(Kind::Timeout);
        }

        let Some(current) = kernel::running_task(guard.borrow_mut()) else {
            log::error!("semaphore wait with no current task");
            return Err(Kind::InvalidState);
        };

        s.waiters
            .insert(guard.borrow_mut(), current, BlockedOn::Semaphore(s));
        kernel::block_current(guard, current, timeout);

        // Resumed: a signaller that woke us cleared the tag and consumed
        // the permit on our behalf; a surviving tag means timeout.
        let mut guard = klock::lock_cpu();
        if current.blocked_on.get(&*guard) == BlockedOn::Semaphore(s) {
            s.waiters.remove(guard.borrow_mut(), current);
            return Err(Kind::Timeout);
        }
        Ok(())
    }

    /// Take one permit without blocking.
    pub fn try_wait(&self) -> Result {
        self.wait(NO_WAIT)
    }

    /// Release one permit: wake the highest-priority waiter, or raise the
    /// count when nobody is waiting.
    pub fn signal(&self) -> Result {
        let s = self.0;
        let mut guard = klock::lock_cpu();

        if let Some(waiter) = s.waiters.pop(guard.borrow_mut()) {
            kernel::task_unblock(guard.borrow_mut(), waiter);
            return Ok(());
        }

        let count = s.count.get(&*guard);
        let max = s.max.get(&*guard);
        if max != 0 && count >= max {
            log::error!("semaphore overflow (count={}, max={})", count, max);
            return Err(Kind::Full);
        }
        s.count.replace(&mut *guard, count + 1);
        Ok(())
    }

    /// The number of available permits.
    pub fn count(&self) -> u32 {
        let guard = klock::lock_cpu();
        self.0.count.get(&*guard)
    }

    #[cfg(test)]
    pub(crate) fn cb(&self) -> &'static SemaphoreCb {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        task::{self, TaskSt},
        test_support, Task,
    };

    #[test]
    fn counts_and_bounds() {
        test_support::run(|| {
            test_support::bind_default_scheduler();

            assert_eq!(
                Semaphore::create(3, 2).unwrap_err(),
                Kind::InvalidParam
            );

            let s = Semaphore::create(1, 2).unwrap();
            assert_eq!(s.count(), 1);
            s.signal().unwrap();
            assert_eq!(s.count(), 2);
            assert_eq!(s.signal().unwrap_err(), Kind::Full);

            s.try_wait().unwrap();
            s.try_wait().unwrap();
            assert_eq!(s.try_wait().unwrap_err(), Kind::Timeout);
        });
    }

    #[test]
    fn unbounded_when_max_is_zero() {
        test_support::run(|| {
            test_support::bind_default_scheduler();

            let s = Semaphore::create(0, 0).unwrap();
            for _ in 0..100 {
                s.signal().unwrap();
            }
            assert_eq!(s.count(), 100);
        });
    }

    #[test]
    fn signal_wakes_highest_priority_waiter() {
        test_support::run(|| {
            test_support::bind_default_scheduler();
            let [t1, t2, t3] = test_support::spawn_tasks([1, 2, 3]);
            let s = Semaphore::create(0, 1).unwrap();

            // Park all three on the semaphore, lowest priority first.
            for t in [t1, t2, t3] {
                test_support::make_current(t);
                let mut guard = crate::klock::lock_cpu();
                s.cb()
                    .waiters
                    .insert(guard.borrow_mut(), t, BlockedOn::Semaphore(s.cb()));
                task::set_state(guard.borrow_mut(), t, TaskSt::Blocked).unwrap();
            }

            s.signal().unwrap();

            // The priority-3 task was the one awakened; the permit was
            // consumed by the wakeup, not deposited in the count.
            assert_eq!(Task(t3).state(), TaskSt::Ready);
            assert_eq!(Task(t1).state(), TaskSt::Blocked);
            assert_eq!(Task(t2).state(), TaskSt::Blocked);
            assert_eq!(s.count(), 0);

            let mut guard = crate::klock::lock_cpu();
            assert!(!s.cb().waiters.contains(guard.borrow_mut(), t3));
            assert!(s.cb().waiters.contains(guard.borrow_mut(), t1));
        });
    }
}
