//! Mutexes.
//!
//! Recursive, with a priority-ordered wait queue and transitive priority
//! inheritance: while a higher-priority task waits, the owner (and any
//! owner it is itself waiting on, along the chain of mutex ownership) runs
//! at the waiter's effective priority. On the final unlock the owner drops
//! back to its base priority and the highest-priority waiter is handed the
//! ownership directly — no task can steal the mutex between wakeup and
//! acquisition.
use crate::{
    arena, cfg, kernel,
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    task::{self, TaskCb, TaskSt},
    utils::Init,
    wait::{BlockedOn, WaitQueue},
    Kind, NO_WAIT, Result, Tick,
};

/// *Mutex control block*.
pub struct MutexCb {
    pub(crate) owner: CpuLockCell<Option<&'static TaskCb>>,
    pub(crate) recursion: CpuLockCell<u8>,
    pub(crate) waiters: WaitQueue,
}

impl Init for MutexCb {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        owner: CpuLockCell::new(None),
        recursion: CpuLockCell::new(0),
        waiters: WaitQueue::INIT,
    };
}

/// A handle to a mutex.
#[derive(Clone, Copy)]
pub struct Mutex(&'static MutexCb);

impl Mutex {
    /// Allocate a new, unowned mutex from the arena.
    pub fn create() -> Result<Mutex> {
        let mut guard = klock::lock_cpu();
        let cb = arena::alloc::<MutexCb>(guard.borrow_mut()).ok_or(Kind::NoMemory)?;
        Ok(Mutex(cb))
    }

    /// Acquire the mutex, waiting up to `timeout` ticks.
    ///
    /// [`NO_WAIT`](crate::NO_WAIT) makes a single attempt;
    /// [`MAX_WAIT`](crate::MAX_WAIT) waits forever. Re-acquisition by the
    /// owner increments a recursion count.
    pub fn lock(&self, timeout: Tick) -> Result {
        let m = self.0;
        let mut guard = klock::lock_cpu();

        let Some(current) = kernel::running_task(guard.borrow_mut()) else {
            log::error!("mutex lock with no current task");
            return Err(Kind::InvalidState);
        };

        let owner = m.owner.get(&*guard);
        match owner {
            None => {
                m.owner.replace(&mut *guard, Some(current));
                m.recursion.replace(&mut *guard, 1);
                return Ok(());
            }
            Some(owner) if core::ptr::eq(owner, current) => {
                let n = m.recursion.get(&*guard);
                if n >= cfg::MAX_MUTEX_RECURSION {
                    log::error!("mutex recursion limit reached");
                    return Err(Kind::InvalidState);
                }
                m.recursion.replace(&mut *guard, n + 1);
                return Ok(());
            }
            Some(_) => {}
        }

        if timeout == NO_WAIT {
            return Err(Kind::Timeout);
        }

        enqueue_waiter(guard.borrow_mut(), m, current);
        kernel::block_current(guard, current, timeout);

        // Resumed: either the unlocker handed us the ownership (and
        // cleared the tag), or the wait timed out.
        let mut guard = klock::lock_cpu();
        if m.waiters.contains(guard.borrow_mut(), current)
            && current.blocked_on.get(&*guard) == BlockedOn::Mutex(m)
        {
            m.waiters.remove(guard.borrow_mut(), current);
            return Err(Kind::Timeout);
        }

        debug_assert!(m
            .owner
            .get(&*guard)
            .is_some_and(|o| core::ptr::eq(o, current)));
        Ok(())
    }

    /// Release the mutex. Only the owner may unlock; the final release
    /// restores the owner's base priority and hands the mutex to the
    /// highest-priority waiter.
    pub fn unlock(&self) -> Result {
        let m = self.0;
        let mut guard = klock::lock_cpu();

        let current = kernel::running_task(guard.borrow_mut());
        let owned_by_current = match (m.owner.get(&*guard), current) {
            (Some(owner), Some(cur)) => core::ptr::eq(owner, cur),
            _ => false,
        };
        if !owned_by_current {
            log::error!("mutex unlock by non-owner");
            return Err(Kind::InvalidState);
        }
        let current = current.unwrap_or_else(|| unreachable!());

        let n = m.recursion.get(&*guard);
        if n > 1 {
            m.recursion.replace(&mut *guard, n - 1);
            return Ok(());
        }

        // Final release: shed any inherited boost.
        let base = current.base_priority.get(&*guard);
        task::set_effective_priority(guard.borrow_mut(), current, base);

        if let Some(waiter) = m.waiters.pop(guard.borrow_mut()) {
            // Ownership transfers under the same critical section that
            // removed the waiter from the queue.
            m.owner.replace(&mut *guard, Some(waiter));
            m.recursion.replace(&mut *guard, 1);
            kernel::task_unblock(guard.borrow_mut(), waiter);
        } else {
            m.owner.replace(&mut *guard, None);
            m.recursion.replace(&mut *guard, 0);
        }

        Ok(())
    }

    /// The current owner, if any.
    pub fn owner(&self) -> Option<crate::Task> {
        let guard = klock::lock_cpu();
        self.0.owner.get(&*guard).map(crate::Task)
    }

    #[cfg(test)]
    pub(crate) fn cb(&self) -> &'static MutexCb {
        self.0
    }
}

/// Park `task` in the mutex's wait queue, boosting the ownership chain
/// first. The caller is responsible for blocking the task afterwards.
pub(crate) fn enqueue_waiter(
    mut lock: CpuLockTokenRefMut<'_>,
    m: &'static MutexCb,
    task: &'static TaskCb,
) {
    apply_priority_inheritance(lock.borrow_mut(), m, task);
    m.waiters.insert(lock.borrow_mut(), task, BlockedOn::Mutex(m));
}

/// Transitive priority inheritance.
///
/// Walk the chain of mutex owners starting at `m`'s owner, lifting every
/// owner whose effective priority is below the boost level. An owner that
/// is already higher raises the boost level instead, so the rest of the
/// chain is held at least that high. The walk is bounded: a cycle of
/// ownership (an application deadlock) is logged and abandoned.
fn apply_priority_inheritance(
    mut lock: CpuLockTokenRefMut<'_>,
    m: &'static MutexCb,
    waiter: &'static TaskCb,
) {
    let mut boost = waiter.effective_priority.get(&*lock.borrow_mut());
    let mut target = m.owner.get(&*lock.borrow_mut());
    let mut depth = 0;

    while let Some(t) = target {
        if depth >= cfg::MAX_PI_CHAIN {
            log::error!("priority inheritance chain exceeds depth limit; ownership cycle?");
            break;
        }

        let t_prio = t.effective_priority.get(&*lock.borrow_mut());
        if t_prio < boost {
            log::debug!(
                "priority inheritance: boosting task {} ({} -> {})",
                t.id.get(&*lock.borrow_mut()),
                t_prio,
                boost
            );
            task::set_effective_priority(lock.borrow_mut(), t, boost);
        } else {
            // The chain must be held at least as high as this owner
            // already is.
            boost = t_prio;
        }

        target = match (
            t.st.get(&*lock.borrow_mut()),
            t.blocked_on.get(&*lock.borrow_mut()),
        ) {
            (TaskSt::Blocked, BlockedOn::Mutex(next)) => next.owner.get(&*lock.borrow_mut()),
            _ => None,
        };
        depth += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test_support, Task};

    #[test]
    fn uncontended_lock_and_recursion() {
        test_support::run(|| {
            test_support::bind_default_scheduler();
            let [a] = test_support::spawn_tasks([2]);
            test_support::make_current(a);

            let m = Mutex::create().unwrap();
            m.lock(NO_WAIT).unwrap();
            assert_eq!(m.owner().unwrap(), Task(a));

            m.lock(NO_WAIT).unwrap();
            m.unlock().unwrap();
            assert_eq!(m.owner().unwrap(), Task(a));

            m.unlock().unwrap();
            assert!(m.owner().is_none());
        });
    }

    #[test]
    fn try_lock_contended_times_out() {
        test_support::run(|| {
            test_support::bind_default_scheduler();
            let [a, b] = test_support::spawn_tasks([2, 3]);

            let m = Mutex::create().unwrap();
            test_support::make_current(a);
            m.lock(NO_WAIT).unwrap();

            test_support::make_current(b);
            assert_eq!(m.lock(NO_WAIT).unwrap_err(), Kind::Timeout);
            assert_eq!(m.owner().unwrap(), Task(a));
        });
    }

    #[test]
    fn unlock_by_non_owner_is_refused() {
        test_support::run(|| {
            test_support::bind_default_scheduler();
            let [a, b] = test_support::spawn_tasks([2, 3]);

            let m = Mutex::create().unwrap();
            test_support::make_current(a);
            m.lock(NO_WAIT).unwrap();

            test_support::make_current(b);
            assert_eq!(m.unlock().unwrap_err(), Kind::InvalidState);
            assert_eq!(m.owner().unwrap(), Task(a));
        });
    }

    #[test]
    fn contended_waiter_boosts_owner() {
        test_support::run(|| {
            test_support::bind_default_scheduler();
            let [low, high] = test_support::spawn_tasks([1, 4]);

            let m = Mutex::create().unwrap();
            test_support::make_current(low);
            m.lock(NO_WAIT).unwrap();

            test_support::make_current(high);
            let mut guard = klock::lock_cpu();
            enqueue_waiter(guard.borrow_mut(), m.cb(), high);
            task::set_state(guard.borrow_mut(), high, TaskSt::Blocked).unwrap();
            drop(guard);

            assert_eq!(Task(low).priority(), 4);
            assert_eq!(Task(low).base_priority(), 1);
        });
    }

    #[test]
    fn transitive_inheritance_and_handoff() {
        test_support::run(|| {
            test_support::bind_default_scheduler();
            // The classic three-task chain: L owns A, M owns B and waits
            // for A, H waits for B.
            let [l, m_task, h] = test_support::spawn_tasks([1, 2, 3]);
            let a = Mutex::create().unwrap();
            let b = Mutex::create().unwrap();

            test_support::make_current(l);
            a.lock(NO_WAIT).unwrap();

            test_support::make_current(m_task);
            b.lock(NO_WAIT).unwrap();
            let mut guard = klock::lock_cpu();
            enqueue_waiter(guard.borrow_mut(), a.cb(), m_task);
            task::set_state(guard.borrow_mut(), m_task, TaskSt::Blocked).unwrap();
            drop(guard);
            assert_eq!(Task(l).priority(), 2);

            test_support::make_current(h);
            let mut guard = klock::lock_cpu();
            enqueue_waiter(guard.borrow_mut(), b.cb(), h);
            task::set_state(guard.borrow_mut(), h, TaskSt::Blocked).unwrap();
            drop(guard);

            // H's wait propagates through M to L.
            assert_eq!(Task(m_task).priority(), 3);
            assert_eq!(Task(l).priority(), 3);

            // L releases A: boost shed, ownership handed to M.
            test_support::make_current(l);
            a.unlock().unwrap();
            assert_eq!(Task(l).priority(), 1);
            assert_eq!(a.owner().unwrap(), Task(m_task));
            assert_eq!(Task(m_task).state(), TaskSt::Ready);

            // M releases B: H gets it and M drops back to base.
            test_support::make_current(m_task);
            b.unlock().unwrap();
            assert_eq!(Task(m_task).priority(), 2);
            assert_eq!(b.owner().unwrap(), Task(h));
            assert_eq!(Task(h).state(), TaskSt::Ready);
        });
    }

    #[test]
    fn ownership_cycle_is_bounded() {
        test_support::run(|| {
            test_support::bind_default_scheduler();
            let [a, b] = test_support::spawn_tasks([1, 2]);
            let ma = Mutex::create().unwrap();
            let mb = Mutex::create().unwrap();

            // Manufacture a cycle: a owns ma blocked on mb, b owns mb
            // blocked on ma. The walker must terminate.
            let mut guard = klock::lock_cpu();
            ma.cb().owner.replace(&mut *guard.borrow_mut(), Some(a));
            mb.cb().owner.replace(&mut *guard.borrow_mut(), Some(b));
            crate::sched::ready_remove(guard.borrow_mut(), a);
            crate::sched::ready_remove(guard.borrow_mut(), b);
            for t in [a, b] {
                task::set_state(guard.borrow_mut(), t, TaskSt::Running).unwrap();
                task::set_state(guard.borrow_mut(), t, TaskSt::Blocked).unwrap();
            }
            a.blocked_on
                .replace(&mut *guard.borrow_mut(), BlockedOn::Mutex(mb.cb()));
            b.blocked_on
                .replace(&mut *guard.borrow_mut(), BlockedOn::Mutex(ma.cb()));

            let [w] = test_support::spawn_tasks([5]);
            apply_priority_inheritance(guard.borrow_mut(), ma.cb(), w);

            // Both cycle members were boosted; the walk stopped.
            assert_eq!(a.effective_priority.get(&*guard.borrow_mut()), 5);
            assert_eq!(b.effective_priority.get(&*guard.borrow_mut()), 5);
        });
    }
}
