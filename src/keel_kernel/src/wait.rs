//! Wait queues.
//!
//! Every synchronization object parks its waiters in a [`WaitQueue`]:
//! a singly-linked list threaded through the tasks' wait links, ordered by
//! effective priority descending, FIFO among equals. While a task sits in
//! a wait queue its [`BlockedOn`] tag names the object — the wakeup paths
//! use that tag to distinguish a timeout (tag still set when the task
//! resumes) from a hand-off (the waker cleared it).
use core::fmt;

use crate::{
    klock::{CpuLockCell, CpuLockTokenRefMut},
    mutex::MutexCb,
    queue::QueueCb,
    semaphore::SemaphoreCb,
    task::TaskCb,
    utils::Init,
};

/// What a blocked task is waiting on.
#[derive(Clone, Copy)]
pub(crate) enum BlockedOn {
    None,
    Mutex(&'static MutexCb),
    Semaphore(&'static SemaphoreCb),
    Queue(&'static QueueCb),
}

impl Init for BlockedOn {
    const INIT: Self = Self::None;
}

impl PartialEq for BlockedOn {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Mutex(a), Self::Mutex(b)) => core::ptr::eq(*a, *b),
            (Self::Semaphore(a), Self::Semaphore(b)) => core::ptr::eq(*a, *b),
            (Self::Queue(a), Self::Queue(b)) => core::ptr::eq(*a, *b),
            _ => false,
        }
    }
}

impl Eq for BlockedOn {}

impl fmt::Debug for BlockedOn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Mutex(m) => f.debug_tuple("Mutex").field(&(*m as *const _)).finish(),
            Self::Semaphore(s) => f.debug_tuple("Semaphore").field(&(*s as *const _)).finish(),
            Self::Queue(q) => f.debug_tuple("Queue").field(&(*q as *const _)).finish(),
        }
    }
}

/// A priority-ordered queue of tasks waiting on one synchronization
/// object.
pub(crate) struct WaitQueue {
    head: CpuLockCell<Option<&'static TaskCb>>,
}

impl Init for WaitQueue {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        head: CpuLockCell::new(None),
    };
}

impl fmt::Debug for WaitQueue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("WaitQueue(..)")
    }
}

impl WaitQueue {
    /// Insert `task`, tagging it as blocked on `on`. Highest effective
    /// priority at the head; equal priorities keep arrival order.
    pub(crate) fn insert(
        &self,
        mut lock: CpuLockTokenRefMut<'_>,
        task: &'static TaskCb,
        on: BlockedOn,
    ) {
        debug_assert!(task.wait_link.get(&*lock).is_none());

        task.blocked_on.replace(&mut *lock, on);

        let prio = task.effective_priority.get(&*lock);
        let mut prev: Option<&'static TaskCb> = None;
        let mut cur = self.head.get(&*lock);
        while let Some(c) = cur {
            if c.effective_priority.get(&*lock) < prio {
                break;
            }
            prev = Some(c);
            cur = c.wait_link.get(&*lock);
        }

        task.wait_link.replace(&mut *lock, cur);
        match prev {
            Some(p) => {
                p.wait_link.replace(&mut *lock, Some(task));
            }
            None => {
                self.head.replace(&mut *lock, Some(task));
            }
        }
    }

    /// Unlink `task` and clear its blocked-on tag. Returns whether it was
    /// a member.
    pub(crate) fn remove(&self, mut lock: CpuLockTokenRefMut<'_>, task: &'static TaskCb) -> bool {
        let mut prev: Option<&'static TaskCb> = None;
        let mut cur = self.head.get(&*lock);
        while let Some(c) = cur {
            if core::ptr::eq(c, task) {
                let next = task.wait_link.replace(&mut *lock, None);
                match prev {
                    Some(p) => {
                        p.wait_link.replace(&mut *lock, next);
                    }
                    None => {
                        self.head.replace(&mut *lock, next);
                    }
                }
                task.blocked_on.replace(&mut *lock, BlockedOn::None);
                return true;
            }
            prev = Some(c);
            cur = c.wait_link.get(&*lock);
        }
        false
    }

    /// Detach and return the highest-priority waiter, clearing its
    /// blocked-on tag.
    pub(crate) fn pop(&self, mut lock: CpuLockTokenRefMut<'_>) -> Option<&'static TaskCb> {
        let head = self.head.get(&*lock)?;
        let next = head.wait_link.replace(&mut *lock, None);
        self.head.replace(&mut *lock, next);
        head.blocked_on.replace(&mut *lock, BlockedOn::None);
        Some(head)
    }

    #[cfg(test)]
    pub(crate) fn front(&self, lock: CpuLockTokenRefMut<'_>) -> Option<&'static TaskCb> {
        self.head.get(&*lock)
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self, lock: CpuLockTokenRefMut<'_>) -> bool {
        self.head.get(&*lock).is_none()
    }

    pub(crate) fn contains(&self, mut lock: CpuLockTokenRefMut<'_>, task: &'static TaskCb) -> bool {
        let mut cur = self.head.get(&*lock.borrow_mut());
        while let Some(c) = cur {
            if core::ptr::eq(c, task) {
                return true;
            }
            cur = c.wait_link.get(&*lock.borrow_mut());
        }
        false
    }

    /// Re-sort `task` after a change of its effective priority.
    pub(crate) fn reposition(&self, mut lock: CpuLockTokenRefMut<'_>, task: &'static TaskCb) {
        let on = task.blocked_on.get(&*lock.borrow_mut());
        if self.remove(lock.borrow_mut(), task) {
            self.insert(lock.borrow_mut(), task, on);
        }
    }
}

/// Re-sort a blocked task within whatever wait queue its blocked-on tag
/// names. Called when priority inheritance changes the task's effective
/// priority.
pub(crate) fn requeue_for_blocked_on(mut lock: CpuLockTokenRefMut<'_>, task: &'static TaskCb) {
    let on = task.blocked_on.get(&*lock.borrow_mut());
    match on {
        BlockedOn::None => {}
        BlockedOn::Mutex(m) => m.waiters.reposition(lock.borrow_mut(), task),
        BlockedOn::Semaphore(s) => s.waiters.reposition(lock.borrow_mut(), task),
        BlockedOn::Queue(q) => crate::queue::reposition_waiter(lock.borrow_mut(), q, task),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{klock, test_support};

    #[test]
    fn priority_order_fifo_among_equals() {
        test_support::run(|| {
            let [low, mid_a, mid_b, high] = test_support::spawn_tasks([1, 3, 3, 5]);
            let mut guard = klock::lock_cpu();
            let wq = test_support::leak_wait_queue();

            wq.insert(guard.borrow_mut(), mid_a, BlockedOn::None);
            wq.insert(guard.borrow_mut(), low, BlockedOn::None);
            wq.insert(guard.borrow_mut(), high, BlockedOn::None);
            wq.insert(guard.borrow_mut(), mid_b, BlockedOn::None);

            assert!(core::ptr::eq(wq.pop(guard.borrow_mut()).unwrap(), high));
            assert!(core::ptr::eq(wq.pop(guard.borrow_mut()).unwrap(), mid_a));
            assert!(core::ptr::eq(wq.pop(guard.borrow_mut()).unwrap(), mid_b));
            assert!(core::ptr::eq(wq.pop(guard.borrow_mut()).unwrap(), low));
            assert!(wq.is_empty(guard.borrow_mut()));
        });
    }

    #[test]
    fn remove_clears_tag_and_unlinks() {
        test_support::run(|| {
            let [a, b, c] = test_support::spawn_tasks([2, 2, 2]);
            let mut guard = klock::lock_cpu();
            let wq = test_support::leak_wait_queue();

            for t in [a, b, c] {
                wq.insert(guard.borrow_mut(), t, BlockedOn::None);
            }

            assert!(wq.remove(guard.borrow_mut(), b));
            assert!(!wq.remove(guard.borrow_mut(), b));
            assert!(!wq.contains(guard.borrow_mut(), b));
            assert!(b.wait_link.get(&*guard.borrow_mut()).is_none());

            assert!(core::ptr::eq(wq.pop(guard.borrow_mut()).unwrap(), a));
            assert!(core::ptr::eq(wq.pop(guard.borrow_mut()).unwrap(), c));
        });
    }

    #[test]
    fn reposition_follows_priority_change() {
        test_support::run(|| {
            let [a, b] = test_support::spawn_tasks([2, 4]);
            let mut guard = klock::lock_cpu();
            let wq = test_support::leak_wait_queue();

            wq.insert(guard.borrow_mut(), a, BlockedOn::None);
            wq.insert(guard.borrow_mut(), b, BlockedOn::None);
            assert!(core::ptr::eq(wq.front(guard.borrow_mut()).unwrap(), b));

            a.effective_priority.replace(&mut *guard.borrow_mut(), 6);
            wq.reposition(guard.borrow_mut(), a);
            assert!(core::ptr::eq(wq.front(guard.borrow_mut()).unwrap(), a));
        });
    }
}
