//! Intrusive task lists.
//!
//! Tasks link themselves into scheduler-owned lists through the
//! [`ListLink`] cell pair embedded in every TCB. A task is in at most one
//! such list at a time; the link cells belong to that list while it is.
//! All mutation happens under the CPU Lock, which is what makes the
//! aliasing sound — the cells can only be touched by presenting the token.
use crate::{
    klock::{CpuLockCell, CpuLockTokenRefMut},
    task::TaskCb,
    utils::Init,
};

/// The scheduling-link cells of a task: membership in one ready list or
/// one delayed list.
#[derive(Debug)]
pub(crate) struct ListLink {
    pub(crate) next: CpuLockCell<Option<&'static TaskCb>>,
    pub(crate) prev: CpuLockCell<Option<&'static TaskCb>>,
}

impl Init for ListLink {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        next: CpuLockCell::new(None),
        prev: CpuLockCell::new(None),
    };
}

#[inline]
fn is_task(x: Option<&'static TaskCb>, t: &TaskCb) -> bool {
    x.is_some_and(|x| core::ptr::eq(x, t))
}

/// A doubly-linked FIFO of tasks threaded through their scheduling links.
#[derive(Debug)]
pub(crate) struct TaskList {
    head: CpuLockCell<Option<&'static TaskCb>>,
    tail: CpuLockCell<Option<&'static TaskCb>>,
}

impl Init for TaskList {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        head: CpuLockCell::new(None),
        tail: CpuLockCell::new(None),
    };
}

impl TaskList {
    /// Append to the tail. The task must not currently be in any
    /// scheduler list.
    pub(crate) fn push_back(&self, mut lock: CpuLockTokenRefMut<'_>, task: &'static TaskCb) {
        debug_assert!(!self.contains(lock.borrow_mut(), task));
        debug_assert!(task.sched_link.next.get(&*lock).is_none());
        debug_assert!(task.sched_link.prev.get(&*lock).is_none());

        let old_tail = self.tail.replace(&mut *lock, Some(task));
        task.sched_link.prev.replace(&mut *lock, old_tail);
        task.sched_link.next.replace(&mut *lock, None);

        match old_tail {
            Some(t) => {
                t.sched_link.next.replace(&mut *lock, Some(task));
            }
            None => {
                self.head.replace(&mut *lock, Some(task));
            }
        }
    }

    /// Unlink `task` if it is a member of this list. Returns whether it
    /// was. Passing a task linked into a *different* list is a caller
    /// error this method cannot detect.
    pub(crate) fn remove(&self, mut lock: CpuLockTokenRefMut<'_>, task: &'static TaskCb) -> bool {
        if !self.contains(lock.borrow_mut(), task) {
            return false;
        }

        let prev = task.sched_link.prev.replace(&mut *lock, None);
        let next = task.sched_link.next.replace(&mut *lock, None);

        match prev {
            Some(p) => {
                p.sched_link.next.replace(&mut *lock, next);
            }
            None => {
                self.head.replace(&mut *lock, next);
            }
        }
        match next {
            Some(n) => {
                n.sched_link.prev.replace(&mut *lock, prev);
            }
            None => {
                self.tail.replace(&mut *lock, prev);
            }
        }
        true
    }

    #[cfg(test)]
    pub(crate) fn pop_front(
        &self,
        mut lock: CpuLockTokenRefMut<'_>,
    ) -> Option<&'static TaskCb> {
        let head = self.head.get(&*lock)?;
        self.remove(lock.borrow_mut(), head);
        Some(head)
    }

    pub(crate) fn front(&self, lock: CpuLockTokenRefMut<'_>) -> Option<&'static TaskCb> {
        self.head.get(&*lock)
    }

    pub(crate) fn is_empty(&self, lock: CpuLockTokenRefMut<'_>) -> bool {
        self.head.get(&*lock).is_none()
    }

    pub(crate) fn len(&self, mut lock: CpuLockTokenRefMut<'_>) -> usize {
        let mut n = 0;
        let mut cur = self.head.get(&*lock.borrow_mut());
        while let Some(t) = cur {
            n += 1;
            cur = t.sched_link.next.get(&*lock.borrow_mut());
        }
        n
    }

    /// Membership test: the task is the head, or it has a neighbor.
    fn contains(&self, mut lock: CpuLockTokenRefMut<'_>, task: &'static TaskCb) -> bool {
        is_task(self.head.get(&*lock.borrow_mut()), task)
            || task.sched_link.prev.get(&*lock.borrow_mut()).is_some()
            || task.sched_link.next.get(&*lock.borrow_mut()).is_some()
    }

    #[cfg(test)]
    pub(crate) fn reset(&self, mut lock: CpuLockTokenRefMut<'_>) {
        self.head.replace(&mut *lock, None);
        self.tail.replace(&mut *lock, None);
    }
}
