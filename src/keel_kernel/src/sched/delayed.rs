//! The delayed list: tasks sleeping until an absolute wake tick.
//!
//! One instance per scheduling policy, all sharing the same discipline: a
//! doubly-linked list sorted by wake tick ascending (wrap-safe), FIFO
//! among equal wake ticks. Aging walks from the head and stops at the
//! first unexpired entry.
use crate::{
    klock::{CpuLockCell, CpuLockTokenRefMut},
    task::{self, TaskCb, TaskSt},
    utils::{
        time::{tick_before, tick_reached},
        Init,
    },
    Tick,
};

#[derive(Debug)]
pub(crate) struct DelayedList {
    head: CpuLockCell<Option<&'static TaskCb>>,
}

impl Init for DelayedList {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        head: CpuLockCell::new(None),
    };
}

impl DelayedList {
    /// Insert `task` to wake at the absolute tick `wake`. The task must
    /// not currently be in any scheduler list.
    pub(crate) fn insert(
        &self,
        mut lock: CpuLockTokenRefMut<'_>,
        task: &'static TaskCb,
        wake: Tick,
    ) {
        debug_assert!(task.sched_link.next.get(&*lock).is_none());
        debug_assert!(task.sched_link.prev.get(&*lock).is_none());

        task.wake_tick.replace(&mut *lock, wake);

        // Find the first entry strictly after `wake`; equal wake ticks
        // keep insertion order.
        let mut prev: Option<&'static TaskCb> = None;
        let mut cur = self.head.get(&*lock);
        while let Some(c) = cur {
            if tick_before(wake, c.wake_tick.get(&*lock)) {
                break;
            }
            prev = Some(c);
            cur = c.sched_link.next.get(&*lock);
        }

        task.sched_link.next.replace(&mut *lock, cur);
        task.sched_link.prev.replace(&mut *lock, prev);
        match prev {
            Some(p) => {
                p.sched_link.next.replace(&mut *lock, Some(task));
            }
            None => {
                self.head.replace(&mut *lock, Some(task));
            }
        }
        if let Some(c) = cur {
            c.sched_link.prev.replace(&mut *lock, Some(task));
        }
    }

    /// Unlink `task` if present. Returns whether it was.
    pub(crate) fn remove(&self, mut lock: CpuLockTokenRefMut<'_>, task: &'static TaskCb) -> bool {
        let at_head = self
            .head
            .get(&*lock)
            .is_some_and(|h| core::ptr::eq(h, task));
        if !at_head
            && task.sched_link.prev.get(&*lock).is_none()
            && task.sched_link.next.get(&*lock).is_none()
        {
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
        if let Some(n) = next {
            n.sched_link.prev.replace(&mut *lock, prev);
        }
        true
    }

    /// Move every task whose wake tick has been reached into the Ready
    /// state, handing each to `make_ready` (which inserts it into the
    /// policy's ready structure). The sort order guarantees no entries
    /// past the first unexpired one need inspection.
    pub(crate) fn advance(
        &self,
        mut lock: CpuLockTokenRefMut<'_>,
        now: Tick,
        mut make_ready: impl FnMut(CpuLockTokenRefMut<'_>, &'static TaskCb),
    ) {
        loop {
            let Some(head) = self.head.get(&*lock.borrow_mut()) else {
                break;
            };
            if !tick_reached(now, head.wake_tick.get(&*lock.borrow_mut())) {
                break;
            }

            self.remove(lock.borrow_mut(), head);
            if task::set_state(lock.borrow_mut(), head, TaskSt::Ready).is_ok() {
                make_ready(lock.borrow_mut(), head);
            }
        }
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

    #[cfg(test)]
    pub(crate) fn front(&self, lock: CpuLockTokenRefMut<'_>) -> Option<&'static TaskCb> {
        self.head.get(&*lock)
    }

    #[cfg(test)]
    pub(crate) fn reset(&self, mut lock: CpuLockTokenRefMut<'_>) {
        self.head.replace(&mut *lock, None);
    }
}
