//! Bounded message queues.
//!
//! A fixed-capacity circular buffer of fixed-size items, with
//! priority-ordered wait lists on both sides: senders park when the queue
//! is full, receivers when it is empty. A completed transfer wakes one
//! peer from the opposite side.
use core::ptr::NonNull;

use crate::{
    arena, kernel,
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    task::TaskCb,
    utils::Init,
    wait::{BlockedOn, WaitQueue},
    Kind, NO_WAIT, Result, Tick,
};

#[derive(Clone, Copy)]
pub(crate) struct QueueBuffer {
    ptr: *mut u8,
}

// Safety: points into arena storage, only dereferenced under the CPU Lock.
unsafe impl Send for QueueBuffer {}

impl Init for QueueBuffer {
    const INIT: Self = Self {
        ptr: core::ptr::null_mut(),
    };
}

/// *Queue control block*.
pub struct QueueCb {
    pub(crate) buffer: CpuLockCell<QueueBuffer>,
    pub(crate) item_size: CpuLockCell<usize>,
    pub(crate) capacity: CpuLockCell<usize>,
    pub(crate) count: CpuLockCell<usize>,
    pub(crate) read_idx: CpuLockCell<usize>,
    pub(crate) write_idx: CpuLockCell<usize>,
    pub(crate) senders: WaitQueue,
    pub(crate) receivers: WaitQueue,
}

impl Init for QueueCb {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        buffer: CpuLockCell::new(QueueBuffer::INIT),
        item_size: CpuLockCell::new(0),
        capacity: CpuLockCell::new(0),
        count: CpuLockCell::new(0),
        read_idx: CpuLockCell::new(0),
        write_idx: CpuLockCell::new(0),
        senders: WaitQueue::INIT,
        receivers: WaitQueue::INIT,
    };
}

/// A handle to a message queue.
#[derive(Clone, Copy)]
pub struct Queue(&'static QueueCb);

impl core::fmt::Debug for Queue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("Queue").field(&(self.0 as *const _)).finish()
    }
}

impl Queue {
    /// Allocate a queue holding up to `capacity` items of `item_size`
    /// bytes each.
    pub fn create(capacity: usize, item_size: usize) -> Result<Queue> {
        if capacity == 0 || item_size == 0 {
            return Err(Kind::InvalidParam);
        }

        let mut guard = klock::lock_cpu();
        let cb = arena::alloc::<QueueCb>(guard.borrow_mut()).ok_or(Kind::NoMemory)?;
        let buffer: NonNull<u8> =
            arena::alloc_bytes(guard.borrow_mut(), capacity * item_size).ok_or(Kind::NoMemory)?;

        cb.buffer.replace(
            &mut *guard,
            QueueBuffer {
                ptr: buffer.as_ptr(),
            },
        );
        cb.item_size.replace(&mut *guard, item_size);
        cb.capacity.replace(&mut *guard, capacity);
        drop(guard);

        log::info!(
            "queue created: capacity={}, item_size={} bytes",
            capacity,
            item_size
        );
        Ok(Queue(cb))
    }

    /// Copy `item` into the queue, waiting up to `timeout` ticks for
    /// space. `item` must be exactly one item long.
    pub fn send(&self, item: &[u8], timeout: Tick) -> Result {
        let q = self.0;
        let mut guard = klock::lock_cpu();

        if item.len() != q.item_size.get(&*guard) {
            return Err(Kind::InvalidParam);
        }

        if q.count.get(&*guard) >= q.capacity.get(&*guard) {
            if timeout == NO_WAIT {
                return Err(Kind::Full);
            }

            let Some(current) = kernel::running_task(guard.borrow_mut()) else {
                log::error!("queue send with no current task");
                return Err(Kind::InvalidState);
            };

            q.senders
                .insert(guard.borrow_mut(), current, BlockedOn::Queue(q));
            kernel::block_current(guard, current, timeout);

            guard = klock::lock_cpu();
            if current.blocked_on.get(&*guard) == BlockedOn::Queue(q) {
                // Still tagged: nobody consumed an item for us.
                q.senders.remove(guard.borrow_mut(), current);
                return Err(Kind::Timeout);
            }

            // A receiver woke us, but re-check: the spot may have been
            // taken again before we ran.
            if q.count.get(&*guard) >= q.capacity.get(&*guard) {
                log::error!("queue send: woken but queue is full again");
                return Err(Kind::Full);
            }
        }

        copy_in(guard.borrow_mut(), q, item);

        if let Some(receiver) = q.receivers.pop(guard.borrow_mut()) {
            kernel::task_unblock(guard.borrow_mut(), receiver);
        }
        Ok(())
    }

    /// Copy the oldest item into `buf`, waiting up to `timeout` ticks for
    /// one to arrive. `buf` must be exactly one item long.
    pub fn receive(&self, buf: &mut [u8], timeout: Tick) -> Result {
        let q = self.0;
        let mut guard = klock::lock_cpu();

        if buf.len() != q.item_size.get(&*guard) {
            return Err(Kind::InvalidParam);
        }

        if q.count.get(&*guard) == 0 {
            if timeout == NO_WAIT {
                return Err(Kind::Empty);
            }

            let Some(current) = kernel::running_task(guard.borrow_mut()) else {
                log::error!("queue receive with no current task");
                return Err(Kind::InvalidState);
            };

            q.receivers
                .insert(guard.borrow_mut(), current, BlockedOn::Queue(q));
            kernel::block_current(guard, current, timeout);

            guard = klock::lock_cpu();
            if current.blocked_on.get(&*guard) == BlockedOn::Queue(q) {
                q.receivers.remove(guard.borrow_mut(), current);
                return Err(Kind::Timeout);
            }

            if q.count.get(&*guard) == 0 {
                log::error!("queue receive: woken but queue is empty again");
                return Err(Kind::Empty);
            }
        }

        copy_out(guard.borrow_mut(), q, buf);

        if let Some(sender) = q.senders.pop(guard.borrow_mut()) {
            kernel::task_unblock(guard.borrow_mut(), sender);
        }
        Ok(())
    }

    /// Items currently stored.
    pub fn messages_waiting(&self) -> usize {
        let guard = klock::lock_cpu();
        self.0.count.get(&*guard)
    }

    /// Free item slots.
    pub fn spaces_available(&self) -> usize {
        let guard = klock::lock_cpu();
        self.0.capacity.get(&*guard) - self.0.count.get(&*guard)
    }

    pub fn is_full(&self) -> bool {
        let guard = klock::lock_cpu();
        self.0.count.get(&*guard) >= self.0.capacity.get(&*guard)
    }

    pub fn is_empty(&self) -> bool {
        let guard = klock::lock_cpu();
        self.0.count.get(&*guard) == 0
    }

    /// Drop all stored items and wake every blocked sender (the queue is
    /// now empty, so they will all find space).
    pub fn reset(&self) -> Result {
        let q = self.0;
        let mut guard = klock::lock_cpu();

        q.count.replace(&mut *guard, 0);
        q.read_idx.replace(&mut *guard, 0);
        q.write_idx.replace(&mut *guard, 0);

        while let Some(sender) = q.senders.pop(guard.borrow_mut()) {
            kernel::task_unblock(guard.borrow_mut(), sender);
        }

        log::info!("queue reset");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn cb(&self) -> &'static QueueCb {
        self.0
    }
}

fn copy_in(mut lock: CpuLockTokenRefMut<'_>, q: &'static QueueCb, item: &[u8]) {
    let item_size = q.item_size.get(&*lock);
    let idx = q.write_idx.get(&*lock);
    let buffer = q.buffer.get(&*lock);

    // Safety: `idx < capacity` and the buffer holds `capacity` items
    unsafe {
        core::ptr::copy_nonoverlapping(item.as_ptr(), buffer.ptr.add(idx * item_size), item_size);
    }

    let capacity = q.capacity.get(&*lock);
    q.write_idx.replace(&mut *lock, (idx + 1) % capacity);
    let count = q.count.get(&*lock);
    q.count.replace(&mut *lock, count + 1);
}

fn copy_out(mut lock: CpuLockTokenRefMut<'_>, q: &'static QueueCb, buf: &mut [u8]) {
    let item_size = q.item_size.get(&*lock);
    let idx = q.read_idx.get(&*lock);
    let buffer = q.buffer.get(&*lock);

    // Safety: `idx < capacity` and the buffer holds `capacity` items
    unsafe {
        core::ptr::copy_nonoverlapping(buffer.ptr.add(idx * item_size), buf.as_mut_ptr(), item_size);
    }

    let capacity = q.capacity.get(&*lock);
    q.read_idx.replace(&mut *lock, (idx + 1) % capacity);
    let count = q.count.get(&*lock);
    q.count.replace(&mut *lock, count - 1);
}

/// Re-sort a waiter in whichever of the queue's wait lists holds it.
pub(crate) fn reposition_waiter(
    mut lock: CpuLockTokenRefMut<'_>,
    q: &'static QueueCb,
    task: &'static TaskCb,
) {
    if q.senders.contains(lock.borrow_mut(), task) {
        q.senders.reposition(lock.borrow_mut(), task);
    } else {
        q.receivers.reposition(lock.borrow_mut(), task);
    }
}
