//! Preemptive fixed-priority scheduling.
//!
//! One FIFO ready list per priority level plus a bitmap over the levels,
//! so choosing the next task is a bitmap scan and a head read. Ties within
//! a level are FIFO.
use super::{delayed::DelayedList, list::TaskList, SchedOps, SchedStats};
use crate::{
    cfg, kernel,
    klock::{CpuLockCell, CpuLockTokenRefMut},
    task::TaskCb,
    utils::{Init, PrioBitmap},
    Tick,
};

struct State {
    ready: [TaskList; cfg::MAX_PRIORITIES],
    /// Invariant: bit `i` set iff `ready[i]` is non-empty.
    bitmap: CpuLockCell<PrioBitmap<{ cfg::MAX_PRIORITIES }>>,
    delayed: DelayedList,
}

static STATE: State = State {
    ready: [TaskList::INIT; cfg::MAX_PRIORITIES],
    bitmap: CpuLockCell::new(PrioBitmap::INIT),
    delayed: DelayedList::INIT,
};

pub(crate) static OPS: SchedOps = SchedOps {
    init,
    pick_next,
    should_preempt,
    on_yield,
    ready_push,
    ready_remove,
    delayed_push,
    delayed_remove,
    advance_delayed,
    stats,
};

fn init(mut lock: CpuLockTokenRefMut<'_>) {
    // Ready lists and the delayed list hold no tasks at (re)init time;
    // clearing the bitmap is all that is needed.
    STATE.bitmap.replace(&mut *lock, PrioBitmap::INIT);
}

fn pick_next(mut lock: CpuLockTokenRefMut<'_>) -> Option<&'static TaskCb> {
    let level = STATE.bitmap.get(&*lock.borrow_mut()).find_highest()?;
    let head = STATE.ready[level].front(lock.borrow_mut());
    if head.is_none() {
        log::error!("ready bitmap claims level {} is non-empty", level);
    }
    head
}

fn should_preempt(mut lock: CpuLockTokenRefMut<'_>, candidate: &'static TaskCb) -> bool {
    let Some(current) = kernel::running_task(lock.borrow_mut()) else {
        return false;
    };
    if core::ptr::eq(current, candidate) {
        return false;
    }
    candidate.effective_priority.get(&*lock) > current.effective_priority.get(&*lock)
}

fn on_yield(_lock: CpuLockTokenRefMut<'_>, _task: &'static TaskCb) {}

fn ready_push(mut lock: CpuLockTokenRefMut<'_>, task: &'static TaskCb) {
    let level = task.effective_priority.get(&*lock.borrow_mut()) as usize;
    STATE.ready[level].push_back(lock.borrow_mut(), task);
    STATE.bitmap.write(&mut *lock).set(level);
}

fn ready_remove(mut lock: CpuLockTokenRefMut<'_>, task: &'static TaskCb) {
    let level = task.effective_priority.get(&*lock.borrow_mut()) as usize;
    if STATE.ready[level].remove(lock.borrow_mut(), task)
        && STATE.ready[level].is_empty(lock.borrow_mut())
    {
        STATE.bitmap.write(&mut *lock).clear(level);
    }
}

fn delayed_push(mut lock: CpuLockTokenRefMut<'_>, task: &'static TaskCb, ticks: Tick) {
    let wake = kernel::tick_now(lock.borrow_mut()).wrapping_add(ticks);
    STATE.delayed.insert(lock.borrow_mut(), task, wake);
}

fn delayed_remove(mut lock: CpuLockTokenRefMut<'_>, task: &'static TaskCb) {
    STATE.delayed.remove(lock.borrow_mut(), task);
}

fn advance_delayed(mut lock: CpuLockTokenRefMut<'_>) {
    let now = kernel::tick_now(lock.borrow_mut());
    STATE.delayed.advance(lock.borrow_mut(), now, ready_push);
}

fn stats(mut lock: CpuLockTokenRefMut<'_>) -> SchedStats {
    let mut ready = 0;
    for list in STATE.ready.iter() {
        ready += list.len(lock.borrow_mut());
    }
    SchedStats {
        ready,
        delayed: STATE.delayed.len(lock.borrow_mut()),
        slice_remaining: 0,
    }
}

#[cfg(test)]
pub(crate) fn test_reset(mut lock: CpuLockTokenRefMut<'_>) {
    for list in STATE.ready.iter() {
        list.reset(lock.borrow_mut());
    }
    STATE.bitmap.replace(&mut *lock, PrioBitmap::INIT);
    STATE.delayed.reset(lock.borrow_mut());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{klock, test_support};

    #[test]
    fn picks_highest_level_fifo_within_level() {
        test_support::run(|| {
            let [low, a, b, top] = test_support::spawn_tasks([2, 3, 3, 4]);
            let mut guard = klock::lock_cpu();

            // All four were pushed by creation, in order.
            assert!(core::ptr::eq(pick_next(guard.borrow_mut()).unwrap(), top));

            ready_remove(guard.borrow_mut(), top);
            assert!(core::ptr::eq(pick_next(guard.borrow_mut()).unwrap(), a));

            ready_remove(guard.borrow_mut(), a);
            assert!(core::ptr::eq(pick_next(guard.borrow_mut()).unwrap(), b));

            ready_remove(guard.borrow_mut(), b);
            assert!(core::ptr::eq(pick_next(guard.borrow_mut()).unwrap(), low));

            ready_remove(guard.borrow_mut(), low);
            assert!(pick_next(guard.borrow_mut()).is_none());
        });
    }

    #[test]
    fn bitmap_tracks_level_occupancy() {
        test_support::run(|| {
            let [a, b] = test_support::spawn_tasks([5, 5]);
            let mut guard = klock::lock_cpu();

            assert!(STATE.bitmap.get(&*guard.borrow_mut()).get(5));
            ready_remove(guard.borrow_mut(), a);
            assert!(STATE.bitmap.get(&*guard.borrow_mut()).get(5));
            ready_remove(guard.borrow_mut(), b);
            assert!(!STATE.bitmap.get(&*guard.borrow_mut()).get(5));
        });
    }

    #[test]
    fn preempts_only_strictly_higher() {
        test_support::run(|| {
            let [cur, equal, higher] = test_support::spawn_tasks([3, 3, 4]);
            test_support::make_current(cur);

            let mut guard = klock::lock_cpu();
            assert!(!should_preempt(guard.borrow_mut(), equal));
            assert!(should_preempt(guard.borrow_mut(), higher));
            assert!(!should_preempt(guard.borrow_mut(), cur));
        });
    }
}
