//! Round-robin time-sliced scheduling.
//!
//! A single FIFO; the running task carries its remaining slice in its TCB.
//! The tick path drives `should_preempt`, which burns one tick of the
//! slice and requests preemption once the slice is gone and somebody else
//! is Ready. The preempted task rotates to the tail with a fresh slice.
use super::{delayed::DelayedList, list::TaskList, SchedOps, SchedStats};
use crate::{
    cfg, kernel,
    klock::CpuLockTokenRefMut,
    task::{TaskCb, TaskSt},
    utils::Init,
    Tick,
};

struct State {
    ready: TaskList,
    delayed: DelayedList,
}

static STATE: State = State {
    ready: TaskList::INIT,
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

fn init(_lock: CpuLockTokenRefMut<'_>) {}

fn pick_next(mut lock: CpuLockTokenRefMut<'_>) -> Option<&'static TaskCb> {
    let head = STATE.ready.front(lock.borrow_mut())?;
    // The candidate starts (or restarts) with a full slice when it is
    // eventually dispatched.
    head.slice_remaining
        .replace(&mut *lock, cfg::TIME_SLICE_TICKS);
    Some(head)
}

fn should_preempt(mut lock: CpuLockTokenRefMut<'_>, _candidate: &'static TaskCb) -> bool {
    let Some(current) = kernel::running_task(lock.borrow_mut()) else {
        return false;
    };

    let slice = current.slice_remaining.get(&*lock);
    let slice = slice.saturating_sub(1);
    current.slice_remaining.replace(&mut *lock, slice);

    slice == 0 && !STATE.ready.is_empty(lock.borrow_mut())
}

fn on_yield(mut lock: CpuLockTokenRefMut<'_>, task: &'static TaskCb) {
    if task.st.get(&*lock.borrow_mut()) == TaskSt::Ready {
        STATE.ready.remove(lock.borrow_mut(), task);
        STATE.ready.push_back(lock.borrow_mut(), task);
        task.slice_remaining
            .replace(&mut *lock, cfg::TIME_SLICE_TICKS);
    }
}

fn ready_push(mut lock: CpuLockTokenRefMut<'_>, task: &'static TaskCb) {
    STATE.ready.push_back(lock.borrow_mut(), task);
}

fn ready_remove(mut lock: CpuLockTokenRefMut<'_>, task: &'static TaskCb) {
    STATE.ready.remove(lock.borrow_mut(), task);
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
    let slice_remaining = kernel::running_task(lock.borrow_mut())
        .map_or(0, |t| t.slice_remaining.get(&*lock.borrow_mut()));
    SchedStats {
        ready: STATE.ready.len(lock.borrow_mut()),
        delayed: STATE.delayed.len(lock.borrow_mut()),
        slice_remaining,
    }
}

#[cfg(test)]
pub(crate) fn test_reset(mut lock: CpuLockTokenRefMut<'_>) {
    STATE.ready.reset(lock.borrow_mut());
    STATE.delayed.reset(lock.borrow_mut());
}
