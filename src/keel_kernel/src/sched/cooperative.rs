//! Cooperative scheduling: a single FIFO, no preemption.
//!
//! A task runs until it yields or blocks; on yield it rotates to the tail,
//! so ready tasks take turns across yields.
use super::{delayed::DelayedList, list::TaskList, SchedOps, SchedStats};
use crate::{
    kernel,
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
    STATE.ready.front(lock.borrow_mut())
}

fn should_preempt(_lock: CpuLockTokenRefMut<'_>, _candidate: &'static TaskCb) -> bool {
    false
}

fn on_yield(mut lock: CpuLockTokenRefMut<'_>, task: &'static TaskCb) {
    if task.st.get(&*lock.borrow_mut()) == TaskSt::Ready {
        STATE.ready.remove(lock.borrow_mut(), task);
        STATE.ready.push_back(lock.borrow_mut(), task);
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
    SchedStats {
        ready: STATE.ready.len(lock.borrow_mut()),
        delayed: STATE.delayed.len(lock.borrow_mut()),
        slice_remaining: 0,
    }
}

#[cfg(test)]
pub(crate) fn test_reset(mut lock: CpuLockTokenRefMut<'_>) {
    STATE.ready.reset(lock.borrow_mut());
    STATE.delayed.reset(lock.borrow_mut());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{klock, task, test_support};

    #[test]
    fn never_preempts() {
        test_support::run(|| {
            test_support::bind_scheduler(crate::SchedulerKind::Cooperative);
            let [cur, other] = test_support::spawn_tasks([1, 7]);
            test_support::make_current(cur);

            let mut guard = klock::lock_cpu();
            assert!(!should_preempt(guard.borrow_mut(), other));
        });
    }

    #[test]
    fn yield_rotates_ready_task_to_tail() {
        test_support::run(|| {
            test_support::bind_scheduler(crate::SchedulerKind::Cooperative);
            let [a, b, c] = test_support::spawn_tasks([1, 1, 1]);
            let mut guard = klock::lock_cpu();

            assert!(core::ptr::eq(pick_next(guard.borrow_mut()).unwrap(), a));

            on_yield(guard.borrow_mut(), a);
            assert!(core::ptr::eq(pick_next(guard.borrow_mut()).unwrap(), b));
            on_yield(guard.borrow_mut(), b);
            assert!(core::ptr::eq(pick_next(guard.borrow_mut()).unwrap(), c));

            // A task that is no longer Ready is left alone.
            ready_remove(guard.borrow_mut(), c);
            task::set_state(guard.borrow_mut(), c, TaskSt::Running).unwrap();
            task::set_state(guard.borrow_mut(), c, TaskSt::Blocked).unwrap();
            on_yield(guard.borrow_mut(), c);
            assert_eq!(stats(guard.borrow_mut()).ready, 2);
        });
    }
}
