//! Shared plumbing for kernel tests.
//!
//! The kernel is a process-wide singleton, so tests that touch it are
//! serialized on one mutex and start from a freshly reset kernel. The
//! arena is the one piece that is *not* reclaimed (its allocator cannot
//! free); the test build compensates with a much larger pool.
use std::sync::Mutex as StdMutex;

use crate::{
    cfg, kernel, klock, port,
    sched::{self, delayed::DelayedList, list::TaskList, SchedulerKind},
    task::{self, Task, TaskCb, TaskSt},
    timer,
    utils::Init,
    wait::WaitQueue,
    Priority,
};

static TEST_GUARD: StdMutex<()> = StdMutex::new(());

/// Run `f` with exclusive access to a freshly reset kernel.
pub(crate) fn run(f: impl FnOnce()) {
    let _guard = TEST_GUARD.lock().unwrap_or_else(|e| e.into_inner());

    {
        let mut guard = klock::lock_cpu();
        kernel::reset_state(guard.borrow_mut());
        sched::reset(guard.borrow_mut());
        task::reset_pool(guard.borrow_mut());
        timer::reset(guard.borrow_mut());
    }
    port::reset();

    f();
}

pub(crate) fn bind_default_scheduler() {
    bind_scheduler(cfg::SCHEDULER_TYPE);
}

pub(crate) fn bind_scheduler(kind: SchedulerKind) {
    let mut guard = klock::lock_cpu();
    sched::bind(guard.borrow_mut(), kind).unwrap();
}

fn task_entry(_param: usize) {}

/// Create one task per requested priority, with minimal stacks. Binds the
/// default scheduler if none is bound yet.
pub(crate) fn spawn_tasks<const N: usize>(priorities: [Priority; N]) -> [&'static TaskCb; N] {
    {
        let mut guard = klock::lock_cpu();
        if !sched::is_bound(guard.borrow_mut()) {
            sched::bind(guard.borrow_mut(), cfg::SCHEDULER_TYPE).unwrap();
        }
    }

    priorities.map(|prio| {
        Task::create(task_entry, None, cfg::MIN_STACK_SIZE, 0, prio)
            .unwrap()
            .cb()
    })
}

/// Install `task` as the running task, the way a context switch would:
/// the previously running task goes back to Ready, the new one comes off
/// the ready structure.
pub(crate) fn make_current(task: &'static TaskCb) {
    let mut guard = klock::lock_cpu();

    if let Some(prev) = kernel::running_task(guard.borrow_mut()) {
        if prev.st.get(&*guard) == TaskSt::Running
            && task::set_state(guard.borrow_mut(), prev, TaskSt::Ready).is_ok()
        {
            sched::ready_push(guard.borrow_mut(), prev);
        }
    }

    if task.st.get(&*guard) == TaskSt::Ready {
        sched::ready_remove(guard.borrow_mut(), task);
    }
    task::set_state(guard.borrow_mut(), task, TaskSt::Running).unwrap();
    kernel::install_running(guard.borrow_mut(), task);
}

/// A detached task list for exercising the list primitives in isolation.
pub(crate) fn leak_task_list() -> &'static TaskList {
    Box::leak(Box::new(TaskList::INIT))
}

pub(crate) fn leak_delayed_list() -> &'static DelayedList {
    Box::leak(Box::new(DelayedList::INIT))
}

pub(crate) fn leak_wait_queue() -> &'static WaitQueue {
    Box::leak(Box::new(WaitQueue::INIT))
}
