//! Host stand-in for the port layer.
//!
//! There is no exception model to lean on here, so "context switches" only
//! move the kernel's bookkeeping — task code never actually runs. What this
//! port *does* faithfully reproduce is the passage of time: while the task
//! that called [`yield_now`] is not the running task, kernel ticks are
//! delivered one by one, so delays and timed waits complete with exact tick
//! accounting. That is enough to drive every kernel path short of real
//! preemption from unit tests.
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crate::{kernel, task::TaskCb, TaskFn};

/// Ticks delivered per `yield_now` before the port gives up and panics.
/// A lost wakeup in a test becomes a loud failure instead of a hang.
const YIELD_TICK_LIMIT: u32 = 1_000_000;

static SWITCH_PENDING: AtomicBool = AtomicBool::new(false);
static RUNNING_TASK: AtomicPtr<TaskCb> = AtomicPtr::new(core::ptr::null_mut());

pub(crate) fn init() {
    SWITCH_PENDING.store(false, Ordering::Relaxed);
}

pub(crate) fn start_tick() {}

pub(crate) fn start_first_task() -> ! {
    panic!("the hosted port cannot enter thread mode");
}

/// Pretend to build an initial frame: the saved SP is simply the (aligned)
/// stack top. Nothing will ever restore it.
pub(crate) fn init_task_stack(stack_top: *mut u8, _entry: TaskFn, _param: usize) -> usize {
    (stack_top as usize) & !0x7
}


#[cfg(not(test))]
mod critical {
    use core::sync::atomic::{AtomicU32, Ordering};

    static NESTING: AtomicU32 = AtomicU32::new(0);

    pub(super) fn enter() {
        NESTING.fetch_add(1, Ordering::Acquire);
    }

    pub(super) fn exit() {
        let prev = NESTING.fetch_sub(1, Ordering::Release);
        debug_assert!(prev > 0, "unbalanced critical section exit");
    }

    pub(super) fn active() -> bool {
        NESTING.load(Ordering::Relaxed) > 0
    }
}

pub(crate) fn enter_critical() {
    critical::enter();
}

pub(crate) fn exit_critical() {
    critical::exit();
}

pub(crate) fn enter_critical_from_isr() -> u32 {
    critical::enter();
    0
}

pub(crate) fn exit_critical_from_isr(_saved: u32) {
    critical::exit();
}

pub(crate) fn in_critical() -> bool {
    critical::active()
}

/// Give up the processor. The scheduling decision happens inline; if it
/// parks the caller's task, ticks are delivered until the task is made
/// runnable and dispatched again.
pub(crate) fn yield_now() {
    let prev = RUNNING_TASK.load(Ordering::Relaxed);
    SWITCH_PENDING.store(false, Ordering::Relaxed);
    kernel::switch_context();

    if prev.is_null() {
        return;
    }
    // Safety: TCBs live in a static pool and are never deallocated.
    let prev: &'static TaskCb = unsafe { &*prev };

    let mut ticks = 0;
    while !kernel::is_running_task(prev) {
        kernel::tick_handler();
        SWITCH_PENDING.store(false, Ordering::Relaxed);
        kernel::switch_context();

        ticks += 1;
        if ticks > YIELD_TICK_LIMIT {
            panic!("hosted port: task was never scheduled again (lost wakeup?)");
        }
    }
}

pub(crate) fn pend_switch() {
    SWITCH_PENDING.store(true, Ordering::Relaxed);
}

pub(crate) fn wait_for_interrupt() {
    core::hint::spin_loop();
}

pub(crate) fn publish_running_task(task: Option<&'static TaskCb>) {
    let ptr = task.map_or(core::ptr::null_mut(), |t| t as *const TaskCb as *mut TaskCb);
    RUNNING_TASK.store(ptr, Ordering::Relaxed);
}

/// Whether a context switch has been requested and not yet performed.
/// Used by tests to observe preemption decisions.
#[cfg(test)]
pub(crate) fn switch_pending() -> bool {
    SWITCH_PENDING.load(Ordering::Relaxed)
}

#[cfg(test)]
pub(crate) fn reset() {
    SWITCH_PENDING.store(false, Ordering::Relaxed);
    RUNNING_TASK.store(core::ptr::null_mut(), Ordering::Relaxed);
}
