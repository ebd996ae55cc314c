//! The kernel core: global state, the tick engine, and the context-switch
//! protocol.
use core::convert::Infallible;

use crate::{
    cfg,
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    port, sched,
    task::{self, Task, TaskCb, TaskSt},
    timer, Kind, MAX_WAIT, Result, Tick,
};

/// Kernel lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelSt {
    /// Before [`init`].
    Inactive,
    /// Initialized; the scheduler has not been started.
    Ready,
    /// [`start`] has dispatched the first task.
    Running,
    /// Reserved: the scheduler is temporarily held off.
    Suspended,
}

struct KernelState {
    state: CpuLockCell<KernelSt>,
    tick_count: CpuLockCell<Tick>,
    current_task: CpuLockCell<Option<&'static TaskCb>>,
    /// Scratch slot holding the scheduling decision between selection and
    /// installation.
    next_task: CpuLockCell<Option<&'static TaskCb>>,
    /// When non-zero, `switch_context` is a no-op.
    sched_suspended: CpuLockCell<u8>,
    idle_task: CpuLockCell<Option<&'static TaskCb>>,
}

static KERNEL: KernelState = KernelState {
    state: CpuLockCell::new(KernelSt::Inactive),
    tick_count: CpuLockCell::new(0),
    current_task: CpuLockCell::new(None),
    next_task: CpuLockCell::new(None),
    sched_suspended: CpuLockCell::new(0),
    idle_task: CpuLockCell::new(None),
};

/// Initialize the kernel: bind the scheduling policy, initialize the port
/// layer, and create the idle task.
pub fn init() -> Result {
    let mut guard = klock::lock_cpu();

    if KERNEL.state.get(&*guard) != KernelSt::Inactive {
        return Err(Kind::InvalidState);
    }

    KERNEL.tick_count.replace(&mut *guard, 0);
    KERNEL.current_task.replace(&mut *guard, None);
    KERNEL.next_task.replace(&mut *guard, None);
    KERNEL.sched_suspended.replace(&mut *guard, 0);

    sched::bind(guard.borrow_mut(), cfg::SCHEDULER_TYPE)?;
    port::init();
    drop(guard);

    let idle = Task::create(task::idle_entry, Some("idle"), 0, 0, cfg::IDLE_PRIORITY)?;

    let mut guard = klock::lock_cpu();
    KERNEL.idle_task.replace(&mut *guard, Some(idle.0));
    KERNEL.state.replace(&mut *guard, KernelSt::Ready);

    log::info!("kernel initialized");
    Ok(())
}

/// Start the scheduler. On success control transfers to the first task and
/// this function never returns.
pub fn start() -> Result<Infallible> {
    let mut guard = klock::lock_cpu();

    if KERNEL.state.get(&*guard) != KernelSt::Ready {
        return Err(Kind::InvalidState);
    }

    let Some(first) = sched::pick_next(guard.borrow_mut()) else {
        log::error!("no runnable task at scheduler start");
        return Err(Kind::General);
    };

    sched::ready_remove(guard.borrow_mut(), first);
    task::set_state(guard.borrow_mut(), first, TaskSt::Running)?;
    KERNEL.current_task.replace(&mut *guard, Some(first));
    port::publish_running_task(Some(first));
    KERNEL.state.replace(&mut *guard, KernelSt::Running);
    drop(guard);

    port::start_tick();
    port::start_first_task()
}

/// Current value of the kernel tick counter.
pub fn tick_count() -> Tick {
    let guard = klock::lock_cpu();
    KERNEL.tick_count.get(&*guard)
}

/// Block the calling task for `ticks` kernel ticks. `0` is a no-op.
pub fn delay_ticks(ticks: Tick) {
    if ticks == 0 {
        return;
    }

    let mut guard = klock::lock_cpu();
    let Some(current) = KERNEL.current_task.get(&*guard) else {
        log::error!("delay with no current task");
        return;
    };

    if task::set_state(guard.borrow_mut(), current, TaskSt::Blocked).is_err() {
        return;
    }
    sched::delayed_push(guard.borrow_mut(), current, ticks);
    drop(guard);

    port::yield_now();
}

/// Block the calling task for `ms` milliseconds, rounding up to whole
/// ticks (minimum one).
pub fn delay_ms(ms: u32) {
    let ticks = (ms as u64 * cfg::TICK_HZ as u64).div_ceil(1000) as Tick;
    delay_ticks(ticks.max(1));
}

/// Voluntarily give up the processor.
pub fn yield_now() {
    port::yield_now();
}

/// Make `task` Ready and request preemption if the scheduler says the
/// newly ready task should run in place of the current one.
pub(crate) fn task_ready(mut lock: CpuLockTokenRefMut<'_>, task: &'static TaskCb) {
    if task::set_state(lock.borrow_mut(), task, TaskSt::Ready).is_err() {
        return;
    }
    sched::ready_push(lock.borrow_mut(), task);

    if KERNEL.state.get(&*lock.borrow_mut()) == KernelSt::Running
        && sched::should_preempt(lock.borrow_mut(), task)
    {
        port::pend_switch();
    }
}

/// Block the current task, parking it on the delayed list when the
/// timeout is finite. Consumes the guard: the yield must happen outside
/// the critical section.
pub(crate) fn block_current(
    mut guard: klock::CpuLockGuard,
    task: &'static TaskCb,
    timeout: Tick,
) {
    if task::set_state(guard.borrow_mut(), task, TaskSt::Blocked).is_err() {
        return;
    }
    if timeout != MAX_WAIT {
        sched::delayed_push(guard.borrow_mut(), task, timeout);
    }
    drop(guard);

    port::yield_now();
}

/// Wake a blocked task. Idempotent: waking a task that is not Blocked
/// does nothing, so the timeout path and the hand-off path may race
/// benignly.
pub(crate) fn task_unblock(mut lock: CpuLockTokenRefMut<'_>, task: &'static TaskCb) {
    if task.st.get(&*lock.borrow_mut()) != TaskSt::Blocked {
        return;
    }

    sched::delayed_remove(lock.borrow_mut(), task);
    task_ready(lock.borrow_mut(), task);
}

/// The kernel tick. Called from the tick interrupt with interrupts masked
/// above the kernel priority threshold.
pub fn tick_handler() {
    let mut saved = port::enter_critical_from_isr();

    {
        // Safety: the ISR-variant critical section was just entered
        let mut token = unsafe { klock::assume_cpu_lock() };
        let mut lock = token.borrow_mut();
        let tick = KERNEL.tick_count.get(&*lock);
        KERNEL.tick_count.replace(&mut *lock, tick.wrapping_add(1));
    }

    // Software timers fire before delayed tasks age; callbacks run with
    // the critical section released.
    saved = timer::service(saved);

    {
        // Safety: `timer::service` returned with the critical section
        // re-entered
        let mut token = unsafe { klock::assume_cpu_lock() };
        let mut lock = token.borrow_mut();

        if KERNEL.state.get(&*lock.borrow_mut()) == KernelSt::Running {
            sched::advance_delayed(lock.borrow_mut());

            if let Some(candidate) = sched::pick_next(lock.borrow_mut()) {
                if sched::should_preempt(lock.borrow_mut(), candidate) {
                    port::pend_switch();
                }
            }
        }
    }

    port::exit_critical_from_isr(saved);
}

/// The scheduling half of a context switch. The port's switch handler
/// saves the outgoing register frame and the stack pointer *before*
/// calling this, and restores from the incoming task's TCB *after*.
pub fn switch_context() {
    let mut guard = klock::lock_cpu();

    if KERNEL.sched_suspended.get(&*guard) > 0 {
        return;
    }

    // A task that is still runnable goes back to the ready structure; a
    // Blocked or Suspended one stays off it.
    if let Some(current) = KERNEL.current_task.get(&*guard) {
        let st = current.st.get(&*guard);
        if st != TaskSt::Blocked && st != TaskSt::Suspended {
            if task::set_state(guard.borrow_mut(), current, TaskSt::Ready).is_ok() {
                sched::ready_push(guard.borrow_mut(), current);
            }
        }
        sched::on_yield(guard.borrow_mut(), current);
    }

    let mut next = sched::pick_next(guard.borrow_mut());
    if next.is_none() {
        // Nothing runnable; fall back to the idle task.
        let idle = KERNEL.idle_task.get(&*guard);
        next = idle.filter(|idle| idle.st.get(&*guard) == TaskSt::Ready);
    }
    KERNEL.next_task.replace(&mut *guard, next);

    let Some(next) = next else {
        log::error!("scheduler produced no task and the idle task is unavailable");
        return;
    };

    sched::ready_remove(guard.borrow_mut(), next);
    if task::set_state(guard.borrow_mut(), next, TaskSt::Running).is_err() {
        return;
    }
    KERNEL.current_task.replace(&mut *guard, Some(next));
    KERNEL.next_task.replace(&mut *guard, None);
    port::publish_running_task(Some(next));
}

/// The task currently installed as running.
pub(crate) fn running_task(lock: CpuLockTokenRefMut<'_>) -> Option<&'static TaskCb> {
    KERNEL.current_task.get(&*lock)
}

/// Tick counter, for callers already holding the CPU Lock.
pub(crate) fn tick_now(lock: CpuLockTokenRefMut<'_>) -> Tick {
    KERNEL.tick_count.get(&*lock)
}

/// Whether `task` is the installed running task. Used by the hosted port
/// to detect when a yielding task has been scheduled again.
pub(crate) fn is_running_task(task: &'static TaskCb) -> bool {
    let mut guard = klock::lock_cpu();
    running_task(guard.borrow_mut()).is_some_and(|t| core::ptr::eq(t, task))
        && task.st.get(&*guard) == TaskSt::Running
}

/// Kernel lifecycle state.
pub fn state() -> KernelSt {
    let guard = klock::lock_cpu();
    KERNEL.state.get(&*guard)
}

#[cfg(test)]
pub(crate) fn reset_state(mut lock: CpuLockTokenRefMut<'_>) {
    KERNEL.state.replace(&mut *lock, KernelSt::Inactive);
    KERNEL.tick_count.replace(&mut *lock, 0);
    KERNEL.current_task.replace(&mut *lock, None);
    KERNEL.next_task.replace(&mut *lock, None);
    KERNEL.sched_suspended.replace(&mut *lock, 0);
    KERNEL.idle_task.replace(&mut *lock, None);
}

#[cfg(test)]
pub(crate) fn set_tick(mut lock: CpuLockTokenRefMut<'_>, tick: Tick) {
    KERNEL.tick_count.replace(&mut *lock, tick);
}

#[cfg(test)]
pub(crate) fn install_running(mut lock: CpuLockTokenRefMut<'_>, task: &'static TaskCb) {
    KERNEL.current_task.replace(&mut *lock, Some(task));
    KERNEL.state.replace(&mut *lock, KernelSt::Running);
    port::publish_running_task(Some(task));
}
