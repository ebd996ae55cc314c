//! Tasks.
//!
//! Task control blocks live in a fixed pool; stacks come from the arena.
//! Neither is ever reclaimed — a pool slot whose `entry` is `None` has
//! never been used.
use core::fmt;
use core::mem::offset_of;

use crate::{
    arena, cfg, kernel,
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    port::{self, PortTaskState},
    sched::{self, list::ListLink, SchedulerKind},
    utils::Init,
    wait::BlockedOn,
    Kind, Priority, Result, Tick,
};

/// A task entry function. Receives the opaque parameter given at creation.
pub type TaskFn = fn(usize);

/// Task execution states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSt {
    /// Runnable, sitting in a scheduler ready list.
    Ready,
    /// The one task currently executing in thread mode.
    Running,
    /// Waiting for a timeout or a synchronization object.
    Blocked,
    /// Taken off the scheduler until resumed.
    Suspended,
    /// Not alive. Also the state of a never-used pool slot; task deletion
    /// with reclamation is not supported.
    Deleted,
}

impl Init for TaskSt {
    const INIT: Self = Self::Deleted;
}

/// The stack region owned by a task.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TaskStack {
    pub(crate) base: *mut u8,
    pub(crate) size: usize,
}

// Safety: the pointer refers to arena storage that is never reclaimed; it
// is only dereferenced under the CPU Lock or by the owning task itself.
unsafe impl Send for TaskStack {}

impl Init for TaskStack {
    const INIT: Self = Self {
        base: core::ptr::null_mut(),
        size: 0,
    };
}

/// *Task control block* — the per-task record.
///
/// `port_state` must stay the first field: the context-switch handler
/// reaches the saved stack pointer by dereferencing the current-task
/// pointer and then the first word.
#[repr(C)]
pub struct TaskCb {
    pub(crate) port_state: PortTaskState,

    pub(crate) id: CpuLockCell<u8>,
    pub(crate) name: CpuLockCell<Option<&'static str>>,
    pub(crate) entry: CpuLockCell<Option<TaskFn>>,
    pub(crate) entry_param: CpuLockCell<usize>,
    pub(crate) stack: CpuLockCell<TaskStack>,

    pub(crate) st: CpuLockCell<TaskSt>,
    /// The priority given at creation, restored when the last held mutex
    /// is released.
    pub(crate) base_priority: CpuLockCell<Priority>,
    /// The priority the schedulers and wait queues order by. May be
    /// boosted above `base_priority` by priority inheritance.
    pub(crate) effective_priority: CpuLockCell<Priority>,

    /// Absolute tick at which a timed wait expires. Meaningful while the
    /// task sits in a delayed list.
    pub(crate) wake_tick: CpuLockCell<Tick>,
    /// Round-robin budget of the task while it runs.
    pub(crate) slice_remaining: CpuLockCell<Tick>,

    /// Links the task into exactly one scheduler-owned list (a ready list
    /// or a delayed list).
    pub(crate) sched_link: ListLink,
    /// Links the task into at most one sync-object wait list.
    pub(crate) wait_link: CpuLockCell<Option<&'static TaskCb>>,
    /// What the task is blocked on, if anything. The wakeup paths use this
    /// to tell a timeout from a hand-off.
    pub(crate) blocked_on: CpuLockCell<BlockedOn>,
}

const _: () = assert!(offset_of!(TaskCb, port_state) == 0);
const _: () = assert!(offset_of!(PortTaskState, sp) == 0);

impl Init for TaskCb {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        port_state: Init::INIT,
        id: Init::INIT,
        name: Init::INIT,
        entry: Init::INIT,
        entry_param: Init::INIT,
        stack: Init::INIT,
        st: Init::INIT,
        base_priority: Init::INIT,
        effective_priority: Init::INIT,
        wake_tick: Init::INIT,
        slice_remaining: Init::INIT,
        sched_link: Init::INIT,
        wait_link: Init::INIT,
        blocked_on: Init::INIT,
    };
}

static TASK_POOL: [TaskCb; cfg::MAX_TASKS] = [TaskCb::INIT; cfg::MAX_TASKS];

static TASK_COUNT: CpuLockCell<u8> = CpuLockCell::new(0);

/// A handle to a task.
#[derive(Clone, Copy)]
pub struct Task(pub(crate) &'static TaskCb);

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self.0, other.0)
    }
}

impl Eq for Task {}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Task").field(&(self.0 as *const _)).finish()
    }
}

impl Task {
    /// Create a new task and add it to the scheduler's ready list.
    ///
    /// `stack_size == 0` selects [`cfg::DEFAULT_STACK_SIZE`]; any other
    /// value is clamped up to [`cfg::MIN_STACK_SIZE`] and rounded up to 8
    /// bytes. `priority` must be below [`cfg::MAX_PRIORITIES`].
    pub fn create(
        entry: TaskFn,
        name: Option<&'static str>,
        stack_size: usize,
        param: usize,
        priority: Priority,
    ) -> Result<Task> {
        if priority as usize >= cfg::MAX_PRIORITIES {
            log::error!(
                "invalid task priority {} (max {})",
                priority,
                cfg::MAX_PRIORITIES - 1
            );
            return Err(Kind::InvalidParam);
        }

        let stack_size = if stack_size == 0 {
            cfg::DEFAULT_STACK_SIZE
        } else {
            stack_size.max(cfg::MIN_STACK_SIZE)
        };
        let stack_size = (stack_size + 7) & !7;

        let mut guard = klock::lock_cpu();

        let mut slot = None;
        for cb in TASK_POOL.iter() {
            if cb.entry.get(&*guard).is_none() {
                slot = Some(cb);
                break;
            }
        }
        let Some(cb) = slot else {
            log::error!("task pool exhausted ({} slots)", cfg::MAX_TASKS);
            return Err(Kind::TooManyTasks);
        };

        let Some(stack_base) = arena::alloc_bytes(guard.borrow_mut(), stack_size) else {
            return Err(Kind::NoMemory);
        };
        let stack_base = stack_base.as_ptr();

        // Overflow sentinel at the lowest address; a descending stack
        // clobbers it last.
        // Safety: the region was just allocated and is at least
        // MIN_STACK_SIZE bytes
        unsafe { (stack_base as *mut u32).write_volatile(cfg::STACK_CANARY) };

        let stack_top = unsafe { stack_base.add(stack_size) };
        let sp = port::init_task_stack(stack_top, entry, param);

        let id = TASK_COUNT.get(&*guard);
        TASK_COUNT.replace(&mut *guard, id + 1);

        cb.id.replace(&mut *guard, id);
        cb.name.replace(&mut *guard, name);
        cb.entry.replace(&mut *guard, Some(entry));
        cb.entry_param.replace(&mut *guard, param);
        cb.stack.replace(
            &mut *guard,
            TaskStack {
                base: stack_base,
                size: stack_size,
            },
        );
        cb.st.replace(&mut *guard, TaskSt::Ready);
        cb.base_priority.replace(&mut *guard, priority);
        cb.effective_priority.replace(&mut *guard, priority);
        cb.wake_tick.replace(&mut *guard, 0);
        cb.slice_remaining.replace(&mut *guard, cfg::TIME_SLICE_TICKS);
        cb.blocked_on.replace(&mut *guard, BlockedOn::None);
        // Safety: CPU Lock held; the slot is not yet visible to the
        // scheduler
        unsafe { *cb.port_state.sp.get() = sp };

        sched::ready_push(guard.borrow_mut(), cb);

        drop(guard);

        log::info!(
            "created task '{}' (id={}, prio={}, stack={} bytes)",
            name.unwrap_or("unnamed"),
            id,
            priority,
            stack_size
        );

        Ok(Task(cb))
    }

    /// The currently running task, if the scheduler has dispatched one.
    pub fn current() -> Option<Task> {
        let mut guard = klock::lock_cpu();
        kernel::running_task(guard.borrow_mut()).map(Task)
    }

    /// Look up a task by its numeric id.
    pub fn by_id(id: u8) -> Result<Task> {
        let guard = klock::lock_cpu();
        for cb in TASK_POOL.iter() {
            if cb.entry.get(&*guard).is_some() && cb.id.get(&*guard) == id {
                return Ok(Task(cb));
            }
        }
        Err(Kind::TaskNotFound)
    }

    /// Look up a task by name.
    pub fn by_name(name: &str) -> Result<Task> {
        let guard = klock::lock_cpu();
        for cb in TASK_POOL.iter() {
            if cb.entry.get(&*guard).is_some() && cb.name.get(&*guard) == Some(name) {
                return Ok(Task(cb));
            }
        }
        Err(Kind::TaskNotFound)
    }

    pub fn id(&self) -> u8 {
        let guard = klock::lock_cpu();
        self.0.id.get(&*guard)
    }

    pub fn name(&self) -> Option<&'static str> {
        let guard = klock::lock_cpu();
        self.0.name.get(&*guard)
    }

    pub fn state(&self) -> TaskSt {
        let guard = klock::lock_cpu();
        self.0.st.get(&*guard)
    }

    /// The task's current (effective) priority.
    pub fn priority(&self) -> Priority {
        let guard = klock::lock_cpu();
        self.0.effective_priority.get(&*guard)
    }

    /// The priority the task was created with.
    pub fn base_priority(&self) -> Priority {
        let guard = klock::lock_cpu();
        self.0.base_priority.get(&*guard)
    }

    /// Suspend the calling task. Only the running task can be suspended —
    /// there is no transition from `Ready` or `Blocked` to `Suspended`.
    pub fn suspend(&self) -> Result {
        let mut guard = klock::lock_cpu();

        let is_current =
            kernel::running_task(guard.borrow_mut()).is_some_and(|t| core::ptr::eq(t, self.0));
        if !is_current {
            return Err(Kind::InvalidState);
        }

        set_state(guard.borrow_mut(), self.0, TaskSt::Suspended)?;
        drop(guard);
        port::yield_now();
        Ok(())
    }

    /// Make a suspended task runnable again.
    pub fn resume(&self) -> Result {
        let mut guard = klock::lock_cpu();

        if self.0.st.get(&*guard) != TaskSt::Suspended {
            return Err(Kind::InvalidState);
        }

        kernel::task_ready(guard.borrow_mut(), self.0);
        Ok(())
    }

    /// Verify the stack overflow sentinel.
    pub fn check_stack(&self) -> Result {
        let guard = klock::lock_cpu();

        let stack = self.0.stack.get(&*guard);
        if stack.base.is_null() {
            return Err(Kind::InvalidState);
        }

        // Safety: the base points at the task's arena-backed stack region
        let canary = unsafe { (stack.base as *const u32).read_volatile() };
        if canary != cfg::STACK_CANARY {
            log::error!(
                "stack overflow detected on task {} (canary {:#010x})",
                self.0.id.get(&*guard),
                canary
            );
            return Err(Kind::General);
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn cb(&self) -> &'static TaskCb {
        self.0
    }
}

/// Number of tasks created so far (including the idle task).
pub fn count() -> u8 {
    let guard = klock::lock_cpu();
    TASK_COUNT.get(&*guard)
}

/// Log a per-task summary at debug level.
pub fn dump_all() {
    let mut guard = klock::lock_cpu();

    let arena_used = arena::used(guard.borrow_mut());
    log::debug!(
        "tasks: {}/{}, arena: {}/{} bytes",
        TASK_COUNT.get(&*guard),
        cfg::MAX_TASKS,
        arena_used,
        arena::capacity()
    );
    for cb in TASK_POOL.iter() {
        if cb.entry.get(&*guard).is_none() {
            continue;
        }
        log::debug!(
            "  task[{}] '{}' prio={}/{} state={:?} stack={}",
            cb.id.get(&*guard),
            cb.name.get(&*guard).unwrap_or("unnamed"),
            cb.effective_priority.get(&*guard),
            cb.base_priority.get(&*guard),
            cb.st.get(&*guard),
            cb.stack.get(&*guard).size,
        );
    }
}

/// Perform a validated state transition. Anything outside the state
/// machine is rejected and logged.
pub(crate) fn set_state(
    mut lock: CpuLockTokenRefMut<'_>,
    task: &'static TaskCb,
    new: TaskSt,
) -> Result {
    use TaskSt::*;

    let old = task.st.get(&*lock);
    let valid = matches!(
        (old, new),
        (Ready, Running)
            | (Running, Ready)
            | (Running, Blocked)
            | (Running, Suspended)
            | (Blocked, Ready)
            | (Suspended, Ready)
    );
    if !valid {
        log::error!(
            "rejected task state transition {:?} -> {:?} (task {})",
            old,
            new,
            task.id.get(&*lock)
        );
        return Err(Kind::InvalidState);
    }

    task.st.replace(&mut *lock, new);
    Ok(())
}

/// Change a task's effective priority, keeping whichever ordered structure
/// currently holds the task consistent.
pub(crate) fn set_effective_priority(
    mut lock: CpuLockTokenRefMut<'_>,
    task: &'static TaskCb,
    priority: Priority,
) {
    if task.effective_priority.get(&*lock) == priority {
        return;
    }

    let st = task.st.get(&*lock);
    match st {
        TaskSt::Ready => {
            // The ready structure is keyed by effective priority; move the
            // task between lists.
            sched::ready_remove(lock.borrow_mut(), task);
            task.effective_priority.replace(&mut *lock, priority);
            sched::ready_push(lock.borrow_mut(), task);
        }
        TaskSt::Blocked => {
            task.effective_priority.replace(&mut *lock, priority);
            crate::wait::requeue_for_blocked_on(lock.borrow_mut(), task);
        }
        _ => {
            task.effective_priority.replace(&mut *lock, priority);
        }
    }
}

/// The idle task. Created by [`kernel::init`] at [`cfg::IDLE_PRIORITY`].
pub(crate) fn idle_entry(_param: usize) {
    loop {
        port::wait_for_interrupt();

        if matches!(cfg::SCHEDULER_TYPE, SchedulerKind::Cooperative) {
            kernel::yield_now();
        }
    }
}

#[cfg(test)]
pub(crate) fn reset_pool(mut lock: CpuLockTokenRefMut<'_>) {
    for cb in TASK_POOL.iter() {
        cb.id.replace(&mut *lock, 0);
        cb.name.replace(&mut *lock, None);
        cb.entry.replace(&mut *lock, None);
        cb.entry_param.replace(&mut *lock, 0);
        cb.stack.replace(&mut *lock, TaskStack::INIT);
        cb.st.replace(&mut *lock, TaskSt::Deleted);
        cb.base_priority.replace(&mut *lock, 0);
        cb.effective_priority.replace(&mut *lock, 0);
        cb.wake_tick.replace(&mut *lock, 0);
        cb.slice_remaining.replace(&mut *lock, 0);
        cb.sched_link.next.replace(&mut *lock, None);
        cb.sched_link.prev.replace(&mut *lock, None);
        cb.wait_link.replace(&mut *lock, None);
        cb.blocked_on.replace(&mut *lock, BlockedOn::None);
        // Safety: CPU Lock held
        unsafe { *cb.port_state.sp.get() = 0 };
    }
    TASK_COUNT.replace(&mut *lock, 0);
}
