//! The scheduler layer.
//!
//! Every policy exposes the same capability set through a [`SchedOps`]
//! table of plain function pointers. Exactly one table is bound at
//! [`crate::kernel::init`] and stays bound for the lifetime of the kernel;
//! there is no runtime registration.
//!
//! The free functions in this module are the kernel-facing surface; they
//! dispatch through the bound table and degrade to logged no-ops when no
//! policy is bound (mirroring the "scheduler not initialized" guards of
//! the state machine they front).
pub(crate) mod cooperative;
pub(crate) mod delayed;
pub(crate) mod fixed_priority;
pub(crate) mod list;
pub(crate) mod round_robin;

use crate::{
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    task::TaskCb,
    Kind, Result, Tick,
};

/// Selects a scheduling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerKind {
    /// Preemptive fixed-priority; FIFO among equal priorities.
    FixedPriority,
    /// Run-to-yield; a yielding task rotates to the tail.
    Cooperative,
    /// Equal time slices over a single FIFO.
    RoundRobin,
}

/// The capability set every policy implements.
pub(crate) struct SchedOps {
    /// Reset policy-private state.
    pub(crate) init: fn(CpuLockTokenRefMut<'_>),
    /// Choose the task that should run next. Does not dequeue it.
    pub(crate) pick_next: fn(CpuLockTokenRefMut<'_>) -> Option<&'static TaskCb>,
    /// Decide whether `candidate` should preempt the running task. Called
    /// when a task becomes Ready and once per tick.
    pub(crate) should_preempt: fn(CpuLockTokenRefMut<'_>, &'static TaskCb) -> bool,
    /// Notification that `task` yielded the processor (voluntarily or by
    /// preemption).
    pub(crate) on_yield: fn(CpuLockTokenRefMut<'_>, &'static TaskCb),
    pub(crate) ready_push: fn(CpuLockTokenRefMut<'_>, &'static TaskCb),
    pub(crate) ready_remove: fn(CpuLockTokenRefMut<'_>, &'static TaskCb),
    /// Park `task` until `ticks` ticks have elapsed.
    pub(crate) delayed_push: fn(CpuLockTokenRefMut<'_>, &'static TaskCb, Tick),
    pub(crate) delayed_remove: fn(CpuLockTokenRefMut<'_>, &'static TaskCb),
    /// Move every task whose wake tick has been reached into Ready.
    pub(crate) advance_delayed: fn(CpuLockTokenRefMut<'_>),
    pub(crate) stats: fn(CpuLockTokenRefMut<'_>) -> SchedStats,
}

/// A point-in-time summary of the bound policy's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedStats {
    /// Tasks in the ready structure.
    pub ready: usize,
    /// Tasks parked on the delayed list.
    pub delayed: usize,
    /// Remaining round-robin slice of the running task; zero under other
    /// policies.
    pub slice_remaining: Tick,
}

static REGISTRY: [(SchedulerKind, &SchedOps); 3] = [
    (SchedulerKind::FixedPriority, &fixed_priority::OPS),
    (SchedulerKind::Cooperative, &cooperative::OPS),
    (SchedulerKind::RoundRobin, &round_robin::OPS),
];

static ACTIVE: CpuLockCell<Option<&'static SchedOps>> = CpuLockCell::new(None);

/// Bind and initialize the policy. Fails if one is already bound.
pub(crate) fn bind(mut lock: CpuLockTokenRefMut<'_>, kind: SchedulerKind) -> Result {
    if ACTIVE.get(&*lock).is_some() {
        log::error!("scheduler already initialized");
        return Err(Kind::InvalidState);
    }

    let Some(&(_, ops)) = REGISTRY.iter().find(|(k, _)| *k == kind) else {
        return Err(Kind::InvalidParam);
    };

    (ops.init)(lock.borrow_mut());
    ACTIVE.replace(&mut *lock, Some(ops));
    log::info!("scheduler initialized: {:?}", kind);
    Ok(())
}

fn active(lock: &CpuLockTokenRefMut<'_>) -> Option<&'static SchedOps> {
    let ops = ACTIVE.get(&**lock);
    if ops.is_none() {
        log::error!("scheduler not initialized");
    }
    ops
}

pub(crate) fn pick_next(mut lock: CpuLockTokenRefMut<'_>) -> Option<&'static TaskCb> {
    let ops = active(&lock)?;
    (ops.pick_next)(lock.borrow_mut())
}

pub(crate) fn should_preempt(mut lock: CpuLockTokenRefMut<'_>, candidate: &'static TaskCb) -> bool {
    match active(&lock) {
        Some(ops) => (ops.should_preempt)(lock.borrow_mut(), candidate),
        None => false,
    }
}

pub(crate) fn on_yield(mut lock: CpuLockTokenRefMut<'_>, task: &'static TaskCb) {
    if let Some(ops) = active(&lock) {
        (ops.on_yield)(lock.borrow_mut(), task);
    }
}

pub(crate) fn ready_push(mut lock: CpuLockTokenRefMut<'_>, task: &'static TaskCb) {
    if let Some(ops) = active(&lock) {
        (ops.ready_push)(lock.borrow_mut(), task);
    }
}

pub(crate) fn ready_remove(mut lock: CpuLockTokenRefMut<'_>, task: &'static TaskCb) {
    if let Some(ops) = active(&lock) {
        (ops.ready_remove)(lock.borrow_mut(), task);
    }
}

pub(crate) fn delayed_push(mut lock: CpuLockTokenRefMut<'_>, task: &'static TaskCb, ticks: Tick) {
    if let Some(ops) = active(&lock) {
        (ops.delayed_push)(lock.borrow_mut(), task, ticks);
    }
}

pub(crate) fn delayed_remove(mut lock: CpuLockTokenRefMut<'_>, task: &'static TaskCb) {
    if let Some(ops) = active(&lock) {
        (ops.delayed_remove)(lock.borrow_mut(), task);
    }
}

pub(crate) fn advance_delayed(mut lock: CpuLockTokenRefMut<'_>) {
    if let Some(ops) = active(&lock) {
        (ops.advance_delayed)(lock.borrow_mut());
    }
}

/// A snapshot of the bound policy's state, or `None` before
/// [`crate::kernel::init`].
pub fn stats() -> Option<SchedStats> {
    let mut guard = klock::lock_cpu();
    let ops = ACTIVE.get(&*guard)?;
    Some((ops.stats)(guard.borrow_mut()))
}

#[cfg(test)]
pub(crate) fn is_bound(lock: CpuLockTokenRefMut<'_>) -> bool {
    ACTIVE.get(&*lock).is_some()
}

#[cfg(test)]
pub(crate) fn reset(mut lock: CpuLockTokenRefMut<'_>) {
    ACTIVE.replace(&mut *lock, None);
    fixed_priority::test_reset(lock.borrow_mut());
    cooperative::test_reset(lock.borrow_mut());
    round_robin::test_reset(lock.borrow_mut());
}
