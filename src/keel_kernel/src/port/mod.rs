//! The port layer.
//!
//! Everything the portable kernel needs from the hardware is collected
//! behind this module's function surface:
//!
//! - `init` — set the context-switch and tick exceptions to their
//!   configured priorities and zero the critical-nesting state.
//! - `start_tick` — program the periodic timer for [`crate::cfg::TICK_HZ`].
//! - `start_first_task` — set up thread-mode register state from the first
//!   task's saved frame and transfer control; never returns.
//! - `init_task_stack` — lay out an exception frame and callee-saved
//!   registers on a fresh stack such that the first context restore enters
//!   `entry(param)` in thread mode.
//! - `enter_critical` / `exit_critical` — nestable; mask interrupts at or
//!   below the kernel priority threshold on first entry, restore on last
//!   exit.
//! - `enter_critical_from_isr` / `exit_critical_from_isr` — variants for
//!   interrupt handlers that return and accept the saved mask.
//! - `yield_now` — give up the processor from task context; returns once
//!   the calling task is scheduled again.
//! - `pend_switch` — request a context switch without waiting for it; safe
//!   from interrupt context.
//! - `wait_for_interrupt` — idle-task sleep.
//! - `publish_running_task` — keep the context-switch handler's view of
//!   the current TCB in sync with the kernel's.
//!
//! Two implementations exist: `arm_m` for bare-metal Arm Cortex-M
//! targets, and `hosted` for every other target, which exists so the
//! kernel's logic can be exercised by host unit tests.
//!
//! The context-switch handler relies on the saved stack pointer living at
//! offset zero of the task control block; see [`PortTaskState`].
use core::cell::UnsafeCell;

use crate::utils::Init;

#[cfg(all(target_arch = "arm", target_os = "none"))]
mod arm_m;
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub(crate) use arm_m::*;

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
mod hosted;
#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub(crate) use hosted::*;

/// Port-owned per-task state. This is the first field of the task control
/// block so that the context-switch handler can reach the saved stack
/// pointer by dereferencing the current-task pointer and then the first
/// word.
#[derive(Debug)]
#[repr(C)]
pub struct PortTaskState {
    pub(crate) sp: UnsafeCell<usize>,
}

// Safety: `sp` is only accessed by the context-switch handler and by task
// creation, both of which run with the CPU Lock held.
unsafe impl Sync for PortTaskState {}

impl Init for PortTaskState {
    const INIT: Self = Self {
        sp: UnsafeCell::new(0),
    };
}
