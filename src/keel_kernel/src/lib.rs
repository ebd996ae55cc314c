//! A small preemptive real-time kernel for single-core Arm Cortex-M–class
//! microcontrollers.
//!
//! The kernel provides preemptive multitasking over a fixed task pool, three
//! pluggable scheduling policies (fixed-priority preemptive, cooperative,
//! round-robin time-sliced), a tick/delay engine, blocking synchronization
//! primitives (recursive mutex with transitive priority inheritance, counting
//! semaphore, bounded message queue), and software timers driven by the
//! kernel tick.
//!
//! # Structure
//!
//! All kernel objects are created at runtime from static storage: task
//! control blocks come from a fixed pool ([`cfg::MAX_TASKS`] slots), task
//! stacks and synchronization objects from a bump-allocated byte arena
//! ([`cfg::TOTAL_HEAP_SIZE`] bytes). Nothing is ever freed.
//!
//! Every piece of kernel-shared state is wrapped in a `CpuLockCell`, which
//! can only be accessed while holding the CPU Lock (the kernel critical
//! section). The lock is entered through the port layer, which masks
//! interrupts at or below the kernel priority threshold.
//!
//! # Typical usage
//!
//! ```no_run
//! use keel_kernel as keel;
//!
//! fn blink(_param: usize) {
//!     loop {
//!         // toggle an LED...
//!         keel::delay_ms(500);
//!     }
//! }
//!
//! keel::init().unwrap();
//! keel::Task::create(blink, Some("blink"), 512, 0, 3).unwrap();
//! keel::start().unwrap(); // never returns on success
//! ```
#![cfg_attr(not(test), no_std)]

pub mod cfg;
pub mod error;

mod arena;
pub mod kernel;
mod klock;
pub mod mutex;
mod port;
pub mod queue;
pub mod sched;
pub mod semaphore;
pub mod task;
pub mod timer;
mod utils;
mod wait;

#[cfg(test)]
mod scenarios;
#[cfg(test)]
mod test_support;

pub use self::error::{Kind, Result};
pub use self::kernel::{delay_ms, delay_ticks, init, start, tick_count, yield_now, KernelSt};
pub use self::mutex::Mutex;
pub use self::queue::Queue;
pub use self::sched::{SchedStats, SchedulerKind};
pub use self::semaphore::Semaphore;
pub use self::task::{Task, TaskFn, TaskSt};
pub use self::timer::{Timer, TimerFn, TimerMode};

/// The type of the system tick counter. Wraps around on overflow; all
/// comparisons against tick values use wrap-safe signed-difference
/// arithmetic.
pub type Tick = u32;

/// Task priority. Higher numeric values are higher priorities;
/// [`cfg::IDLE_PRIORITY`] is the lowest.
pub type Priority = u8;

/// Timeout value requesting a single non-blocking attempt.
pub const NO_WAIT: Tick = 0;

/// Timeout value requesting an unbounded wait.
pub const MAX_WAIT: Tick = Tick::MAX;
