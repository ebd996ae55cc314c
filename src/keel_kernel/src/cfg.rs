//! Compile-time kernel configuration.
//!
//! These are the build-time defaults; a board integration adjusts them by
//! editing this module (there is no runtime configuration — the values feed
//! static storage sizes).
use crate::{sched::SchedulerKind, Priority, Tick};

/// Core clock frequency the tick timer is derived from.
pub const SYSTEM_CLOCK_HZ: u32 = 84_000_000;

/// Kernel tick frequency in Hz.
pub const TICK_HZ: u32 = 1000;

/// Number of task control block slots, including the idle task.
pub const MAX_TASKS: usize = 8;

/// Number of priority levels. Valid task priorities are
/// `0..MAX_PRIORITIES`.
pub const MAX_PRIORITIES: usize = 8;

/// Priority of the idle task.
pub const IDLE_PRIORITY: Priority = 0;

/// Stack size used when a task is created with `stack_size == 0`.
pub const DEFAULT_STACK_SIZE: usize = 1024;

/// Hard lower bound on task stack sizes.
pub const MIN_STACK_SIZE: usize = 128;

/// Size of the kernel memory arena, which supplies task stacks and
/// synchronization-object storage.
///
/// The host test build gets a much larger arena: the allocator never frees,
/// and every test case allocates fresh kernel objects.
pub const TOTAL_HEAP_SIZE: usize = if cfg!(test) { 512 * 1024 } else { 16384 };

/// Round-robin time slice, in ticks.
pub const TIME_SLICE_TICKS: Tick = 20;

/// The scheduling policy bound at [`crate::kernel::init`].
pub const SCHEDULER_TYPE: SchedulerKind = SchedulerKind::FixedPriority;

/// Sentinel word written at the lowest address of every task stack.
pub const STACK_CANARY: u32 = 0xC0DE_C0DE;

/// Upper bound on the priority-inheritance chain walk. Reaching it means
/// the application has built a cycle of mutex ownership.
pub const MAX_PI_CHAIN: usize = 16;

/// Maximum recursive lock count of a mutex.
pub const MAX_MUTEX_RECURSION: u8 = 255;
