//! Status codes.
//!
//! All failure is reported by value; the kernel never unwinds across an
//! application boundary.

/// The error half of every fallible kernel operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// A parameter was out of range or otherwise unusable.
    InvalidParam,
    /// The arena could not satisfy an allocation.
    NoMemory,
    /// The task pool is exhausted.
    TooManyTasks,
    /// No task matched the given id or name.
    TaskNotFound,
    /// The operation is not legal in the current kernel or object state
    /// (double init, unlock by non-owner, invalid state transition, ...).
    InvalidState,
    /// A finite wait elapsed without the condition being met.
    Timeout,
    /// The queue (or bounded semaphore) is at capacity.
    Full,
    /// The queue is empty.
    Empty,
    /// An internal inconsistency that has no more precise code.
    General,
}

pub type Result<T = ()> = core::result::Result<T, Kind>;
