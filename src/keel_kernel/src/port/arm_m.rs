//! Arm Cortex-M port (Armv7-M and Armv7E-M).
//!
//! Exception usage:
//!
//! - **SysTick** runs at the kernel priority and drives
//!   [`crate::kernel::tick_handler`].
//! - **PendSV** runs at the lowest priority and performs the context
//!   switch. It is only ever *pended*; it fires once every higher-priority
//!   exception has drained, so it always interrupts thread mode.
//! - **SVCall** is used exactly once, to launch the first task.
//!
//! Critical sections raise `BASEPRI` to [`KERNEL_BASEPRI`], so interrupts
//! configured *above* that threshold (numerically lower priority values)
//! are never masked by the kernel.
//!
//! The handler symbols (`PendSV`, `SVCall`, `SysTick`) match the vector
//! names expected by `cortex-m-rt`; linking this crate into a `cortex-m-rt`
//! application wires them up without further glue.
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, Ordering};

use cortex_m::peripheral::scb::SystemHandler;
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::register::{basepri, basepri_max, psp};

use crate::{cfg, task::TaskCb, TaskFn};

/// `BASEPRI` value of the kernel critical section. Exceptions with
/// priority values numerically at or above this are masked while the CPU
/// Lock is held.
pub const KERNEL_BASEPRI: u8 = 0x80;

/// Exception priority assigned to SysTick (the kernel tick).
pub const TICK_IRQ_PRIORITY: u8 = KERNEL_BASEPRI;

/// Exception priority assigned to PendSV (the context switch). Must be the
/// lowest priority in the system.
pub const SWITCH_IRQ_PRIORITY: u8 = 0xff;

static CRITICAL_NESTING: AtomicU32 = AtomicU32::new(0);
static SAVED_BASEPRI: AtomicU32 = AtomicU32::new(0);

#[repr(transparent)]
struct RunningTask(UnsafeCell<*mut TaskCb>);

// Safety: written only with the CPU Lock held or from the PendSV handler,
// which the kernel priority discipline serializes against the writers.
unsafe impl Sync for RunningTask {}

/// The TCB the PendSV handler saves the outgoing context into and restores
/// the incoming context from. The saved-SP slot is the first word of the
/// TCB.
static RUNNING_TASK: RunningTask = RunningTask(UnsafeCell::new(core::ptr::null_mut()));

pub(crate) fn init() {
    CRITICAL_NESTING.store(0, Ordering::Relaxed);

    // Safety: priority configuration at startup; no priority-based
    // critical sections are constructed from these handlers' priorities.
    unsafe {
        let mut peripherals = cortex_m::Peripherals::steal();
        peripherals
            .SCB
            .set_priority(SystemHandler::PendSV, SWITCH_IRQ_PRIORITY);
        peripherals
            .SCB
            .set_priority(SystemHandler::SVCall, SWITCH_IRQ_PRIORITY);
        peripherals
            .SCB
            .set_priority(SystemHandler::SysTick, TICK_IRQ_PRIORITY);
    }
}

pub(crate) fn start_tick() {
    let reload = cfg::SYSTEM_CLOCK_HZ / cfg::TICK_HZ - 1;

    // Safety: we own SysTick; the claim-by-value API is bypassed because
    // the embedding application may have taken `Peripherals` already.
    let mut syst = unsafe { cortex_m::Peripherals::steal().SYST };
    syst.set_clock_source(SystClkSource::Core);
    syst.set_reload(reload);
    syst.clear_current();
    syst.enable_interrupt();
    syst.enable_counter();
}

pub(crate) fn start_first_task() -> ! {
    // Safety: the kernel has installed the first task before calling this.
    let first = unsafe { *RUNNING_TASK.0.get() };
    debug_assert!(!first.is_null());

    // The saved frame was built by `init_task_stack`: eight callee-saved
    // words below a hardware exception frame. Point PSP at it and let the
    // SVCall handler unstack.
    let sp = unsafe { *(*first).port_state.sp.get() };
    unsafe { psp::write(sp as u32) };

    unsafe {
        core::arch::asm!("svc 0", options(noreturn));
    }
}

/// Build the initial saved context so that the first restore of this task
/// enters `entry(param)` in thread mode using PSP.
///
/// Layout, from the returned SP upward: R4–R11, then the hardware frame
/// R0, R1, R2, R3, R12, LR, PC, xPSR.
pub(crate) fn init_task_stack(stack_top: *mut u8, entry: TaskFn, param: usize) -> usize {
    let mut sp = (stack_top as usize & !0x7) as *mut u32;

    // Hardware exception frame, unstacked on exception return
    for word in [
        0x0100_0000,               // xPSR: Thumb bit
        entry as usize as u32 & !1, // PC
        task_exit_trap as usize as u32, // LR: return from the entry function
        0,                         // R12
        0,                         // R3
        0,                         // R2
        0,                         // R1
        param as u32,              // R0: entry parameter
    ]
    .into_iter()
    .rev()
    {
        // Safety: the caller hands us an unused stack region
        unsafe {
            sp = sp.sub(1);
            sp.write(word);
        }
    }

    // Callee-saved registers R4-R11, restored by the PendSV handler
    for _ in 0..8 {
        unsafe {
            sp = sp.sub(1);
            sp.write(0);
        }
    }

    sp as usize
}

/// Reached if a task's entry function returns. Task deletion is not
/// supported, so there is nowhere to go.
extern "C" fn task_exit_trap() -> ! {
    log::error!("task entry function returned");
    loop {
        cortex_m::asm::wfi();
    }
}

pub(crate) fn enter_critical() {
    // The nesting counter is only touched from thread context and from
    // handlers below the kernel priority, so the first-entry window is not
    // racy against anything that also uses it.
    let nesting = CRITICAL_NESTING.load(Ordering::Relaxed);
    if nesting == 0 {
        SAVED_BASEPRI.store(basepri::read() as u32, Ordering::Relaxed);
        // Safety: raising BASEPRI is always memory-safe
        unsafe { basepri_max::write(KERNEL_BASEPRI) };
    }
    CRITICAL_NESTING.store(nesting + 1, Ordering::Relaxed);
}

pub(crate) fn exit_critical() {
    let nesting = CRITICAL_NESTING.load(Ordering::Relaxed);
    debug_assert!(nesting > 0, "unbalanced critical section exit");
    CRITICAL_NESTING.store(nesting - 1, Ordering::Relaxed);
    if nesting == 1 {
        // Safety: restoring the mask saved on first entry
        unsafe { basepri::write(SAVED_BASEPRI.load(Ordering::Relaxed) as u8) };
    }
}

pub(crate) fn enter_critical_from_isr() -> u32 {
    let saved = basepri::read() as u32;
    // Safety: raising BASEPRI is always memory-safe
    unsafe { basepri_max::write(KERNEL_BASEPRI) };
    saved
}

pub(crate) fn exit_critical_from_isr(saved: u32) {
    // Safety: `saved` came from `enter_critical_from_isr` on this path
    unsafe { basepri::write(saved as u8) };
}

pub(crate) fn in_critical() -> bool {
    basepri::read() != 0
}

pub(crate) fn yield_now() {
    pend_switch();
}

pub(crate) fn pend_switch() {
    cortex_m::peripheral::SCB::set_pendsv();
    cortex_m::asm::dsb();
    cortex_m::asm::isb();
}

pub(crate) fn wait_for_interrupt() {
    cortex_m::asm::wfi();
}

pub(crate) fn publish_running_task(task: Option<&'static TaskCb>) {
    let ptr = task.map_or(core::ptr::null_mut(), |t| t as *const TaskCb as *mut TaskCb);
    // Safety: called with the CPU Lock held
    unsafe { *RUNNING_TASK.0.get() = ptr };
}

/// Called by the PendSV handler between saving the outgoing context and
/// restoring the incoming one.
extern "C" fn pendsv_switch() {
    crate::kernel::switch_context();
}

#[no_mangle]
extern "C" fn SysTick() {
    crate::kernel::tick_handler();
}

// The context-switch and first-task handlers.
//
// PendSV precondition: the exception was taken in thread mode (it has the
// lowest priority), and the interrupted task's frame is stacked on PSP.
// If `RUNNING_TASK` is null there is no context to save (first dispatch or
// the previous task exited); likewise nothing to restore if the kernel left
// it null.
core::arch::global_asm!(
    "
    .global PendSV
    .type PendSV, %function
    .thumb_func
PendSV:
    mrs r0, psp
    ldr r2, ={running}
    ldr r1, [r2]
    cbz r1, 1f
    stmdb r0!, {{r4-r11}}
    str r0, [r1]
1:
    push {{r2, lr}}
    bl {switch}
    pop {{r2, lr}}
    ldr r1, [r2]
    cbz r1, 2f
    ldr r0, [r1]
    ldmia r0!, {{r4-r11}}
    msr psp, r0
2:
    bx lr

    .global SVCall
    .type SVCall, %function
    .thumb_func
SVCall:
    mrs r0, psp
    ldmia r0!, {{r4-r11}}
    msr psp, r0
    movw lr, #0xfffd
    movt lr, #0xffff
    bx lr
    ",
    running = sym RUNNING_TASK,
    switch = sym pendsv_switch,
);
