//! Software timers.
//!
//! Active timers form a singly-linked list sorted by absolute expiry tick
//! (wrap-safe). The tick path pops expired timers and runs their callbacks
//! with the critical section released; auto-reload timers are advanced in
//! whole periods past the current tick before reinsertion, so a stalled
//! callback produces one catch-up invocation instead of a burst.
use crate::{
    arena, kernel,
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    port,
    utils::{
        time::{tick_before, tick_reached},
        Init,
    },
    Kind, Result, Tick,
};

/// Timer firing behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    /// Fire once, then deactivate.
    OneShot,
    /// Re-arm `period` ticks after each expiry.
    AutoReload,
}

/// A timer callback. Runs in the tick handler's interrupt context with the
/// critical section released; it must not call blocking APIs.
pub type TimerFn = fn(Timer, usize);

/// *Timer control block*.
pub struct TimerCb {
    pub(crate) name: CpuLockCell<Option<&'static str>>,
    pub(crate) period: CpuLockCell<Tick>,
    pub(crate) expiry: CpuLockCell<Tick>,
    pub(crate) mode: CpuLockCell<TimerMode>,
    pub(crate) callback: CpuLockCell<Option<TimerFn>>,
    pub(crate) param: CpuLockCell<usize>,
    pub(crate) active: CpuLockCell<bool>,
    pub(crate) next: CpuLockCell<Option<&'static TimerCb>>,
}

impl Init for TimerCb {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        name: CpuLockCell::new(None),
        period: CpuLockCell::new(0),
        expiry: CpuLockCell::new(0),
        mode: CpuLockCell::new(TimerMode::OneShot),
        callback: CpuLockCell::new(None),
        param: CpuLockCell::new(0),
        active: CpuLockCell::new(false),
        next: CpuLockCell::new(None),
    };
}

static ACTIVE_HEAD: CpuLockCell<Option<&'static TimerCb>> = CpuLockCell::new(None);

/// A handle to a software timer.
#[derive(Clone, Copy)]
pub struct Timer(&'static TimerCb);

impl core::fmt::Debug for Timer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("Timer").field(&(self.0 as *const _)).finish()
    }
}

impl Timer {
    /// Allocate a timer. It is created inactive; `start` arms it.
    pub fn create(
        name: Option<&'static str>,
        period: Tick,
        mode: TimerMode,
        callback: TimerFn,
        param: usize,
    ) -> Result<Timer> {
        if period == 0 {
            return Err(Kind::InvalidParam);
        }

        let mut guard = klock::lock_cpu();
        let cb = arena::alloc::<TimerCb>(guard.borrow_mut()).ok_or(Kind::NoMemory)?;
        cb.name.replace(&mut *guard, name);
        cb.period.replace(&mut *guard, period);
        cb.mode.replace(&mut *guard, mode);
        cb.callback.replace(&mut *guard, Some(callback));
        cb.param.replace(&mut *guard, param);
        drop(guard);

        log::info!(
            "timer created: '{}' (period={} ticks, {:?})",
            name.unwrap_or("unnamed"),
            period,
            mode
        );
        Ok(Timer(cb))
    }

    /// Arm the timer to expire one period from now. An already active
    /// timer is re-anchored.
    pub fn start(&self) -> Result {
        let t = self.0;
        let mut guard = klock::lock_cpu();

        if t.callback.get(&*guard).is_none() {
            return Err(Kind::InvalidState);
        }

        if t.active.get(&*guard) {
            detach(guard.borrow_mut(), t);
        }

        let now = kernel::tick_now(guard.borrow_mut());
        let period = t.period.get(&*guard);
        t.expiry.replace(&mut *guard, now.wrapping_add(period));
        t.active.replace(&mut *guard, true);
        insert_sorted(guard.borrow_mut(), t);
        Ok(())
    }

    /// Disarm the timer. A stopped timer keeps its period and can be
    /// started again.
    pub fn stop(&self) -> Result {
        let t = self.0;
        let mut guard = klock::lock_cpu();

        if t.active.get(&*guard) {
            detach(guard.borrow_mut(), t);
            t.active.replace(&mut *guard, false);
        }
        Ok(())
    }

    /// Change the period. An active timer is re-anchored to expire one new
    /// period from now.
    pub fn change_period(&self, period: Tick) -> Result {
        if period == 0 {
            return Err(Kind::InvalidParam);
        }

        let t = self.0;
        let mut guard = klock::lock_cpu();

        t.period.replace(&mut *guard, period);
        if t.active.get(&*guard) {
            detach(guard.borrow_mut(), t);
            let now = kernel::tick_now(guard.borrow_mut());
            t.expiry.replace(&mut *guard, now.wrapping_add(period));
            insert_sorted(guard.borrow_mut(), t);
        }
        Ok(())
    }

    /// Stop the timer and drop its callback. The control block itself is
    /// arena storage and is not reclaimed.
    pub fn delete(&self) -> Result {
        self.stop()?;
        let mut guard = klock::lock_cpu();
        self.0.callback.replace(&mut *guard, None);
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        let guard = klock::lock_cpu();
        self.0.active.get(&*guard)
    }

    pub fn name(&self) -> Option<&'static str> {
        let guard = klock::lock_cpu();
        self.0.name.get(&*guard)
    }

    #[cfg(test)]
    pub(crate) fn expiry_for_test(&self) -> Tick {
        let guard = klock::lock_cpu();
        self.0.expiry.get(&*guard)
    }
}

fn insert_sorted(mut lock: CpuLockTokenRefMut<'_>, timer: &'static TimerCb) {
    let expiry = timer.expiry.get(&*lock);

    let mut prev: Option<&'static TimerCb> = None;
    let mut cur = ACTIVE_HEAD.get(&*lock);
    while let Some(c) = cur {
        if tick_before(expiry, c.expiry.get(&*lock)) {
            break;
        }
        prev = Some(c);
        cur = c.next.get(&*lock);
    }

    timer.next.replace(&mut *lock, cur);
    match prev {
        Some(p) => {
            p.next.replace(&mut *lock, Some(timer));
        }
        None => {
            ACTIVE_HEAD.replace(&mut *lock, Some(timer));
        }
    }
}

fn detach(mut lock: CpuLockTokenRefMut<'_>, timer: &'static TimerCb) {
    let mut prev: Option<&'static TimerCb> = None;
    let mut cur = ACTIVE_HEAD.get(&*lock);
    while let Some(c) = cur {
        if core::ptr::eq(c, timer) {
            let next = timer.next.replace(&mut *lock, None);
            match prev {
                Some(p) => {
                    p.next.replace(&mut *lock, next);
                }
                None => {
                    ACTIVE_HEAD.replace(&mut *lock, next);
                }
            }
            return;
        }
        prev = Some(c);
        cur = c.next.get(&*lock);
    }
}

/// Run all expired timers. Called from the tick path with the ISR-variant
/// critical section held; `saved` is its saved mask, which is released
/// around each callback and returned re-acquired.
pub(crate) fn service(mut saved: u32) -> u32 {
    loop {
        let expired;
        {
            // Safety: the caller entered the ISR-variant critical section
            let mut token = unsafe { klock::assume_cpu_lock() };
            let mut lock = token.borrow_mut();

            let now = kernel::tick_now(lock.borrow_mut());
            let head = ACTIVE_HEAD.get(&*lock.borrow_mut());
            match head {
                Some(head) if tick_reached(now, head.expiry.get(&*lock.borrow_mut())) => {
                    // Detach before the callback runs; the sorted order
                    // makes the head the only candidate.
                    let next = head.next.replace(&mut *lock, None);
                    ACTIVE_HEAD.replace(&mut *lock, next);
                    expired = head;
                }
                _ => break,
            }
        }

        let (callback, param);
        {
            let mut token = unsafe { klock::assume_cpu_lock() };
            let lock = token.borrow_mut();
            callback = expired.callback.get(&*lock);
            param = expired.param.get(&*lock);
        }

        // Callbacks run with the critical section released.
        port::exit_critical_from_isr(saved);
        if let Some(callback) = callback {
            callback(Timer(expired), param);
        }
        saved = port::enter_critical_from_isr();

        {
            let mut token = unsafe { klock::assume_cpu_lock() };
            let mut lock = token.borrow_mut();

            let mode = expired.mode.get(&*lock.borrow_mut());
            match mode {
                TimerMode::AutoReload => {
                    // Advance in whole periods to the first expiry
                    // strictly after now: no drift, no re-fire storm.
                    let now = kernel::tick_now(lock.borrow_mut());
                    let period = expired.period.get(&*lock.borrow_mut());
                    let mut expiry = expired.expiry.get(&*lock.borrow_mut());
                    while tick_reached(now, expiry) {
                        expiry = expiry.wrapping_add(period);
                    }
                    expired.expiry.replace(&mut *lock, expiry);
                    insert_sorted(lock.borrow_mut(), expired);
                }
                TimerMode::OneShot => {
                    expired.active.replace(&mut *lock, false);
                }
            }
        }
    }

    saved
}

#[cfg(test)]
pub(crate) fn reset(mut lock: CpuLockTokenRefMut<'_>) {
    // Abandon any timers a previous test left armed; their control blocks
    // are arena storage that is never revisited.
    let mut cur = ACTIVE_HEAD.replace(&mut *lock, None);
    while let Some(t) = cur {
        cur = t.next.replace(&mut *lock, None);
        t.active.replace(&mut *lock, false);
    }
}
