//! Kernel-level scenario tests: whole call paths through the public API,
//! driven on the hosted port (which delivers ticks while a task would be
//! off the processor, so delays and timed waits complete with exact tick
//! accounting).
use crate::{
    kernel, klock, port, sched, task,
    task::{Task, TaskSt},
    test_support, KernelSt, Kind, Mutex, MAX_WAIT, NO_WAIT, Queue, Semaphore, Timer, TimerMode,
};

fn nop(_: usize) {}

#[test]
fn init_creates_idle_task_and_becomes_ready() {
    test_support::run(|| {
        assert_eq!(kernel::state(), KernelSt::Inactive);
        kernel::init().unwrap();
        assert_eq!(kernel::state(), KernelSt::Ready);

        let idle = Task::by_name("idle").unwrap();
        assert_eq!(idle.base_priority(), crate::cfg::IDLE_PRIORITY);
        assert_eq!(idle.state(), TaskSt::Ready);

        // The idle task is the only ready task so far.
        assert_eq!(sched::stats().unwrap().ready, 1);
    });
}

#[test]
fn double_init_is_rejected() {
    test_support::run(|| {
        kernel::init().unwrap();
        assert_eq!(kernel::init().unwrap_err(), Kind::InvalidState);
    });
}

#[test]
fn start_requires_init() {
    test_support::run(|| {
        assert_eq!(kernel::start().unwrap_err(), Kind::InvalidState);
    });
}

#[test]
fn delay_ticks_blocks_for_exactly_n_ticks() {
    test_support::run(|| {
        kernel::init().unwrap();
        let a = Task::create(nop, Some("a"), 0, 0, 3).unwrap();
        test_support::make_current(a.cb());

        let before = kernel::tick_count();
        kernel::delay_ticks(5);
        assert_eq!(kernel::tick_count() - before, 5);

        // The task came back as the running task; the idle task that
        // filled in went back to Ready.
        assert_eq!(a.state(), TaskSt::Running);
        assert_eq!(Task::by_name("idle").unwrap().state(), TaskSt::Ready);
    });
}

#[test]
fn delay_zero_is_a_no_op() {
    test_support::run(|| {
        kernel::init().unwrap();
        let a = Task::create(nop, None, 0, 0, 3).unwrap();
        test_support::make_current(a.cb());

        let before = kernel::tick_count();
        kernel::delay_ticks(0);
        assert_eq!(kernel::tick_count(), before);
        assert_eq!(a.state(), TaskSt::Running);
    });
}

#[test]
fn delay_ms_rounds_up_to_whole_ticks() {
    test_support::run(|| {
        kernel::init().unwrap();
        let a = Task::create(nop, None, 0, 0, 3).unwrap();
        test_support::make_current(a.cb());

        // At 1000 ticks/s, 1 ms is one tick; 0 ms still delays the
        // minimum of one tick; 2.5 ticks' worth rounds up to 3.
        let before = kernel::tick_count();
        kernel::delay_ms(1);
        assert_eq!(kernel::tick_count() - before, 1);

        let before = kernel::tick_count();
        kernel::delay_ms(0);
        assert_eq!(kernel::tick_count() - before, 1);

        let before = kernel::tick_count();
        kernel::delay_ms(3);
        assert_eq!(kernel::tick_count() - before, 3);
    });
}

#[test]
fn delay_completes_across_tick_wrap() {
    test_support::run(|| {
        kernel::init().unwrap();
        let a = Task::create(nop, None, 0, 0, 3).unwrap();
        test_support::make_current(a.cb());

        {
            let mut guard = klock::lock_cpu();
            kernel::set_tick(guard.borrow_mut(), u32::MAX - 3);
        }

        kernel::delay_ticks(10);

        // The wake tick wrapped past zero and still fired on time.
        assert_eq!(kernel::tick_count(), 6);
        assert_eq!(a.state(), TaskSt::Running);
    });
}

#[test]
fn mutex_lock_times_out_after_requested_ticks() {
    test_support::run(|| {
        kernel::init().unwrap();
        let holder = Task::create(nop, Some("holder"), 0, 0, 1).unwrap();
        let waiter = Task::create(nop, Some("waiter"), 0, 0, 2).unwrap();
        let m = Mutex::create().unwrap();

        test_support::make_current(holder.cb());
        m.lock(NO_WAIT).unwrap();

        test_support::make_current(waiter.cb());
        let before = kernel::tick_count();
        assert_eq!(m.lock(100).unwrap_err(), Kind::Timeout);
        assert_eq!(kernel::tick_count() - before, 100);

        // The waiter is running again and no longer queued on the mutex.
        assert_eq!(waiter.state(), TaskSt::Running);
        assert_eq!(m.owner().unwrap(), holder);
        let mut guard = klock::lock_cpu();
        assert!(!m.cb().waiters.contains(guard.borrow_mut(), waiter.cb()));
    });
}

#[test]
fn queue_send_times_out_when_full() {
    test_support::run(|| {
        kernel::init().unwrap();
        let a = Task::create(nop, None, 0, 0, 2).unwrap();
        test_support::make_current(a.cb());

        let q = Queue::create(2, 4).unwrap();
        q.send(&[1, 1, 1, 1], NO_WAIT).unwrap();
        q.send(&[2, 2, 2, 2], NO_WAIT).unwrap();
        assert!(q.is_full());

        let before = kernel::tick_count();
        assert_eq!(q.send(&[3, 3, 3, 3], 100).unwrap_err(), Kind::Timeout);
        assert_eq!(kernel::tick_count() - before, 100);

        assert_eq!(a.state(), TaskSt::Running);
        let mut guard = klock::lock_cpu();
        assert!(q.cb().senders.is_empty(guard.borrow_mut()));
    });
}

#[test]
fn semaphore_wait_times_out() {
    test_support::run(|| {
        kernel::init().unwrap();
        let a = Task::create(nop, None, 0, 0, 2).unwrap();
        test_support::make_current(a.cb());

        let s = Semaphore::create(0, 1).unwrap();
        let before = kernel::tick_count();
        assert_eq!(s.wait(50).unwrap_err(), Kind::Timeout);
        assert_eq!(kernel::tick_count() - before, 50);
        assert_eq!(a.state(), TaskSt::Running);
    });
}

#[test]
fn waking_a_higher_priority_task_requests_preemption() {
    test_support::run(|| {
        kernel::init().unwrap();
        let low = Task::create(nop, Some("low"), 0, 0, 1).unwrap();
        let high = Task::create(nop, Some("high"), 0, 0, 3).unwrap();

        // Park the high-priority task, then run the low one.
        test_support::make_current(high.cb());
        {
            let mut guard = klock::lock_cpu();
            task::set_state(guard.borrow_mut(), high.cb(), TaskSt::Blocked).unwrap();
        }
        test_support::make_current(low.cb());
        assert!(!port::switch_pending());

        // Unblocking the high task must pend a context switch...
        {
            let mut guard = klock::lock_cpu();
            kernel::task_unblock(guard.borrow_mut(), high.cb());
        }
        assert_eq!(high.state(), TaskSt::Ready);
        assert!(port::switch_pending());

        // ...and the switch installs it, demoting the low task to Ready.
        kernel::switch_context();
        assert_eq!(high.state(), TaskSt::Running);
        assert_eq!(low.state(), TaskSt::Ready);
        assert_eq!(Task::current().unwrap(), high);
    });
}

#[test]
fn waking_a_lower_priority_task_does_not_preempt() {
    test_support::run(|| {
        kernel::init().unwrap();
        let low = Task::create(nop, None, 0, 0, 1).unwrap();
        let high = Task::create(nop, None, 0, 0, 3).unwrap();

        test_support::make_current(low.cb());
        {
            let mut guard = klock::lock_cpu();
            task::set_state(guard.borrow_mut(), low.cb(), TaskSt::Blocked).unwrap();
        }
        test_support::make_current(high.cb());
        {
            let mut guard = klock::lock_cpu();
            kernel::task_unblock(guard.borrow_mut(), low.cb());
        }
        assert_eq!(low.state(), TaskSt::Ready);
        assert!(!port::switch_pending());
    });
}

#[test]
fn blocked_task_with_infinite_timeout_stays_off_the_delayed_list() {
    test_support::run(|| {
        kernel::init().unwrap();
        let holder = Task::create(nop, None, 0, 0, 1).unwrap();
        let waiter = Task::create(nop, None, 0, 0, 2).unwrap();
        let m = Mutex::create().unwrap();

        test_support::make_current(holder.cb());
        m.lock(NO_WAIT).unwrap();

        // Enqueue the waiter for an unbounded wait by hand (a real
        // MAX_WAIT lock would never return without an unlocker).
        test_support::make_current(waiter.cb());
        {
            let mut guard = klock::lock_cpu();
            crate::mutex::enqueue_waiter(guard.borrow_mut(), m.cb(), waiter.cb());
            task::set_state(guard.borrow_mut(), waiter.cb(), TaskSt::Blocked).unwrap();
        }

        // Ticks pass; nothing wakes the waiter.
        for _ in 0..50 {
            kernel::tick_handler();
        }
        assert_eq!(waiter.state(), TaskSt::Blocked);
        assert_eq!(sched::stats().unwrap().delayed, 0);

        // The unlock hands the mutex over and the waiter becomes Ready.
        test_support::make_current(holder.cb());
        m.unlock().unwrap();
        assert_eq!(waiter.state(), TaskSt::Ready);
        assert_eq!(m.owner().unwrap(), waiter);
    });
}

#[test]
fn suspended_task_resumed_by_timer_callback() {
    test_support::run(|| {
        kernel::init().unwrap();
        let a = Task::create(nop, Some("sleeper"), 0, 0, 2).unwrap();
        test_support::make_current(a.cb());

        fn resume_cb(_t: Timer, param: usize) {
            let task = Task::by_id(param as u8).unwrap();
            task.resume().unwrap();
        }

        let t = Timer::create(
            Some("wakeup"),
            10,
            TimerMode::OneShot,
            resume_cb,
            a.id() as usize,
        )
        .unwrap();
        t.start().unwrap();

        let before = kernel::tick_count();
        a.suspend().unwrap();

        // The suspend call returned because the timer callback resumed
        // the task ten ticks later.
        assert_eq!(kernel::tick_count() - before, 10);
        assert_eq!(a.state(), TaskSt::Running);
        assert!(!t.is_active());
    });
}

#[test]
fn mutex_handoff_wakes_waiter_with_priority_intact() {
    test_support::run(|| {
        kernel::init().unwrap();
        let low = Task::create(nop, None, 0, 0, 1).unwrap();
        let high = Task::create(nop, None, 0, 0, 3).unwrap();
        let m = Mutex::create().unwrap();

        test_support::make_current(low.cb());
        m.lock(MAX_WAIT).unwrap();

        test_support::make_current(high.cb());
        {
            let mut guard = klock::lock_cpu();
            crate::mutex::enqueue_waiter(guard.borrow_mut(), m.cb(), high.cb());
            task::set_state(guard.borrow_mut(), high.cb(), TaskSt::Blocked).unwrap();
        }
        assert_eq!(low.priority(), 3);

        test_support::make_current(low.cb());
        m.unlock().unwrap();

        // Boost shed, ownership handed off, waiter runnable, and the
        // hand-off pended a switch (the waiter outranks the unlocker).
        assert_eq!(low.priority(), 1);
        assert_eq!(m.owner().unwrap(), high);
        assert_eq!(high.state(), TaskSt::Ready);
        assert!(port::switch_pending());
    });
}

#[test]
fn stats_track_ready_and_delayed_membership() {
    test_support::run(|| {
        kernel::init().unwrap();
        let a = Task::create(nop, None, 0, 0, 2).unwrap();
        let b = Task::create(nop, None, 0, 0, 3).unwrap();

        // idle + a + b
        assert_eq!(sched::stats().unwrap().ready, 3);

        test_support::make_current(b.cb());
        assert_eq!(sched::stats().unwrap().ready, 2);

        {
            let mut guard = klock::lock_cpu();
            task::set_state(guard.borrow_mut(), b.cb(), TaskSt::Blocked).unwrap();
            sched::delayed_push(guard.borrow_mut(), b.cb(), 100);
        }
        let stats = sched::stats().unwrap();
        assert_eq!(stats.ready, 2); // idle + a
        assert_eq!(stats.delayed, 1);

        let _ = a;
    });
}
