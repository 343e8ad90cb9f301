// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use smallvec::SmallVec;

use crate::fiber::Fiber;

/// A synchronization primitive that blocks one or more fibers or threads
/// until another party modifies a shared variable (the condition) and
/// notifies the `ConditionVariable`.
///
/// Waiters on a thread with a bound scheduler suspend their fiber and let
/// the worker run other tasks until notified; waiters on other threads
/// fall back to an OS condition variable.
///
/// All `wait` flavors must be used with guards of one and the same mutex,
/// and the condition must only be mutated with that mutex held; a notify
/// that races with a concurrent wait is only guaranteed to be observed
/// under that discipline.
pub struct ConditionVariable {
    /// Fibers parked on this condition variable. A fiber appears at most
    /// once.
    waiting: Mutex<SmallVec<[Arc<Fiber>; 4]>>,
    /// Backing condition variable for waiters with no bound scheduler.
    condition: Condvar,
    /// Total number of waiters, used to short-circuit the notify paths.
    num_waiting: AtomicUsize,
    /// Number of waiters blocked on `condition` rather than on a fiber.
    num_waiting_on_condition: AtomicUsize,
}

// === impl ConditionVariable ===

impl ConditionVariable {
    pub fn new() -> Self {
        Self {
            waiting: Mutex::new(SmallVec::new()),
            condition: Condvar::new(),
            num_waiting: AtomicUsize::new(0),
            num_waiting_on_condition: AtomicUsize::new(0),
        }
    }

    /// Notifies and potentially unblocks one waiting fiber or thread.
    pub fn notify_one(&self) {
        if self.num_waiting.load(Ordering::SeqCst) == 0 {
            return;
        }
        let fiber = self.waiting.lock().pop();
        if let Some(fiber) = fiber {
            fiber.notify();
        }
        if self.num_waiting_on_condition.load(Ordering::SeqCst) > 0 {
            self.condition.notify_one();
        }
    }

    /// Notifies and potentially unblocks all waiting fibers and threads.
    pub fn notify_all(&self) {
        if self.num_waiting.load(Ordering::SeqCst) == 0 {
            return;
        }
        let fibers = std::mem::take(&mut *self.waiting.lock());
        for fiber in fibers {
            fiber.notify();
        }
        if self.num_waiting_on_condition.load(Ordering::SeqCst) > 0 {
            self.condition.notify_all();
        }
    }

    /// Blocks the current fiber or thread until `pred` is satisfied and
    /// the condition variable is notified.
    pub fn wait<T, F>(&self, guard: &mut MutexGuard<'_, T>, pred: F)
    where
        F: FnMut(&mut T) -> bool,
    {
        self.wait_inner(guard, None, pred);
    }

    /// Like [`wait`](ConditionVariable::wait), but gives up after
    /// `timeout`. Returns whether `pred` held when the wait ended.
    pub fn wait_for<T, F>(&self, guard: &mut MutexGuard<'_, T>, timeout: Duration, pred: F) -> bool
    where
        F: FnMut(&mut T) -> bool,
    {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.wait_inner(guard, Some(deadline), pred),
            // Too far in the future to represent; an untimed wait is
            // indistinguishable.
            None => {
                self.wait_inner(guard, None, pred);
                true
            }
        }
    }

    /// Like [`wait`](ConditionVariable::wait), but gives up at `deadline`.
    /// Returns whether `pred` held when the wait ended.
    pub fn wait_until<T, F>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        deadline: Instant,
        pred: F,
    ) -> bool
    where
        F: FnMut(&mut T) -> bool,
    {
        self.wait_inner(guard, Some(deadline), pred)
    }

    fn wait_inner<T, F>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        deadline: Option<Instant>,
        mut pred: F,
    ) -> bool
    where
        F: FnMut(&mut T) -> bool,
    {
        if pred(&mut **guard) {
            return true;
        }
        self.num_waiting.fetch_add(1, Ordering::SeqCst);

        // `pred` is known false here and `guard` stays held up to the
        // suspension, so each pass checks the deadline first and evaluates
        // `pred` exactly once, after the wake-up. An already-expired
        // deadline returns without re-evaluating it.
        let result = if let Some(fiber) = Fiber::current() {
            // Currently executing on a scheduler fiber. Park so other
            // tasks can run and unblock this one; re-registration happens
            // on every pass so a timed-out fiber never lingers in the
            // waiting list.
            loop {
                if let Some(deadline) = deadline
                    && Instant::now() >= deadline
                {
                    break false;
                }
                self.waiting.lock().push(Arc::clone(&fiber));
                fiber.park(guard, deadline);
                {
                    let mut waiting = self.waiting.lock();
                    if let Some(idx) = waiting.iter().position(|f| Arc::ptr_eq(f, &fiber)) {
                        waiting.remove(idx);
                    }
                }
                if pred(&mut **guard) {
                    break true;
                }
            }
        } else {
            // Currently running outside the scheduler; delegate to the OS
            // condition variable.
            self.num_waiting_on_condition.fetch_add(1, Ordering::SeqCst);
            let result = loop {
                match deadline {
                    Some(deadline) => {
                        if Instant::now() >= deadline {
                            break false;
                        }
                        let _ = self.condition.wait_until(guard, deadline);
                    }
                    None => self.condition.wait(guard),
                }
                if pred(&mut **guard) {
                    break true;
                }
            };
            self.num_waiting_on_condition.fetch_sub(1, Ordering::SeqCst);
            result
        };

        self.num_waiting.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl Default for ConditionVariable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::with_scheduler;
    use crate::{WaitGroup, schedule};
    use std::thread;

    #[test]
    fn wait_returns_immediately_when_pred_holds() {
        let cv = ConditionVariable::new();
        let mutex = Mutex::new(true);
        let mut guard = mutex.lock();
        cv.wait(&mut guard, |ready| *ready);
    }

    #[test]
    fn threads_without_scheduler_use_os_condvar() {
        let state = Arc::new((Mutex::new(false), ConditionVariable::new()));

        let waiter = {
            let state = Arc::clone(&state);
            thread::spawn(move || {
                let (mutex, cv) = &*state;
                let mut guard = mutex.lock();
                cv.wait(&mut guard, |ready| *ready);
            })
        };

        {
            let (mutex, cv) = &*state;
            *mutex.lock() = true;
            cv.notify_one();
        }
        waiter.join().unwrap();
    }

    #[test]
    fn fibers_wait_and_are_notified() {
        with_scheduler(2, || {
            let state = Arc::new((Mutex::new(false), ConditionVariable::new()));
            let wg = WaitGroup::new(1);

            {
                let state = Arc::clone(&state);
                let wg = wg.clone();
                schedule(move || {
                    let (mutex, cv) = &*state;
                    let mut guard = mutex.lock();
                    cv.wait(&mut guard, |ready| *ready);
                    drop(guard);
                    wg.done();
                });
            }

            {
                let state = Arc::clone(&state);
                schedule(move || {
                    let (mutex, cv) = &*state;
                    *mutex.lock() = true;
                    cv.notify_one();
                });
            }

            wg.wait();
        });
    }

    #[test]
    fn timed_wait_does_not_miss_notification() {
        // A waiter with a long deadline must return promptly (and with
        // `true`) when the condition is set shortly after it suspends.
        with_scheduler(2, || {
            let state = Arc::new((Mutex::new(false), ConditionVariable::new()));
            let wg = WaitGroup::new(1);

            {
                let state = Arc::clone(&state);
                let wg = wg.clone();
                schedule(move || {
                    let (mutex, cv) = &*state;
                    let mut guard = mutex.lock();
                    let result =
                        cv.wait_for(&mut guard, Duration::from_secs(10), |ready| *ready);
                    assert!(result, "the wait timed out instead of being notified");
                    drop(guard);
                    wg.done();
                });
            }

            {
                let state = Arc::clone(&state);
                schedule(move || {
                    thread::sleep(Duration::from_millis(10));
                    let (mutex, cv) = &*state;
                    *mutex.lock() = true;
                    cv.notify_one();
                });
            }

            let start = Instant::now();
            wg.wait();
            assert!(start.elapsed() < Duration::from_secs(5));
        });
    }

    #[test]
    fn timed_wait_times_out() {
        with_scheduler(1, || {
            let wg = WaitGroup::new(1);
            {
                let wg = wg.clone();
                schedule(move || {
                    let mutex = Mutex::new(());
                    let cv = ConditionVariable::new();
                    let mut guard = mutex.lock();
                    let start = Instant::now();
                    let result = cv.wait_for(&mut guard, Duration::from_millis(20), |_| false);
                    assert!(!result);
                    assert!(start.elapsed() >= Duration::from_millis(20));
                    drop(guard);
                    wg.done();
                });
            }
            wg.wait();
        });
    }

    #[test]
    fn zero_timeout_evaluates_pred_once() {
        with_scheduler(1, || {
            let wg = WaitGroup::new(1);
            {
                let wg = wg.clone();
                schedule(move || {
                    let mutex = Mutex::new(0u32);
                    let cv = ConditionVariable::new();
                    let mut guard = mutex.lock();
                    let result = cv.wait_for(&mut guard, Duration::ZERO, |calls| {
                        *calls += 1;
                        false
                    });
                    assert!(!result);
                    assert_eq!(*guard, 1);
                    drop(guard);
                    wg.done();
                });
            }
            wg.wait();
        });
    }

    #[test]
    fn notify_all_wakes_every_waiter() {
        with_scheduler(4, || {
            const WAITERS: usize = 8;
            let state = Arc::new((Mutex::new(false), ConditionVariable::new()));
            let wg = WaitGroup::new(WAITERS);

            for _ in 0..WAITERS {
                let state = Arc::clone(&state);
                let wg = wg.clone();
                schedule(move || {
                    let (mutex, cv) = &*state;
                    let mut guard = mutex.lock();
                    cv.wait(&mut guard, |ready| *ready);
                    drop(guard);
                    wg.done();
                });
            }

            {
                let state = Arc::clone(&state);
                schedule(move || {
                    thread::sleep(Duration::from_millis(5));
                    let (mutex, cv) = &*state;
                    *mutex.lock() = true;
                    cv.notify_all();
                });
            }

            wg.wait();
        });
    }
}
