// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use static_assertions::assert_impl_all;

use crate::sync::condition_variable::ConditionVariable;

/// A counter that can be incremented, decremented, and waited on until it
/// reaches zero.
///
/// The simplest way to wait for a number of concurrently executing tasks
/// to complete. `WaitGroup` is a cheap handle sharing its counter across
/// clones; it is meant to be captured by value in scheduled tasks.
#[derive(Clone)]
pub struct WaitGroup {
    data: Arc<Data>,
}

assert_impl_all!(WaitGroup: Send, Sync);

struct Data {
    count: AtomicUsize,
    mutex: Mutex<()>,
    condition: ConditionVariable,
}

// === impl WaitGroup ===

impl WaitGroup {
    /// Constructs the wait group with the given initial count.
    pub fn new(initial_count: usize) -> Self {
        Self {
            data: Arc::new(Data {
                count: AtomicUsize::new(initial_count),
                mutex: Mutex::new(()),
                condition: ConditionVariable::new(),
            }),
        }
    }

    /// Increments the counter by `count`.
    pub fn add(&self, count: usize) {
        self.data.count.fetch_add(count, Ordering::SeqCst);
    }

    /// Decrements the counter by one; returns whether the counter reached
    /// zero.
    ///
    /// The counter must be greater than zero; debug builds assert on
    /// underflow.
    pub fn done(&self) -> bool {
        let previous = self.data.count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "WaitGroup::done() called too many times");
        if previous == 1 {
            let _guard = self.data.mutex.lock();
            self.data.condition.notify_all();
            true
        } else {
            false
        }
    }

    /// Blocks until the counter reaches zero. Any number of fibers and
    /// threads may wait concurrently.
    pub fn wait(&self) {
        let mut guard = self.data.mutex.lock();
        let count = &self.data.count;
        self.data
            .condition
            .wait(&mut guard, |_| count.load(Ordering::SeqCst) == 0);
    }
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::with_scheduler;
    use crate::schedule;

    #[test]
    fn zero_count_wait_returns_immediately() {
        let wg = WaitGroup::default();
        wg.wait();
    }

    #[test]
    fn done_reports_reaching_zero() {
        let wg = WaitGroup::new(2);
        assert!(!wg.done());
        assert!(wg.done());
    }

    #[test]
    fn parallel_dones_release_the_waiter() {
        with_scheduler(4, || {
            const TASKS: usize = 64;
            let wg = WaitGroup::new(TASKS);
            let counter = Arc::new(AtomicUsize::new(0));

            for _ in 0..TASKS {
                let wg = wg.clone();
                let counter = Arc::clone(&counter);
                schedule(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    wg.done();
                });
            }

            wg.wait();
            assert_eq!(counter.load(Ordering::SeqCst), TASKS);
            assert_eq!(wg.data.count.load(Ordering::SeqCst), 0);
        });
    }

    #[test]
    fn add_extends_an_in_flight_group() {
        with_scheduler(2, || {
            let wg = WaitGroup::new(1);
            {
                let wg = wg.clone();
                schedule(move || {
                    // The first task fans out another before finishing.
                    wg.add(1);
                    {
                        let wg = wg.clone();
                        schedule(move || {
                            wg.done();
                        });
                    }
                    wg.done();
                });
            }
            wg.wait();
        });
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "done() called too many times")]
    fn done_underflow_asserts() {
        let wg = WaitGroup::default();
        wg.done();
    }
}
