// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::thread;

use crate::WaitGroup;

/// Runs `f` on a dedicated OS thread and returns its result.
///
/// Scheduler fibers must not block their worker thread in long OS-level
/// calls (file I/O, pipes, foreign libraries); `blocking_call` moves the
/// call onto its own thread and suspends only the calling *fiber* until it
/// completes, so the worker keeps executing other tasks in the meantime.
///
/// Called outside a scheduler this degrades to running `f` on a helper
/// thread and blocking on it.
///
/// # Panics
///
/// Panics if `f` panics.
pub fn blocking_call<T, F>(f: F) -> T
where
    F: FnOnce() -> T + Send,
    T: Send,
{
    let wg = WaitGroup::new(1);
    thread::scope(|scope| {
        let handle = {
            let wg = wg.clone();
            scope.spawn(move || {
                let result = f();
                wg.done();
                result
            })
        };
        // Fiber-aware: the worker services other tasks while the call is
        // in flight. The scope's implicit join is immediate afterwards.
        wg.wait();
        handle.join().expect("blocking call panicked")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::with_scheduler;
    use crate::{WaitGroup, schedule};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn returns_the_closure_result() {
        assert_eq!(blocking_call(|| 6 * 7), 42);
    }

    #[test]
    fn worker_keeps_running_tasks_during_the_call() {
        with_scheduler(1, || {
            let progressed = Arc::new(AtomicUsize::new(0));
            let wg = WaitGroup::new(2);

            {
                let progressed = Arc::clone(&progressed);
                let wg = wg.clone();
                schedule(move || {
                    let observed = blocking_call(|| {
                        // Give the single worker a chance to pick up the
                        // other task while we are off-thread.
                        thread::sleep(Duration::from_millis(50));
                        progressed.load(Ordering::SeqCst)
                    });
                    assert_eq!(observed, 1, "the worker was blocked during the call");
                    wg.done();
                });
            }
            {
                let progressed = Arc::clone(&progressed);
                let wg = wg.clone();
                schedule(move || {
                    progressed.fetch_add(1, Ordering::SeqCst);
                    wg.done();
                });
            }

            wg.wait();
        });
    }
}
