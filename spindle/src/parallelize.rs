// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

/// Runs the given closures concurrently and blocks until all of them have
/// completed.
///
/// The first closure runs inline on the caller; the rest are scheduled as
/// tasks, so a scheduler must be bound to the current thread and the
/// scheduled closures must be `Send + 'static` (capture shared state by
/// value, as with any scheduled task).
///
/// ```no_run
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// static HITS: AtomicUsize = AtomicUsize::new(0);
///
/// spindle::parallelize!(
///     || { HITS.fetch_add(1, Ordering::SeqCst); },
///     || { HITS.fetch_add(1, Ordering::SeqCst); },
///     || { HITS.fetch_add(1, Ordering::SeqCst); },
/// );
/// ```
#[macro_export]
macro_rules! parallelize {
    ($first:expr $(, $rest:expr)* $(,)?) => {{
        let __wg = $crate::WaitGroup::default();
        $(
            __wg.add(1);
            $crate::schedule({
                let __wg = ::core::clone::Clone::clone(&__wg);
                let __task = $rest;
                move || {
                    __task();
                    __wg.done();
                }
            });
        )*
        ($first)();
        __wg.wait();
    }};
}

#[cfg(test)]
mod tests {
    use crate::test_util::with_scheduler;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_every_closure_to_completion() {
        with_scheduler(4, || {
            let hits = Arc::new(AtomicUsize::new(0));
            let (a, b, c) = (Arc::clone(&hits), Arc::clone(&hits), Arc::clone(&hits));
            crate::parallelize!(
                move || {
                    a.fetch_add(1, Ordering::SeqCst);
                },
                move || {
                    b.fetch_add(1, Ordering::SeqCst);
                },
                move || {
                    c.fetch_add(1, Ordering::SeqCst);
                },
            );
            assert_eq!(hits.load(Ordering::SeqCst), 3);
        });
    }

    #[test]
    fn single_closure_runs_inline() {
        with_scheduler(1, || {
            let mut ran = false;
            crate::parallelize!(|| ran = true);
            assert!(ran);
        });
    }
}
