// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;

use crate::Scheduler;

/// Runs `f` on a thread bound to a fresh scheduler with `num_workers`
/// worker threads, then tears the scheduler down again.
pub(crate) fn with_scheduler(num_workers: usize, f: impl FnOnce()) {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_names(true)
        .set_default();

    let scheduler = Scheduler::new();
    scheduler.set_worker_thread_count(num_workers);
    scheduler.bind();

    f();

    Scheduler::unbind();
    drop(scheduler);
}
