// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A user-space cooperative task scheduler.
//!
//! `spindle` multiplexes an application's tasks over a bounded set of worker
//! threads using stack-switching fibers. Tasks are plain closures submitted
//! with [`schedule`]; when a task blocks on one of the fiber-aware
//! synchronization primitives ([`Event`], [`WaitGroup`],
//! [`ConditionVariable`], [`Ticket`], the pools in [`sync::pool`]), only its
//! fiber suspends — the worker thread underneath picks up other ready work
//! and keeps the CPU busy.
//!
//! # Binding
//!
//! A thread that wants to submit work first binds a [`Scheduler`] with
//! [`Scheduler::bind`], which installs a thread-local handle and lets the
//! thread itself participate in scheduling. Worker threads are spawned with
//! [`Scheduler::set_worker_thread_count`]; with a count of zero the
//! scheduler degrades to single-threaded mode where submitted tasks run
//! whenever the bound thread blocks or unbinds.
//!
//! ```no_run
//! let scheduler = spindle::Scheduler::new();
//! scheduler.set_worker_thread_count(4);
//! scheduler.bind();
//!
//! let wg = spindle::WaitGroup::new(10);
//! for _ in 0..10 {
//!     let wg = wg.clone();
//!     spindle::schedule(move || {
//!         // do work
//!         wg.done();
//!     });
//! }
//! wg.wait();
//!
//! spindle::Scheduler::unbind();
//! ```
//!
//! # Guarantees
//!
//! - Fibers are never preempted; they yield only inside the primitives'
//!   wait functions.
//! - A suspended fiber always resumes on the worker that was executing it,
//!   so per-worker state observed before a wait is still there after it.
//! - Primitive handles ([`Event`], [`WaitGroup`], [`Ticket`], loans) share
//!   their inner state across clones and are designed to be captured by
//!   value in scheduled tasks.

mod blocking_call;
mod fiber;
mod parallelize;
mod scheduler;
pub mod sync;
mod worker;

pub use blocking_call::blocking_call;
pub use fiber::Fiber;
// The lock types the wait APIs are expressed in terms of.
pub use parking_lot::{Mutex, MutexGuard};
pub use scheduler::{Scheduler, schedule};
pub use sync::condition_variable::ConditionVariable;
pub use sync::event::{Event, Mode as EventMode};
pub use sync::pool::{BoundedPool, Loan, PoolPolicy, UnboundedPool};
pub use sync::ticket::{Ticket, TicketQueue};
pub use sync::wait_group::WaitGroup;

/// A unit of work for the scheduler.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

#[cfg(test)]
mod test_util;
