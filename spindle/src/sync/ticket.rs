// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, MutexGuard};
use static_assertions::assert_impl_all;

use crate::sync::condition_variable::ConditionVariable;
use crate::sync::pool::{Loan, PoolPolicy, UnboundedPool};
use crate::{Task, schedule};

/// A synchronization primitive used to serially order execution.
///
/// Tickets are taken from a [`TicketQueue`]; the order in which they are
/// taken dictates the order in which they are *called*. The first ticket
/// taken from a queue is called immediately, the others wait until their
/// predecessor is finished.
///
/// [`Ticket::wait`] blocks until the ticket is called. [`Ticket::done`]
/// finishes the ticket and calls the next one. A ticket that is dropped
/// without `done` finishes implicitly, so its successor is still called.
///
/// ```no_run
/// let queue = spindle::TicketQueue::new();
/// for _ in 0..10 {
///     let ticket = queue.take();
///     spindle::schedule(move || {
///         // runs concurrently
///         ticket.wait();
///         // runs in take() order, never concurrently
///         ticket.done();
///     });
/// }
/// ```
#[derive(Clone)]
pub struct Ticket {
    record: Loan<Record>,
}

assert_impl_all!(Ticket: Send, Sync);

/// Hands out [`Ticket`]s.
#[derive(Clone)]
pub struct TicketQueue {
    shared: Arc<Shared>,
    pool: UnboundedPool<Record>,
}

/// State shared between all tickets of one queue.
struct Shared {
    /// Guards the list linkage and call state of every record in the
    /// queue, including the sentinel.
    mutex: Mutex<()>,
    /// List sentinel: `tail.links.prev` is the most recently taken record,
    /// and a record whose `next` points at the sentinel is last in line.
    tail: Record,
}

/// The pool-loaned state behind one ticket.
pub(crate) struct Record {
    is_called_cv: ConditionVariable,
    /// Back-reference to the owning queue; set when the record is taken.
    shared: Mutex<Option<Arc<Shared>>>,
    /// Linkage and call state; guarded by `Shared::mutex`.
    links: UnsafeCell<Links>,
    is_done: AtomicBool,
}

// Safety: `links` is only accessed with the owning queue's shared mutex
// held; the remaining fields are thread-safe on their own.
unsafe impl Send for Record {}
// Safety: as above.
unsafe impl Sync for Record {}

struct Links {
    /// Raw, non-owning list links. A record linked into the list always
    /// has a live loan (its ticket), and the implicit `done()` in the
    /// record's drop unlinks it before the pool slot is reused.
    next: *mut Record,
    prev: *mut Record,
    /// Composed callback to run when the ticket is called.
    on_call: Option<Task>,
    is_called: bool,
}

// === impl Ticket ===

impl Ticket {
    /// Blocks until the ticket is called.
    pub fn wait(&self) {
        let shared = self.record.queue();
        let mut guard = shared.mutex.lock();
        let record: &Record = &self.record;
        record.is_called_cv.wait(&mut guard, |_| {
            // Safety: the shared mutex is held; `pred` always runs under
            // the caller's lock.
            unsafe { (*record.links.get()).is_called }
        });
    }

    /// Finishes the ticket and calls the next taken ticket of the queue.
    pub fn done(&self) {
        self.record.done();
    }

    /// Registers `f` to be scheduled when this ticket is called. If the
    /// ticket was already called, `f` is scheduled immediately. Multiple
    /// callbacks compose in registration order.
    pub fn on_call<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = self.record.queue();
        let guard = shared.mutex.lock();
        // Safety: the shared mutex is held.
        let links = unsafe { &mut *self.record.links.get() };
        if links.is_called {
            drop(guard);
            schedule(f);
            return;
        }
        links.on_call = Some(match links.on_call.take() {
            Some(previous) => Box::new(move || {
                previous();
                f();
            }),
            None => Box::new(f),
        });
        drop(guard);
    }
}

// === impl TicketQueue ===

impl TicketQueue {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                mutex: Mutex::new(()),
                tail: Record::default(),
            }),
            pool: UnboundedPool::new(PoolPolicy::Reconstruct),
        }
    }

    /// Takes a single ticket from the queue.
    pub fn take(&self) -> Ticket {
        let mut out = None;
        self.take_n(1, |ticket| out = Some(ticket));
        out.expect("take_n(1) yields one ticket")
    }

    /// Takes `count` tickets from the queue, calling `f` with each one.
    ///
    /// The batch is attached to the queue atomically: tickets handed to
    /// `f` are called in exactly this order, with no foreign ticket
    /// interleaved.
    pub fn take_n<F>(&self, count: usize, mut f: F)
    where
        F: FnMut(Ticket),
    {
        if count == 0 {
            return;
        }

        let mut first: Option<Loan<Record>> = None;
        let mut last: Option<Loan<Record>> = None;
        self.pool.borrow_n(count, |record| {
            *record.shared.lock() = Some(Arc::clone(&self.shared));
            if let Some(previous) = &last {
                // Chain the batch up before publishing it; nothing else
                // can see these records yet.
                // Safety: both records are unpublished, there is no
                // concurrent access.
                unsafe {
                    (*(*record_ptr(previous)).links.get()).next = record_ptr(&record);
                    (*(*record_ptr(&record)).links.get()).prev = record_ptr(previous);
                }
            }
            if first.is_none() {
                first = Some(record.clone());
            }
            last = Some(record.clone());
            f(Ticket { record });
        });
        let first = first.expect("batch is non-empty");
        let last = last.expect("batch is non-empty");

        let tail_ptr = ptr::from_ref::<Record>(&self.shared.tail).cast_mut();
        // Safety: the batch is still unpublished.
        unsafe { (*(*record_ptr(&last)).links.get()).next = tail_ptr };

        let guard = self.shared.mutex.lock();
        let head_call = {
            let first_ptr = record_ptr(&first);
            // Safety: the shared mutex is held.
            unsafe {
                let tail_links = &mut *self.shared.tail.links.get();
                (*(*first_ptr).links.get()).prev = tail_links.prev;
                tail_links.prev = record_ptr(&last);
                let prev = (*(*first_ptr).links.get()).prev;
                if prev.is_null() {
                    true
                } else {
                    (*(*prev).links.get()).next = first_ptr;
                    false
                }
            }
        };
        if head_call {
            // The batch became the queue head; call the first ticket
            // synchronously.
            first.call_and_unlock(guard);
        }
    }
}

impl Default for TicketQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn record_ptr(record: &Record) -> *mut Record {
    ptr::from_ref::<Record>(record).cast_mut()
}

// === impl Record ===

impl Record {
    fn queue(&self) -> Arc<Shared> {
        self.shared
            .lock()
            .clone()
            .expect("ticket is not attached to a queue")
    }

    /// Marks the record finished; if it was the queue head, calls its
    /// successor.
    fn done(&self) {
        if self.is_done.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = self.queue();
        let guard = shared.mutex.lock();
        let call_next = {
            // Safety: the shared mutex is held.
            unsafe {
                let links = &mut *self.links.get();
                let call_next = if links.prev.is_null() && !links.next.is_null() {
                    links.next
                } else {
                    ptr::null_mut()
                };
                if !links.prev.is_null() {
                    (*(*links.prev).links.get()).next = links.next;
                }
                if !links.next.is_null() {
                    (*(*links.next).links.get()).prev = links.prev;
                }
                links.prev = ptr::null_mut();
                links.next = ptr::null_mut();
                call_next
            }
        };
        if !call_next.is_null() {
            // The lock must stay held while calling the successor: a
            // concurrent final drop of the successor's ticket blocks on
            // this mutex in done(), so the record cannot be reclaimed
            // from under us.
            // Safety: records in the list are alive (see Links); the
            // sentinel lives in Shared.
            unsafe { &*call_next }.call_and_unlock(guard);
        }
    }

    /// Transitions the record to called: wakes waiters and schedules the
    /// registered callback. Consumes the shared mutex guard.
    fn call_and_unlock(&self, guard: MutexGuard<'_, ()>) {
        let task = {
            // Safety: the shared mutex is held.
            let links = unsafe { &mut *self.links.get() };
            if links.is_called {
                return;
            }
            links.is_called = true;
            links.on_call.take()
        };
        self.is_called_cv.notify_all();
        drop(guard);
        if let Some(task) = task {
            schedule(task);
        }
    }
}

impl Default for Record {
    fn default() -> Self {
        Self {
            is_called_cv: ConditionVariable::new(),
            shared: Mutex::new(None),
            links: UnsafeCell::new(Links {
                next: ptr::null_mut(),
                prev: ptr::null_mut(),
                on_call: None,
                is_called: false,
            }),
            is_done: AtomicBool::new(false),
        }
    }
}

impl Drop for Record {
    fn drop(&mut self) {
        // A ticket dropped without done() finishes implicitly, so its
        // successor still gets called. Runs when the last loan returns the
        // record to its pool, before the slot is reused.
        if self.shared.get_mut().is_some() {
            self.done();
        }
    }
}
