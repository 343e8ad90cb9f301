// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use parking_lot::{Mutex, RwLock};
use static_assertions::assert_impl_all;

use crate::Task;
use crate::worker::{Mode, Worker};

/// Maximum number of worker threads.
const MAX_WORKER_THREADS: usize = 256;

/// Size of the ring of recently-spinning worker ids.
const SPINNING_WORKERS: usize = 8;

/// Identifier used for the single-threaded workers backing bound threads.
const SINGLE_THREADED_WORKER_ID: u32 = u32::MAX;

type ThreadInitializer = Arc<dyn Fn() + Send + Sync + 'static>;

thread_local! {
    /// The scheduler bound to the current thread. Held weakly so that
    /// worker threads do not keep their own scheduler alive.
    static BOUND: RefCell<Option<Weak<SchedulerCore>>> = const { RefCell::new(None) };
    /// The worker servicing the current thread (or fiber stack).
    static CURRENT_WORKER: RefCell<Option<Arc<Worker>>> = const { RefCell::new(None) };
}

/// Asynchronously processes [`Task`]s.
///
/// A scheduler is bound to a thread with [`Scheduler::bind`]; once bound,
/// the thread can call [`schedule`] to enqueue tasks for asynchronous
/// execution. Schedulers are initially in single-threaded mode; call
/// [`Scheduler::set_worker_thread_count`] to spawn dedicated worker
/// threads.
///
/// `Scheduler` is a cheap handle; clones share the same state. Dropping
/// the last handle stops and joins all worker threads, after every bound
/// thread has unbound itself.
#[derive(Clone)]
pub struct Scheduler {
    core: Arc<SchedulerCore>,
}

assert_impl_all!(Scheduler: Send, Sync);

pub(crate) struct SchedulerCore {
    thread_init: Mutex<Option<ThreadInitializer>>,

    /// Ring of worker ids that recently began spinning for work. `enqueue`
    /// prefers these workers to keep them from going back to sleep. A slot
    /// holds -1 when empty.
    spinning_workers: [AtomicI64; SPINNING_WORKERS],
    next_spinning_worker_idx: AtomicUsize,

    next_enqueue_index: AtomicUsize,
    num_worker_threads: AtomicUsize,
    /// Written only while no tasks are in flight (see
    /// [`Scheduler::set_worker_thread_count`]); read concurrently by
    /// `enqueue` and the steal path.
    worker_threads: RwLock<Vec<Arc<Worker>>>,

    single_threaded_workers: Mutex<HashMap<ThreadId, Arc<Worker>>>,

    /// Tracks whether tasks have been enqueued since the last worker count
    /// change; guards the resize contract in debug builds.
    tasks_since_resize: AtomicBool,
}

/// Schedules `f` to be asynchronously called using the scheduler bound to
/// the current thread.
///
/// # Panics
///
/// Panics if no scheduler is bound to the current thread. If the bound
/// scheduler is already shutting down the task is silently dropped; only
/// tasks enqueued before shutdown are guaranteed to execute.
pub fn schedule<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    BOUND.with(|bound| {
        let bound = bound.borrow();
        let weak = bound
            .as_ref()
            .expect("schedule() requires a scheduler bound to the current thread");
        if let Some(core) = weak.upgrade() {
            core.enqueue(Box::new(f));
        }
    });
}

// === impl Scheduler ===

impl Scheduler {
    pub fn new() -> Self {
        Self {
            core: Arc::new(SchedulerCore {
                thread_init: Mutex::new(None),
                spinning_workers: [const { AtomicI64::new(-1) }; SPINNING_WORKERS],
                next_spinning_worker_idx: AtomicUsize::new(0x8000_0000),
                next_enqueue_index: AtomicUsize::new(0),
                num_worker_threads: AtomicUsize::new(0),
                worker_threads: RwLock::new(Vec::new()),
                single_threaded_workers: Mutex::new(HashMap::new()),
                tasks_since_resize: AtomicBool::new(false),
            }),
        }
    }

    /// Returns the scheduler bound to the current thread, if any.
    pub fn get() -> Option<Scheduler> {
        BOUND.with(|bound| {
            let core = bound.borrow().as_ref()?.upgrade()?;
            Some(Scheduler { core })
        })
    }

    /// Binds this scheduler to the current thread.
    ///
    /// Also creates the single-threaded worker that services this thread:
    /// on a bound thread, blocking on a primitive pumps pending tasks
    /// instead of sleeping.
    ///
    /// # Panics
    ///
    /// Panics if a scheduler is already bound to the current thread.
    pub fn bind(&self) {
        BOUND.with(|bound| {
            let mut bound = bound.borrow_mut();
            assert!(
                bound.is_none(),
                "a scheduler is already bound to this thread"
            );
            *bound = Some(Arc::downgrade(&self.core));
        });
        let worker = Worker::new(&self.core, Mode::SingleThreaded, SINGLE_THREADED_WORKER_ID);
        worker.start();
        self.core
            .single_threaded_workers
            .lock()
            .insert(thread::current().id(), worker);
    }

    /// Unbinds the scheduler currently bound to the current thread,
    /// flushing any tasks still enqueued on this thread's single-threaded
    /// worker first.
    ///
    /// # Panics
    ///
    /// Panics if no scheduler is bound to the current thread.
    pub fn unbind() {
        let core = BOUND
            .with(|bound| bound.borrow().clone())
            .expect("no scheduler bound to this thread")
            .upgrade()
            .expect("the bound scheduler was dropped while still bound");
        let worker = core
            .single_threaded_workers
            .lock()
            .remove(&thread::current().id())
            .expect("single-threaded worker not found");
        worker.flush();
        worker.stop();
        BOUND.with(|bound| bound.borrow_mut().take());
    }

    /// Adjusts the number of dedicated worker threads.
    ///
    /// A count of 0 puts the scheduler into single-threaded mode. Counts
    /// above the maximum of 256 are clamped with a warning.
    ///
    /// The count cannot be changed to a non-zero value once tasks have
    /// been enqueued; debug builds assert on this.
    pub fn set_worker_thread_count(&self, count: usize) {
        self.core.set_worker_thread_count(count);
    }

    /// Returns the number of worker threads.
    pub fn worker_thread_count(&self) -> usize {
        self.core.num_worker_threads.load(Ordering::SeqCst)
    }

    /// Sets the worker thread initializer, called once on each thread a
    /// worker spawns (including the carrier threads backing fibers) before
    /// it starts executing tasks.
    ///
    /// Only newly created threads run the initializer; call this before
    /// [`set_worker_thread_count`](Scheduler::set_worker_thread_count).
    pub fn set_thread_initializer<F>(&self, init: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.core.thread_init.lock() = Some(Arc::new(init));
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

// === impl SchedulerCore ===

impl SchedulerCore {
    pub(crate) fn thread_initializer(&self) -> Option<ThreadInitializer> {
        self.thread_init.lock().clone()
    }

    /// Queues the task for asynchronous execution.
    fn enqueue(&self, task: Task) {
        self.tasks_since_resize.store(true, Ordering::Relaxed);
        let num = self.num_worker_threads.load(Ordering::SeqCst);
        if num > 0 {
            loop {
                // Prioritize workers that have recently started spinning.
                let ring_idx = self
                    .next_spinning_worker_idx
                    .fetch_sub(1, Ordering::Relaxed)
                    .wrapping_sub(1)
                    % SPINNING_WORKERS;
                let spinning = self.spinning_workers[ring_idx].swap(-1, Ordering::Relaxed);

                // If no spinning worker could be claimed, round-robin.
                let idx = usize::try_from(spinning).unwrap_or_else(|_| {
                    self.next_enqueue_index.fetch_add(1, Ordering::Relaxed) % num
                });

                let workers = self.worker_threads.read();
                if let Some(worker) = workers.get(idx)
                    && let Some(guard) = worker.try_lock_work()
                {
                    worker.enqueue_task_and_unlock(guard, task);
                    return;
                }
                // The worker is contended; retry rather than blocking the
                // caller on a single worker.
            }
        } else {
            // Single-threaded mode: enqueue on the worker servicing the
            // calling thread. Looked up through the thread-local rather
            // than the thread-id map so that tasks scheduling further
            // tasks work from any of the worker's fiber stacks.
            let worker = current_worker()
                .expect("schedule() requires a scheduler bound to the current thread");
            worker.enqueue_task(task);
        }
    }

    /// Attempts to steal a task from the worker picked by `hint`. Called
    /// by spinning workers.
    pub(crate) fn steal_work(&self, thief: u32, hint: usize) -> Option<Task> {
        let num = self.num_worker_threads.load(Ordering::SeqCst);
        if num == 0 {
            return None;
        }
        let workers = self.worker_threads.read();
        let victim = workers.get(hint % num)?;
        if victim.id == thief {
            return None;
        }
        victim.dequeue()
    }

    /// Called when a worker starts spinning for work; `enqueue` will
    /// prioritize this worker to try to keep it from going to sleep.
    pub(crate) fn on_begin_spinning(&self, worker_id: u32) {
        let idx = self.next_spinning_worker_idx.fetch_add(1, Ordering::Relaxed) % SPINNING_WORKERS;
        self.spinning_workers[idx].store(i64::from(worker_id), Ordering::Relaxed);
    }

    fn set_worker_thread_count(self: &Arc<Self>, count: usize) {
        let count = if count > MAX_WORKER_THREADS {
            tracing::warn!(
                requested = count,
                max = MAX_WORKER_THREADS,
                "worker thread count exceeds the maximum, clamping"
            );
            MAX_WORKER_THREADS
        } else {
            count
        };
        debug_assert!(
            count == 0 || !self.tasks_since_resize.load(Ordering::Relaxed),
            "the worker thread count cannot be changed once tasks have been enqueued"
        );

        // Stop trailing workers when shrinking. The write lock is not held
        // across stop(): a stopping worker may still be inside the steal
        // path, which takes the read lock.
        let removed = {
            let mut workers = self.worker_threads.write();
            if count < workers.len() {
                workers.split_off(count)
            } else {
                Vec::new()
            }
        };
        for worker in removed.iter().rev() {
            worker.stop();
        }
        drop(removed);

        let created = {
            let mut workers = self.worker_threads.write();
            let old = workers.len();
            let created: Vec<Arc<Worker>> = (old..count)
                .map(|idx| {
                    let id = u32::try_from(idx).expect("worker index overflow");
                    let worker = Worker::new(self, Mode::MultiThreaded, id);
                    workers.push(Arc::clone(&worker));
                    worker
                })
                .collect();
            created
        };
        self.num_worker_threads.store(count, Ordering::SeqCst);
        for worker in &created {
            worker.start();
        }
        self.tasks_since_resize.store(false, Ordering::Relaxed);
    }
}

impl Drop for SchedulerCore {
    fn drop(&mut self) {
        debug_assert!(
            self.single_threaded_workers.get_mut().is_empty(),
            "scheduler dropped while still bound to {} thread(s)",
            self.single_threaded_workers.get_mut().len()
        );
        // Stop all worker threads; this waits for in-flight tasks to
        // complete before returning.
        let workers = std::mem::take(self.worker_threads.get_mut());
        self.num_worker_threads.store(0, Ordering::SeqCst);
        for worker in workers.iter().rev() {
            worker.stop();
        }
    }
}

/// Installs the thread-local scheduler handle on a worker-owned thread.
pub(crate) fn bind_worker_thread(core: &Arc<SchedulerCore>) {
    BOUND.with(|bound| {
        *bound.borrow_mut() = Some(Arc::downgrade(core));
    });
}

pub(crate) fn set_current_worker(worker: Option<Arc<Worker>>) {
    CURRENT_WORKER.with(|current| {
        *current.borrow_mut() = worker;
    });
}

pub(crate) fn current_worker() -> Option<Arc<Worker>> {
    CURRENT_WORKER.with(|current| current.borrow().clone())
}
