// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Workers execute tasks on a single thread.
//!
//! Once a task is started it may yield to other tasks on the same worker,
//! but a suspended task is always resumed by the worker that started it.
//!
//! Lock order: a primitive's own mutex, then `Worker::work`, then
//! `Worker::roster`. Fiber switches always happen with `work` released and
//! no guards live on the suspending stack.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::Task;
use crate::fiber::{Fiber, State};
use crate::scheduler::{self, SchedulerCore};

/// Stack size in bytes of a new fiber.
const FIBER_STACK_SIZE: usize = 1024 * 1024;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Mode {
    /// The worker spawns a background thread to process tasks.
    MultiThreaded,
    /// The worker executes tasks whenever the bound thread yields or
    /// flushes.
    SingleThreaded,
}

pub(crate) struct Worker {
    pub(crate) id: u32,
    mode: Mode,
    scheduler: Weak<SchedulerCore>,
    /// `work.tasks.len() + work.fibers.len()`, readable without the mutex.
    num: AtomicUsize,
    work: Mutex<Work>,
    /// Notified when work is added to an idle worker.
    added: Condvar,
    roster: Mutex<Roster>,
    thread: Mutex<Option<JoinHandle<()>>>,
    rng: Mutex<fastrand::Rng>,
    shutdown: AtomicBool,
}

/// Tasks and fibers enqueued on a worker.
#[derive(Default)]
pub(crate) struct Work {
    tasks: VecDeque<Task>,
    fibers: VecDeque<Arc<Fiber>>,
    waiting: WaitingFibers,
}

/// The fibers owned by a worker.
#[derive(Default)]
struct Roster {
    main_fiber: Option<Arc<Fiber>>,
    current_fiber: Option<Arc<Fiber>>,
    /// Fibers that have run dry and can be recycled.
    idle_fibers: Vec<Arc<Fiber>>,
    /// All fibers created by this worker; keeps them alive.
    worker_fibers: Vec<Arc<Fiber>>,
}

/// All the fibers blocked on a wait with a deadline, indexed twice: by
/// `(deadline, fiber id)` so the next expiry is the first entry, and by
/// fiber id so an early notify can erase a specific fiber.
#[derive(Default)]
pub(crate) struct WaitingFibers {
    timeouts: BTreeMap<(Instant, u32), Arc<Fiber>>,
    fibers: HashMap<u32, Instant>,
}

// === impl WaitingFibers ===

impl WaitingFibers {
    fn is_empty(&self) -> bool {
        self.fibers.is_empty()
    }

    /// The deadline of the next fiber to time out.
    fn next(&self) -> Option<Instant> {
        self.timeouts.keys().next().map(|&(deadline, _)| deadline)
    }

    /// Removes and returns the next fiber whose deadline has passed.
    fn take(&mut self, now: Instant) -> Option<Arc<Fiber>> {
        let (&(deadline, id), _) = self.timeouts.iter().next()?;
        if deadline > now {
            return None;
        }
        let fiber = self.timeouts.remove(&(deadline, id));
        let erased = self.fibers.remove(&id);
        debug_assert!(erased.is_some(), "waiting fiber indexes out of sync");
        fiber
    }

    fn add(&mut self, deadline: Instant, fiber: Arc<Fiber>) {
        let id = fiber.id();
        let previous = self.fibers.insert(id, deadline);
        debug_assert!(previous.is_none(), "fiber {id} is already waiting");
        self.timeouts.insert((deadline, id), fiber);
    }

    fn erase(&mut self, fiber: &Fiber) {
        if let Some(deadline) = self.fibers.remove(&fiber.id()) {
            let erased = self.timeouts.remove(&(deadline, fiber.id()));
            debug_assert!(erased.is_some(), "waiting fiber indexes out of sync");
        }
    }

    fn contains(&self, fiber: &Fiber) -> bool {
        self.fibers.contains_key(&fiber.id())
    }
}

// === impl Worker ===

impl Worker {
    pub(crate) fn new(scheduler: &Arc<SchedulerCore>, mode: Mode, id: u32) -> Arc<Self> {
        Arc::new(Self {
            id,
            mode,
            scheduler: Arc::downgrade(scheduler),
            num: AtomicUsize::new(0),
            work: Mutex::new(Work::default()),
            added: Condvar::new(),
            roster: Mutex::new(Roster::default()),
            thread: Mutex::new(None),
            rng: Mutex::new(fastrand::Rng::new()),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Begins execution of the worker.
    pub(crate) fn start(self: &Arc<Self>) {
        match self.mode {
            Mode::MultiThreaded => {
                let worker = Arc::clone(self);
                let handle = thread::Builder::new()
                    .name(format!("spindle-worker-{:02}", self.id))
                    .spawn(move || {
                        let Some(sched) = worker.scheduler.upgrade() else {
                            return;
                        };
                        if let Some(init) = sched.thread_initializer() {
                            init();
                        }
                        scheduler::bind_worker_thread(&sched);
                        drop(sched);
                        worker.attach_current_thread();
                        worker.run();
                        // run() returned on the main fiber; release it.
                        worker.roster.lock().main_fiber = None;
                    })
                    .expect("failed to spawn worker thread");
                *self.thread.lock() = Some(handle);
            }
            Mode::SingleThreaded => self.attach_current_thread(),
        }
    }

    /// Ceases execution of the worker, blocking until all pending tasks
    /// have fully finished.
    pub(crate) fn stop(&self) {
        match self.mode {
            Mode::MultiThreaded => {
                self.shutdown.store(true, Ordering::SeqCst);
                // Ensure the worker is woken up to notice the shutdown.
                self.enqueue_task(Box::new(|| {}));
                let handle = self.thread.lock().take();
                if let Some(handle) = handle {
                    let _ = handle.join();
                }
            }
            Mode::SingleThreaded => scheduler::set_current_worker(None),
        }
        self.teardown_fibers();
    }

    /// Makes the calling thread this worker's main context.
    fn attach_current_thread(self: &Arc<Self>) {
        scheduler::set_current_worker(Some(Arc::clone(self)));
        let main = Fiber::from_current_thread(0, Arc::downgrade(self));
        let mut roster = self.roster.lock();
        roster.current_fiber = Some(Arc::clone(&main));
        roster.main_fiber = Some(main);
    }

    /// Unwinds every parked fiber stack and releases the fiber handles.
    ///
    /// Parked frames hold `Arc<Fiber>` clones of their switch partners, so
    /// refcounts alone cannot reclaim them; the stacks have to be unwound
    /// first.
    fn teardown_fibers(&self) {
        let fibers = {
            let mut roster = self.roster.lock();
            roster.current_fiber = None;
            roster.main_fiber = None;
            roster.idle_fibers.clear();
            std::mem::take(&mut roster.worker_fibers)
        };
        for fiber in &fibers {
            fiber.terminate();
        }
    }

    /// The task processing loop.
    ///
    /// In multi-threaded mode, runs until [`stop`](Worker::stop) and all
    /// blocked fibers are reclaimed; a worker fiber that carries the loop
    /// to shutdown parks itself as idle and hands control back to the main
    /// fiber, which is the one that returns and lets the thread exit. In
    /// single-threaded mode this is the body of the worker fibers spawned
    /// when the bound thread suspends: each one flushes pending work,
    /// parks itself as idle and hands back to the main fiber.
    pub(crate) fn run(self: &Arc<Self>) {
        match self.mode {
            Mode::MultiThreaded => {
                let _span = tracing::debug_span!("worker", worker = self.id).entered();
                let is_main = self.current_fiber_unchecked().id() == 0;
                loop {
                    {
                        let mut work = self.work.lock();
                        while !(self.num.load(Ordering::SeqCst) > 0
                            || !work.waiting.is_empty()
                            || self.shutdown.load(Ordering::SeqCst))
                        {
                            self.added.wait(&mut work);
                        }
                        while !self.shutdown.load(Ordering::SeqCst)
                            || self.num.load(Ordering::SeqCst) > 0
                            || self.num_blocked_fibers() > 0
                        {
                            work = self.wait_for_work(work);
                            work = self.run_until_idle(work);
                        }
                    }
                    tracing::debug!(worker = self.id, "shutting down");
                    if is_main {
                        // The main fiber returns from run() and the thread
                        // exits.
                        break;
                    }

                    // A worker fiber carried the loop to shutdown; it is
                    // finished and reclaimable. Park it as idle and hand
                    // control to the main fiber so the thread can exit.
                    let main = self.claim_main_fiber();
                    let current = self.current_fiber_unchecked();
                    {
                        let _work = self.work.lock();
                        self.change_fiber_state(&current, State::Running, State::Idle);
                    }
                    self.roster.lock().idle_fibers.push(current);
                    self.switch_to_fiber(main);
                    // Resumed from the idle set: a task scheduled during
                    // shutdown still found its way here. Go around again.
                    let current = self.current_fiber_unchecked();
                    let _work = self.work.lock();
                    self.change_fiber_state(&current, State::Idle, State::Running);
                }
            }
            Mode::SingleThreaded => {
                while !self.shutdown.load(Ordering::SeqCst) {
                    self.flush();
                    let current = self.current_fiber_unchecked();
                    {
                        let _work = self.work.lock();
                        self.change_fiber_state(&current, State::Running, State::Idle);
                    }
                    self.roster.lock().idle_fibers.push(current);
                    let main = self.claim_main_fiber();
                    self.switch_to_fiber(main);
                    // Resumed from the idle set by a suspending fiber.
                    let current = self.current_fiber_unchecked();
                    let _work = self.work.lock();
                    self.change_fiber_state(&current, State::Idle, State::Running);
                }
            }
        }
    }

    /// Processes all enqueued tasks before returning.
    pub(crate) fn flush(self: &Arc<Self>) {
        debug_assert_eq!(
            self.mode,
            Mode::SingleThreaded,
            "flush() requires a single-threaded worker"
        );
        let work = self.work.lock();
        drop(self.run_until_idle(work));
    }

    /// Suspends the current fiber until `pred` returns true, or until
    /// `deadline` passes.
    ///
    /// `guard` is unlocked while the fiber is suspended and re-locked
    /// before `pred` runs. Returns whether `pred` held when the wait ended.
    pub(crate) fn wait<T, F>(
        self: &Arc<Self>,
        guard: &mut MutexGuard<'_, T>,
        deadline: Option<Instant>,
        mut pred: F,
    ) -> bool
    where
        F: FnMut(&mut T) -> bool,
    {
        loop {
            if pred(&mut **guard) {
                return true;
            }
            self.park(guard, deadline);
            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                return pred(&mut **guard);
            }
            // Spurious wake-up; park again.
        }
    }

    /// Suspends the current fiber exactly once.
    ///
    /// The work mutex is taken *before* `guard` is released: a `notify`
    /// racing with the suspension has to wait on the work mutex and so
    /// always observes the fiber in its suspended state. Releasing `guard`
    /// first would open a lost-wakeup window.
    pub(crate) fn park<T>(self: &Arc<Self>, guard: &mut MutexGuard<'_, T>, deadline: Option<Instant>) {
        let work = self.work.lock();
        MutexGuard::unlocked(guard, || {
            drop(self.suspend(work, deadline));
        });
    }

    /// Suspends the currently executing fiber until it is woken with
    /// [`enqueue_fiber`](Worker::enqueue_fiber), or automatically some time
    /// after the optional deadline, and picks something else to run.
    fn suspend<'a>(
        self: &'a Arc<Self>,
        mut work: MutexGuard<'a, Work>,
        deadline: Option<Instant>,
    ) -> MutexGuard<'a, Work> {
        {
            let current = self.current_fiber_unchecked();
            if let Some(deadline) = deadline {
                self.change_fiber_state(&current, State::Running, State::Waiting);
                work.waiting.add(deadline, Arc::clone(&current));
            } else {
                self.change_fiber_state(&current, State::Running, State::Yielded);
            }
        }

        // First wait until there's something else this worker can do.
        work = self.wait_for_work(work);

        if let Some(to) = work.fibers.pop_front() {
            // Another fiber has become unblocked; resume that.
            self.num.fetch_sub(1, Ordering::SeqCst);
            debug_assert_eq!(to.state(), State::Queued, "dequeued fiber is not queued");
            drop(work);
            self.switch_to_fiber(to);
        } else if let Some(to) = self.take_idle_fiber() {
            // There's an old fiber we can reuse, resume that.
            debug_assert_eq!(to.state(), State::Idle, "recycled fiber is not idle");
            drop(work);
            self.switch_to_fiber(to);
        } else {
            // Tasks to process and no existing fibers to resume; spawn a
            // new fiber.
            drop(work);
            let to = self.create_worker_fiber();
            self.switch_to_fiber(to);
        }

        let work = self.work.lock();
        let current = self.current_fiber_unchecked();
        self.set_fiber_state(&current, State::Running);
        work
    }

    /// Enqueues resuming of a suspended fiber.
    pub(crate) fn enqueue_fiber(&self, fiber: Arc<Fiber>) {
        let mut work = self.work.lock();
        tracing::trace!(worker = self.id, fiber = fiber.id(), state = ?fiber.state(), "enqueue fiber");
        match fiber.state() {
            // Nothing to do here - the fiber is already queued or running.
            State::Running | State::Queued => return,
            // A stale notify: the fiber already finished its wait and was
            // recycled. It is not a waiter anymore (waiters re-check their
            // predicate), and queueing it would leave it in two containers
            // at once.
            State::Idle => return,
            State::Waiting => work.waiting.erase(&fiber),
            State::Yielded => {}
        }
        let was_idle = self.num.load(Ordering::SeqCst) == 0;
        debug_assert!(
            !work.waiting.contains(&fiber),
            "fiber is unexpectedly in the waiting list"
        );
        self.set_fiber_state(&fiber, State::Queued);
        work.fibers.push_back(fiber);
        self.num.fetch_add(1, Ordering::SeqCst);
        drop(work);
        if was_idle {
            self.added.notify_one();
        }
    }

    /// Enqueues a new, unstarted task.
    pub(crate) fn enqueue_task(&self, task: Task) {
        let work = self.work.lock();
        self.enqueue_task_and_unlock(work, task);
    }

    /// Attempts to lock the worker for task enqueueing. On success the
    /// caller must pass the guard to
    /// [`enqueue_task_and_unlock`](Worker::enqueue_task_and_unlock).
    pub(crate) fn try_lock_work(&self) -> Option<MutexGuard<'_, Work>> {
        self.work.try_lock()
    }

    pub(crate) fn enqueue_task_and_unlock(&self, mut work: MutexGuard<'_, Work>, task: Task) {
        let was_idle = self.num.load(Ordering::SeqCst) == 0;
        work.tasks.push_back(task);
        self.num.fetch_add(1, Ordering::SeqCst);
        drop(work);
        if was_idle {
            self.added.notify_one();
        }
    }

    /// Attempts to take a task from the worker without blocking.
    pub(crate) fn dequeue(&self) -> Option<Task> {
        if self.num.load(Ordering::SeqCst) == 0 {
            return None;
        }
        let mut work = self.work.try_lock()?;
        let task = work.tasks.pop_front()?;
        self.num.fetch_sub(1, Ordering::SeqCst);
        Some(task)
    }

    pub(crate) fn current_fiber(&self) -> Option<Arc<Fiber>> {
        self.roster.lock().current_fiber.clone()
    }

    /// Blocks until new work is available, potentially spinning and
    /// stealing from other workers first.
    fn wait_for_work<'a>(&'a self, mut work: MutexGuard<'a, Work>) -> MutexGuard<'a, Work> {
        debug_assert_eq!(
            self.num.load(Ordering::SeqCst),
            work.tasks.len() + work.fibers.len(),
            "work count out of sync"
        );
        if self.num.load(Ordering::SeqCst) == 0 && self.mode == Mode::MultiThreaded {
            if let Some(sched) = self.scheduler.upgrade() {
                sched.on_begin_spinning(self.id);
            }
            drop(work);
            self.spin_for_work();
            work = self.work.lock();
        }

        if work.waiting.is_empty() {
            while !(self.num.load(Ordering::SeqCst) > 0
                || (self.shutdown.load(Ordering::SeqCst) && self.num_blocked_fibers() == 0))
            {
                self.added.wait(&mut work);
            }
        } else {
            let deadline = work.waiting.next().expect("waiting set is non-empty");
            while !(self.num.load(Ordering::SeqCst) > 0
                || (self.shutdown.load(Ordering::SeqCst) && self.num_blocked_fibers() == 0))
            {
                if self.added.wait_until(&mut work, deadline).timed_out() {
                    break;
                }
            }
            self.enqueue_fiber_timeouts(&mut work);
        }
        work
    }

    /// Re-queues every waiting fiber whose deadline has passed.
    fn enqueue_fiber_timeouts(&self, work: &mut Work) {
        let now = Instant::now();
        while let Some(fiber) = work.waiting.take(now) {
            tracing::trace!(worker = self.id, fiber = fiber.id(), "fiber wait timed out");
            self.change_fiber_state(&fiber, State::Waiting, State::Queued);
            work.fibers.push_back(fiber);
            self.num.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Attempts to steal work from other workers while keeping the thread
    /// awake for a short duration, reducing the overhead of frequently
    /// sleeping and re-waking.
    ///
    /// Tuning: ~1ms total, in 256 bursts of 32 `spin_loop` hints with a
    /// lock-free work check between bursts and a steal attempt plus
    /// `yield_now` between rounds.
    fn spin_for_work(&self) {
        const SPIN_DURATION: Duration = Duration::from_millis(1);

        tracing::trace!(worker = self.id, "spinning for work");
        let start = Instant::now();
        while start.elapsed() < SPIN_DURATION {
            for _ in 0..256 {
                for _ in 0..32 {
                    std::hint::spin_loop();
                }
                if self.num.load(Ordering::SeqCst) > 0 {
                    return;
                }
            }

            let hint = self.rng.lock().usize(..);
            if let Some(sched) = self.scheduler.upgrade()
                && let Some(task) = sched.steal_work(self.id, hint)
            {
                tracing::trace!(worker = self.id, "stole a task");
                let mut work = self.work.lock();
                work.tasks.push_back(task);
                self.num.fetch_add(1, Ordering::SeqCst);
                return;
            }

            thread::yield_now();
        }
    }

    /// Executes queued fibers, then queued tasks, until both queues are
    /// empty.
    fn run_until_idle<'a>(&'a self, mut work: MutexGuard<'a, Work>) -> MutexGuard<'a, Work> {
        debug_assert_eq!(
            self.num.load(Ordering::SeqCst),
            work.tasks.len() + work.fibers.len(),
            "work count out of sync"
        );
        loop {
            // Note: we cannot take and hold more than a single fiber or
            // task at a time, as the fiber may yield and the locals would
            // be held on the suspended stack.
            while let Some(fiber) = work.fibers.pop_front() {
                self.num.fetch_sub(1, Ordering::SeqCst);
                debug_assert_eq!(fiber.state(), State::Queued, "dequeued fiber is not queued");
                let current = self.current_fiber_unchecked();
                debug_assert!(
                    !Arc::ptr_eq(&fiber, &current),
                    "dequeued fiber is currently running"
                );
                self.change_fiber_state(&current, State::Running, State::Idle);
                drop(work);
                {
                    let mut roster = self.roster.lock();
                    debug_assert!(
                        !roster.idle_fibers.iter().any(|f| Arc::ptr_eq(f, &current)),
                        "fiber is already idle"
                    );
                    roster.idle_fibers.push(current);
                }
                self.switch_to_fiber(fiber);
                work = self.work.lock();
                let current = self.current_fiber_unchecked();
                self.change_fiber_state(&current, State::Idle, State::Running);
            }

            if let Some(task) = work.tasks.pop_front() {
                self.num.fetch_sub(1, Ordering::SeqCst);
                drop(work);
                task();
                work = self.work.lock();
            } else if work.fibers.is_empty() {
                return work;
            }
        }
    }

    /// Creates a new fiber that enters [`run`](Worker::run) when first
    /// switched to.
    fn create_worker_fiber(self: &Arc<Self>) -> Arc<Fiber> {
        let fiber_id = u32::try_from(self.roster.lock().worker_fibers.len() + 1)
            .expect("worker fiber count overflow");
        tracing::trace!(worker = self.id, fiber = fiber_id, "creating worker fiber");
        let worker = Arc::clone(self);
        let fiber = Fiber::create(fiber_id, Arc::downgrade(self), FIBER_STACK_SIZE, move || {
            if let Some(sched) = worker.scheduler.upgrade() {
                if let Some(init) = sched.thread_initializer() {
                    init();
                }
                scheduler::bind_worker_thread(&sched);
                drop(sched);
            }
            scheduler::set_current_worker(Some(Arc::clone(&worker)));
            worker.run();
        });
        self.roster.lock().worker_fibers.push(Arc::clone(&fiber));
        fiber
    }

    /// Switches execution to the given fiber. The fiber must belong to
    /// this worker.
    fn switch_to_fiber(&self, to: Arc<Fiber>) {
        let from = {
            let mut roster = self.roster.lock();
            debug_assert!(
                !roster.idle_fibers.iter().any(|f| Arc::ptr_eq(f, &to)),
                "switching to an idle fiber"
            );
            roster
                .current_fiber
                .replace(Arc::clone(&to))
                .expect("worker has no current fiber")
        };
        tracing::trace!(worker = self.id, from = from.id(), to = to.id(), "switch");
        from.switch_to(&to);
    }

    fn take_idle_fiber(&self) -> Option<Arc<Fiber>> {
        self.roster.lock().idle_fibers.pop()
    }

    /// Takes the main fiber for a switch, claiming it out of the idle set
    /// if it parked itself there (as [`take_idle_fiber`](Self::take_idle_fiber)
    /// does for ordinary resumption). A fiber never sits in the idle set
    /// while it is the current fiber.
    fn claim_main_fiber(&self) -> Arc<Fiber> {
        let mut roster = self.roster.lock();
        let main = roster
            .main_fiber
            .clone()
            .expect("worker has no main fiber");
        if let Some(idx) = roster
            .idle_fibers
            .iter()
            .position(|f| Arc::ptr_eq(f, &main))
        {
            roster.idle_fibers.remove(idx);
        }
        main
    }

    fn current_fiber_unchecked(&self) -> Arc<Fiber> {
        self.current_fiber().expect("worker has no current fiber")
    }

    /// Fibers currently blocked and held externally.
    fn num_blocked_fibers(&self) -> usize {
        let roster = self.roster.lock();
        debug_assert!(roster.idle_fibers.len() <= roster.worker_fibers.len() + 1);
        roster
            .worker_fibers
            .len()
            .saturating_sub(roster.idle_fibers.len())
    }

    fn change_fiber_state(&self, fiber: &Fiber, from: State, to: State) {
        debug_assert_eq!(
            fiber.state(),
            from,
            "fiber {} was in state {:?}, but expected {:?}",
            fiber.id(),
            fiber.state(),
            from
        );
        tracing::trace!(worker = self.id, fiber = fiber.id(), ?from, ?to, "fiber state");
        fiber.set_state(to);
    }

    fn set_fiber_state(&self, fiber: &Fiber, to: State) {
        tracing::trace!(worker = self.id, fiber = fiber.id(), ?to, "fiber state");
        fiber.set_state(to);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_fiber(id: u32) -> Arc<Fiber> {
        Fiber::from_current_thread(id, Weak::new())
    }

    #[test]
    fn waiting_fibers_orders_by_deadline() {
        let mut waiting = WaitingFibers::default();
        let now = Instant::now();
        let near = now + Duration::from_millis(10);
        let far = now + Duration::from_millis(100);

        waiting.add(far, dummy_fiber(1));
        waiting.add(near, dummy_fiber(2));
        assert_eq!(waiting.next(), Some(near));

        // Nothing has expired yet.
        assert!(waiting.take(now).is_none());

        let fiber = waiting.take(near).expect("near deadline expired");
        assert_eq!(fiber.id(), 2);
        assert_eq!(waiting.next(), Some(far));

        let fiber = waiting.take(far + Duration::from_millis(1)).unwrap();
        assert_eq!(fiber.id(), 1);
        assert!(waiting.is_empty());
    }

    #[test]
    fn waiting_fibers_erase_specific_fiber() {
        let mut waiting = WaitingFibers::default();
        let now = Instant::now();
        let f1 = dummy_fiber(1);
        let f2 = dummy_fiber(2);

        waiting.add(now + Duration::from_millis(10), Arc::clone(&f1));
        waiting.add(now + Duration::from_millis(20), Arc::clone(&f2));
        assert!(waiting.contains(&f1));

        waiting.erase(&f1);
        assert!(!waiting.contains(&f1));
        assert!(waiting.contains(&f2));

        // Erasing a fiber that is not waiting is a no-op.
        waiting.erase(&f1);

        let fiber = waiting.take(now + Duration::from_secs(1)).unwrap();
        assert_eq!(fiber.id(), 2);
        assert!(waiting.is_empty());
    }
}
