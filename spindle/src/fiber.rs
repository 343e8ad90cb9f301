// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use osfiber::OsFiber;
use parking_lot::MutexGuard;

use crate::scheduler;
use crate::worker::Worker;

/// A cooperatively scheduled stack hosting a task in progress.
///
/// Fibers are created by the scheduler; application code only ever observes
/// them through [`Fiber::current`]. When execution becomes blocked,
/// [`Fiber::wait`] suspends the fiber and lets the worker run other pending
/// work; once the block is lifted, [`Fiber::notify`] re-queues the fiber on
/// the worker that was executing it.
pub struct Fiber {
    id: u32,
    worker: Weak<Worker>,
    /// Guarded by the owning worker's work mutex: transitions only happen
    /// with it held. The atomic makes concurrent reads well-defined.
    state: AtomicU8,
    os: OsFiber,
}

/// Lifecycle of a [`Fiber`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum State {
    /// Unused, sitting in the worker's idle set, ready to be recycled.
    Idle = 0,
    /// Blocked on a wait with no deadline.
    Yielded = 1,
    /// Blocked on a wait with a deadline; also present in the worker's
    /// waiting set.
    Waiting = 2,
    /// Queued for execution in the worker's fiber queue.
    Queued = 3,
    /// Currently executing.
    Running = 4,
}

// === impl Fiber ===

impl Fiber {
    /// Returns the currently executing fiber, or `None` if the calling
    /// thread has no bound scheduler.
    pub fn current() -> Option<Arc<Fiber>> {
        scheduler::current_worker()?.current_fiber()
    }

    /// The worker-unique identifier of this fiber. Id 0 is the worker's
    /// main fiber.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Suspends the fiber until it is woken by a [`notify`](Fiber::notify)
    /// and `pred` returns true.
    ///
    /// If `pred` does not return true when the fiber is woken, the fiber is
    /// re-suspended and needs another `notify`. `guard` is released just
    /// before the fiber suspends and re-acquired before it resumes; `pred`
    /// always runs with it held.
    ///
    /// Must only be called on the currently executing fiber.
    pub fn wait<T, F>(&self, guard: &mut MutexGuard<'_, T>, pred: F)
    where
        F: FnMut(&mut T) -> bool,
    {
        self.worker().wait(guard, None, pred);
    }

    /// Like [`wait`](Fiber::wait), but gives up at `deadline`.
    ///
    /// Returns whether `pred` held when the wait ended; a return of `false`
    /// means the deadline was reached first.
    pub fn wait_until<T, F>(&self, guard: &mut MutexGuard<'_, T>, deadline: Instant, pred: F) -> bool
    where
        F: FnMut(&mut T) -> bool,
    {
        self.worker().wait(guard, Some(deadline), pred)
    }

    /// Reschedules the suspended fiber for execution on its owning worker.
    ///
    /// Usually only called when the predicate of one or more
    /// [`wait`](Fiber::wait) calls is likely to return true. Resume
    /// affinity: the fiber is re-queued on the worker it suspended on.
    pub fn notify(self: &Arc<Self>) {
        if let Some(worker) = self.worker.upgrade() {
            worker.enqueue_fiber(Arc::clone(self));
        }
    }

    /// Suspends the fiber exactly once, without a predicate loop.
    ///
    /// Used by [`ConditionVariable`](crate::ConditionVariable), which keeps
    /// its own registration list and predicate loop around the suspension.
    pub(crate) fn park<T>(&self, guard: &mut MutexGuard<'_, T>, deadline: Option<Instant>) {
        self.worker().park(guard, deadline);
    }

    pub(crate) fn from_current_thread(id: u32, worker: Weak<Worker>) -> Arc<Self> {
        Arc::new(Self {
            id,
            worker,
            state: AtomicU8::new(State::Running as u8),
            os: OsFiber::from_current_thread(),
        })
    }

    /// Constructs a fiber with its own stack that will execute `entry` when
    /// first switched to.
    pub(crate) fn create<F>(id: u32, worker: Weak<Worker>, stack_size: usize, entry: F) -> Arc<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let os = OsFiber::with_start(stack_size, entry).expect("failed to spawn fiber stack");
        Arc::new(Self {
            id,
            worker,
            state: AtomicU8::new(State::Running as u8),
            os,
        })
    }

    /// Switches execution to `to`. Must only be called on the currently
    /// executing fiber; switching to self is a no-op.
    pub(crate) fn switch_to(&self, to: &Fiber) {
        if std::ptr::eq(self, to) {
            return;
        }
        self.os.switch_to(&to.os);
    }

    /// Tears down the fiber's parked stack. See [`OsFiber::terminate`].
    pub(crate) fn terminate(&self) {
        self.os.terminate();
    }

    pub(crate) fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn worker(&self) -> Arc<Worker> {
        self.worker.upgrade().expect("fiber outlived its worker")
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// === impl State ===

impl State {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => State::Idle,
            1 => State::Yielded,
            2 => State::Waiting,
            3 => State::Queued,
            4 => State::Running,
            _ => unreachable!("invalid fiber state {raw}"),
        }
    }
}
