// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use smallvec::SmallVec;
use static_assertions::assert_impl_all;

use crate::sync::condition_variable::ConditionVariable;

/// Whether an [`Event`] resets itself when a wait returns.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    /// The signal is automatically reset when a call to
    /// [`wait`](Event::wait) returns. A single [`signal`](Event::signal)
    /// only unblocks a single (possibly future) wait.
    Auto,
    /// While the event is signalled, any wait unblocks without resetting
    /// the state; reset it with [`clear`](Event::clear).
    Manual,
}

/// A synchronization primitive used to block until a signal is raised.
///
/// `Event` is a cheap handle sharing its state across clones; it is meant
/// to be captured by value in scheduled tasks.
#[derive(Clone)]
pub struct Event {
    shared: Arc<Shared>,
}

assert_impl_all!(Event: Send, Sync);

struct Shared {
    mode: Mode,
    cv: ConditionVariable,
    state: Mutex<State>,
}

struct State {
    signalled: bool,
    /// Dependent events signalled transitively; how [`Event::any`] fan-in
    /// is wired up.
    deps: SmallVec<[Arc<Shared>; 1]>,
}

// === impl Event ===

impl Event {
    pub fn new(mode: Mode) -> Self {
        Self::with_initial_state(mode, false)
    }

    pub fn with_initial_state(mode: Mode, signalled: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                mode,
                cv: ConditionVariable::new(),
                state: Mutex::new(State {
                    signalled,
                    deps: SmallVec::new(),
                }),
            }),
        }
    }

    /// Signals the event, possibly unblocking a call to
    /// [`wait`](Event::wait). Signalling an already-signalled event is a
    /// no-op.
    pub fn signal(&self) {
        self.shared.signal();
    }

    /// Clears the signalled state.
    pub fn clear(&self) {
        self.shared.state.lock().signalled = false;
    }

    /// Blocks until the event is signalled.
    ///
    /// For [`Mode::Auto`] events the signalled state is cleared before
    /// returning, so only one wait unblocks per signal.
    pub fn wait(&self) {
        self.shared.wait(None);
    }

    /// Like [`wait`](Event::wait), but gives up after `timeout`. Returns
    /// `false` if the timeout was reached.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.shared.wait(Some(deadline)),
            None => {
                self.shared.wait(None);
                true
            }
        }
    }

    /// Like [`wait`](Event::wait), but gives up at `deadline`. Returns
    /// `false` if the deadline was reached.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        self.shared.wait(Some(deadline))
    }

    /// Returns whether the event is signalled, clearing the state for
    /// [`Mode::Auto`] events.
    pub fn test(&self) -> bool {
        let mut state = self.shared.state.lock();
        if !state.signalled {
            return false;
        }
        if self.shared.mode == Mode::Auto {
            state.signalled = false;
        }
        true
    }

    /// Returns whether the event is signalled, without clearing it.
    ///
    /// No lock is held after this returns, so the state may change
    /// immediately; use with caution.
    pub fn is_signalled(&self) -> bool {
        self.shared.state.lock().signalled
    }

    /// Returns an event that is automatically signalled whenever any of
    /// `events` is signalled.
    ///
    /// An `any` of no events is never signalled.
    pub fn any<'a, I>(events: I) -> Event
    where
        I: IntoIterator<Item = &'a Event>,
    {
        Self::any_with_mode(Mode::Auto, events)
    }

    /// Like [`any`](Event::any), with an explicit mode for the returned
    /// event.
    pub fn any_with_mode<'a, I>(mode: Mode, events: I) -> Event
    where
        I: IntoIterator<Item = &'a Event>,
    {
        let any = Event::new(mode);
        for event in events {
            let mut state = event.shared.state.lock();
            if state.signalled {
                any.signal();
            }
            state.deps.push(Arc::clone(&any.shared));
        }
        any
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new(Mode::Auto)
    }
}

// === impl Shared ===

impl Shared {
    fn signal(&self) {
        let deps = {
            let mut state = self.state.lock();
            if state.signalled {
                return;
            }
            state.signalled = true;
            match self.mode {
                Mode::Auto => self.cv.notify_one(),
                Mode::Manual => self.cv.notify_all(),
            }
            state.deps.clone()
        };
        // Walk dependents outside the critical section, holding strong
        // references; a dependency cycle terminates on the
        // already-signalled fast path above.
        for dep in deps {
            dep.signal();
        }
    }

    fn wait(&self, deadline: Option<Instant>) -> bool {
        let mut state = self.state.lock();
        let signalled = match deadline {
            Some(deadline) => self
                .cv
                .wait_until(&mut state, deadline, |state| state.signalled),
            None => {
                self.cv.wait(&mut state, |state| state.signalled);
                true
            }
        };
        if !signalled {
            return false;
        }
        if self.mode == Mode::Auto {
            state.signalled = false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::with_scheduler;
    use crate::{WaitGroup, schedule};

    #[test]
    fn manual_event_stays_signalled() {
        let event = Event::new(Mode::Manual);
        assert!(!event.is_signalled());

        event.signal();
        assert!(event.is_signalled());
        event.wait();
        event.wait();
        assert!(event.is_signalled());

        // Signalling twice is equivalent to signalling once.
        event.signal();
        assert!(event.test());
        assert!(event.is_signalled());

        event.clear();
        assert!(!event.is_signalled());
    }

    #[test]
    fn auto_event_clears_on_wait() {
        let event = Event::new(Mode::Auto);
        event.signal();
        assert!(event.is_signalled());

        // With no other waiter present the signalled wait returns
        // immediately and consumes the signal.
        event.wait();
        assert!(!event.is_signalled());
    }

    #[test]
    fn auto_event_test_consumes_signal() {
        let event = Event::new(Mode::Auto);
        assert!(!event.test());
        event.signal();
        assert!(event.test());
        assert!(!event.test());
    }

    #[test]
    fn wait_for_times_out() {
        let event = Event::new(Mode::Auto);
        let start = Instant::now();
        assert!(!event.wait_for(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));

        event.signal();
        assert!(event.wait_for(Duration::from_secs(1)));
    }

    #[test]
    fn initial_state_is_observable() {
        let event = Event::with_initial_state(Mode::Manual, true);
        assert!(event.is_signalled());
        event.wait();
    }

    #[test]
    fn fan_out_unblocks_scheduled_tasks() {
        with_scheduler(4, || {
            const TASKS: usize = 10;
            let go = Event::new(Mode::Manual);
            let wg = WaitGroup::new(TASKS);

            for _ in 0..TASKS {
                let go = go.clone();
                let wg = wg.clone();
                schedule(move || {
                    go.wait();
                    wg.done();
                });
            }

            go.signal();
            wg.wait();
            assert!(go.is_signalled());
        });
    }

    #[test]
    fn any_is_signalled_by_each_input() {
        with_scheduler(2, || {
            let e1 = Event::new(Mode::Auto);
            let e2 = Event::new(Mode::Auto);
            let e3 = Event::new(Mode::Auto);
            let any = Event::any([&e1, &e2, &e3]);

            e2.signal();
            any.wait();
            assert!(!e1.is_signalled());
            assert!(!e3.is_signalled());

            // The auto `any` reset itself when the first wait returned.
            e1.signal();
            any.wait();
        });
    }

    #[test]
    fn any_of_already_signalled_event() {
        let e1 = Event::new(Mode::Manual);
        e1.signal();
        let any = Event::any([&e1]);
        assert!(any.is_signalled());
    }

    #[test]
    fn any_of_nothing_never_signals() {
        let inputs: [&Event; 0] = [];
        let any = Event::any(inputs);
        assert!(!any.wait_for(Duration::from_millis(10)));
    }

    #[test]
    fn dependency_cycles_terminate() {
        let e1 = Event::new(Mode::Manual);
        let e2 = Event::new(Mode::Manual);
        e1.shared.state.lock().deps.push(Arc::clone(&e2.shared));
        e2.shared.state.lock().deps.push(Arc::clone(&e1.shared));

        e1.signal();
        assert!(e1.is_signalled());
        assert!(e2.is_signalled());
    }
}
