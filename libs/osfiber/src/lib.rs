// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Switchable execution contexts for cooperative scheduling.
//!
//! This crate provides [`OsFiber`], a minimal "scoped stack with
//! switch-to(other)" capability: a context either wraps the calling thread's
//! own stack ([`OsFiber::from_current_thread`]) or owns a fresh stack that
//! begins executing an entry function on its first switch-in
//! ([`OsFiber::with_start`]). [`OsFiber::switch_to`] transfers execution to
//! another context and returns once some context switches back.
//!
//! The backend is a parked carrier thread per context, with execution handed
//! over through a mutex/condvar baton. Exactly one context per [`OsFiber`]
//! group is ever runnable at a time, so the contexts behave like stackful
//! coroutines: thread-locals and stack frames survive across suspension, and
//! a switched-away context makes no progress until it is switched back to.
//!
//! Entry functions must never return: a context ends its life either parked
//! (and is then torn down when the `OsFiber` is dropped or
//! [`terminated`](OsFiber::terminate)) or by unwinding through the teardown
//! path.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

/// Panic payload used to unwind a parked carrier thread during teardown.
///
/// Not public: it must never escape the carrier's entry frame.
struct FiberExit;

#[derive(Default)]
struct BatonState {
    /// Set when this context has been switched to and may run.
    resumed: bool,
    /// Set when the context should unwind and exit instead of resuming.
    exiting: bool,
}

/// The handover point between a context's carrier thread and whoever
/// switches to it.
#[derive(Default)]
struct Baton {
    state: Mutex<BatonState>,
    cv: Condvar,
}

/// A switchable execution context.
///
/// See the [crate docs](crate) for the contract.
pub struct OsFiber {
    baton: Arc<Baton>,
    /// The carrier thread owning this context's stack. `None` for contexts
    /// created from an existing thread.
    carrier: Mutex<Option<JoinHandle<()>>>,
}

// === impl Baton ===

impl Baton {
    /// Allow the owning context to run.
    fn wake(&self) {
        let mut state = self.state.lock();
        state.resumed = true;
        self.cv.notify_one();
    }

    /// Park the calling thread until the owning context is resumed.
    ///
    /// Initiates an unwind out of the caller if teardown was requested while
    /// parked.
    fn sleep(&self) {
        let mut state = self.state.lock();
        loop {
            if state.exiting {
                drop(state);
                panic::resume_unwind(Box::new(FiberExit));
            }
            if state.resumed {
                state.resumed = false;
                return;
            }
            self.cv.wait(&mut state);
        }
    }

    /// Request teardown of the owning context.
    fn exit(&self) {
        let mut state = self.state.lock();
        state.exiting = true;
        self.cv.notify_one();
    }
}

// === impl OsFiber ===

impl OsFiber {
    /// Returns a context representing the calling thread's current stack.
    ///
    /// The returned context is considered running; switching away from it
    /// parks the calling thread until something switches back.
    pub fn from_current_thread() -> Self {
        Self {
            baton: Arc::new(Baton::default()),
            carrier: Mutex::new(None),
        }
    }

    /// Returns a context that will begin executing `f` upon first switch-in.
    ///
    /// `f` must not return; it must eventually switch away and stay parked
    /// until the context is torn down.
    ///
    /// # Errors
    ///
    /// Returns an error if the carrier thread cannot be spawned.
    pub fn with_start<F>(stack_size: usize, f: F) -> io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let baton = Arc::new(Baton::default());
        let carrier = {
            let baton = Arc::clone(&baton);
            thread::Builder::new()
                .name("osfiber".into())
                .stack_size(stack_size)
                .spawn(move || carrier_main(&baton, f))?
        };
        Ok(Self {
            baton,
            carrier: Mutex::new(Some(carrier)),
        })
    }

    /// Transfers execution to `to`.
    ///
    /// Must be called on the context that is currently executing. Returns
    /// when some other context switches back to `self`. Switching to `self`
    /// is a no-op.
    pub fn switch_to(&self, to: &OsFiber) {
        if Arc::ptr_eq(&self.baton, &to.baton) {
            return;
        }
        // Hold only the batons across the park. Holding `self`/`to` borrows
        // is fine: the caller's frame is suspended with them anyway.
        to.baton.wake();
        self.baton.sleep();
    }

    /// Tears down a parked context: unwinds its carrier thread and joins it.
    ///
    /// Must not be called while the context is executing. Idempotent; a
    /// no-op for contexts created with [`OsFiber::from_current_thread`].
    pub fn terminate(&self) {
        if let Some(handle) = self.carrier.lock().take() {
            self.baton.exit();
            let _ = handle.join();
        }
    }
}

impl Drop for OsFiber {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn carrier_main<F>(baton: &Baton, f: F)
where
    F: FnOnce(),
{
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        baton.sleep();
        f();
        panic!("OsFiber entry function returned; it must switch away instead");
    }));
    if let Err(payload) = result {
        if payload.downcast_ref::<FiberExit>().is_none() {
            // A real panic from the entry function; let it take the carrier
            // thread down loudly.
            panic::resume_unwind(payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn round_trip_and_teardown() {
        let steps = Arc::new(AtomicUsize::new(0));
        let main = Arc::new(OsFiber::from_current_thread());
        let slot: Arc<Mutex<Option<Arc<OsFiber>>>> = Arc::new(Mutex::new(None));

        let fiber = {
            let steps = Arc::clone(&steps);
            let main = Arc::clone(&main);
            let slot = Arc::clone(&slot);
            Arc::new(
                OsFiber::with_start(64 * 1024, move || {
                    let me = slot.lock().clone().unwrap();
                    steps.fetch_add(1, Ordering::SeqCst);
                    me.switch_to(&main);
                    steps.fetch_add(1, Ordering::SeqCst);
                    me.switch_to(&main);
                    unreachable!("resumed after final switch away");
                })
                .unwrap(),
            )
        };
        *slot.lock() = Some(Arc::clone(&fiber));

        assert_eq!(steps.load(Ordering::SeqCst), 0);
        main.switch_to(&fiber);
        assert_eq!(steps.load(Ordering::SeqCst), 1);
        main.switch_to(&fiber);
        assert_eq!(steps.load(Ordering::SeqCst), 2);

        // The fiber is parked on its second switch away; terminate unwinds
        // and joins the carrier.
        fiber.terminate();
    }

    #[test]
    fn self_switch_is_a_noop() {
        let main = OsFiber::from_current_thread();
        main.switch_to(&main);
    }

    #[test]
    fn terminate_never_started() {
        let fiber = OsFiber::with_start(64 * 1024, || unreachable!()).unwrap();
        fiber.terminate();
    }

    #[test]
    fn terminate_is_idempotent() {
        let main = Arc::new(OsFiber::from_current_thread());
        let slot: Arc<Mutex<Option<Arc<OsFiber>>>> = Arc::new(Mutex::new(None));
        let fiber = {
            let main = Arc::clone(&main);
            let slot = Arc::clone(&slot);
            Arc::new(
                OsFiber::with_start(64 * 1024, move || {
                    let me = slot.lock().clone().unwrap();
                    me.switch_to(&main);
                    unreachable!();
                })
                .unwrap(),
            )
        };
        *slot.lock() = Some(Arc::clone(&fiber));

        main.switch_to(&fiber);

        fiber.terminate();
        fiber.terminate();
        // Drop the carrier's own handle last; terminate already joined.
        drop(slot.lock().take());
    }
}
