// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Object pools handing out reference-counted [`Loan`]s.
//!
//! [`BoundedPool`] holds a fixed number of items and blocks (fiber-aware)
//! when empty; [`UnboundedPool`] grows on demand and never blocks.

use std::cell::UnsafeCell;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::sync::condition_variable::ConditionVariable;

/// Controls whether pool items are constructed and destructed each time
/// they are borrowed and returned, or persist for the lifetime of the
/// pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PoolPolicy {
    /// Construct the item on borrow and drop it when the item is returned;
    /// state does not persist between loans.
    Reconstruct,
    /// Construct all items once for the lifetime of the pool; items keep
    /// their state between loans.
    Preserve,
}

/// The backing data of a single item in a pool.
struct Item<T> {
    /// `Some` while the item is constructed. Mutated only when no loans
    /// exist (refcount zero).
    data: UnsafeCell<Option<T>>,
    /// Number of [`Loan`]s to this item.
    refcount: AtomicUsize,
    /// Intrusive free-list link; guarded by the storage mutex.
    next: UnsafeCell<Option<NonNull<Item<T>>>>,
}

/// Free list and backing allocations; the mutex-guarded part of
/// [`Storage`].
struct FreeList<T> {
    /// Head of the intrusive free list.
    free: Option<NonNull<Item<T>>>,
    /// Every item ever allocated. Items are heap-allocated individually so
    /// their addresses are stable for the lifetime of the storage.
    items: Vec<NonNull<Item<T>>>,
}

/// The state shared between a pool and all of its loans.
struct Storage<T> {
    policy: PoolPolicy,
    inner: Mutex<FreeList<T>>,
    /// Notified when an item is returned; what a bounded `borrow` blocks
    /// on.
    returned: ConditionVariable,
}

// Safety: items are only ever mutated under the storage mutex or with the
// refcount at zero (exclusive access); loans hand out `&T` only.
unsafe impl<T: Send + Sync> Send for Storage<T> {}
// Safety: as above.
unsafe impl<T: Send + Sync> Sync for Storage<T> {}

/// A reference-counted handle to a pooled item.
///
/// Loans track the number of references to the loaned item and return the
/// item to its pool when the final reference is dropped.
pub struct Loan<T: 'static> {
    item: NonNull<Item<T>>,
    storage: Arc<Storage<T>>,
}

// Safety: a Loan only hands out `&T`; moving or sharing it across threads
// is safe whenever `&T` is.
unsafe impl<T: Send + Sync> Send for Loan<T> {}
// Safety: as above.
unsafe impl<T: Send + Sync> Sync for Loan<T> {}

/// A pool of items of type `T` with a fixed capacity of `N` items.
///
/// The pool is created fully populated; [`borrow`](BoundedPool::borrow)
/// blocks (suspending the calling fiber) while all items are out on loan.
pub struct BoundedPool<T: 'static, const N: usize> {
    storage: Arc<Storage<T>>,
}

/// A pool of items of type `T` that allocates more items whenever it runs
/// dry; [`borrow`](UnboundedPool::borrow) never blocks.
pub struct UnboundedPool<T: 'static> {
    storage: Arc<Storage<T>>,
}

// === impl Storage ===

impl<T: Default> Storage<T> {
    /// Pushes `count` freshly allocated items onto the free list.
    fn grow(free_list: &mut FreeList<T>, policy: PoolPolicy, count: usize) {
        for _ in 0..count {
            let data = match policy {
                PoolPolicy::Preserve => Some(T::default()),
                PoolPolicy::Reconstruct => None,
            };
            let item = NonNull::from(Box::leak(Box::new(Item {
                data: UnsafeCell::new(data),
                refcount: AtomicUsize::new(0),
                next: UnsafeCell::new(free_list.free),
            })));
            free_list.items.push(item);
            free_list.free = Some(item);
        }
    }

    /// Pops a free item, constructing its data under the `Reconstruct`
    /// policy. Must be called with the storage mutex held (via
    /// `free_list`).
    fn pop_free(&self, free_list: &mut FreeList<T>) -> Option<NonNull<Item<T>>> {
        let item = free_list.free?;
        // Safety: the free-list links are guarded by the storage mutex,
        // which the caller holds.
        free_list.free = unsafe { *item.as_ref().next.get() };
        if self.policy == PoolPolicy::Reconstruct {
            // Safety: a free item has no loans, so this access is
            // exclusive.
            unsafe { *item.as_ref().data.get() = Some(T::default()) };
        }
        Some(item)
    }
}

impl<T> Storage<T> {
    /// Returns an item to the free list once its last loan dropped.
    fn return_item(&self, item: NonNull<Item<T>>) {
        if self.policy == PoolPolicy::Reconstruct {
            // Safety: the last loan just dropped; no other access to the
            // data remains.
            unsafe { *item.as_ref().data.get() = None };
        }
        {
            let mut free_list = self.inner.lock();
            // Safety: the free-list links are guarded by the storage
            // mutex.
            unsafe { *item.as_ref().next.get() = free_list.free };
            free_list.free = Some(item);
        }
        self.returned.notify_one();
    }
}

impl<T> Drop for Storage<T> {
    fn drop(&mut self) {
        let free_list = self.inner.get_mut();
        for item in free_list.items.drain(..) {
            // Safety: every loan holds an `Arc<Storage>`, so none remain
            // when the storage drops; the boxes were leaked in `grow`.
            drop(unsafe { Box::from_raw(item.as_ptr()) });
        }
    }
}

// === impl Loan ===

impl<T> Loan<T> {
    fn new(item: NonNull<Item<T>>, storage: Arc<Storage<T>>) -> Self {
        // Safety: the item stays alive for as long as `storage` does, and
        // the loan holds the storage.
        unsafe { item.as_ref() }.refcount.fetch_add(1, Ordering::SeqCst);
        Self { item, storage }
    }
}

impl<T> Deref for Loan<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the item is constructed for the whole lifetime of the
        // loan, and nothing mutates it while loans exist.
        unsafe { (*self.item.as_ref().data.get()).as_ref() }.expect("pool item is not constructed")
    }
}

impl<T> Clone for Loan<T> {
    fn clone(&self) -> Self {
        Self::new(self.item, Arc::clone(&self.storage))
    }
}

impl<T> Drop for Loan<T> {
    fn drop(&mut self) {
        // Safety: see Loan::new.
        let refs = unsafe { self.item.as_ref() }
            .refcount
            .fetch_sub(1, Ordering::SeqCst);
        debug_assert!(refs > 0, "loan refcount underflow");
        if refs == 1 {
            self.storage.return_item(self.item);
        }
    }
}

// === impl BoundedPool ===

impl<T: Default, const N: usize> BoundedPool<T, N> {
    pub fn new(policy: PoolPolicy) -> Self {
        let mut free_list = FreeList {
            free: None,
            items: Vec::with_capacity(N),
        };
        Storage::grow(&mut free_list, policy, N);
        Self {
            storage: Arc::new(Storage {
                policy,
                inner: Mutex::new(free_list),
                returned: ConditionVariable::new(),
            }),
        }
    }

    /// Borrows a single item from the pool, blocking until an item is
    /// returned if the pool is empty.
    pub fn borrow(&self) -> Loan<T> {
        let mut out = None;
        self.borrow_n(1, |loan| out = Some(loan));
        out.expect("borrow_n(1) yields one loan")
    }

    /// Borrows `count` items from the pool, blocking until enough items
    /// are available, and calls `f` with each borrowed item.
    pub fn borrow_n<F>(&self, count: usize, mut f: F)
    where
        F: FnMut(Loan<T>),
    {
        let mut free_list = self.storage.inner.lock();
        for _ in 0..count {
            self.storage
                .returned
                .wait(&mut free_list, |fl| fl.free.is_some());
            let item = self
                .storage
                .pop_free(&mut free_list)
                .expect("free list is non-empty");
            f(Loan::new(item, Arc::clone(&self.storage)));
        }
    }

    /// Attempts to borrow a single item from the pool without blocking;
    /// `None` if the pool is empty.
    pub fn try_borrow(&self) -> Option<Loan<T>> {
        let mut free_list = self.storage.inner.lock();
        let item = self.storage.pop_free(&mut free_list)?;
        Some(Loan::new(item, Arc::clone(&self.storage)))
    }
}

impl<T: Default, const N: usize> Default for BoundedPool<T, N> {
    fn default() -> Self {
        Self::new(PoolPolicy::Reconstruct)
    }
}

impl<T, const N: usize> Clone for BoundedPool<T, N> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
        }
    }
}

// === impl UnboundedPool ===

impl<T: Default> UnboundedPool<T> {
    pub fn new(policy: PoolPolicy) -> Self {
        Self {
            storage: Arc::new(Storage {
                policy,
                inner: Mutex::new(FreeList {
                    free: None,
                    items: Vec::new(),
                }),
                returned: ConditionVariable::new(),
            }),
        }
    }

    /// Borrows a single item from the pool, allocating more items if the
    /// pool is empty. Does not block.
    pub fn borrow(&self) -> Loan<T> {
        let mut out = None;
        self.borrow_n(1, |loan| out = Some(loan));
        out.expect("borrow_n(1) yields one loan")
    }

    /// Borrows `count` items from the pool, calling `f` with each borrowed
    /// item. Does not block.
    pub fn borrow_n<F>(&self, count: usize, mut f: F)
    where
        F: FnMut(Loan<T>),
    {
        let mut free_list = self.storage.inner.lock();
        for _ in 0..count {
            if free_list.free.is_none() {
                // Amortized O(1): double the allocation, from a floor of
                // 32 items.
                let grow_by = free_list.items.len().max(32);
                Storage::grow(&mut free_list, self.storage.policy, grow_by);
            }
            let item = self
                .storage
                .pop_free(&mut free_list)
                .expect("free list was just grown");
            f(Loan::new(item, Arc::clone(&self.storage)));
        }
    }
}

impl<T: Default> Default for UnboundedPool<T> {
    fn default() -> Self {
        Self::new(PoolPolicy::Reconstruct)
    }
}

impl<T> Clone for UnboundedPool<T> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::with_scheduler;
    use crate::{WaitGroup, schedule};
    use std::time::Duration;

    #[test]
    fn bounded_try_borrow_fails_when_empty() {
        let pool: BoundedPool<u32, 2> = BoundedPool::default();
        let a = pool.try_borrow().unwrap();
        let b = pool.try_borrow().unwrap();
        assert!(pool.try_borrow().is_none());
        drop(a);
        let c = pool.try_borrow().unwrap();
        drop(b);
        drop(c);
    }

    #[test]
    fn loan_clones_share_the_item() {
        struct Slot(u32);
        impl Default for Slot {
            fn default() -> Self {
                Slot(7)
            }
        }

        let pool: UnboundedPool<Slot> = UnboundedPool::default();
        let loan = pool.borrow();
        let clone = loan.clone();
        assert_eq!(loan.0, 7);
        assert_eq!(clone.0, 7);
        drop(loan);
        // The item is only returned once the last loan drops.
        assert_eq!(clone.0, 7);
        drop(clone);
    }

    #[test]
    fn preserve_policy_keeps_state_between_loans() {
        use std::cell::Cell;

        // A single-threaded probe; Cell is fine because the pool is only
        // used from this thread.
        #[derive(Default)]
        struct Counter(Cell<u32>);

        let pool: UnboundedPool<Counter> = UnboundedPool::new(PoolPolicy::Preserve);
        {
            let loan = pool.borrow();
            loan.0.set(41);
        }
        // The free list is LIFO, so the same slot comes back.
        let loan = pool.borrow();
        assert_eq!(loan.0.get(), 41);
    }

    #[test]
    fn reconstruct_policy_resets_state_between_loans() {
        use std::cell::Cell;

        #[derive(Default)]
        struct Counter(Cell<u32>);

        let pool: UnboundedPool<Counter> = UnboundedPool::default();
        {
            let loan = pool.borrow();
            loan.0.set(41);
        }
        let loan = pool.borrow();
        assert_eq!(loan.0.get(), 0);
    }

    #[test]
    fn unbounded_pool_grows_on_demand() {
        let pool: UnboundedPool<u32> = UnboundedPool::default();
        let mut loans = Vec::new();
        pool.borrow_n(100, |loan| loans.push(loan));
        assert_eq!(loans.len(), 100);
    }

    #[test]
    fn bounded_borrow_blocks_until_a_loan_returns() {
        with_scheduler(4, || {
            const TASKS: usize = 64;
            const CAPACITY: usize = 4;

            let pool: BoundedPool<u32, CAPACITY> = BoundedPool::default();
            let outstanding = Arc::new(AtomicUsize::new(0));
            let wg = WaitGroup::new(TASKS);

            for _ in 0..TASKS {
                let pool = pool.clone();
                let outstanding = Arc::clone(&outstanding);
                let wg = wg.clone();
                schedule(move || {
                    let loan = pool.borrow();
                    let now = outstanding.fetch_add(1, Ordering::SeqCst) + 1;
                    assert!(now <= CAPACITY, "{now} loans outstanding");
                    std::thread::sleep(Duration::from_millis(1));
                    outstanding.fetch_sub(1, Ordering::SeqCst);
                    drop(loan);
                    wg.done();
                });
            }

            wg.wait();
        });
    }
}
