//! # Semaphore.
//!
//! A **semaphore** is a nonnegative counter together with two atomic
//! operators:
//!
//! - [`Semaphore::down`] ("P"): waits for the value to become positive, then
//!   decrements it.
//! - [`Semaphore::up`] ("V"): increments the value and wakes up one waiting
//!   thread, if any.
//!
//! A semaphore initialized to zero serves as an event: one thread downs it to
//! wait for the event, and another ups it when the event has occurred. A
//! semaphore initialized to `n` bounds the number of concurrent users of a
//! resource to `n`.
//!
//! Waiters are woken in **priority order**: [`Semaphore::up`] wakes the waiter
//! with the highest priority at the time of the call, so a priority donated
//! to a waiter after it started waiting is honored. Waiters of the same
//! priority are woken in arrival order.
//!
//! #### Usage Example
//!
//! ```
//! use keos::{Kernel, SystemConfiguration, sync::Semaphore, thread::ThreadBuilder};
//! use std::sync::Arc;
//!
//! Kernel::start(SystemConfiguration::default(), || {
//!     let sema = Arc::new(Semaphore::new(0));
//!     let s = sema.clone();
//!     ThreadBuilder::new("signaler").spawn(move || s.up()).unwrap();
//!     sema.down(); // Returns once "signaler" ran.
//! })
//! .unwrap();
//! ```
use crate::thread::{Membership, Tid, local};
use abyss::{interrupt::InterruptGuard, spinlock::SpinLock};
use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU64, Ordering},
};

/// Identity of a semaphore, recorded in the [`Membership`] of its waiters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SemaId(u64);

struct SemaphoreInner {
    value: usize,
    waiters: VecDeque<Tid>,
}

/// Counting semaphore.
pub struct Semaphore {
    id: SemaId,
    inner: SpinLock<SemaphoreInner>,
}

impl Semaphore {
    /// Creates a new semaphore initialized to `value`.
    pub fn new(value: usize) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(0);
        Self {
            id: SemaId(NEXT_ID.fetch_add(1, Ordering::Relaxed)),
            inner: SpinLock::new(SemaphoreInner {
                value,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Identity of this semaphore.
    pub fn id(&self) -> SemaId {
        self.id
    }

    /// Waits for the value to become positive and then decrements it.
    ///
    /// Must not be called in an interrupt context.
    pub fn down(&self) {
        let local = local();
        let kernel = &local.kernel;
        assert!(
            !kernel.cpu().in_interrupt(),
            "Try to down a semaphore in an interrupt context."
        );

        let _guard = InterruptGuard::new(kernel.cpu());
        loop {
            let mut inner = self.inner.lock();
            if inner.value > 0 {
                inner.value -= 1;
                inner.unlock();
                break;
            }
            kernel.with_state(|s| s.insert_by_priority(&mut inner.waiters, local.tid));
            inner.unlock();
            kernel.block(&local, Membership::Semaphore(self.id));
        }
    }

    /// Decrements the value if it is positive, without waiting.
    ///
    /// Returns true on success. May be called in an interrupt context.
    pub fn try_down(&self) -> bool {
        let mut inner = self.inner.lock();
        let success = inner.value > 0;
        if success {
            inner.value -= 1;
        }
        inner.unlock();
        success
    }

    /// Increments the value and wakes up the highest-priority waiter.
    ///
    /// If the woken thread has a higher priority than the caller, the caller
    /// yields; in an interrupt context it yields when the handler returns.
    pub fn up(&self) {
        let local = local();
        let kernel = &local.kernel;
        let _guard = InterruptGuard::new(kernel.cpu());

        let mut inner = self.inner.lock();
        if !inner.waiters.is_empty() {
            kernel.with_state(|s| {
                s.sort_by_priority(&mut inner.waiters);
                if let Some(tid) = inner.waiters.pop_front() {
                    s.make_ready(tid);
                }
            });
        }
        inner.value += 1;
        inner.unlock();
        kernel.preempt();
    }

    /// Snapshot of the value.
    pub fn value(&self) -> usize {
        let inner = self.inner.lock();
        let value = inner.value;
        inner.unlock();
        value
    }

    /// Downs the semaphore and returns a guard that ups it when dropped.
    pub fn wait(&self) -> SemaphorePermits<'_> {
        self.down();
        SemaphorePermits { sema: self }
    }
}

/// An RAII implementation of a "scoped semaphore". When this structure
/// is dropped (falls out of scope), the semaphore will be upped.
///
/// This structure is created by the [`wait`] method on [`Semaphore`].
///
/// [`wait`]: Semaphore::wait
pub struct SemaphorePermits<'a> {
    sema: &'a Semaphore,
}

impl Drop for SemaphorePermits<'_> {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            self.sema.up();
        }
    }
}
