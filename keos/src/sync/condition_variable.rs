//! # Condition variable.
//!
//! A condition variable lets a thread wait, without consuming CPU time, until
//! another thread tells it that some condition *may* have become true. It is
//! always used together with a lock that protects the condition:
//!
//! ```ignore
//! lock.acquire();
//! while !condition() {
//!     cv.wait(&lock);
//! }
//! // ...
//! lock.release();
//! ```
//!
//! KeOS condition variables follow **Mesa semantics**: signaling a waiter does
//! not hand the lock over atomically. By the time the waiter reacquires the
//! lock, the condition may have changed again, so it must be re-checked in a
//! loop. [`ConditionVariable::wait_while`] writes that loop for you.
//!
//! Each waiter sleeps on its own semaphore. [`ConditionVariable::signal`]
//! wakes the waiter whose thread has the highest priority at the time of the
//! call.
use super::{
    AsLock,
    mutex::{Mutex, MutexGuard},
    semaphore::Semaphore,
};
use crate::thread::{Tid, local};
use abyss::spinlock::SpinLock;
use std::{collections::VecDeque, sync::Arc};

struct Waiter {
    tid: Tid,
    sema: Arc<Semaphore>,
}

/// A Condition Variable
///
/// Note that any attempt to use multiple locks on the same condition
/// variable at the same time is a bug.
#[derive(Default)]
pub struct ConditionVariable {
    waiters: SpinLock<VecDeque<Waiter>>,
}

impl ConditionVariable {
    /// Creates a new condition variable which is ready to be waited on and
    /// signaled.
    pub fn new() -> Self {
        Self {
            waiters: SpinLock::new(VecDeque::new()),
        }
    }

    /// Atomically releases `lock` and waits to be signaled, then reacquires
    /// `lock` before returning.
    ///
    /// # Panics
    /// If the current thread does not hold `lock`, or in an interrupt context.
    #[track_caller]
    pub fn wait(&self, lock: &impl AsLock) {
        let lock = lock.as_lock();
        let local = local();
        let kernel = &local.kernel;
        assert!(
            !kernel.cpu().in_interrupt(),
            "Try to wait on a condition variable in an interrupt context."
        );
        assert!(
            lock.held_by_current(),
            "Try to wait on a condition variable without holding its lock."
        );

        let sema = Arc::new(Semaphore::new(0));
        let mut waiters = self.waiters.lock();
        kernel.with_state(|s| {
            let priority = s.threads[local.tid].priority;
            let at = waiters
                .iter()
                .position(|w| s.threads[w.tid].priority < priority)
                .unwrap_or(waiters.len());
            waiters.insert(
                at,
                Waiter {
                    tid: local.tid,
                    sema: sema.clone(),
                },
            );
        });
        waiters.unlock();

        lock.release();
        sema.down();
        lock.acquire();
    }

    /// Blocks the current thread while `predicate` returns `true`.
    ///
    /// This function locks `mutex` and checks the predicate. If it returns
    /// `true`, the thread waits and the mutex is temporarily released. When
    /// the thread is signaled and wakes up, it reacquires the mutex and
    /// re-evaluates the predicate. This loop continues until the predicate
    /// returns `false`.
    ///
    /// # Example
    /// ```ignore
    /// let guard = condvar.wait_while(&mutex, |state| state.count == 0);
    /// ```
    pub fn wait_while<'a, T>(
        &self,
        mutex: &'a Mutex<T>,
        mut predicate: impl FnMut(&mut T) -> bool,
    ) -> MutexGuard<'a, T> {
        let mut guard = mutex.lock();
        while predicate(&mut *guard) {
            self.wait(guard.mutex());
        }
        guard
    }

    /// Wakes up the highest-priority thread waiting on this condition
    /// variable, if any.
    ///
    /// # Panics
    /// If the current thread does not hold `lock`.
    #[track_caller]
    pub fn signal(&self, lock: &impl AsLock) {
        assert!(
            lock.as_lock().held_by_current(),
            "Try to signal a condition variable without holding its lock."
        );
        let local = local();
        let mut waiters = self.waiters.lock();
        let woken = if waiters.is_empty() {
            None
        } else {
            local.kernel.with_state(|s| {
                waiters
                    .make_contiguous()
                    .sort_by_key(|w| std::cmp::Reverse(s.threads[w.tid].priority));
            });
            waiters.pop_front()
        };
        waiters.unlock();
        if let Some(waiter) = woken {
            waiter.sema.up();
        }
    }

    /// Wakes up all threads waiting on this condition variable.
    ///
    /// # Panics
    /// If the current thread does not hold `lock`.
    #[track_caller]
    pub fn broadcast(&self, lock: &impl AsLock) {
        loop {
            let waiters = self.waiters.lock();
            let empty = waiters.is_empty();
            waiters.unlock();
            if empty {
                break;
            }
            self.signal(lock);
        }
    }
}
