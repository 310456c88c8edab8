//! # Synchronization Primitives.
//!
//! Kernel threads coordinate access to shared state with the primitives of
//! this module. Except for the [`SpinLock`], every primitive puts a waiting
//! thread to sleep instead of polling, and wakes waiters in priority order.
//!
//! | Primitive             | Blocks Thread? | Wake order          | Typical Use Case                                  |
//! |-----------------------|----------------|---------------------|---------------------------------------------------|
//! | [`SpinLock`]          | No (busy wait) | None                | Short critical sections inside the kernel         |
//! | [`Semaphore`]         | Yes            | Priority, then FIFO | Events, joins and bounded resources               |
//! | [`Lock`]              | Yes            | Priority, then FIFO | Mutual exclusion with priority donation           |
//! | [`Mutex`]             | Yes            | Priority, then FIFO | Exclusive access to the data it owns              |
//! | [`ConditionVariable`] | Yes            | Priority, then FIFO | Waiting for a condition while holding a [`Lock`]  |
//!
//! - **Semaphore** is the building block: [`Lock`] and [`ConditionVariable`]
//!   are built on top of it.
//! - **Lock** adds an owner to a binary semaphore. Threads blocked on a lock
//!   donate their priority to its holder, see [`lock`].
//! - **Mutex** wraps a [`Lock`] around the data it protects.
//! - **ConditionVariable** releases the lock while waiting and reacquires it
//!   before returning.
//!
//! None of the sleeping primitives may be acquired from an interrupt context.
//! [`Semaphore::up`] and [`Semaphore::try_down`] may be.
//!
//! [`lock`]: self::lock
pub mod condition_variable;
pub mod donation;
pub mod lock;
pub mod mutex;
pub mod semaphore;

pub use abyss::spinlock::{SpinLock, SpinLockGuard, WouldBlock};
pub use condition_variable::ConditionVariable;
pub use lock::Lock;
pub use mutex::{Mutex, MutexGuard};
pub use semaphore::{Semaphore, SemaphorePermits};

/// Types that are backed by a [`Lock`].
///
/// A [`ConditionVariable`] accepts either a bare [`Lock`] or a [`Mutex`] and
/// its [`MutexGuard`].
pub trait AsLock {
    /// The lock backing `self`.
    fn as_lock(&self) -> &Lock;
}

impl AsLock for Lock {
    fn as_lock(&self) -> &Lock {
        self
    }
}
