//! # Mutex.
//!
//! A [`Mutex`] couples a [`Lock`] with the data it protects. The data can only
//! be reached through a [`MutexGuard`], and the guard exists only while the
//! lock is held.
//!
//! As with [`SpinLockGuard`], a [`MutexGuard`] is **not** released on drop:
//! it must be released explicitly with [`MutexGuard::unlock`]. Forgetting to
//! do so panics.
//!
//! [`SpinLockGuard`]: super::SpinLockGuard
use super::{AsLock, lock::Lock};
use abyss::spinlock::WouldBlock;
use std::{
    cell::UnsafeCell,
    marker::PhantomData,
    ops::{Deref, DerefMut},
};

/// A mutual exclusion primitive useful for protecting shared data
///
/// This mutex will block threads waiting for the lock to become available,
/// donating their priority to the holder.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use keos::{sync::Mutex, thread::ThreadBuilder};
///
/// let data = Arc::new(Mutex::new(0));
/// let c_data = Arc::clone(&data);
/// ThreadBuilder::new("work")
///     .spawn(move || {
///         let mut guard = c_data.lock();
///         *guard += 1;
///         // the lock must be "explicitly" unlocked.
///         guard.unlock();
///     })
///     .unwrap()
///     .join();
/// ```
pub struct Mutex<T> {
    lock: Lock,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> Mutex<T> {
    /// Creates a new mutex in an unlocked state ready for use.
    pub fn new(t: T) -> Mutex<T> {
        Mutex {
            lock: Lock::new(),
            data: UnsafeCell::new(t),
        }
    }

    /// Acquires a mutex, blocking the current thread until it is able to do
    /// so.
    ///
    /// # Panics
    /// If the current thread already holds the mutex.
    #[track_caller]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.lock.acquire();
        MutexGuard {
            mutex: self,
            _not_send: PhantomData,
        }
    }

    /// Attempts to acquire this lock.
    ///
    /// # Errors
    ///
    /// If the mutex could not be acquired because it is already locked, then
    /// this call will return the [`WouldBlock`] error.
    #[track_caller]
    pub fn try_lock(&self) -> Result<MutexGuard<'_, T>, WouldBlock> {
        if self.lock.try_acquire() {
            Ok(MutexGuard {
                mutex: self,
                _not_send: PhantomData,
            })
        } else {
            Err(WouldBlock)
        }
    }

    /// Consumes this mutex, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T> AsLock for Mutex<T> {
    fn as_lock(&self) -> &Lock {
        &self.lock
    }
}

/// An implementation of a "scoped lock" of a mutex. When this structure
/// is dropped (falls out of scope) without unlock, panic occurs.
///
/// This structure is created by the [`lock`] and [`try_lock`] methods on
/// [`Mutex`].
///
/// [`lock`]: Mutex::lock
/// [`try_lock`]: Mutex::try_lock
pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
    _not_send: PhantomData<*const ()>,
}

unsafe impl<T: Sync> Sync for MutexGuard<'_, T> {}

impl<'a, T> MutexGuard<'a, T> {
    /// Releases the underlying [`Mutex`].
    pub fn unlock(self) {
        self.mutex.lock.release();
        std::mem::forget(self);
    }

    pub(crate) fn mutex(&self) -> &'a Mutex<T> {
        self.mutex
    }
}

impl<T> AsLock for MutexGuard<'_, T> {
    fn as_lock(&self) -> &Lock {
        &self.mutex.lock
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            panic!("`.unlock()` must be explicitly called before dropping MutexGuard.");
        }
    }
}
