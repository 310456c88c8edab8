//! # Lock with priority donation.
//!
//! A [`Lock`] is a semaphore with an initial value of one and an **owner**:
//! only the thread that acquired a lock may release it, and a thread may not
//! acquire a lock it already holds.
//!
//! ## Priority inversion
//!
//! Consider three threads H, M and L with high, medium and low priority. If
//! L holds a lock that H waits for, and M is ready, M runs forever while H
//! waits for L, which never gets the CPU. To avoid this, a thread that blocks
//! on a held lock **donates** its priority to the holder:
//!
//! - The donation follows the wait chain: if the holder itself waits for
//!   another lock, the donation continues to that holder, up to
//!   [`MAX_DONATION_DEPTH`] hops.
//! - A thread may receive donations through several locks at once. Its
//!   effective priority is the maximum of its own priority and its donors'.
//! - Releasing a lock drops the donations made through that lock only.
//!
//! Under the MLFQS scheduler, priorities are computed by the scheduler and no
//! donation takes place.
//!
//! [`Lock::try_acquire`] never donates.
//!
//! [`MAX_DONATION_DEPTH`]: super::donation::MAX_DONATION_DEPTH
use super::{donation, semaphore::Semaphore};
use crate::thread::{Tid, local};
use abyss::interrupt::InterruptGuard;
use crossbeam_utils::atomic::AtomicCell;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

/// Identity of a lock, recorded in donation edges.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockId(u64);

/// The part of a lock that waiting threads point to.
pub(crate) struct LockCore {
    pub(crate) id: LockId,
    holder: AtomicCell<Option<Tid>>,
    sema: Semaphore,
}

impl LockCore {
    pub(crate) fn holder(&self) -> Option<Tid> {
        self.holder.load()
    }
}

/// A sleeping mutual exclusion lock.
pub struct Lock {
    core: Arc<LockCore>,
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

impl Lock {
    /// Creates an unlocked lock.
    pub fn new() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(0);
        Self {
            core: Arc::new(LockCore {
                id: LockId(NEXT_ID.fetch_add(1, Ordering::Relaxed)),
                holder: AtomicCell::new(None),
                sema: Semaphore::new(1),
            }),
        }
    }

    /// Identity of this lock.
    pub fn id(&self) -> LockId {
        self.core.id
    }

    /// Acquires the lock, sleeping until it becomes available.
    ///
    /// If another thread holds the lock, the caller donates its priority to
    /// the holder while it waits.
    ///
    /// # Panics
    /// If the lock is already held by the caller, or in an interrupt context.
    #[track_caller]
    pub fn acquire(&self) {
        let local = local();
        let kernel = &local.kernel;
        assert!(
            !kernel.cpu().in_interrupt(),
            "Try to acquire a lock in an interrupt context."
        );
        assert!(
            !self.held_by_current(),
            "Lock is already held by the current thread (tid {}).",
            local.tid
        );

        let _guard = InterruptGuard::new(kernel.cpu());
        if let Some(holder) = self.core.holder() {
            kernel.with_state(|s| {
                if s.scheduler.donation_enabled() {
                    donation::donate(&mut s.threads, local.tid, holder, &self.core);
                }
            });
        }
        self.core.sema.down();
        kernel.with_state(|s| s.threads[local.tid].lock_on_wait = None);
        self.core.holder.store(Some(local.tid));
    }

    /// Tries to acquire the lock without sleeping.
    ///
    /// Returns true on success. No priority is donated on failure.
    ///
    /// # Panics
    /// If the lock is already held by the caller.
    #[track_caller]
    pub fn try_acquire(&self) -> bool {
        let local = local();
        assert!(
            !self.held_by_current(),
            "Lock is already held by the current thread (tid {}).",
            local.tid
        );
        let success = self.core.sema.try_down();
        if success {
            self.core.holder.store(Some(local.tid));
        }
        success
    }

    /// Releases the lock.
    ///
    /// Donations received through this lock are dropped, and the caller's
    /// priority is recomputed from what remains.
    ///
    /// # Panics
    /// If the caller does not hold the lock.
    #[track_caller]
    pub fn release(&self) {
        assert!(
            self.held_by_current(),
            "Try to release a lock that is not held by the current thread."
        );
        let local = local();
        let kernel = &local.kernel;
        let _guard = InterruptGuard::new(kernel.cpu());
        kernel.with_state(|s| {
            if s.scheduler.donation_enabled() {
                donation::revoke(&mut s.threads, local.tid, self.core.id);
            }
        });
        self.core.holder.store(None);
        self.core.sema.up();
    }

    /// Returns true if the current thread holds this lock.
    pub fn held_by_current(&self) -> bool {
        self.core.holder() == Some(local().tid)
    }

    /// Snapshot of the holder.
    pub fn holder(&self) -> Option<Tid> {
        self.core.holder()
    }
}
