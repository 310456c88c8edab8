//! Priority donation bookkeeping.
//!
//! Runs with interrupts disabled, on the thread table of the kernel.
use super::lock::{LockCore, LockId};
use crate::thread::{Donation, Priority, Tid, table::ThreadTable};
use std::sync::Arc;

/// Maximum number of holders a donation is passed through.
pub const MAX_DONATION_DEPTH: usize = 8;

/// Records that `donor` waits for `lock`, held by `holder`, and propagates
/// the donor's priority down the wait chain.
pub(crate) fn donate(threads: &mut ThreadTable, donor: Tid, holder: Tid, lock: &Arc<LockCore>) {
    let priority = threads[donor].priority;
    threads[donor].lock_on_wait = Some(lock.clone());

    let at = threads[holder]
        .donations
        .iter()
        .position(|d| threads[d.donor].priority < priority)
        .unwrap_or(threads[holder].donations.len());
    threads[holder].donations.insert(
        at,
        Donation {
            donor,
            lock: lock.id,
        },
    );
    propagate(threads, donor);
}

/// Raises the priority of every holder on the wait chain of `donor` to the
/// donor's priority.
pub(crate) fn propagate(threads: &mut ThreadTable, donor: Tid) {
    let priority = threads[donor].priority;
    let mut waiter = donor;
    for _ in 0..MAX_DONATION_DEPTH {
        let Some(holder) = next_holder(threads, waiter) else {
            return;
        };
        let th = &mut threads[holder];
        if th.priority < priority {
            th.priority = priority;
        }
        waiter = holder;
    }
    if next_holder(threads, waiter).is_some() {
        log::warn!(
            "donation of thread {donor} stopped at thread {waiter} after {MAX_DONATION_DEPTH} hops"
        );
    }
}

fn next_holder(threads: &ThreadTable, waiter: Tid) -> Option<Tid> {
    threads[waiter]
        .lock_on_wait
        .as_ref()
        .and_then(|lock| lock.holder())
}

/// Drops the donations `holder` received through `lock` and recomputes its
/// priority.
pub(crate) fn revoke(threads: &mut ThreadTable, holder: Tid, lock: LockId) {
    threads[holder].donations.retain(|d| d.lock != lock);
    retrieve(threads, holder);
}

/// Recomputes the effective priority of `tid`: the priority of its highest
/// remaining donor, or its own priority once no donor is left.
pub(crate) fn retrieve(threads: &mut ThreadTable, tid: Tid) {
    let mut donations = std::mem::take(&mut threads[tid].donations);
    donations.sort_by_key(|d| std::cmp::Reverse(threads[d.donor].priority));
    let donated = donations.first().map(|d| threads[d.donor].priority);

    let th = &mut threads[tid];
    th.donations = donations;
    th.priority = donated.unwrap_or(th.actual_priority);
}

/// Sets the priority `tid` assigns itself.
///
/// While donors wait on the thread, its effective priority does not drop
/// below the highest donor.
pub(crate) fn set_actual_priority(threads: &mut ThreadTable, tid: Tid, priority: Priority) {
    let donated = threads[tid]
        .donations
        .iter()
        .map(|d| threads[d.donor].priority)
        .max();
    let th = &mut threads[tid];
    th.actual_priority = priority;
    th.priority = donated.map_or(priority, |p| p.max(priority));
}
