//! Thread scheduler
//!
//! The scheduler keeps every ready thread on a single ready queue in arrival
//! order. When the CPU becomes free, it picks the **first thread with the
//! highest priority**. Priorities are read at pick time, so a thread whose
//! priority changed while it was waiting (e.g., by donation) is still picked
//! correctly, and threads of equal priority run in round-robin order.
//!
//! A thread leaves the CPU in one of four ways:
//!
//! | Path                         | Status after | Queued on             |
//! |------------------------------|--------------|-----------------------|
//! | [`Current::yield_now`]       | Ready        | back of ready queue   |
//! | blocking (semaphore, sleep)  | Blocked      | the waited object     |
//! | preemption (timer, wake-up)  | Ready        | back of ready queue   |
//! | exit                         | Dying        | nothing; slot freed   |
//!
//! When nothing is ready, the idle thread runs. It waits for the next timer
//! interrupt, which advances the clock and wakes sleepers.
//!
//! [`Current::yield_now`]: super::Current::yield_now
use super::{
    KernelHalted, Local, Membership, PRI_MIN, Priority, Thread, ThreadStatus, Tid, install,
    table::ThreadTable, uninstall,
};
use crate::{
    KernelError, fixed_point::Fixed, kernel::Kernel, kernel::KernelState, timer,
};
use abyss::interrupt::{InterruptGuard, InterruptState};
use crossbeam_utils::sync::{Parker, Unparker};
use std::{
    collections::VecDeque,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

/// What happened on a timer tick.
pub(crate) struct Tick {
    /// The tick count after this tick.
    pub(crate) now: i64,
    /// The interrupted thread, unless it is the idle thread.
    pub(crate) running: Option<Tid>,
    /// Timer interrupts per second.
    pub(crate) timer_freq: i64,
}

/// A trait for a thread scheduler.
///
/// The [`Scheduler`] trait defines which thread runs next and how priorities
/// evolve with time. Strict priority scheduling and the multi-level feedback
/// queue scheduler share the ready queue discipline and differ on the timer
/// tick and on how priorities are set.
pub(crate) trait Scheduler {
    /// Pops the next thread to run, or `None` if no thread is ready.
    fn next_to_run(&mut self, threads: &ThreadTable) -> Option<Tid>;

    /// Push a thread `tid` into scheduling queue.
    fn push_to_queue(&mut self, tid: Tid);

    /// The highest priority among ready threads.
    fn peek_priority(&self, threads: &ThreadTable) -> Option<Priority>;

    /// Number of ready threads.
    fn ready_threads(&self) -> usize;

    /// Called on every timer interrupt, before sleepers wake up.
    fn timer_tick(&mut self, _threads: &mut ThreadTable, _tick: &Tick) {}

    /// Sets up the scheduling state of a new thread created by `parent`.
    fn init_thread(&self, _th: &mut Thread, _parent: Option<&Thread>) {}

    /// Called when the niceness of `th` changed.
    fn on_nice_change(&self, _th: &mut Thread) {}

    /// Whether locks donate priorities, and threads may set their own.
    fn donation_enabled(&self) -> bool {
        true
    }

    /// System load average.
    fn load_avg(&self) -> Fixed {
        Fixed::ZERO
    }
}

/// Strict priority scheduler.
pub(crate) struct PriorityScheduler {
    runqueue: VecDeque<Tid>,
}

impl PriorityScheduler {
    pub(crate) fn new() -> Self {
        Self {
            runqueue: VecDeque::new(),
        }
    }
}

impl Scheduler for PriorityScheduler {
    fn next_to_run(&mut self, threads: &ThreadTable) -> Option<Tid> {
        let mut best: Option<(usize, Priority)> = None;
        for (idx, tid) in self.runqueue.iter().enumerate() {
            let priority = threads[*tid].priority;
            if best.is_none_or(|(_, p)| priority > p) {
                best = Some((idx, priority));
            }
        }
        best.and_then(|(idx, _)| self.runqueue.remove(idx))
    }

    fn push_to_queue(&mut self, tid: Tid) {
        self.runqueue.push_back(tid);
    }

    fn peek_priority(&self, threads: &ThreadTable) -> Option<Priority> {
        self.runqueue.iter().map(|tid| threads[*tid].priority).max()
    }

    fn ready_threads(&self) -> usize {
        self.runqueue.len()
    }
}

/// Threads sleeping on the timer, ordered by wake-up time.
pub(crate) struct SleepQueue {
    sleepers: VecDeque<(i64, Tid)>,
}

impl SleepQueue {
    pub(crate) fn new() -> Self {
        Self {
            sleepers: VecDeque::new(),
        }
    }

    /// Adds `tid` that wakes up at tick `wake_time`, after the sleepers that
    /// wake up at the same tick.
    pub(crate) fn insert(&mut self, wake_time: i64, tid: Tid) {
        let at = self
            .sleepers
            .iter()
            .position(|(t, _)| *t > wake_time)
            .unwrap_or(self.sleepers.len());
        self.sleepers.insert(at, (wake_time, tid));
    }

    /// Removes the sleepers whose wake-up time is not after `now`.
    pub(crate) fn pop_expired(&mut self, now: i64) -> Vec<Tid> {
        let mut expired = Vec::new();
        while let Some((t, tid)) = self.sleepers.front().copied() {
            if t > now {
                break;
            }
            self.sleepers.pop_front();
            expired.push(tid);
        }
        expired
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.sleepers.is_empty()
    }
}

/// The decision of [`KernelState::switch_to_next`].
pub(crate) struct Switch {
    next: Tid,
    unparker: Unparker,
    prev_dying: bool,
}

impl KernelState {
    /// Moves the blocked thread `tid` to the ready queue.
    pub(crate) fn make_ready(&mut self, tid: Tid) {
        let th = &mut self.threads[tid];
        assert_eq!(
            th.status,
            ThreadStatus::Blocked,
            "Try to unblock thread `{}` that is not blocked.",
            th.name
        );
        th.set_status(ThreadStatus::Ready);
        th.membership = Membership::Ready;
        self.scheduler.push_to_queue(tid);
    }

    /// Returns true if a ready thread should run instead of the current one.
    pub(crate) fn should_preempt(&self) -> bool {
        match self.scheduler.peek_priority(&self.threads) {
            None => false,
            Some(_) if Some(self.current) == self.idle => true,
            Some(priority) => priority > self.threads[self.current].priority,
        }
    }

    /// Inserts `tid` into `waiters` after every thread of higher or equal
    /// priority.
    pub(crate) fn insert_by_priority(&self, waiters: &mut VecDeque<Tid>, tid: Tid) {
        let priority = self.threads[tid].priority;
        let at = waiters
            .iter()
            .position(|t| self.threads[*t].priority < priority)
            .unwrap_or(waiters.len());
        waiters.insert(at, tid);
    }

    /// Stable sort of `waiters` by current priority, highest first.
    pub(crate) fn sort_by_priority(&self, waiters: &mut VecDeque<Tid>) {
        waiters
            .make_contiguous()
            .sort_by_key(|tid| std::cmp::Reverse(self.threads[*tid].priority));
    }

    /// Picks the next thread and makes it current.
    fn switch_to_next(&mut self) -> Option<Switch> {
        let prev = self.current;
        let next = self
            .scheduler
            .next_to_run(&self.threads)
            .or(self.idle)
            .unwrap_or(prev);
        self.slice = 0;

        if next == prev {
            let th = &mut self.threads[prev];
            th.set_status(ThreadStatus::Running);
            th.membership = Membership::None;
            return None;
        }

        let prev_dying = self.threads[prev].status == ThreadStatus::Dying;
        if prev_dying {
            self.threads.remove(prev);
        }
        let th = &mut self.threads[next];
        th.set_status(ThreadStatus::Running);
        th.membership = Membership::None;
        self.current = next;
        log::trace!("switch: {prev} -> {next} (`{}`)", th.name);
        Some(Switch {
            next,
            unparker: th.unparker.clone(),
            prev_dying,
        })
    }

    /// Accounts a timer tick. Returns true if the running thread must yield.
    pub(crate) fn on_tick(&mut self, now: i64, timer_freq: i64, time_slice: u32) -> bool {
        let running = Some(self.current).filter(|tid| Some(*tid) != self.idle);
        if running.is_some() {
            self.stats.kernel_ticks += 1;
        } else {
            self.stats.idle_ticks += 1;
        }
        let tick = Tick {
            now,
            running,
            timer_freq,
        };
        self.scheduler.timer_tick(&mut self.threads, &tick);

        self.slice += 1;
        let expired = self.slice >= time_slice;
        for tid in self.sleepers.pop_expired(now) {
            self.make_ready(tid);
        }
        expired || self.should_preempt()
    }
}

impl Kernel {
    /// Blocks the current thread until another thread wakes it.
    ///
    /// Interrupts must be disabled; `membership` tells which queue the caller
    /// already put the thread on.
    pub(crate) fn block(&self, local: &Local, membership: Membership) {
        assert!(
            !self.cpu().in_interrupt(),
            "Try to block a thread in an interrupt context."
        );
        assert_eq!(
            InterruptState::current(self.cpu()),
            InterruptState::Off,
            "Try to block a thread without disabling interrupts."
        );
        self.with_state(|s| {
            let th = &mut s.threads[local.tid];
            th.set_status(ThreadStatus::Blocked);
            th.membership = membership;
        });
        self.schedule(local);
    }

    /// Moves the blocked thread `tid` to the ready queue, without preemption.
    pub(crate) fn wake(&self, tid: Tid) {
        self.with_state(|s| s.make_ready(tid));
    }

    /// Gives the CPU to a ready thread with a higher priority, if any.
    ///
    /// In an interrupt handler, the yield is deferred until the handler
    /// returns.
    pub(crate) fn preempt(&self) {
        if self.with_state(|s| s.should_preempt()) {
            if self.cpu().in_interrupt() {
                self.cpu().request_yield_on_return();
            } else {
                self.yield_now();
            }
        }
    }

    /// Puts the current thread at the back of the ready queue and reschedules.
    pub(crate) fn yield_now(&self) {
        let local = super::local();
        let _guard = InterruptGuard::new(self.cpu());
        self.with_state(|s| {
            let tid = s.current;
            let th = &mut s.threads[tid];
            if Some(tid) == s.idle {
                th.set_status(ThreadStatus::Blocked);
            } else {
                th.set_status(ThreadStatus::Ready);
                th.membership = Membership::Ready;
                s.scheduler.push_to_queue(tid);
            }
        });
        self.schedule(&local);
    }

    /// Reschedule the current thread.
    ///
    /// The current thread must already be off the CPU in the books: ready,
    /// blocked, or dying.
    pub(crate) fn schedule(&self, local: &Local) {
        assert_eq!(
            InterruptState::current(self.cpu()),
            InterruptState::Off,
            "Try to reschedule a thread with interrupts enabled."
        );
        assert_eq!(
            abyss::spinlock::held_by_current_thread(),
            0,
            "Try to switch threads while holding a spinlock."
        );
        let switch = self.with_state(|s| {
            debug_assert_eq!(s.current, local.tid);
            assert_ne!(
                s.threads[local.tid].status,
                ThreadStatus::Running,
                "Try to reschedule a running thread."
            );
            s.switch_to_next()
        });
        let Some(Switch {
            next,
            unparker,
            prev_dying,
        }) = switch
        else {
            return;
        };
        if prev_dying {
            self.cpu().handoff(next, &unparker);
        } else if self
            .cpu()
            .switch(&local.parker, local.tid, next, &unparker)
            .is_err()
        {
            self.on_halted(local);
        }
    }

    /// Destroys the current thread and passes the CPU on.
    ///
    /// Returns once the CPU is handed off; the caller must not touch the
    /// kernel afterwards.
    pub(crate) fn exit_current(&self, local: &Local) {
        let exit = self.with_state(|s| s.threads[local.tid].exit.clone());
        exit.up();

        let guard = InterruptGuard::new(self.cpu());
        self.with_state(|s| s.threads[local.tid].set_status(ThreadStatus::Dying));
        log::debug!("thread {} exits", local.tid);
        // The next thread reinstalls its own interrupt state.
        std::mem::forget(guard);
        self.schedule(local);
    }

    /// Creates the idle thread.
    pub(crate) fn spawn_idle(self: &Arc<Self>) -> Result<(), KernelError> {
        let tid = self.allocate_tid();
        let parker = Parker::new();
        let mut th = Thread::new(tid, "idle", PRI_MIN, parker.unparker().clone());
        th.idle = true;
        self.with_state(|s| {
            s.threads.insert(th)?;
            s.idle = Some(tid);
            Ok::<(), KernelError>(())
        })?;

        let kernel = self.clone();
        std::thread::Builder::new()
            .name("keos:idle".into())
            .spawn(move || idle(kernel, tid, parker))
            .map(|_| ())
            .map_err(|e| {
                log::error!("cannot back the idle thread with a host thread: {e}");
                KernelError::NoMemory
            })
    }
}

/// The idle thread.
///
/// Runs only when no other thread is ready. Each iteration halts the CPU
/// until the next timer interrupt.
fn idle(kernel: Arc<Kernel>, tid: Tid, parker: Parker) {
    if kernel.cpu().wait_for_baton(&parker, tid).is_err() {
        return;
    }
    kernel.cpu().start_thread();
    install(Local {
        kernel: kernel.clone(),
        tid,
        parker,
    });
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        loop {
            let (ready, sleeping) =
                kernel.with_state(|s| (s.scheduler.ready_threads() > 0, !s.sleepers.is_empty()));
            if ready {
                kernel.yield_now();
            } else if sleeping {
                timer::interrupt(&kernel);
            } else {
                kernel.halt(Some(
                    "deadlock: every thread is blocked and no thread sleeps".into(),
                ));
                return;
            }
        }
    }));
    if let Err(payload) = outcome {
        if !payload.is::<KernelHalted>() {
            kernel.kernel_panic(tid, payload);
        }
    }
    uninstall();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(priorities: &[Priority]) -> ThreadTable {
        let mut threads = ThreadTable::new(priorities.len());
        for (tid, priority) in (1..).zip(priorities) {
            let parker = Parker::new();
            threads
                .insert(Thread::new(tid, "t", *priority, parker.unparker().clone()))
                .unwrap();
        }
        threads
    }

    #[test]
    fn picks_first_of_highest_priority() {
        let mut threads = table(&[10, 20, 20, 5]);
        let mut scheduler = PriorityScheduler::new();
        for tid in 1..=4 {
            scheduler.push_to_queue(tid);
        }
        assert_eq!(scheduler.peek_priority(&threads), Some(20));
        assert_eq!(scheduler.next_to_run(&threads), Some(2));

        // A priority raised while waiting is honored.
        threads[4].priority = 30;
        assert_eq!(scheduler.next_to_run(&threads), Some(4));
        assert_eq!(scheduler.next_to_run(&threads), Some(3));
        assert_eq!(scheduler.next_to_run(&threads), Some(1));
        assert_eq!(scheduler.next_to_run(&threads), None);
        assert_eq!(scheduler.ready_threads(), 0);
    }

    #[test]
    fn sleepers_wake_in_time_order() {
        let mut sleepers = SleepQueue::new();
        sleepers.insert(30, 1);
        sleepers.insert(10, 2);
        sleepers.insert(30, 3);
        sleepers.insert(20, 4);
        assert!(sleepers.pop_expired(9).is_empty());
        assert_eq!(sleepers.pop_expired(20), vec![2, 4]);
        assert_eq!(sleepers.pop_expired(100), vec![1, 3]);
        assert!(sleepers.is_empty());
    }
}
