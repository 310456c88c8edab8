//! The virtual timer.
//!
//! The timer interrupts the CPU [`TIMER_FREQ`] times per virtual second. On
//! every tick, the interrupt handler
//! 1. advances the tick counter,
//! 2. charges the tick to the running thread (and updates the MLFQS
//!    statistics),
//! 3. wakes up the sleepers whose time has come, and
//! 4. asks the running thread to yield on return if its time slice expired
//!    or a higher-priority thread became ready.
//!
//! Ticks are not tied to wall-clock time. A thread consumes ticks by
//! computing, which [`spin`] simulates; when no thread is ready, the idle
//! thread lets ticks pass until a sleeper wakes up.
//!
//! [`TIMER_FREQ`]: crate::TIMER_FREQ
use crate::{TickStats, kernel::Kernel, thread::Membership};
use abyss::interrupt::{InterruptContext, InterruptGuard, InterruptState};

/// Ticks since boot.
pub fn ticks() -> i64 {
    crate::thread::local().kernel.ticks()
}

/// Ticks elapsed since `then`, a value once returned by [`ticks`].
pub fn elapsed(then: i64) -> i64 {
    ticks() - then
}

/// Where the ticks since boot went.
pub fn stats() -> TickStats {
    crate::thread::local().kernel.stats()
}

/// Sleeps for approximately `ticks` timer ticks.
///
/// The thread is blocked, not busy-waiting, and becomes ready on the first
/// tick at or after `ticks() + ticks`. Returns immediately if `ticks` is not
/// positive.
pub fn sleep(ticks: i64) {
    if ticks <= 0 {
        return;
    }
    let local = crate::thread::local();
    let kernel = &local.kernel;
    assert_eq!(
        InterruptState::current(kernel.cpu()),
        InterruptState::On,
        "Try to sleep with interrupts disabled."
    );
    let _guard = InterruptGuard::new(kernel.cpu());
    let wake_time = kernel.ticks() + ticks;
    kernel.with_state(|s| s.sleepers.insert(wake_time, local.tid));
    kernel.block(&local, Membership::Sleeping);
}

/// Burns CPU time for `ticks` timer ticks.
///
/// Each tick is delivered to the calling thread, which may be preempted in
/// between. Wall-clock ticks that pass while other threads run are not
/// counted.
pub fn spin(ticks: i64) {
    let local = crate::thread::local();
    for _ in 0..ticks {
        assert_eq!(
            InterruptState::current(local.kernel.cpu()),
            InterruptState::On,
            "Try to spin with interrupts disabled."
        );
        interrupt(&local.kernel);
    }
}

/// The timer interrupt handler.
pub(crate) fn interrupt(kernel: &Kernel) {
    let frame = InterruptContext::enter(kernel.cpu());
    let now = kernel.advance_clock();
    let config = kernel.config();
    let reschedule =
        kernel.with_state(|s| s.on_tick(now, config.timer_freq(), config.time_slice()));
    if reschedule {
        kernel.cpu().request_yield_on_return();
    }
    drop(frame);

    if kernel.cpu().take_yield_on_return() {
        kernel.yield_now();
    }
}
