//! # Multi-level feedback queue scheduler.
//!
//! The MLFQS scheduler computes priorities instead of taking them from the
//! threads. A thread that used a lot of CPU time recently gets a lower
//! priority, so I/O-bound and interactive threads win over CPU hogs without
//! any thread setting its own priority.
//!
//! Three quantities drive the scheduler, all kept in [`Fixed`] point:
//!
//! - `recent_cpu` of each thread: incremented on every tick the thread runs,
//!   and decayed once per second:
//!   ```text
//!   recent_cpu = (2 * load_avg) / (2 * load_avg + 1) * recent_cpu + nice
//!   ```
//! - `load_avg` of the system: the moving average of the number of threads
//!   ready to run (including the running one, excluding idle), updated once
//!   per second:
//!   ```text
//!   load_avg = (59 / 60) * load_avg + (1 / 60) * ready_threads
//!   ```
//! - `priority` of each thread, recomputed every
//!   [`PRIORITY_UPDATE_INTERVAL`] ticks and whenever its niceness changes:
//!   ```text
//!   priority = PRI_MAX - recent_cpu / 4 - nice * 2
//!   ```
//!   rounded to the nearest integer and clamped to [`PRI_MIN`, `PRI_MAX`].
//!
//! The ready queue itself is the one of the priority scheduler: the first
//! thread of the highest priority runs next. Priority donation is disabled
//! and [`Current::set_priority`] has no effect.
//!
//! [`Current::set_priority`]: super::Current::set_priority
use super::{
    PRI_MAX, PRI_MIN, Priority, Thread, Tid,
    scheduler::{PriorityScheduler, Scheduler, Tick},
    table::ThreadTable,
};
use crate::fixed_point::Fixed;

/// Ticks between two priority recomputations.
pub const PRIORITY_UPDATE_INTERVAL: i64 = 4;

/// The load average one second after `load_avg`, with `ready` threads ready
/// to run.
pub fn next_load_avg(load_avg: Fixed, ready: i32) -> Fixed {
    Fixed::from_int(59) / 60 * load_avg + Fixed::from_int(ready) / 60
}

/// Decays `recent_cpu` of a thread with niceness `nice`.
pub fn decay_recent_cpu(recent_cpu: Fixed, load_avg: Fixed, nice: i32) -> Fixed {
    let twice_load = load_avg * 2;
    twice_load / (twice_load + 1) * recent_cpu + nice
}

/// The priority of a thread with the given `recent_cpu` and `nice`.
pub fn priority(recent_cpu: Fixed, nice: i32) -> Priority {
    let p = (Fixed::from_int(PRI_MAX as i32) - recent_cpu / 4 - nice * 2).to_int_round();
    p.clamp(PRI_MIN as i32, PRI_MAX as i32) as Priority
}

fn recompute(th: &mut Thread) {
    let p = priority(th.recent_cpu, th.nice);
    th.priority = p;
    th.actual_priority = p;
}

/// The MLFQS scheduler.
pub(crate) struct Mlfqs {
    runqueue: PriorityScheduler,
    load_avg: Fixed,
}

impl Mlfqs {
    pub(crate) fn new() -> Self {
        Self {
            runqueue: PriorityScheduler::new(),
            load_avg: Fixed::ZERO,
        }
    }
}

impl Scheduler for Mlfqs {
    fn next_to_run(&mut self, threads: &ThreadTable) -> Option<Tid> {
        self.runqueue.next_to_run(threads)
    }

    fn push_to_queue(&mut self, tid: Tid) {
        self.runqueue.push_to_queue(tid)
    }

    fn peek_priority(&self, threads: &ThreadTable) -> Option<Priority> {
        self.runqueue.peek_priority(threads)
    }

    fn ready_threads(&self) -> usize {
        self.runqueue.ready_threads()
    }

    fn timer_tick(&mut self, threads: &mut ThreadTable, tick: &Tick) {
        if let Some(tid) = tick.running {
            let th = &mut threads[tid];
            th.recent_cpu = th.recent_cpu + 1;
        }

        if tick.now % tick.timer_freq == 0 {
            let ready = self.runqueue.ready_threads() + usize::from(tick.running.is_some());
            self.load_avg = next_load_avg(self.load_avg, ready as i32);
            for th in threads.iter_mut().filter(|th| !th.idle) {
                th.recent_cpu = decay_recent_cpu(th.recent_cpu, self.load_avg, th.nice);
            }
            log::trace!(
                "mlfqs: tick {}: load_avg {} with {ready} ready threads",
                tick.now,
                self.load_avg
            );
        }

        if tick.now % PRIORITY_UPDATE_INTERVAL == 0 {
            for th in threads.iter_mut().filter(|th| !th.idle) {
                recompute(th);
            }
        }
    }

    fn init_thread(&self, th: &mut Thread, parent: Option<&Thread>) {
        if let Some(parent) = parent {
            th.nice = parent.nice;
            th.recent_cpu = parent.recent_cpu;
        }
        if !th.idle {
            recompute(th);
        }
    }

    fn on_nice_change(&self, th: &mut Thread) {
        recompute(th);
    }

    fn donation_enabled(&self) -> bool {
        false
    }

    fn load_avg(&self) -> Fixed {
        self.load_avg
    }
}
