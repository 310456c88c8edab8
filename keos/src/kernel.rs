//! The kernel instance.
//!
//! A [`Kernel`] owns everything the scheduler needs: the processor, the thread
//! table, the ready and sleep queues, and the clock. There are no globals, so
//! several kernels can run side by side in one host process, each on its own
//! set of host threads.
use crate::{
    KernelError, SchedulerMode, SystemConfiguration,
    thread::{
        self, KernelHalted, Local, PRI_DEFAULT, Thread, ThreadStatus, Tid,
        mlfqs::Mlfqs,
        scheduler::{PriorityScheduler, Scheduler, SleepQueue},
        table::ThreadTable,
    },
};
use abyss::{processor::Processor, spinlock::SpinLock};
use crossbeam_utils::sync::{Parker, Unparker};
use std::{
    any::Any,
    panic,
    sync::{
        Arc,
        atomic::{AtomicI64, AtomicU64, Ordering},
    },
};

/// Tid of the thread that boots the kernel.
pub(crate) const MAIN_TID: Tid = 1;

/// Where the CPU time went.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickStats {
    /// Ticks spent in the idle thread.
    pub idle_ticks: i64,
    /// Ticks spent in any other thread.
    pub kernel_ticks: i64,
}

/// Scheduler state, protected by the kernel spinlock.
pub(crate) struct KernelState {
    pub(crate) threads: ThreadTable,
    pub(crate) scheduler: Box<dyn Scheduler + Send>,
    pub(crate) sleepers: SleepQueue,
    pub(crate) current: Tid,
    pub(crate) idle: Option<Tid>,
    pub(crate) slice: u32,
    pub(crate) stats: TickStats,
}

/// A running kernel.
pub struct Kernel {
    config: SystemConfiguration,
    cpu: Processor,
    state: SpinLock<KernelState>,
    ticks: AtomicI64,
    next_tid: AtomicU64,
    halt_reason: SpinLock<Option<String>>,
}

/// Tears the kernel down when the main thread leaves [`Kernel::start`],
/// whether it returns or unwinds.
struct Shutdown<'a> {
    kernel: &'a Kernel,
}

impl Drop for Shutdown<'_> {
    fn drop(&mut self) {
        let stats = self.kernel.stats();
        log::info!(
            "KeOS: shutdown at tick {}: {} idle ticks, {} kernel ticks",
            self.kernel.ticks(),
            stats.idle_ticks,
            stats.kernel_ticks
        );
        self.kernel.halt(None);
        thread::uninstall();
    }
}

impl Kernel {
    /// Boots a kernel on the calling host thread and runs `main` as its main
    /// thread.
    ///
    /// The kernel is shut down when `main` returns: threads that are still
    /// alive are torn down without running further. If any other kernel
    /// thread panics, the kernel halts and the panic is re-raised on the
    /// calling thread.
    ///
    /// # Errors
    /// [`KernelError::NoMemory`] if the idle thread cannot be created.
    pub fn start<R>(
        config: SystemConfiguration,
        main: impl FnOnce() -> R,
    ) -> Result<R, KernelError> {
        assert!(
            !thread::is_kernel_thread(),
            "A kernel is already running on this thread."
        );
        let parker = Parker::new();
        let kernel = Arc::new(Kernel::new(config, parker.unparker().clone())?);
        log::info!("KeOS: boot with {:?}", kernel.config);

        thread::install(Local {
            kernel: kernel.clone(),
            tid: MAIN_TID,
            parker,
        });
        let _shutdown = Shutdown { kernel: &kernel };
        kernel.spawn_idle()?;
        Ok(main())
    }

    fn new(config: SystemConfiguration, main_unparker: Unparker) -> Result<Self, KernelError> {
        let scheduler: Box<dyn Scheduler + Send> = match config.mode {
            SchedulerMode::Priority => Box::new(PriorityScheduler::new()),
            SchedulerMode::Mlfqs => Box::new(Mlfqs::new()),
        };
        let mut threads = ThreadTable::new(config.max_threads);
        let mut main = Thread::new(MAIN_TID, "main", PRI_DEFAULT, main_unparker);
        scheduler.init_thread(&mut main, None);
        main.set_status(ThreadStatus::Running);
        threads.insert(main)?;

        Ok(Self {
            config,
            cpu: Processor::new(MAIN_TID),
            state: SpinLock::new(KernelState {
                threads,
                scheduler,
                sleepers: SleepQueue::new(),
                current: MAIN_TID,
                idle: None,
                slice: 0,
                stats: TickStats::default(),
            }),
            ticks: AtomicI64::new(0),
            next_tid: AtomicU64::new(MAIN_TID + 1),
            halt_reason: SpinLock::new(None),
        })
    }

    /// The configuration the kernel booted with.
    pub fn config(&self) -> &SystemConfiguration {
        &self.config
    }

    /// The processor of the kernel.
    pub fn cpu(&self) -> &Processor {
        &self.cpu
    }

    /// Ticks since boot.
    pub fn ticks(&self) -> i64 {
        self.ticks.load(Ordering::SeqCst)
    }

    pub(crate) fn advance_clock(&self) -> i64 {
        self.ticks.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Tick statistics.
    pub fn stats(&self) -> TickStats {
        self.with_state(|s| s.stats)
    }

    pub(crate) fn allocate_tid(&self) -> Tid {
        self.next_tid.fetch_add(1, Ordering::SeqCst)
    }

    /// Runs `f` on the scheduler state.
    ///
    /// `f` must not switch threads.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut KernelState) -> R) -> R {
        let mut guard = self.state.lock();
        let r = f(&mut guard);
        guard.unlock();
        r
    }

    /// Halts the kernel and releases every parked thread.
    pub(crate) fn halt(&self, reason: Option<String>) {
        if let Some(reason) = reason {
            let mut slot = self.halt_reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
            slot.unlock();
        }
        self.cpu.halt();
        let unparkers: Vec<Unparker> =
            self.with_state(|s| s.threads.iter().map(|th| th.unparker.clone()).collect());
        for unparker in unparkers {
            unparker.unpark();
        }
    }

    /// Called by a thread that woke up on a halted processor.
    pub(crate) fn on_halted(&self, local: &Local) -> ! {
        if local.tid == MAIN_TID {
            let slot = self.halt_reason.lock();
            let reason = slot.clone().unwrap_or_else(|| "halted".into());
            slot.unlock();
            panic!("kernel halted: {reason}");
        }
        panic::resume_unwind(Box::new(KernelHalted));
    }

    /// Records a panic of the thread `tid` and halts the kernel.
    pub(crate) fn kernel_panic(&self, tid: Tid, payload: Box<dyn Any + Send>) {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "Box<dyn Any>".to_string()
        };
        let name = self.with_state(|s| s.threads.get(tid).map(|th| th.name.clone()));
        let reason = format!(
            "kernel panic in thread `{}` (tid {tid}): {message}",
            name.as_deref().unwrap_or("?")
        );
        log::error!("{reason}");
        self.halt(Some(reason));
    }
}
