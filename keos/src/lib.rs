//! # KeOS threads: the scheduler and synchronization core of KeOS
//!
//! This crate contains the part of the kernel that decides **who runs next**
//! and **how threads wait for each other** on a single CPU:
//!
//! - [`thread`]: kernel threads, the ready queue and the idle thread.
//! - [`sync`]: [`Semaphore`], [`Lock`] with priority donation,
//!   [`ConditionVariable`] and the data-carrying [`Mutex`].
//! - [`timer`]: the virtual timer that drives sleeping, time slicing and the
//!   MLFQS accounting.
//! - [`fixed_point`]: the 17.14 fixed-point numbers used by the MLFQS
//!   scheduler.
//!
//! ## The execution model
//!
//! The kernel runs on top of a host process. Each kernel thread is backed by
//! a host thread, but only one of them owns the simulated processor at a time
//! (see [`abyss::processor`]). Everything a kernel thread does between two
//! scheduling points is therefore atomic with respect to other kernel
//! threads, as on a real uniprocessor.
//!
//! Time only moves forward when a thread burns CPU time with
//! [`timer::spin`], or when the idle thread waits for the next timer
//! interrupt. As a result, every execution of a kernel is deterministic.
//!
//! ```no_run
//! use keos::{Kernel, SystemConfiguration, thread::ThreadBuilder, timer};
//!
//! let ticks = Kernel::start(SystemConfiguration::default(), || {
//!     let handle = ThreadBuilder::new("sleeper")
//!         .spawn(|| timer::sleep(10))
//!         .unwrap();
//!     handle.join();
//!     timer::ticks()
//! })
//! .unwrap();
//! assert_eq!(ticks, 10);
//! ```
//!
//! ## Implementation Notes
//!
//! Interrupt state is per kernel thread: an [`InterruptGuard`] held while a
//! thread blocks is restored when the thread runs again.
//!
//! Internal [`SpinLock`]s are **never** held across a context switch. A
//! [`SpinLockGuard`] must be explicitly released with `unlock()`.
//!
//! [`Semaphore`]: sync::Semaphore
//! [`Lock`]: sync::Lock
//! [`ConditionVariable`]: sync::ConditionVariable
//! [`Mutex`]: sync::Mutex
//! [`InterruptGuard`]: abyss::interrupt::InterruptGuard
//! [`SpinLock`]: sync::SpinLock
//! [`SpinLockGuard`]: sync::SpinLockGuard
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

mod kernel;

pub mod fixed_point;
pub mod sync;
pub mod thread;
pub mod timer;

pub use kernel::{Kernel, TickStats};

/// Enum representing errors that can occur during a kernel operation.
///
/// Contract violations, such as releasing a lock that is not held, are not
/// errors: they are bugs and panic the kernel.
#[derive(Debug, Eq, PartialEq, Clone, Copy, thiserror::Error)]
pub enum KernelError {
    /// Out of memory. (ENOMEM)
    ///
    /// The thread table is full, or the host refused to back a new thread.
    #[error("out of memory")]
    NoMemory,
    /// Invalid arguement. (EINVAL)
    #[error("invalid argument")]
    InvalidArgument,
}

/// The scheduling policy of a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulerMode {
    /// Strict priority scheduling with priority donation.
    #[default]
    Priority,
    /// The multi-level feedback queue scheduler.
    Mlfqs,
}

/// Default frequency of the timer interrupt.
pub const TIMER_FREQ: i64 = 100;
/// Default number of ticks a thread may run before it is preempted.
pub const TIME_SLICE: u32 = 4;
/// Default capacity of the thread table.
pub const MAX_THREADS: usize = 128;

/// System-wide settings of a kernel, fixed at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemConfiguration {
    pub(crate) mode: SchedulerMode,
    pub(crate) timer_freq: i64,
    pub(crate) time_slice: u32,
    pub(crate) max_threads: usize,
}

impl SystemConfiguration {
    /// Starts building a configuration from the defaults.
    pub fn builder() -> SystemConfigurationBuilder {
        SystemConfigurationBuilder::new()
    }

    /// The scheduling policy.
    pub fn mode(&self) -> SchedulerMode {
        self.mode
    }

    /// Timer interrupts per second.
    pub fn timer_freq(&self) -> i64 {
        self.timer_freq
    }

    /// Ticks in a time slice.
    pub fn time_slice(&self) -> u32 {
        self.time_slice
    }

    /// Capacity of the thread table, including the main and idle threads.
    pub fn max_threads(&self) -> usize {
        self.max_threads
    }
}

impl Default for SystemConfiguration {
    fn default() -> Self {
        Self {
            mode: SchedulerMode::Priority,
            timer_freq: TIMER_FREQ,
            time_slice: TIME_SLICE,
            max_threads: MAX_THREADS,
        }
    }
}

/// A builder for system configuration settings.
///
/// The [`SystemConfigurationBuilder`] struct provides an interface for
/// configuring various system-wide settings before initialization, such as
/// the scheduling policy and the timer.
///
/// ```
/// use keos::{SchedulerMode, SystemConfiguration};
///
/// let config = SystemConfiguration::builder()
///     .parse_cmdline("-o mlfqs run alarm-single")
///     .unwrap()
///     .build()
///     .unwrap();
/// assert_eq!(config.mode(), SchedulerMode::Mlfqs);
/// ```
#[derive(Debug, Clone)]
pub struct SystemConfigurationBuilder {
    conf: SystemConfiguration,
}

impl Default for SystemConfigurationBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemConfigurationBuilder {
    /// Creates a builder holding the default configuration.
    pub fn new() -> Self {
        Self {
            conf: SystemConfiguration::default(),
        }
    }

    /// Sets the system-wide scheduler.
    pub fn set_scheduler(mut self, mode: SchedulerMode) -> Self {
        self.conf.mode = mode;
        self
    }

    /// Sets the timer frequency in Hz.
    pub fn set_timer_freq(mut self, freq: i64) -> Self {
        self.conf.timer_freq = freq;
        self
    }

    /// Sets the number of ticks in a time slice.
    pub fn set_time_slice(mut self, ticks: u32) -> Self {
        self.conf.time_slice = ticks;
        self
    }

    /// Sets the capacity of the thread table.
    pub fn set_max_threads(mut self, max: usize) -> Self {
        self.conf.max_threads = max;
        self
    }

    /// Applies the options of a kernel command line.
    ///
    /// Options come first and end at the first word that does not start with
    /// `-`. Recognized options are `-o mlfqs` and `-mlfqs`.
    pub fn parse_cmdline(mut self, cmdline: &str) -> Result<Self, KernelError> {
        let mut words = cmdline.split_whitespace();
        while let Some(word) = words.next() {
            match word {
                "-mlfqs" => self.conf.mode = SchedulerMode::Mlfqs,
                "-o" => match words.next() {
                    Some("mlfqs") => self.conf.mode = SchedulerMode::Mlfqs,
                    other => {
                        log::error!("unknown option `-o {}`", other.unwrap_or(""));
                        return Err(KernelError::InvalidArgument);
                    }
                },
                w if w.starts_with('-') => {
                    log::error!("unknown option `{w}`");
                    return Err(KernelError::InvalidArgument);
                }
                _ => break,
            }
        }
        Ok(self)
    }

    /// Validates the settings.
    ///
    /// The timer must run between 19 and 1000 Hz, a time slice is at least one
    /// tick, and the thread table must fit the main and idle threads.
    pub fn build(self) -> Result<SystemConfiguration, KernelError> {
        let conf = self.conf;
        if !(19..=1000).contains(&conf.timer_freq) || conf.time_slice == 0 || conf.max_threads < 2
        {
            return Err(KernelError::InvalidArgument);
        }
        Ok(conf)
    }
}
