//! Thread abstration, an abstraction of a cpu core.
//!
//! ## The threading model
//!
//! An executing kernel consists of a collection of threads, each with their
//! own stack and local state. Exactly one of them is running on the CPU at a
//! time; the others are ready to run, blocked on a synchronization primitive,
//! sleeping on the timer, or parked.
//!
//! | Status                     | Meaning                                         |
//! |----------------------------|-------------------------------------------------|
//! | [`ThreadStatus::Running`]  | Owns the CPU.                                   |
//! | [`ThreadStatus::Ready`]    | Waits on the ready queue for the CPU.           |
//! | [`ThreadStatus::Blocked`]  | Waits for an event: a semaphore, a timer, etc.  |
//! | [`ThreadStatus::Dying`]    | Finished; its slot is reclaimed on the next switch. |
//!
//! A blocked thread remembers *what* it waits for in its [`Membership`],
//! which tells the queue that currently owns it.
//!
//! ## Priorities
//!
//! Every thread has a priority between [`PRI_MIN`] and [`PRI_MAX`]. The
//! scheduler always runs the highest-priority ready thread, and a thread that
//! becomes ready with a higher priority than the running thread preempts it.
//! The priority of a thread may be temporarily raised by priority donation
//! (see [`sync::lock`]) or, under the MLFQS scheduler, recomputed from its CPU
//! usage (see [`mlfqs`]).
//!
//! [`sync::lock`]: crate::sync::lock
pub mod mlfqs;
pub mod scheduler;
pub(crate) mod table;

use crate::{
    KernelError,
    fixed_point::Fixed,
    kernel::Kernel,
    sync::{Semaphore, lock::LockCore, lock::LockId, semaphore::SemaId},
};
use abyss::interrupt::{InterruptGuard, InterruptState};
use crossbeam_utils::sync::{Parker, Unparker};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::{
    any::Any,
    cell::RefCell,
    panic::{self, AssertUnwindSafe},
    rc::Rc,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
};

/// Thread identifier.
pub type Tid = u64;
/// Thread priority.
pub type Priority = u8;

/// Lowest priority.
pub const PRI_MIN: Priority = 0;
/// Default priority.
pub const PRI_DEFAULT: Priority = 31;
/// Highest priority.
pub const PRI_MAX: Priority = 63;

/// Lowest niceness.
pub const NICE_MIN: i32 = -20;
/// Default niceness.
pub const NICE_DEFAULT: i32 = 0;
/// Highest niceness.
pub const NICE_MAX: i32 = 20;

const NAME_MAX: usize = 16;

/// A possible state of the thread.
#[derive(Clone, Copy, Eq, PartialEq, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ThreadStatus {
    /// Thread is running.
    Running,
    /// Thread is runnable.
    Ready,
    /// Thread waits for an event.
    Blocked,
    /// Thread is about to be destroyed.
    Dying,
}

/// The queue a thread is currently linked into.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum Membership {
    /// Not on any queue.
    None,
    /// On the ready queue.
    Ready,
    /// On the waiter list of a semaphore.
    Semaphore(SemaId),
    /// On the sleep list of the timer.
    Sleeping,
    /// Parked with [`Current::park_with`].
    Parked,
}

/// A donation edge: `donor` waits for a lock held by the owner of the edge.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub(crate) struct Donation {
    pub(crate) donor: Tid,
    pub(crate) lock: LockId,
}

/// An thread abstraction.
pub struct Thread {
    /// Thread id
    pub tid: Tid,
    /// Thread name
    pub name: String,
    pub(crate) status: ThreadStatus,
    pub(crate) priority: Priority,
    pub(crate) actual_priority: Priority,
    pub(crate) lock_on_wait: Option<Arc<LockCore>>,
    pub(crate) donations: Vec<Donation>,
    pub(crate) nice: i32,
    pub(crate) recent_cpu: Fixed,
    pub(crate) membership: Membership,
    pub(crate) idle: bool,
    pub(crate) unparker: Unparker,
    pub(crate) exit: Arc<Semaphore>,
    status_mirror: Arc<AtomicU8>,
}

impl Thread {
    pub(crate) fn new(tid: Tid, name: &str, priority: Priority, unparker: Unparker) -> Self {
        let mut name = String::from(name);
        if let Some((at, _)) = name.char_indices().nth(NAME_MAX) {
            name.truncate(at);
        }
        Self {
            tid,
            name,
            status: ThreadStatus::Blocked,
            priority,
            actual_priority: priority,
            lock_on_wait: None,
            donations: Vec::new(),
            nice: NICE_DEFAULT,
            recent_cpu: Fixed::ZERO,
            membership: Membership::None,
            idle: false,
            unparker,
            exit: Arc::new(Semaphore::new(0)),
            status_mirror: Arc::new(AtomicU8::new(ThreadStatus::Blocked.into())),
        }
    }

    pub(crate) fn set_status(&mut self, status: ThreadStatus) {
        self.status = status;
        self.status_mirror.store(status.into(), Ordering::SeqCst);
    }

    /// Status of the thread.
    pub fn status(&self) -> ThreadStatus {
        self.status
    }

    /// Effective priority, including donations.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Priority set by the thread itself.
    pub fn actual_priority(&self) -> Priority {
        self.actual_priority
    }

    /// Niceness.
    pub fn nice(&self) -> i32 {
        self.nice
    }

    /// Recent CPU usage, in ticks.
    pub fn recent_cpu(&self) -> Fixed {
        self.recent_cpu
    }

    /// The queue this thread is linked into.
    pub fn membership(&self) -> Membership {
        self.membership
    }
}

/// Marker carried by the unwind of [`Current::exit`].
pub(crate) struct ThreadExit;

/// Marker carried by the unwind of a thread torn down by a halted kernel.
pub(crate) struct KernelHalted;

/// Kernel state of the host thread that backs a kernel thread.
pub(crate) struct Local {
    pub(crate) kernel: Arc<Kernel>,
    pub(crate) tid: Tid,
    pub(crate) parker: Parker,
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<Local>>> = const { RefCell::new(None) };
}

pub(crate) fn install(local: Local) {
    CURRENT.with(|c| *c.borrow_mut() = Some(Rc::new(local)));
}

pub(crate) fn uninstall() {
    CURRENT.with(|c| c.borrow_mut().take());
}

pub(crate) fn is_kernel_thread() -> bool {
    CURRENT.with(|c| c.borrow().is_some())
}

/// Kernel state of the running thread.
#[track_caller]
pub(crate) fn local() -> Rc<Local> {
    CURRENT
        .with(|c| c.borrow().clone())
        .unwrap_or_else(|| panic!("Not running on a KeOS kernel thread."))
}

/// Run a function `f` with current thread as an argument.
pub fn with_current<R>(f: impl FnOnce(&Thread) -> R) -> R {
    let local = local();
    local.kernel.with_state(|s| f(&s.threads[local.tid]))
}

/// Get specified thread's [`ThreadStatus`] by TID (Thread ID).
pub fn get_state_by_tid(tid: Tid) -> Result<ThreadStatus, KernelError> {
    let local = local();
    local
        .kernel
        .with_state(|s| s.threads.get(tid).map(|th| th.status))
        .ok_or(KernelError::InvalidArgument)
}

/// Get specified thread's effective priority by TID (Thread ID).
pub fn get_priority_by_tid(tid: Tid) -> Result<Priority, KernelError> {
    let local = local();
    local
        .kernel
        .with_state(|s| s.threads.get(tid).map(|th| th.priority))
        .ok_or(KernelError::InvalidArgument)
}

/// System load average, times 100 and rounded to the nearest integer.
///
/// Always zero unless the kernel runs the MLFQS scheduler.
pub fn load_avg() -> i32 {
    (load_avg_fixed() * 100).to_int_round()
}

/// System load average.
pub fn load_avg_fixed() -> Fixed {
    let local = local();
    local.kernel.with_state(|s| s.scheduler.load_avg())
}

/// A handle to join thread.
pub struct JoinHandle {
    /// Thread id of this handle.
    pub tid: Tid,
    exit: Arc<Semaphore>,
    status: Arc<AtomicU8>,
}

impl JoinHandle {
    fn new_for(th: &Thread) -> Self {
        Self {
            tid: th.tid,
            exit: th.exit.clone(),
            status: th.status_mirror.clone(),
        }
    }

    /// Blocks until the thread exits.
    pub fn join(self) {
        self.exit.down();
    }

    /// Last known status of the thread.
    ///
    /// Unlike [`get_state_by_tid`], this keeps answering
    /// [`ThreadStatus::Dying`] after the thread is destroyed.
    pub fn status(&self) -> ThreadStatus {
        ThreadStatus::try_from(self.status.load(Ordering::SeqCst)).unwrap_or(ThreadStatus::Dying)
    }
}

/// A handle that represent the parked thread.
pub struct ParkHandle {
    tid: Tid,
    kernel: Arc<Kernel>,
}

impl ParkHandle {
    /// Thread id of the parked thread.
    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// Consume the handle and unpark the underlying thread.
    ///
    /// The thread becomes ready, and preempts the caller if it has a higher
    /// priority.
    pub fn unpark(self) {
        let _guard = InterruptGuard::new(self.kernel.cpu());
        self.kernel.wake(self.tid);
        self.kernel.preempt();
    }
}

/// The opaque structure indicating the running thread on the current cpu.
pub struct Current {
    _p: (),
}

impl Current {
    /// Get the current thread's id.
    pub fn get_tid() -> Tid {
        local().tid
    }

    /// Name of the current thread.
    pub fn name() -> String {
        with_current(|th| th.name.clone())
    }

    /// Effective priority of the current thread.
    pub fn priority() -> Priority {
        with_current(|th| th.priority)
    }

    /// Sets the priority of the current thread to `priority`.
    ///
    /// A priority donated to the thread is kept until the donor stops
    /// waiting. If the thread no longer has the highest priority, it yields.
    /// Ignored under the MLFQS scheduler.
    pub fn set_priority(priority: Priority) {
        assert!(
            priority <= PRI_MAX,
            "Priority {priority} is out of range [{PRI_MIN}, {PRI_MAX}]."
        );
        let local = local();
        let kernel = &local.kernel;
        let _guard = InterruptGuard::new(kernel.cpu());
        let applied = kernel.with_state(|s| {
            if !s.scheduler.donation_enabled() {
                return false;
            }
            crate::sync::donation::set_actual_priority(&mut s.threads, local.tid, priority);
            true
        });
        if applied {
            kernel.preempt();
        } else {
            log::trace!("set_priority({priority}) ignored by the MLFQS scheduler");
        }
    }

    /// Niceness of the current thread.
    pub fn nice() -> i32 {
        with_current(|th| th.nice)
    }

    /// Sets the niceness of the current thread and recomputes its priority.
    pub fn set_nice(nice: i32) {
        assert!(
            (NICE_MIN..=NICE_MAX).contains(&nice),
            "Nice {nice} is out of range [{NICE_MIN}, {NICE_MAX}]."
        );
        let local = local();
        let kernel = &local.kernel;
        let _guard = InterruptGuard::new(kernel.cpu());
        kernel.with_state(|s| {
            let th = &mut s.threads[local.tid];
            th.nice = nice;
            s.scheduler.on_nice_change(th);
        });
        kernel.preempt();
    }

    /// Recent CPU usage of the current thread, times 100 and rounded to the
    /// nearest integer.
    pub fn recent_cpu() -> i32 {
        with_current(|th| (th.recent_cpu * 100).to_int_round())
    }

    /// Gives up the CPU. The current thread stays ready and runs again after
    /// the other ready threads of the same priority.
    pub fn yield_now() {
        let local = local();
        assert!(
            !local.kernel.cpu().in_interrupt(),
            "Try to yield in an interrupt context."
        );
        local.kernel.yield_now();
    }

    /// Run a function `f` with [`ParkHandle`] for current thread, and then park
    /// the current thread.
    ///
    /// `f` runs with interrupts disabled and must not unpark the handle
    /// itself.
    pub fn park_with(f: impl FnOnce(ParkHandle)) {
        let local = local();
        let kernel = &local.kernel;
        assert!(
            !kernel.cpu().in_interrupt(),
            "Try to park a thread in an interrupt context."
        );
        let _guard = InterruptGuard::new(kernel.cpu());
        f(ParkHandle {
            tid: local.tid,
            kernel: kernel.clone(),
        });
        kernel.block(&local, Membership::Parked);
    }

    /// Exit the current thread.
    ///
    /// Joiners are released and the thread never runs again. The main thread
    /// cannot exit; it returns from the closure given to
    /// [`Kernel::start`] instead.
    pub fn exit() -> ! {
        let local = local();
        assert_ne!(
            local.tid,
            crate::kernel::MAIN_TID,
            "The main thread cannot exit."
        );
        assert!(
            InterruptState::current(local.kernel.cpu()) == InterruptState::On,
            "Try to exit a thread with interrupts disabled."
        );
        drop(local);
        panic::resume_unwind(Box::new(ThreadExit));
    }
}

/// A struct to build a new thread.
pub struct ThreadBuilder {
    name: String,
    priority: Priority,
}

impl ThreadBuilder {
    /// Create a new thread builder for thread `name`.
    pub fn new<I>(name: I) -> Self
    where
        String: From<I>,
    {
        Self {
            name: String::from(name),
            priority: PRI_DEFAULT,
        }
    }

    /// Sets the initial priority of the thread.
    ///
    /// Ignored under the MLFQS scheduler.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Spawn the thread.
    ///
    /// The thread is ready to run on return, and has already run if its
    /// priority is higher than the creator's.
    ///
    /// # Errors
    /// - [`KernelError::InvalidArgument`] if the priority is out of range.
    /// - [`KernelError::NoMemory`] if the thread table is full.
    pub fn spawn<F: FnOnce() + Send + 'static>(
        self,
        thread_fn: F,
    ) -> Result<JoinHandle, KernelError> {
        let (kernel, handle) = self.into_thread(thread_fn)?;
        let _guard = InterruptGuard::new(kernel.cpu());
        kernel.wake(handle.tid);
        kernel.preempt();
        Ok(handle)
    }

    /// Spawn the thread as a parked state.
    pub fn spawn_as_parked<F: FnOnce() + Send + 'static>(
        self,
        thread_fn: F,
    ) -> Result<ParkHandle, KernelError> {
        let (kernel, handle) = self.into_thread(thread_fn)?;
        kernel.with_state(|s| s.threads[handle.tid].membership = Membership::Parked);
        Ok(ParkHandle {
            tid: handle.tid,
            kernel,
        })
    }

    fn into_thread<F: FnOnce() + Send + 'static>(
        self,
        thread_fn: F,
    ) -> Result<(Arc<Kernel>, JoinHandle), KernelError> {
        if self.priority > PRI_MAX {
            return Err(KernelError::InvalidArgument);
        }
        let local = local();
        let kernel = local.kernel.clone();
        let tid = kernel.allocate_tid();
        let parker = Parker::new();
        let mut th = Thread::new(tid, &self.name, self.priority, parker.unparker().clone());
        let handle = JoinHandle::new_for(&th);
        let name = th.name.clone();

        kernel.with_state(|s| {
            s.scheduler.init_thread(&mut th, Some(&s.threads[local.tid]));
            s.threads.insert(th)
        })?;

        let k = kernel.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("keos:{name}"))
            .spawn(move || thread_start(k, tid, parker, thread_fn));
        if let Err(e) = spawned {
            log::error!("cannot back thread `{name}` with a host thread: {e}");
            kernel.with_state(|s| s.threads.remove(tid));
            return Err(KernelError::NoMemory);
        }
        log::debug!("thread `{name}` (tid {tid}) created");
        Ok((kernel, handle))
    }
}

/// The very beginning of the thread.
fn thread_start<F: FnOnce()>(kernel: Arc<Kernel>, tid: Tid, parker: Parker, thread_fn: F) {
    if kernel.cpu().wait_for_baton(&parker, tid).is_err() {
        return;
    }
    kernel.cpu().start_thread();
    install(Local {
        kernel: kernel.clone(),
        tid,
        parker,
    });

    let finished = match panic::catch_unwind(AssertUnwindSafe(thread_fn)) {
        Ok(()) => true,
        Err(payload) => handle_unwind(&kernel, tid, payload),
    };
    if finished {
        let local = local();
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| kernel.exit_current(&local)))
        {
            handle_unwind(&kernel, tid, payload);
        }
    }
    uninstall();
}

/// Returns true if the thread left its function through [`Current::exit`].
fn handle_unwind(kernel: &Kernel, tid: Tid, payload: Box<dyn Any + Send>) -> bool {
    if payload.is::<ThreadExit>() {
        true
    } else if payload.is::<KernelHalted>() {
        false
    } else {
        kernel.kernel_panic(tid, payload);
        false
    }
}
