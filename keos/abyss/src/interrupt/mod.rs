//! Interrupt
//!
//! The simulated processor has a single interrupt line: the timer. Whether it
//! can be delivered is decided by the [`CpuFlags::IF`] bit of the processor
//! flags, exactly as the `IF` bit of `RFLAGS` on x86_64.
//!
//! Kernel code never toggles the flag directly. Instead, it creates an
//! [`InterruptGuard`], which disables interrupts and restores the previous
//! state when the outermost guard is dropped.
use crate::processor::{CpuFlags, Processor};
use core::{
    marker::PhantomData,
    sync::atomic::{AtomicBool, AtomicIsize, Ordering},
};

/// Nesting bookkeeping of [`InterruptGuard`]s for a processor.
pub(crate) struct InterruptGuardInner {
    initial_state: AtomicBool,
    cnt: AtomicIsize,
}

/// Snapshot of [`InterruptGuardInner`] and the interrupt flag.
///
/// Every kernel thread owns its own interrupt nesting depth. The snapshot is
/// kept on the stack of a thread while it is switched out and reinstalled when
/// the thread gets the processor back.
#[derive(Clone, Copy, Debug)]
pub struct SavedInterruptState {
    initial_state: bool,
    cnt: isize,
    enabled: bool,
}

impl InterruptGuardInner {
    pub(crate) const fn new() -> Self {
        Self {
            initial_state: AtomicBool::new(true),
            cnt: AtomicIsize::new(0),
        }
    }

    fn save_nested_interrupt_state(&self, state: InterruptState) {
        if self.cnt.fetch_add(1, Ordering::SeqCst) == 0 {
            self.initial_state
                .store(state == InterruptState::On, Ordering::SeqCst);
        }
    }

    fn load_nested_interrupt_state(&self, cpu: &Processor) {
        let prev = self.cnt.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "Mismatched InterruptGuard drop calls: {prev}");

        if prev == 1 && self.initial_state.load(Ordering::SeqCst) {
            cpu.set_flags(CpuFlags::IF);
        }
    }

    pub(crate) fn save(&self, enabled: bool) -> SavedInterruptState {
        SavedInterruptState {
            initial_state: self.initial_state.load(Ordering::SeqCst),
            cnt: self.cnt.load(Ordering::SeqCst),
            enabled,
        }
    }

    pub(crate) fn restore(&self, saved: SavedInterruptState, cpu: &Processor) {
        self.initial_state
            .store(saved.initial_state, Ordering::SeqCst);
        self.cnt.store(saved.cnt, Ordering::SeqCst);
        if saved.enabled {
            cpu.set_flags(CpuFlags::IF);
        } else {
            cpu.clear_flags(CpuFlags::IF);
        }
    }

    pub(crate) fn reset(&self, cpu: &Processor) {
        self.restore(
            SavedInterruptState {
                initial_state: true,
                cnt: 0,
                enabled: true,
            },
            cpu,
        );
    }
}

/// Enumeration representing the interrupt state.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum InterruptState {
    /// Interrupts are enabled.
    On,
    /// Interrupts are disabled.
    Off,
}

impl InterruptState {
    /// Reads the interrupt state of `cpu`.
    ///
    /// # Returns
    /// - [`InterruptState::On`] if interrupts are enabled.
    /// - [`InterruptState::Off`] if interrupts are disabled.
    pub fn current(cpu: &Processor) -> Self {
        if cpu.flags().contains(CpuFlags::IF) {
            Self::On
        } else {
            Self::Off
        }
    }
}

/// An RAII-based guard for managing interrupt disabling.
///
/// When an `InterruptGuard` is created, interrupts are disabled. When it is
/// dropped, the interrupt state is restored to what it was before the guard was
/// created.
///
/// **Important:**
/// - [`InterruptGuard`] instances **must be dropped in reverse order of their
///   creation** to prevent unintended interrupt state changes.
/// - Due to Rust's ownership and scoping rules, this invariant is naturally
///   upheld unless `drop()` is explicitly called prematurely or an
///   [`InterruptGuard`] is stored in a struct field.
/// - Once the processor is halted, dropping a guard does nothing. Threads that
///   unwind after a halt must not touch the state of the threads that are
///   still tearing down.
///
/// This structure is created using [`InterruptGuard::new`].
pub struct InterruptGuard<'a> {
    cpu: &'a Processor,
    _not_send: PhantomData<*const ()>,
}

impl<'a> InterruptGuard<'a> {
    /// Creates a new `InterruptGuard`, disabling interrupts on `cpu`.
    ///
    /// # Behavior
    /// - Saves the current interrupt state.
    /// - Clears [`CpuFlags::IF`].
    ///
    /// # Returns
    /// A new instance of `InterruptGuard`, which will restore the original
    /// interrupt state when dropped.
    ///
    /// # Example
    /// ```
    /// use abyss::{
    ///     interrupt::{InterruptGuard, InterruptState},
    ///     processor::Processor,
    /// };
    ///
    /// let cpu = Processor::new(1);
    /// let guard = InterruptGuard::new(&cpu); // Disables interrupts
    /// assert_eq!(InterruptState::current(&cpu), InterruptState::Off);
    /// // Interrupts are restored when `guard` goes out of scope.
    /// drop(guard);
    /// assert_eq!(InterruptState::current(&cpu), InterruptState::On);
    /// ```
    pub fn new(cpu: &'a Processor) -> Self {
        let state = InterruptState::current(cpu);
        cpu.clear_flags(CpuFlags::IF);
        cpu.irq.save_nested_interrupt_state(state);

        Self {
            cpu,
            _not_send: PhantomData,
        }
    }

    /// Returns true if an [`InterruptGuard`] is alive on `cpu`.
    pub fn is_guarded(cpu: &Processor) -> bool {
        cpu.irq.cnt.load(Ordering::SeqCst) > 0
    }
}

impl Drop for InterruptGuard<'_> {
    fn drop(&mut self) {
        if self.cpu.is_halted() {
            return;
        }
        self.cpu.irq.load_nested_interrupt_state(self.cpu);
    }
}

/// The context of a running interrupt handler.
///
/// Entering the handler disables interrupts and sets
/// [`CpuFlags::IN_INTERRUPT`]. Both are undone when the context is dropped.
/// A handler that wants the interrupted thread to give up the processor calls
/// [`Processor::request_yield_on_return`]; the interrupted thread checks it
/// with [`Processor::take_yield_on_return`] after the handler returns.
pub struct InterruptContext<'a> {
    cpu: &'a Processor,
    _guard: InterruptGuard<'a>,
}

impl<'a> InterruptContext<'a> {
    /// Enters an interrupt handler on `cpu`.
    ///
    /// Interrupts must be deliverable, and handlers do not nest.
    pub fn enter(cpu: &'a Processor) -> Self {
        assert_eq!(
            InterruptState::current(cpu),
            InterruptState::On,
            "Interrupt delivered while interrupts are disabled."
        );
        assert!(!cpu.in_interrupt(), "Nested external interrupt.");
        let guard = InterruptGuard::new(cpu);
        cpu.set_flags(CpuFlags::IN_INTERRUPT);
        Self { cpu, _guard: guard }
    }
}

impl Drop for InterruptContext<'_> {
    fn drop(&mut self) {
        self.cpu.clear_flags(CpuFlags::IN_INTERRUPT);
    }
}
