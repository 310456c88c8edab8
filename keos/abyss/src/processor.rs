//! The simulated processor.
//!
//! KeOS runs on a single logical CPU. On a host, each kernel thread is backed
//! by a host thread, and the [`Processor`] decides which of them owns the CPU.
//! Ownership is a baton: the id of the running thread. Only the baton holder
//! executes kernel code; every other host thread is parked.
//!
//! A context switch stores the id of the next thread into the baton, wakes
//! the host thread behind it, and parks the previous thread until the baton
//! comes back. The interrupt state of the previous thread is saved on its own
//! stack across the switch, as the real kernel saves `RFLAGS` in the switch
//! frame.
//!
//! When the processor is halted, every parked thread returns from its wait
//! with [`Halted`] and tears itself down.
use crate::interrupt::{InterruptGuardInner, SavedInterruptState};
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use crossbeam_utils::sync::{Parker, Unparker};

bitflags::bitflags! {
    /// Status flags of the simulated processor.
    pub struct CpuFlags: u32 {
        /// Interrupt enable flag.
        const IF = 1 << 9;
        /// An interrupt handler is running.
        const IN_INTERRUPT = 1 << 16;
        /// The interrupted thread must yield when the handler returns.
        const YIELD_ON_RETURN = 1 << 17;
    }
}

/// The processor was halted while the thread was waiting for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Halted;

/// A single simulated CPU.
pub struct Processor {
    baton: AtomicU64,
    flags: AtomicU32,
    halted: AtomicBool,
    pub(crate) irq: InterruptGuardInner,
}

impl Processor {
    /// Creates a processor owned by the thread `boot`, with interrupts
    /// enabled.
    pub const fn new(boot: u64) -> Self {
        Self {
            baton: AtomicU64::new(boot),
            flags: AtomicU32::new(CpuFlags::IF.bits()),
            halted: AtomicBool::new(false),
            irq: InterruptGuardInner::new(),
        }
    }

    /// Id of the thread that owns the processor.
    pub fn running(&self) -> u64 {
        self.baton.load(Ordering::SeqCst)
    }

    /// Reads the processor flags.
    pub fn flags(&self) -> CpuFlags {
        CpuFlags::from_bits_truncate(self.flags.load(Ordering::SeqCst))
    }

    pub(crate) fn set_flags(&self, flags: CpuFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::SeqCst);
    }

    pub(crate) fn clear_flags(&self, flags: CpuFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::SeqCst);
    }

    /// Returns true if an interrupt handler is running.
    pub fn in_interrupt(&self) -> bool {
        self.flags().contains(CpuFlags::IN_INTERRUPT)
    }

    /// Asks the interrupted thread to yield once the handler returns.
    pub fn request_yield_on_return(&self) {
        assert!(
            self.in_interrupt(),
            "Yield-on-return requested outside of an interrupt handler."
        );
        self.set_flags(CpuFlags::YIELD_ON_RETURN);
    }

    /// Consumes a pending yield-on-return request.
    pub fn take_yield_on_return(&self) -> bool {
        let prev = self
            .flags
            .fetch_and(!CpuFlags::YIELD_ON_RETURN.bits(), Ordering::SeqCst);
        CpuFlags::from_bits_truncate(prev).contains(CpuFlags::YIELD_ON_RETURN)
    }

    /// Returns true once the processor is halted.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Halts the processor. Parked threads must be unparked by the caller to
    /// observe it.
    pub fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }

    /// Prepares the processor for a thread that runs for the first time.
    ///
    /// A fresh thread starts with interrupts enabled and no guard alive.
    pub fn start_thread(&self) {
        self.irq.reset(self);
    }

    /// Switches from the thread `me` to the thread `next`.
    ///
    /// Returns when `me` owns the processor again, with the interrupt state it
    /// had when it switched out.
    pub fn switch(
        &self,
        parker: &Parker,
        me: u64,
        next: u64,
        next_unparker: &Unparker,
    ) -> Result<(), Halted> {
        let saved: SavedInterruptState = self
            .irq
            .save(self.flags().contains(CpuFlags::IF));
        self.handoff(next, next_unparker);
        self.wait_for_baton(parker, me)?;
        self.irq.restore(saved, self);
        Ok(())
    }

    /// Passes the processor to `next` without waiting for it to come back.
    ///
    /// Used by a dying thread. The caller must not touch the processor after
    /// this returns.
    pub fn handoff(&self, next: u64, next_unparker: &Unparker) {
        self.baton.store(next, Ordering::SeqCst);
        next_unparker.unpark();
    }

    /// Parks the calling host thread until `me` owns the processor.
    pub fn wait_for_baton(&self, parker: &Parker, me: u64) -> Result<(), Halted> {
        loop {
            if self.is_halted() {
                return Err(Halted);
            }
            if self.baton.load(Ordering::SeqCst) == me {
                return Ok(());
            }
            parker.park();
        }
    }
}
