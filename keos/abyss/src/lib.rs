//! The abyss of kernel that operates hardwares.
//!
//! This crate contains the simulated hardware underneath KeOS threads: a
//! single processor with an interrupt flag, a baton that says which thread
//! owns the processor, and the spinlock used for short critical sections.
//!
//! You are **not** required to understand every line of code in this crate.
//! Instead, you are supposed to see [`keos`] crate to see which modules (or
//! functions) are available for implementing kernel threads.
//!
//! [`keos`]: ../keos/index.html

pub mod interrupt;
pub mod processor;
pub mod spinlock;

#[cfg(test)]
mod tests {
    use crate::{
        interrupt::{InterruptContext, InterruptGuard, InterruptState},
        processor::Processor,
    };

    #[test]
    fn nested_guards_restore_initial_state() {
        let cpu = Processor::new(1);
        assert_eq!(InterruptState::current(&cpu), InterruptState::On);
        {
            let _outer = InterruptGuard::new(&cpu);
            {
                let _inner = InterruptGuard::new(&cpu);
                assert!(InterruptGuard::is_guarded(&cpu));
            }
            assert_eq!(InterruptState::current(&cpu), InterruptState::Off);
        }
        assert_eq!(InterruptState::current(&cpu), InterruptState::On);
        assert!(!InterruptGuard::is_guarded(&cpu));
    }

    #[test]
    fn interrupt_context_sets_flags() {
        let cpu = Processor::new(1);
        {
            let _ctx = InterruptContext::enter(&cpu);
            assert!(cpu.in_interrupt());
            cpu.request_yield_on_return();
        }
        assert!(!cpu.in_interrupt());
        assert_eq!(InterruptState::current(&cpu), InterruptState::On);
        assert!(cpu.take_yield_on_return());
        assert!(!cpu.take_yield_on_return());
    }

    #[test]
    #[should_panic(expected = "interrupts are disabled")]
    fn interrupt_requires_enabled_flag() {
        let cpu = Processor::new(1);
        let _guard = InterruptGuard::new(&cpu);
        let _ctx = InterruptContext::enter(&cpu);
    }
}
