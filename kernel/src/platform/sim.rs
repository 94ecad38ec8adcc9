//! Deterministic single-CPU simulation of the platform contract.
//!
//! Stands in for the hardware collaborators on a host machine: a software
//! interrupt flag, a tick counter the harness advances by hand, a bounded
//! page budget, and a recorded log of context switches. The switch
//! primitive only records the handoff (the harness remains the executing
//! "CPU"), which is what lets the two-phase dispatch finalization be
//! exercised in isolation.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use spin::Mutex;

use super::{IntrLevel, PageRef, Platform, PAGE_SIZE};
use crate::scheduler::thread::Tid;

/// Default simulated timer frequency, in ticks per second.
pub const SIM_TIMER_FREQUENCY: u64 = 100;

pub struct SimPlatform {
    interrupts_on: AtomicBool,
    in_interrupt: AtomicBool,
    ticks: AtomicU64,
    frequency: u64,
    pages_left: AtomicUsize,
    next_page: AtomicUsize,
    pages_freed: AtomicUsize,
    switches: Mutex<Vec<(Tid, Tid)>>,
}

impl SimPlatform {
    /// Boot state: interrupts disabled, unbounded page budget.
    pub fn new() -> SimPlatform {
        Self::with_page_budget(usize::MAX)
    }

    /// Boot state with only `pages` thread pages available, for driving
    /// the out-of-memory path.
    pub fn with_page_budget(pages: usize) -> SimPlatform {
        SimPlatform {
            interrupts_on: AtomicBool::new(false),
            in_interrupt: AtomicBool::new(false),
            ticks: AtomicU64::new(0),
            frequency: SIM_TIMER_FREQUENCY,
            pages_left: AtomicUsize::new(pages),
            next_page: AtomicUsize::new(PAGE_SIZE),
            pages_freed: AtomicUsize::new(0),
            switches: Mutex::new(Vec::new()),
        }
    }

    pub fn with_frequency(mut self, frequency: u64) -> SimPlatform {
        self.frequency = frequency;
        self
    }

    /// Advances the simulated timer by one tick; returns the new count.
    pub fn advance_tick(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn set_ticks(&self, ticks: u64) {
        self.ticks.store(ticks, Ordering::Relaxed);
    }

    /// Enters simulated interrupt context. Hardware masks interrupts while
    /// servicing one, so entry also disables them; the returned level is
    /// handed back to [`SimPlatform::leave_interrupt`].
    pub fn enter_interrupt(&self) -> IntrLevel {
        self.in_interrupt.store(true, Ordering::Relaxed);
        self.disable_interrupts()
    }

    pub fn leave_interrupt(&self, level: IntrLevel) {
        self.in_interrupt.store(false, Ordering::Relaxed);
        self.set_interrupt_level(level);
    }

    /// Every context switch recorded so far, oldest first.
    pub fn switch_log(&self) -> Vec<(Tid, Tid)> {
        self.switches.lock().clone()
    }

    pub fn pages_freed(&self) -> usize {
        self.pages_freed.load(Ordering::Relaxed)
    }
}

impl Default for SimPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for SimPlatform {
    fn disable_interrupts(&self) -> IntrLevel {
        if self.interrupts_on.swap(false, Ordering::Relaxed) {
            IntrLevel::On
        } else {
            IntrLevel::Off
        }
    }

    fn enable_interrupts(&self) {
        self.interrupts_on.store(true, Ordering::Relaxed);
    }

    fn set_interrupt_level(&self, level: IntrLevel) {
        self.interrupts_on
            .store(level == IntrLevel::On, Ordering::Relaxed);
    }

    fn interrupt_level(&self) -> IntrLevel {
        if self.interrupts_on.load(Ordering::Relaxed) {
            IntrLevel::On
        } else {
            IntrLevel::Off
        }
    }

    fn in_interrupt_context(&self) -> bool {
        self.in_interrupt.load(Ordering::Relaxed)
    }

    fn switch_threads(&self, cur: Tid, next: Tid) -> Tid {
        self.switches.lock().push((cur, next));
        cur
    }

    fn alloc_thread_page(&self) -> Option<PageRef> {
        self.pages_left
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .ok()?;
        Some(PageRef::new(self.next_page.fetch_add(PAGE_SIZE, Ordering::Relaxed)))
    }

    fn free_thread_page(&self, _page: PageRef) {
        self.pages_freed.fetch_add(1, Ordering::Relaxed);
    }

    fn timer_frequency(&self) -> u64 {
        self.frequency
    }

    fn timer_ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_state_has_interrupts_off() {
        let p = SimPlatform::new();
        assert_eq!(p.interrupt_level(), IntrLevel::Off);
        assert!(!p.in_interrupt_context());
    }

    #[test]
    fn page_budget_exhausts() {
        let p = SimPlatform::with_page_budget(2);
        assert!(p.alloc_thread_page().is_some());
        assert!(p.alloc_thread_page().is_some());
        assert!(p.alloc_thread_page().is_none());
    }

    #[test]
    fn interrupt_entry_masks_and_exit_restores() {
        let p = SimPlatform::new();
        p.enable_interrupts();
        let prev = p.enter_interrupt();
        assert_eq!(prev, IntrLevel::On);
        assert!(p.in_interrupt_context());
        assert_eq!(p.interrupt_level(), IntrLevel::Off);
        p.leave_interrupt(prev);
        assert!(!p.in_interrupt_context());
        assert_eq!(p.interrupt_level(), IntrLevel::On);
    }
}
