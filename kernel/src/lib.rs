//! Piton kernel: the thread-scheduling core of a small instructional kernel.
//!
//! Decides which ready thread runs next on a single CPU, tracks per-thread
//! priority including donation across lock ownership, and offers an
//! alternative multi-level feedback queue (MLFQS) mode with fixed-point
//! load and CPU accounting.
//!
//! The surrounding kernel supplies the context-switch primitive, interrupt
//! control, timer and page allocator through [`platform::Platform`]. The
//! sole serialization mechanism for scheduler state is disabling hardware
//! interrupts; see [`platform::IntrGuard`].

#![no_std]

extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod platform;
pub mod scheduler;

pub use platform::{IntrGuard, IntrLevel, PageRef, Platform};
pub use scheduler::config::{SchedConfig, SchedPolicy};
pub use scheduler::core::{SchedError, SchedResult, Scheduler, TickStats};
pub use scheduler::fixed_point::Fixed;
pub use scheduler::thread::{LockId, Thread, ThreadFlags, ThreadStatus, Tid};
pub use scheduler::{
    NICE_DEFAULT, NICE_MAX, NICE_MIN, PRI_DEFAULT, PRI_MAX, PRI_MIN, TIME_SLICE,
};
