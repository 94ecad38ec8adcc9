//! Dispatch core: errors, tick accounting and the scheduler itself.

pub mod error;
pub mod scheduler;
pub mod stats;

pub use error::{SchedError, SchedResult};
pub use scheduler::Scheduler;
pub use stats::TickStats;
