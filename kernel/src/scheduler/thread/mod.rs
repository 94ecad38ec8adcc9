//! Thread descriptors and their lifecycle states.

pub mod state;
pub mod thread;

pub use state::{validate_transition, ThreadStatus};
pub use thread::{LockId, Runnable, Thread, ThreadFlags, Tid};

pub(crate) use thread::{get_checked, get_checked_mut};
