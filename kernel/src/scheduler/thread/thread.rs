//! Thread descriptor.
//!
//! One descriptor per schedulable unit of execution, backed by a single
//! allocator page that also holds the thread's kernel stack. The stack
//! grows down toward the descriptor, so the `magic` guard at the end of
//! the struct is the first thing an overflow tramples; every registry
//! lookup checks it.
//!
//! A descriptor is owned by the arena and referenced everywhere else by
//! [`Tid`]. At most one wait container (ready queue, a lock's wait list,
//! the timer's sleep list) refers to a thread at a time.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt;

use super::state::ThreadStatus;
use crate::platform::PageRef;
use crate::sched_assert;
use crate::scheduler::fixed_point::Fixed;
use crate::scheduler::{PRI_MAX, PRI_MIN};

/// Thread identifier. Allocated monotonically starting at 1; never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid(u64);

impl Tid {
    pub(crate) const fn new(raw: u64) -> Tid {
        Tid(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle naming a lock owned by the external synchronization
/// primitives. The scheduler only stores and compares it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockId(pub u64);

/// Guard value detecting descriptor corruption from stack overflow.
pub(crate) const THREAD_MAGIC: u32 = 0xcd6a_bf4b;

/// A thread's entry point, invoked exactly once by the execution
/// primitive the first time the thread is dispatched.
pub type Runnable = Box<dyn FnOnce() + Send>;

bitflags! {
    /// Per-thread boolean state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadFlags: u8 {
        /// This thread is currently donating its priority to a receiver.
        /// A thread holds at most one active donation system-wide.
        const DONATED = 1 << 0;
        /// The idle thread; never admitted to the ready queue.
        const IDLE = 1 << 1;
        /// Runs user code; only tick accounting looks at this.
        const USER = 1 << 2;
    }
}

/// A kernel thread descriptor.
pub struct Thread {
    pub(crate) tid: Tid,
    pub(crate) name: String,
    pub(crate) status: ThreadStatus,
    /// Base priority; donation may raise the effective value above it.
    pub(crate) priority: i32,
    pub(crate) flags: ThreadFlags,

    // MLFQS accounting; meaningful only under SchedPolicy::Mlfqs.
    pub(crate) recent_cpu: Fixed,
    pub(crate) nice: i32,

    // Donation bookkeeping, shared with the synchronization primitives.
    pub(crate) donatees: Vec<Tid>,
    pub(crate) waiting_on: Option<LockId>,

    // Owned by the external timer: the sleep deadline and the counter of
    // the per-thread semaphore it parks sleepers on.
    pub(crate) wakeup_tick: u64,
    pub(crate) sleep_permits: u32,

    /// Allocator-provided backing page; `None` only for the bootstrap
    /// thread, whose memory was never dynamically obtained.
    pub(crate) page: Option<PageRef>,
    pub(crate) runnable: Option<Runnable>,

    /// Must stay [`THREAD_MAGIC`]; anything else means the stack grew
    /// into the descriptor.
    pub(crate) magic: u32,
}

impl Thread {
    /// Basic initialization of a blocked thread named `name`.
    pub(crate) fn new(
        tid: Tid,
        name: &str,
        priority: i32,
        nice: i32,
        page: Option<PageRef>,
        runnable: Option<Runnable>,
    ) -> Thread {
        debug_assert!((PRI_MIN..=PRI_MAX).contains(&priority));
        Thread {
            tid,
            name: name.to_string(),
            status: ThreadStatus::Blocked,
            priority,
            flags: ThreadFlags::empty(),
            recent_cpu: Fixed::ZERO,
            nice,
            donatees: Vec::new(),
            waiting_on: None,
            wakeup_tick: 0,
            sleep_permits: 0,
            page,
            runnable,
            magic: THREAD_MAGIC,
        }
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> ThreadStatus {
        self.status
    }

    /// Base priority, before donation.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn nice(&self) -> i32 {
        self.nice
    }

    pub fn recent_cpu(&self) -> Fixed {
        self.recent_cpu
    }

    pub fn flags(&self) -> ThreadFlags {
        self.flags
    }

    pub fn is_idle(&self) -> bool {
        self.flags.contains(ThreadFlags::IDLE)
    }

    pub fn waiting_on(&self) -> Option<LockId> {
        self.waiting_on
    }

    pub fn wakeup_tick(&self) -> u64 {
        self.wakeup_tick
    }

    /// Timer hook: records when this sleeper should be woken.
    pub fn set_wakeup_tick(&mut self, tick: u64) {
        self.wakeup_tick = tick;
    }

    /// Timer hook: releases one permit on the per-thread sleep
    /// semaphore. The timer pairs this with an unblock.
    pub fn post_sleep_permit(&mut self) {
        self.sleep_permits += 1;
    }

    /// Timer hook: consumes a sleep permit if one is available; a
    /// sleeper that finds none blocks until the timer posts one.
    pub fn take_sleep_permit(&mut self) -> bool {
        if self.sleep_permits > 0 {
            self.sleep_permits -= 1;
            true
        } else {
            false
        }
    }

    /// Takes the entry point; the execution primitive calls this once
    /// when the thread first lands on the CPU.
    pub fn take_runnable(&mut self) -> Option<Runnable> {
        self.runnable.take()
    }

    pub(crate) fn magic_ok(&self) -> bool {
        self.magic == THREAD_MAGIC
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("tid", &self.tid)
            .field("name", &self.name)
            .field("status", &self.status)
            .field("priority", &self.priority)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

/// Arena lookup with the corruption check every access goes through.
/// Both failures are fatal invariant violations.
pub(crate) fn get_checked(threads: &BTreeMap<Tid, Thread>, tid: Tid) -> &Thread {
    let Some(t) = threads.get(&tid) else {
        panic!("[SCHED CRITICAL] invariant violated: unknown thread {}", tid);
    };
    sched_assert!(t.magic_ok(), "thread {} descriptor guard corrupted", tid);
    t
}

pub(crate) fn get_checked_mut(threads: &mut BTreeMap<Tid, Thread>, tid: Tid) -> &mut Thread {
    let Some(t) = threads.get_mut(&tid) else {
        panic!("[SCHED CRITICAL] invariant violated: unknown thread {}", tid);
    };
    sched_assert!(t.magic_ok(), "thread {} descriptor guard corrupted", tid);
    t
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;
    use static_assertions::const_assert;

    // The descriptor shares its page with the thread's stack; it must
    // stay small.
    const_assert!(size_of::<Thread>() <= 256);

    fn plain(tid: u64) -> Thread {
        Thread::new(Tid::new(tid), "t", 31, 0, None, None)
    }

    #[test]
    fn new_threads_start_blocked_with_clean_bookkeeping() {
        let t = plain(7);
        assert_eq!(t.status(), ThreadStatus::Blocked);
        assert!(t.donatees.is_empty());
        assert_eq!(t.waiting_on(), None);
        assert_eq!(t.recent_cpu(), Fixed::ZERO);
        assert!(t.magic_ok());
    }

    #[test]
    fn sleep_permits_count_posts_and_takes() {
        let mut t = plain(2);
        assert!(!t.take_sleep_permit());
        t.set_wakeup_tick(120);
        t.post_sleep_permit();
        assert_eq!(t.wakeup_tick(), 120);
        assert!(t.take_sleep_permit());
        assert!(!t.take_sleep_permit());
    }

    #[test]
    fn runnable_is_taken_exactly_once() {
        let mut t = Thread::new(Tid::new(1), "worker", 31, 0, None, Some(Box::new(|| {})));
        assert!(t.take_runnable().is_some());
        assert!(t.take_runnable().is_none());
    }

    #[test]
    #[should_panic(expected = "guard corrupted")]
    fn corrupted_guard_is_fatal() {
        let mut threads = BTreeMap::new();
        let mut t = plain(3);
        t.magic = 0xdead_beef;
        threads.insert(t.tid, t);
        get_checked(&threads, Tid::new(3));
    }

    #[test]
    #[should_panic(expected = "unknown thread")]
    fn unknown_tid_is_fatal() {
        let threads = BTreeMap::new();
        get_checked(&threads, Tid::new(42));
    }
}
