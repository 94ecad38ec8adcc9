//! Scheduler core: thread lifecycle, dispatch and the timer hook.
//!
//! A single logical CPU; interleaving, not parallelism, is the hazard.
//! Process-wide state sits behind one spin mutex that is only ever taken
//! with interrupts disabled, and the guard is dropped before the
//! context-switch primitive runs; the switched-to thread may call back
//! into the scheduler.
//!
//! Dispatch is two-phase: [`Scheduler::schedule`] selects the next thread
//! and performs the handoff; `schedule_tail` finalizes on the far side of
//! the switch, marks the new thread running and reclaims a dying
//! predecessor. Reclamation must wait until the stack switch has landed,
//! which is the whole reason the tail is a separate, always-called step.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use spin::{Mutex, MutexGuard};

use super::error::{SchedError, SchedResult};
use super::stats::TickStats;
use crate::platform::{IntrGuard, IntrLevel, Platform, PAGE_SIZE};
use crate::sched_assert;
use crate::scheduler::config::{SchedConfig, SchedPolicy};
use crate::scheduler::donation;
use crate::scheduler::fixed_point::Fixed;
use crate::scheduler::mlfqs;
use crate::scheduler::ready_queue::ReadyQueue;
use crate::scheduler::thread::{
    get_checked, get_checked_mut, validate_transition, LockId, Thread, ThreadFlags, ThreadStatus,
    Tid,
};
use crate::scheduler::{NICE_DEFAULT, NICE_MAX, NICE_MIN, PRI_DEFAULT, PRI_MAX, PRI_MIN};

/// Everything the dispatcher mutates, under one lock.
struct SchedState {
    /// Storage arena; owns every live descriptor. Entries outlive their
    /// registration: a dying thread stays here until the dispatch that
    /// switched away from it finalizes.
    threads: BTreeMap<Tid, Thread>,
    /// Registration order of live threads: the iteration set for
    /// `for_each_thread` and the MLFQS sweeps.
    all: Vec<Tid>,
    ready: ReadyQueue,
    current: Tid,
    idle: Option<Tid>,
    /// Bootstrap thread; no backing page, never reclaimed.
    initial: Tid,
    next_tid: u64,
    load_avg: Fixed,
    /// Ticks consumed by the current slice.
    slice_ticks: u32,
    in_dispatch: bool,
    stats: TickStats,
}

impl SchedState {
    fn alloc_tid(&mut self) -> Tid {
        let tid = Tid::new(self.next_tid);
        self.next_tid += 1;
        tid
    }
}

/// The scheduling core. One instance per kernel, built at boot and never
/// torn down.
pub struct Scheduler<P: Platform> {
    platform: P,
    config: SchedConfig,
    state: Mutex<SchedState>,
}

impl<P: Platform> Scheduler<P> {
    /// Turns the code that is currently running into the `"main"`
    /// bootstrap thread and builds the scheduler context around it.
    /// Interrupts must still be disabled.
    pub fn new(platform: P, config: SchedConfig) -> Self {
        sched_assert!(
            platform.interrupt_level() == IntrLevel::Off,
            "scheduler built with interrupts enabled"
        );
        let tid = Tid::new(1);
        let mut main = Thread::new(tid, "main", PRI_DEFAULT, NICE_DEFAULT, None, None);
        main.status = ThreadStatus::Running;
        let mut threads = BTreeMap::new();
        threads.insert(tid, main);

        Scheduler {
            platform,
            config,
            state: Mutex::new(SchedState {
                threads,
                all: vec![tid],
                ready: ReadyQueue::new(),
                current: tid,
                idle: None,
                initial: tid,
                next_tid: 2,
                load_avg: Fixed::ZERO,
                slice_ticks: 0,
                in_dispatch: false,
                stats: TickStats::new(),
            }),
        }
    }

    /// The platform this scheduler drives. Harnesses use it to advance
    /// simulated time and raise interrupts.
    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn policy(&self) -> SchedPolicy {
        self.config.policy
    }

    /// Creates the idle thread and starts preemptive scheduling by
    /// enabling interrupts. Called once after [`Scheduler::new`].
    pub fn start(&self) {
        sched_assert!(
            self.platform.interrupt_level() == IntrLevel::Off,
            "start() with interrupts enabled"
        );
        {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            sched_assert!(st.idle.is_none(), "start() called twice");
            let page = self.platform.alloc_thread_page();
            sched_assert!(page.is_some(), "no memory for the idle thread");
            let tid = st.alloc_tid();
            let mut idle = Thread::new(tid, "idle", PRI_MIN, NICE_DEFAULT, page, None);
            idle.flags.insert(ThreadFlags::IDLE);
            st.threads.insert(tid, idle);
            st.all.push(tid);
            st.idle = Some(tid);
            log::info!("scheduler: idle thread {} created, enabling preemption", tid);
        }
        self.platform.enable_interrupts();
    }

    /// Creates a thread named `name` at `priority` and schedules it; the
    /// entry runs once, the first time the thread lands on the CPU.
    ///
    /// The one recoverable failure in the core: when the allocator cannot
    /// back the descriptor, the caller gets [`SchedError::OutOfMemory`].
    /// An out-of-range priority, by contrast, is a fatal invariant
    /// violation.
    pub fn create(
        &self,
        name: &str,
        priority: i32,
        runnable: impl FnOnce() + Send + 'static,
    ) -> SchedResult<Tid> {
        sched_assert!(
            (PRI_MIN..=PRI_MAX).contains(&priority),
            "priority {} outside [{}, {}]",
            priority,
            PRI_MIN,
            PRI_MAX
        );
        let Some(page) = self.platform.alloc_thread_page() else {
            return Err(SchedError::OutOfMemory {
                requested: PAGE_SIZE,
            });
        };

        let tid;
        {
            let _intr = IntrGuard::new(&self.platform);
            let mut guard = self.state.lock();
            let st = &mut *guard;
            tid = st.alloc_tid();
            // MLFQS fields: nice is inherited from the creator, recent
            // CPU starts at zero.
            let nice = get_checked(&st.threads, st.current).nice;
            let mut t = Thread::new(tid, name, priority, nice, Some(page), Some(Box::new(runnable)));
            if self.config.policy == SchedPolicy::Mlfqs {
                t.priority = mlfqs::priority_for(t.recent_cpu, t.nice);
            }
            st.threads.insert(tid, t);
            st.all.push(tid);
            Self::make_ready(st, tid, self.config.policy);
            log::debug!("scheduler: created thread {} '{}'", tid, name);
        }
        // Yield check: a higher-priority newcomer preempts immediately;
        // otherwise the dispatcher re-selects the creator.
        self.yield_now();
        Ok(tid)
    }

    /// Marks a thread ready and queues it. Interrupts are off and the
    /// state lock is held at every call site.
    fn make_ready(st: &mut SchedState, tid: Tid, policy: SchedPolicy) {
        sched_assert!(
            st.idle != Some(tid),
            "idle thread must never enter the ready queue"
        );
        {
            let t = get_checked_mut(&mut st.threads, tid);
            sched_assert!(
                validate_transition(t.status, ThreadStatus::Ready),
                "cannot make a {} thread ready",
                t.status
            );
            t.status = ThreadStatus::Ready;
        }
        st.ready.insert(tid, &st.threads, policy);
    }

    /// Puts the current thread to sleep until [`Scheduler::unblock`].
    /// Callable only outside interrupt context, with interrupts already
    /// disabled; the caller is responsible for having arranged the
    /// wakeup.
    pub fn block(&self) {
        sched_assert!(
            !self.platform.in_interrupt_context(),
            "block() inside interrupt context"
        );
        sched_assert!(
            self.platform.interrupt_level() == IntrLevel::Off,
            "block() with interrupts enabled"
        );
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let cur = st.current;
        let t = get_checked_mut(&mut st.threads, cur);
        sched_assert!(
            validate_transition(t.status, ThreadStatus::Blocked),
            "cannot block a {} thread",
            t.status
        );
        t.status = ThreadStatus::Blocked;
        self.schedule(guard);
    }

    /// Moves a blocked thread to the ready queue. Does not preempt: a
    /// caller that disabled interrupts itself can unblock a thread and
    /// finish its own update atomically.
    pub fn unblock(&self, tid: Tid) {
        let prev = self.platform.disable_interrupts();
        {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            sched_assert!(
                get_checked(&st.threads, tid).status == ThreadStatus::Blocked,
                "unblock of thread {} which is not blocked",
                tid
            );
            Self::make_ready(st, tid, self.config.policy);
        }
        self.platform.set_interrupt_level(prev);
    }

    /// Yields the CPU. The current thread goes back into the ready queue
    /// and may be re-selected immediately if it is still the highest
    /// priority.
    pub fn yield_now(&self) {
        sched_assert!(
            !self.platform.in_interrupt_context(),
            "yield_now() inside interrupt context"
        );
        let prev = self.platform.disable_interrupts();
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let cur = st.current;
        if st.idle == Some(cur) {
            // Idle never queues; it is re-selected only as the fallback.
            get_checked_mut(&mut st.threads, cur).status = ThreadStatus::Ready;
        } else {
            Self::make_ready(st, cur, self.config.policy);
        }
        self.schedule(guard);
        self.platform.set_interrupt_level(prev);
    }

    /// Deschedules and destroys the current thread. The descriptor
    /// outlives this call on purpose: the next dispatch finalization
    /// reclaims it, so the exiting thread's stack stays valid through
    /// the switch. In a real port control never comes back here, and the
    /// execution primitive must not resume a dying thread.
    pub fn exit(&self) {
        sched_assert!(
            !self.platform.in_interrupt_context(),
            "exit() inside interrupt context"
        );
        self.platform.disable_interrupts();
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let cur = st.current;
        if let Some(pos) = st.all.iter().position(|&t| t == cur) {
            st.all.remove(pos);
        }
        get_checked_mut(&mut st.threads, cur).status = ThreadStatus::Dying;
        self.schedule(guard);
    }

    /// Timer-interrupt hook, once per hardware tick; interrupt context
    /// only. Returns `true` when the current slice is exhausted and the
    /// interrupt layer should yield on return.
    pub fn tick(&self) -> bool {
        sched_assert!(
            self.platform.in_interrupt_context(),
            "tick() outside interrupt context"
        );
        sched_assert!(
            self.platform.interrupt_level() == IntrLevel::Off,
            "tick() with interrupts enabled"
        );
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let cur = st.current;

        if st.idle == Some(cur) {
            st.stats.record_idle();
        } else if get_checked(&st.threads, cur).flags.contains(ThreadFlags::USER) {
            st.stats.record_user();
        } else {
            st.stats.record_kernel();
        }

        if self.config.policy == SchedPolicy::Mlfqs {
            self.mlfqs_tick(st, cur);
        }

        st.slice_ticks += 1;
        st.slice_ticks >= self.config.time_slice
    }

    fn mlfqs_tick(&self, st: &mut SchedState, cur: Tid) {
        if st.idle != Some(cur) {
            let t = get_checked_mut(&mut st.threads, cur);
            t.recent_cpu = t.recent_cpu.add_int(1);
        }

        let now = self.platform.timer_ticks();
        if now % self.platform.timer_frequency() == 0 {
            // Load average first; the decay coefficient wants the fresh
            // value.
            let ready = Self::ready_thread_count_locked(st);
            st.load_avg = mlfqs::recalculated_load_avg(st.load_avg, ready);
            mlfqs::decay_recent_cpu(&mut st.threads, &st.all, st.load_avg);
            log::debug!(
                "mlfqs: load_avg(x100)={} with {} ready threads",
                st.load_avg.mul_int(100).to_int_round(),
                ready
            );
        }
        if now % u64::from(self.config.time_slice) == 0 {
            mlfqs::refresh_priorities(&mut st.threads, &st.all);
            st.ready.resort(&st.threads, self.config.policy);
        }
    }

    /// Threads that are running or ready, idle excluded.
    fn ready_thread_count_locked(st: &SchedState) -> i32 {
        let mut count = 0;
        for &tid in &st.all {
            if st.idle == Some(tid) {
                continue;
            }
            let t = get_checked(&st.threads, tid);
            if matches!(t.status, ThreadStatus::Running | ThreadStatus::Ready) {
                count += 1;
            }
        }
        count
    }

    pub fn ready_thread_count(&self) -> i32 {
        let _intr = IntrGuard::new(&self.platform);
        Self::ready_thread_count_locked(&self.state.lock())
    }

    /// Selects the next thread and hands the CPU over. Interrupts must be
    /// off and the current thread must already have left `Running`.
    fn schedule(&self, mut guard: MutexGuard<'_, SchedState>) {
        sched_assert!(
            self.platform.interrupt_level() == IntrLevel::Off,
            "schedule with interrupts enabled"
        );
        let st = &mut *guard;
        sched_assert!(!st.in_dispatch, "nested dispatch");
        let cur = st.current;
        sched_assert!(
            get_checked(&st.threads, cur).status != ThreadStatus::Running,
            "schedule() while the current thread is still running"
        );
        let next = match st.ready.pop_highest() {
            Some(tid) => tid,
            None => {
                // Idle fallback: runs only when nothing else can.
                let Some(idle) = st.idle else {
                    panic!("[SCHED CRITICAL] invariant violated: nothing to run and no idle thread");
                };
                idle
            }
        };
        st.in_dispatch = true;
        st.current = next;
        // The switch primitive must never run under the state lock; the
        // resumed thread may re-enter the scheduler.
        drop(guard);
        let prev = if cur != next {
            self.platform.switch_threads(cur, next)
        } else {
            cur
        };
        self.schedule_tail(prev);
    }

    /// Second phase of dispatch, after the stack switch has landed:
    /// marks the new thread running, starts its slice, and reclaims the
    /// previous thread if it was dying. Separate from `schedule` so a
    /// harness can drive the handoff with a fake switch primitive.
    pub(crate) fn schedule_tail(&self, prev: Tid) {
        sched_assert!(
            self.platform.interrupt_level() == IntrLevel::Off,
            "schedule_tail with interrupts enabled"
        );
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let cur = st.current;
        get_checked_mut(&mut st.threads, cur).status = ThreadStatus::Running;
        st.slice_ticks = 0;
        st.in_dispatch = false;

        if prev != cur
            && prev != st.initial
            && get_checked(&st.threads, prev).status == ThreadStatus::Dying
        {
            // Only safe now: the dying thread's stack is no longer in
            // use, and higher-level services may be called again.
            if let Some(dead) = st.threads.remove(&prev) {
                log::debug!("scheduler: reclaimed thread {} '{}'", prev, dead.name());
                if let Some(page) = dead.page {
                    self.platform.free_thread_page(page);
                }
            }
        }
    }

    /// Effective priority of the current thread.
    pub fn priority(&self) -> i32 {
        let _intr = IntrGuard::new(&self.platform);
        let st = self.state.lock();
        donation::effective_priority(&st.threads, self.config.policy, st.current)
    }

    /// Sets the current thread's base priority and re-runs the yield
    /// check, since a lowered priority may no longer be the highest ready.
    /// Ignored under MLFQS, which computes priority itself.
    pub fn set_priority(&self, new_priority: i32) {
        sched_assert!(
            (PRI_MIN..=PRI_MAX).contains(&new_priority),
            "priority {} outside [{}, {}]",
            new_priority,
            PRI_MIN,
            PRI_MAX
        );
        if self.config.policy == SchedPolicy::Mlfqs {
            log::debug!("scheduler: set_priority({}) ignored under mlfqs", new_priority);
            return;
        }
        {
            let _intr = IntrGuard::new(&self.platform);
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let cur = st.current;
            get_checked_mut(&mut st.threads, cur).priority = new_priority;
        }
        self.yield_now();
    }

    pub fn nice(&self) -> i32 {
        let _intr = IntrGuard::new(&self.platform);
        let st = self.state.lock();
        get_checked(&st.threads, st.current).nice
    }

    /// Sets the current thread's nice value, recomputes its MLFQS
    /// priority, and yields so a now-higher thread can take over.
    pub fn set_nice(&self, nice: i32) {
        sched_assert!(
            (NICE_MIN..=NICE_MAX).contains(&nice),
            "nice {} outside [{}, {}]",
            nice,
            NICE_MIN,
            NICE_MAX
        );
        {
            let _intr = IntrGuard::new(&self.platform);
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let cur = st.current;
            let t = get_checked_mut(&mut st.threads, cur);
            t.nice = nice;
            if self.config.policy == SchedPolicy::Mlfqs {
                t.priority = mlfqs::priority_for(t.recent_cpu, nice);
            }
        }
        self.yield_now();
    }

    /// System load average ×100, rounded to nearest.
    pub fn load_avg_x100(&self) -> i32 {
        let _intr = IntrGuard::new(&self.platform);
        let st = self.state.lock();
        st.load_avg.mul_int(100).to_int_round()
    }

    /// Current thread's recent CPU ×100, rounded to nearest.
    pub fn recent_cpu_x100(&self) -> i32 {
        let _intr = IntrGuard::new(&self.platform);
        let st = self.state.lock();
        get_checked(&st.threads, st.current)
            .recent_cpu
            .mul_int(100)
            .to_int_round()
    }

    /// Hook for the lock implementation: registers `donor`'s priority
    /// behind `receiver`, the holder of the lock `donor` wants. A thread
    /// donates at most once at a time system-wide; a repeat registration
    /// is a no-op. Donating to oneself is fatal.
    pub fn donate(&self, receiver: Tid, donor: Tid) {
        let _intr = IntrGuard::new(&self.platform);
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if donation::register(&mut st.threads, receiver, donor) {
            // Effective priorities moved under queued entries: the
            // receiver's, and transitively along lock chains.
            st.ready.resort(&st.threads, self.config.policy);
        }
    }

    /// Records or clears the lock `tid` is blocked trying to acquire.
    pub fn set_blocked_on(&self, tid: Tid, lock: Option<LockId>) {
        let _intr = IntrGuard::new(&self.platform);
        let mut guard = self.state.lock();
        let st = &mut *guard;
        get_checked_mut(&mut st.threads, tid).waiting_on = lock;
    }

    /// Hook for lock release: `tid` stopped waiting, so its donation is
    /// withdrawn and every stale ready-queue position (its own and its
    /// former receiver's) is recomputed.
    pub fn revoke_after_release(&self, tid: Tid) {
        let _intr = IntrGuard::new(&self.platform);
        let mut guard = self.state.lock();
        let st = &mut *guard;
        donation::detach(&mut st.threads, tid);
        st.ready.resort(&st.threads, self.config.policy);
    }

    /// Effective priority of an arbitrary thread, for the lock layer's
    /// wait-queue ordering.
    pub fn effective_priority(&self, tid: Tid) -> i32 {
        let _intr = IntrGuard::new(&self.platform);
        let st = self.state.lock();
        donation::effective_priority(&st.threads, self.config.policy, tid)
    }

    pub fn current_tid(&self) -> Tid {
        let _intr = IntrGuard::new(&self.platform);
        self.state.lock().current
    }

    pub fn current_name(&self) -> String {
        let _intr = IntrGuard::new(&self.platform);
        let st = self.state.lock();
        get_checked(&st.threads, st.current).name.clone()
    }

    pub fn idle_tid(&self) -> Option<Tid> {
        let _intr = IntrGuard::new(&self.platform);
        self.state.lock().idle
    }

    /// Runs `f` over every registered thread. Interrupts must be off:
    /// the arena may not change under the iteration.
    pub fn for_each_thread(&self, mut f: impl FnMut(&Thread)) {
        sched_assert!(
            self.platform.interrupt_level() == IntrLevel::Off,
            "for_each_thread with interrupts enabled"
        );
        let st = self.state.lock();
        for &tid in &st.all {
            f(get_checked(&st.threads, tid));
        }
    }

    pub fn stats(&self) -> TickStats {
        let _intr = IntrGuard::new(&self.platform);
        self.state.lock().stats
    }

    /// Logs the tick breakdown.
    pub fn print_stats(&self) {
        self.stats().log_summary();
    }
}
