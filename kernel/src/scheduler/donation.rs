//! Priority donation resolver.
//!
//! Defeats priority inversion: a high-priority thread blocked on a lock
//! donates its priority to the lock holder, transitively along chains of
//! held locks, so the holder cannot starve behind medium-priority
//! threads. Donation is disabled under MLFQS, where nice/recent-CPU
//! priority supersedes it.
//!
//! Donor sets are plain `Tid` lists walked through the arena, so the
//! recursive resolution can never follow a reference into a reclaimed
//! descriptor.

use alloc::collections::BTreeMap;

use crate::sched_assert;
use crate::scheduler::config::SchedPolicy;
use crate::scheduler::thread::{get_checked, get_checked_mut, Thread, ThreadFlags, Tid};

/// Donation chains deeper than this contribute base priority only.
/// Chains are expected to stay shallow; the cap keeps a corrupted cyclic
/// graph from hanging the resolver.
pub(crate) const MAX_DONATION_DEPTH: u32 = 8;

/// Effective priority of `tid`: the value scheduling decisions use.
///
/// Under MLFQS the stored priority is returned unmodified. Otherwise the
/// maximum of the thread's base priority and the effective priority of
/// every donor in its donatee set, resolved depth-first.
pub fn effective_priority(threads: &BTreeMap<Tid, Thread>, policy: SchedPolicy, tid: Tid) -> i32 {
    resolve(threads, policy, tid, MAX_DONATION_DEPTH)
}

fn resolve(threads: &BTreeMap<Tid, Thread>, policy: SchedPolicy, tid: Tid, depth: u32) -> i32 {
    let t = get_checked(threads, tid);
    if policy == SchedPolicy::Mlfqs || depth == 0 {
        return t.priority;
    }
    let mut highest = t.priority;
    for &donor in &t.donatees {
        let donated = resolve(threads, policy, donor, depth - 1);
        if donated > highest {
            highest = donated;
        }
    }
    highest
}

/// Registers `donor` in `receiver`'s donatee set.
///
/// A thread that has already donated, to any receiver, is not
/// registered again; the registration is one-per-donor system-wide, not
/// a multiset. Returns whether the set changed. Donating to oneself is a
/// fatal invariant violation.
pub(crate) fn register(threads: &mut BTreeMap<Tid, Thread>, receiver: Tid, donor: Tid) -> bool {
    sched_assert!(receiver != donor, "thread {} donating to itself", donor);
    if get_checked(threads, donor).flags.contains(ThreadFlags::DONATED) {
        return false;
    }
    get_checked_mut(threads, receiver).donatees.push(donor);
    get_checked_mut(threads, donor)
        .flags
        .insert(ThreadFlags::DONATED);
    true
}

/// Detaches `tid` from whichever donatee set holds it and clears its
/// donation bookkeeping. Returns whether an entry was removed.
pub(crate) fn detach(threads: &mut BTreeMap<Tid, Thread>, tid: Tid) -> bool {
    let mut removed = false;
    for t in threads.values_mut() {
        if let Some(pos) = t.donatees.iter().position(|&d| d == tid) {
            t.donatees.remove(pos);
            removed = true;
            break;
        }
    }
    let donor = get_checked_mut(threads, tid);
    donor.flags.remove(ThreadFlags::DONATED);
    donor.waiting_on = None;
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::thread::LockId;

    fn arena(specs: &[(u64, i32)]) -> BTreeMap<Tid, Thread> {
        let mut threads = BTreeMap::new();
        for &(tid, priority) in specs {
            let tid = Tid::new(tid);
            threads.insert(tid, Thread::new(tid, "t", priority, 0, None, None));
        }
        threads
    }

    #[test]
    fn no_donors_means_base_priority() {
        let threads = arena(&[(1, 31)]);
        assert_eq!(
            effective_priority(&threads, SchedPolicy::Priority, Tid::new(1)),
            31
        );
    }

    #[test]
    fn donation_takes_the_maximum() {
        let mut threads = arena(&[(1, 5), (2, 10), (3, 7)]);
        assert!(register(&mut threads, Tid::new(1), Tid::new(2)));
        assert!(register(&mut threads, Tid::new(1), Tid::new(3)));
        assert_eq!(
            effective_priority(&threads, SchedPolicy::Priority, Tid::new(1)),
            10
        );
    }

    #[test]
    fn chains_resolve_transitively() {
        // 2 donates to 1, 3 donates to 2: thread 1 sees 3's priority.
        let mut threads = arena(&[(1, 1), (2, 5), (3, 10)]);
        assert!(register(&mut threads, Tid::new(1), Tid::new(2)));
        assert!(register(&mut threads, Tid::new(2), Tid::new(3)));
        assert_eq!(
            effective_priority(&threads, SchedPolicy::Priority, Tid::new(1)),
            10
        );
    }

    #[test]
    fn second_donation_by_the_same_donor_is_a_noop() {
        let mut threads = arena(&[(1, 1), (2, 10), (3, 5)]);
        assert!(register(&mut threads, Tid::new(1), Tid::new(2)));
        assert!(!register(&mut threads, Tid::new(3), Tid::new(2)));
        assert_eq!(
            effective_priority(&threads, SchedPolicy::Priority, Tid::new(3)),
            5
        );
    }

    #[test]
    #[should_panic(expected = "donating to itself")]
    fn self_donation_is_fatal() {
        let mut threads = arena(&[(1, 31)]);
        register(&mut threads, Tid::new(1), Tid::new(1));
    }

    #[test]
    fn detach_restores_base_priority_and_clears_bookkeeping() {
        let mut threads = arena(&[(1, 1), (2, 10)]);
        assert!(register(&mut threads, Tid::new(1), Tid::new(2)));
        get_checked_mut(&mut threads, Tid::new(2)).waiting_on = Some(LockId(7));

        assert!(detach(&mut threads, Tid::new(2)));
        assert_eq!(
            effective_priority(&threads, SchedPolicy::Priority, Tid::new(1)),
            1
        );
        let donor = get_checked(&threads, Tid::new(2));
        assert!(!donor.flags.contains(ThreadFlags::DONATED));
        assert_eq!(donor.waiting_on, None);
        // The donor may donate again afterwards.
        assert!(register(&mut threads, Tid::new(1), Tid::new(2)));
    }

    #[test]
    fn mlfqs_ignores_donations() {
        let mut threads = arena(&[(1, 1), (2, 10)]);
        assert!(register(&mut threads, Tid::new(1), Tid::new(2)));
        assert_eq!(
            effective_priority(&threads, SchedPolicy::Mlfqs, Tid::new(1)),
            1
        );
    }

    #[test]
    fn resolution_depth_is_capped() {
        // A chain one longer than the cap: the priority at the far end
        // must not propagate all the way down.
        let count = MAX_DONATION_DEPTH as u64 + 2;
        let mut specs: alloc::vec::Vec<(u64, i32)> = (1..=count).map(|i| (i, 1)).collect();
        specs.last_mut().expect("chain is nonempty").1 = 63;
        let mut threads = arena(&specs);
        for i in 1..count {
            assert!(register(&mut threads, Tid::new(i), Tid::new(i + 1)));
        }
        assert_eq!(
            effective_priority(&threads, SchedPolicy::Priority, Tid::new(1)),
            1
        );
        // From one link up the chain, the far end is within reach.
        assert_eq!(
            effective_priority(&threads, SchedPolicy::Priority, Tid::new(2)),
            63
        );
    }
}
