//! MLFQS calculator: load average, recent CPU and priority recomputation.
//!
//! All three computations use 17.14 fixed point. Ordering matters in the
//! once-per-second pass: the load average is refreshed first because the
//! recent-CPU decay coefficient depends on the fresh value. The sweeps
//! cover every registered thread; blocked threads keep decaying.

use alloc::collections::BTreeMap;

use crate::scheduler::fixed_point::Fixed;
use crate::scheduler::thread::{get_checked_mut, Thread, Tid};
use crate::scheduler::{PRI_MAX, PRI_MIN};

/// priority = clamp(PRI_MAX − recent_cpu/4 − nice·2, PRI_MIN, PRI_MAX),
/// rounded to nearest.
pub(crate) fn priority_for(recent_cpu: Fixed, nice: i32) -> i32 {
    let raw = Fixed::from_int(PRI_MAX) - recent_cpu.div_int(4) - Fixed::from_int(nice * 2);
    raw.to_int_round().clamp(PRI_MIN, PRI_MAX)
}

/// load_avg = (59/60)·load_avg + (1/60)·ready_count.
pub(crate) fn recalculated_load_avg(load_avg: Fixed, ready_count: i32) -> Fixed {
    load_avg.mul_int(59).div_int(60) + Fixed::from_int(ready_count).div_int(60)
}

/// recent_cpu = (2·load_avg)/(2·load_avg + 1)·recent_cpu + nice, for
/// every registered thread.
pub(crate) fn decay_recent_cpu(
    threads: &mut BTreeMap<Tid, Thread>,
    all: &[Tid],
    load_avg: Fixed,
) {
    let twice_load = load_avg.mul_int(2);
    let coefficient = twice_load.div(twice_load.add_int(1));
    for &tid in all {
        let t = get_checked_mut(threads, tid);
        t.recent_cpu = coefficient.mul(t.recent_cpu).add_int(t.nice);
    }
}

/// Refreshes every registered thread's priority from its recent CPU and
/// nice value.
pub(crate) fn refresh_priorities(threads: &mut BTreeMap<Tid, Thread>, all: &[Tid]) {
    for &tid in all {
        let t = get_checked_mut(threads, tid);
        t.priority = priority_for(t.recent_cpu, t.nice);
    }
}
