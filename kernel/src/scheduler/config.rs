//! Boot-time scheduling configuration.

use super::TIME_SLICE;

/// Which scheduling algorithm the kernel runs. Chosen once from the boot
/// command line and immutable for the life of the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedPolicy {
    /// Fixed base priorities, elevated through donation across lock
    /// ownership.
    #[default]
    Priority,
    /// Multi-level feedback queue: priority recomputed periodically from
    /// nice and recent CPU. Donation is disabled in this mode.
    Mlfqs,
}

/// Scheduler configuration, built once at boot.
#[derive(Debug, Clone, Copy)]
pub struct SchedConfig {
    pub policy: SchedPolicy,
    /// Timer ticks each thread gets before preemption is requested.
    pub time_slice: u32,
}

impl Default for SchedConfig {
    fn default() -> Self {
        SchedConfig {
            policy: SchedPolicy::Priority,
            time_slice: TIME_SLICE,
        }
    }
}

impl SchedConfig {
    pub fn with_policy(policy: SchedPolicy) -> Self {
        SchedConfig {
            policy,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_priority_scheduling() {
        let config = SchedConfig::default();
        assert_eq!(config.policy, SchedPolicy::Priority);
        assert_eq!(config.time_slice, TIME_SLICE);
    }
}
