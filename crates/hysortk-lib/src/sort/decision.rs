//! Choosing between the in-place and the aligned sort
//!
//! The aligned sort doubles the memory of every task it touches, so it is
//! only chosen when this process's share of free node memory covers the
//! bytes about to be sorted. The decision is taken once per process and
//! applied to all of its tasks.

use tracing::{debug, warn};

use crate::constants::SORT_MEMORY_FRACTION;

/// Strategy requested by the configuration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortPolicy {
    /// Decide from free memory
    #[default]
    Auto,
    /// Always use the in-place MSD sort
    InPlace,
    /// Always use the aligned LSD sort
    Aligned,
}

/// Strategy actually run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortStrategy {
    /// In-place American-flag MSD sort
    InPlace,
    /// Aligned LSD sort with a scratch buffer
    Aligned,
}

/// Pick a strategy from the free memory of the node and the processes sharing it
///
/// Unknown inputs fall back to the in-place sort.
pub fn choose_strategy(total_bytes: u64, free_bytes: Option<u64>, procs_per_node: Option<usize>) -> SortStrategy {
    match (free_bytes, procs_per_node) {
        (Some(free), Some(ppn)) if ppn > 0 => {
            let budget = free as f64 * SORT_MEMORY_FRACTION / ppn as f64;
            if budget >= total_bytes as f64 {
                SortStrategy::Aligned
            } else {
                SortStrategy::InPlace
            }
        }
        _ => SortStrategy::InPlace,
    }
}

/// Resolve `policy` for a process about to sort `total_bytes`
///
/// `procs_per_node` overrides the value read from `SLURM_TASKS_PER_NODE`.
pub fn sort_decision(total_bytes: u64, policy: SortPolicy, procs_per_node: Option<usize>) -> SortStrategy {
    match policy {
        SortPolicy::InPlace => SortStrategy::InPlace,
        SortPolicy::Aligned => SortStrategy::Aligned,
        SortPolicy::Auto => {
            let free = available_memory_bytes();
            let ppn = procs_per_node.or_else(procs_per_node_from_env);
            if free.is_none() {
                warn!("Free memory unknown, falling back to the in-place sort");
            }
            let strategy = choose_strategy(total_bytes, free, ppn);
            debug!(
                "Sort decision: {} bytes to sort, free memory {:?}, procs per node {:?} -> {:?}",
                total_bytes, free, ppn, strategy
            );
            strategy
        }
    }
}

/// Free memory of the node in bytes, if the platform reports it
pub fn available_memory_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        use procfs::Current;
        procfs::Meminfo::current()
            .ok()
            .map(|info| info.mem_available.unwrap_or(info.mem_free))
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

/// Processes per node as advertised by SLURM
pub fn procs_per_node_from_env() -> Option<usize> {
    std::env::var("SLURM_TASKS_PER_NODE")
        .ok()
        .and_then(|value| parse_tasks_per_node(&value))
}

/// Leading count of a SLURM tasks-per-node string such as `"4(x2),3"`
fn parse_tasks_per_node(value: &str) -> Option<usize> {
    let digits: String = value.trim().chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok().filter(|&n| n > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_choose_strategy() {
        let gib = 1u64 << 30;
        assert_eq!(choose_strategy(gib, Some(16 * gib), Some(4)), SortStrategy::Aligned);
        assert_eq!(choose_strategy(4 * gib, Some(16 * gib), Some(4)), SortStrategy::InPlace);
        assert_eq!(choose_strategy(gib, None, Some(4)), SortStrategy::InPlace);
        assert_eq!(choose_strategy(gib, Some(16 * gib), None), SortStrategy::InPlace);
        assert_eq!(choose_strategy(gib, Some(16 * gib), Some(0)), SortStrategy::InPlace);
    }

    #[test]
    fn test_forced_policies() {
        assert_eq!(sort_decision(u64::MAX, SortPolicy::Aligned, None), SortStrategy::Aligned);
        assert_eq!(sort_decision(0, SortPolicy::InPlace, Some(1)), SortStrategy::InPlace);
    }

    #[test]
    fn test_parse_tasks_per_node() {
        assert_eq!(parse_tasks_per_node("8"), Some(8));
        assert_eq!(parse_tasks_per_node("4(x2),3"), Some(4));
        assert_eq!(parse_tasks_per_node(" 16 "), Some(16));
        assert_eq!(parse_tasks_per_node("0"), None);
        assert_eq!(parse_tasks_per_node("n/a"), None);
    }
}
