//! Task-to-instance distribution algorithms.
//!
//! Three modes assign pending tasks across N instance buckets. Every call
//! returns exactly `instance_count` buckets; an empty pending set yields
//! empty buckets rather than an error.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::tasks::{Task, TaskStatus};
use crate::{hlog_debug, hlog_warn, Error};

/// The algorithm used to assign tasks to instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DistributionMode {
    /// Every instance receives the full pending list. Instances are
    /// expected to self-coordinate; no dedup primitive is provided.
    All,
    /// `tasks[i]` lands in bucket `i % instance_count`, preserving order.
    #[default]
    RoundRobin,
    /// Dependency chains are built from `blockedBy` links and merged
    /// down to the instance count.
    ByDependency,
}

impl std::fmt::Display for DistributionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DistributionMode::All => write!(f, "all"),
            DistributionMode::RoundRobin => write!(f, "round-robin"),
            DistributionMode::ByDependency => write!(f, "by-dependency"),
        }
    }
}

impl std::str::FromStr for DistributionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(DistributionMode::All),
            "round-robin" => Ok(DistributionMode::RoundRobin),
            "by-dependency" => Ok(DistributionMode::ByDependency),
            other => Err(Error::Validation(format!(
                "unknown distribution mode: {}",
                other
            ))),
        }
    }
}

/// Partition `tasks` into exactly `instance_count` buckets.
///
/// Completed tasks are filtered out first; only pending work is
/// distributed. An empty pending set is non-fatal and logged as a warning.
pub fn distribute_tasks(
    tasks: &[Task],
    instance_count: usize,
    mode: DistributionMode,
) -> Vec<Vec<Task>> {
    if instance_count == 0 {
        return Vec::new();
    }

    let pending: Vec<Task> = tasks
        .iter()
        .filter(|t| t.status != TaskStatus::Completed)
        .cloned()
        .collect();

    if pending.is_empty() {
        hlog_warn!(
            "distribute_tasks: no pending tasks, returning {} empty buckets",
            instance_count
        );
        return vec![Vec::new(); instance_count];
    }

    hlog_debug!(
        "distribute_tasks: {} pending across {} instances, mode={}",
        pending.len(),
        instance_count,
        mode
    );

    match mode {
        DistributionMode::All => vec![pending; instance_count],
        DistributionMode::RoundRobin => round_robin(pending, instance_count),
        DistributionMode::ByDependency => by_dependency(pending, instance_count),
    }
}

fn round_robin(pending: Vec<Task>, instance_count: usize) -> Vec<Vec<Task>> {
    let mut buckets = vec![Vec::new(); instance_count];
    for (i, task) in pending.into_iter().enumerate() {
        buckets[i % instance_count].push(task);
    }
    buckets
}

/// Group tasks into dependency chains, then merge/pad to the bucket count.
///
/// A task with an empty `blockedBy` is a chain root. Each chain is the
/// root plus the transitive closure of tasks whose `blockedBy` references
/// an already-included task. Tasks never reached from any root (cycle
/// participants) become singleton chains. Chains exceeding the bucket
/// count are merged greedily, two smallest first; a shortfall is padded
/// with empty buckets.
fn by_dependency(pending: Vec<Task>, instance_count: usize) -> Vec<Vec<Task>> {
    let mut chains = build_chains(&pending);

    // Greedy smallest-first merge. Not optimal bin packing, but stable.
    while chains.len() > instance_count {
        let a = smallest_chain(&chains);
        let merged = chains.remove(a);
        let b = smallest_chain(&chains);
        chains[b].extend(merged);
    }

    while chains.len() < instance_count {
        chains.push(Vec::new());
    }
    chains
}

fn build_chains(pending: &[Task]) -> Vec<Vec<Task>> {
    let mut visited: HashSet<String> = HashSet::new();
    let mut chains: Vec<Vec<Task>> = Vec::new();

    for task in pending {
        if !task.blocked_by.is_empty() || visited.contains(&task.id) {
            continue;
        }
        let mut chain = Vec::new();
        visited.insert(task.id.clone());
        chain.push(task.clone());
        collect_dependents(&task.id, pending, &mut visited, &mut chain);
        chains.push(chain);
    }

    // Anything unreached has only cyclic or dangling dependencies.
    for task in pending {
        if !visited.contains(&task.id) {
            visited.insert(task.id.clone());
            chains.push(vec![task.clone()]);
        }
    }

    chains
}

/// Depth-first walk pulling in every task blocked (directly or
/// transitively) by `id`. The visited set prevents re-assignment when
/// a task is blocked by members of two different chains.
fn collect_dependents(
    id: &str,
    pending: &[Task],
    visited: &mut HashSet<String>,
    chain: &mut Vec<Task>,
) {
    for task in pending {
        if visited.contains(&task.id) {
            continue;
        }
        if task.blocked_by.iter().any(|dep| dep == id) {
            visited.insert(task.id.clone());
            chain.push(task.clone());
            collect_dependents(&task.id, pending, visited, chain);
        }
    }
}

fn smallest_chain(chains: &[Vec<Task>]) -> usize {
    let mut best = 0;
    for (i, chain) in chains.iter().enumerate() {
        if chain.len() < chains[best].len() {
            best = i;
        }
    }
    best
}
