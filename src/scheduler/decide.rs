// src/scheduler/decide.rs

//! Worker selection for runnable tasks.

use std::cmp::Reverse;
use std::time::Duration;

use crate::scheduler::{SchedulerState, WorkerInfo};
use crate::types::{WorkerAddr, resources_satisfy};

/// Pick the worker that should run `key`, or `None` if no running worker
/// satisfies its resource restrictions.
///
/// Ranking, best first:
/// 1. most bytes of the task's dependencies already held,
/// 2. lowest occupancy,
/// 3. fewest processing tasks,
/// 4. address.
pub fn decide_worker(state: &SchedulerState, key: &str) -> Option<WorkerAddr> {
    let ts = state.tasks.get(key)?;

    state
        .running_workers()
        .filter(|ws| resources_satisfy(&ws.resources, &ts.resource_restrictions))
        .min_by_key(|ws| {
            (
                Reverse(held_dependency_bytes(state, key, ws)),
                ws.occupancy,
                ws.processing.len(),
                ws.address.clone(),
            )
        })
        .map(|ws| ws.address.clone())
}

/// Bytes of `key`'s dependencies already on `ws`.
pub fn held_dependency_bytes(state: &SchedulerState, key: &str, ws: &WorkerInfo) -> u64 {
    let Some(ts) = state.tasks.get(key) else {
        return 0;
    };
    ts.dependencies
        .iter()
        .filter(|dep| ws.has_what.contains(*dep))
        .filter_map(|dep| state.tasks.get(dep).and_then(|d| d.nbytes))
        .sum()
}

/// Estimated time to move `key`'s missing dependencies onto `ws`.
pub fn transfer_cost(state: &SchedulerState, key: &str, ws: &WorkerInfo) -> Duration {
    let Some(ts) = state.tasks.get(key) else {
        return Duration::ZERO;
    };
    let missing: u64 = ts
        .dependencies
        .iter()
        .filter(|dep| !ws.has_what.contains(*dep))
        .filter_map(|dep| state.tasks.get(dep).and_then(|d| d.nbytes))
        .sum();
    let bandwidth = state.config.bandwidth.max(1) as f64;
    Duration::from_secs_f64(missing as f64 / bandwidth)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use crate::config::SchedulerConfig;
    use crate::scheduler::{TaskInfo, TaskState};
    use crate::types::{Priority, Resources, RunSpec};

    fn setup() -> SchedulerState {
        let now = Instant::now();
        let mut state = SchedulerState::new(SchedulerConfig::default(), now);
        for w in ["a", "b", "c"] {
            state.workers.insert(
                w.to_string(),
                WorkerInfo::new(w.to_string(), 1, Resources::new(), 1 << 30, now),
            );
        }
        let mut dep = TaskInfo::new("dep".into(), RunSpec::default(), Priority::default(), 3);
        dep.state = TaskState::Memory;
        dep.nbytes = Some(1000);
        dep.dependents.insert("t".into());
        state.tasks.insert("dep".into(), dep);

        let mut t = TaskInfo::new("t".into(), RunSpec::default(), Priority::default(), 3);
        t.dependencies.insert("dep".into());
        state.tasks.insert("t".into(), t);
        state
    }

    #[test]
    fn prefers_data_locality() {
        let mut state = setup();
        state.add_replica("dep", "c");
        assert_eq!(decide_worker(&state, "t").as_deref(), Some("c"));
    }

    #[test]
    fn ties_break_on_occupancy_then_address() {
        let mut state = setup();
        assert_eq!(decide_worker(&state, "t").as_deref(), Some("a"));

        state.workers.get_mut("a").unwrap().occupancy = Duration::from_secs(1);
        assert_eq!(decide_worker(&state, "t").as_deref(), Some("b"));
    }

    #[test]
    fn respects_resources_and_status() {
        let mut state = setup();
        state
            .tasks
            .get_mut("t")
            .unwrap()
            .resource_restrictions
            .insert("GPU".into(), 1.0);
        assert_eq!(decide_worker(&state, "t"), None);

        state.workers.get_mut("b").unwrap().resources.insert("GPU".into(), 2.0);
        assert_eq!(decide_worker(&state, "t").as_deref(), Some("b"));

        state.workers.get_mut("b").unwrap().status = crate::scheduler::WorkerStatus::ClosingGracefully;
        assert_eq!(decide_worker(&state, "t"), None);
    }

    #[test]
    fn transfer_cost_counts_missing_bytes_only() {
        let mut state = setup();
        state.config.bandwidth = 1000;
        let a = state.workers["a"].clone();
        assert_eq!(transfer_cost(&state, "t", &a), Duration::from_secs(1));
        state.add_replica("dep", "a");
        let a = state.workers["a"].clone();
        assert_eq!(transfer_cost(&state, "t", &a), Duration::ZERO);
    }
}
