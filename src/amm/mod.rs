// src/amm/mod.rs

//! Active Memory Manager (AMM).
//!
//! Runs an ordered list of [`Policy`]s against the scheduler state and
//! turns their [`Suggestion`]s into concrete replicate/drop instructions,
//! enforcing the safety rules:
//!
//! - never drop the last replica of a key (pending drops included);
//! - never drop a replica of a key that has a copy in flight, nor from a
//!   worker that is the destination of a pending copy;
//! - never drop a replica a dependent processing on that worker needs;
//! - never exceed `max_replicas` (pending copies included).
//!
//! Reconciliation is deterministic: replicates are accepted first, then
//! drops, and a drop for a key that received a replicate in the same cycle
//! is rejected. Accepted instructions stay pending until the worker
//! confirms them, the worker leaves, or `pending_ttl` cycles pass.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, trace};

use crate::config::AmmConfig;
use crate::scheduler::{SchedulerState, TaskState, WorkerStatus};
use crate::types::{Key, PolicyName, WorkerAddr};

pub mod policy;
pub mod reduce_replicas;
pub mod retire_worker;

pub use policy::{AmmView, Policy, Suggestion};
pub use reduce_replicas::ReduceReplicas;
pub use retire_worker::RetireWorker;

/// A concrete decision for the scheduler to send out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmmInstruction {
    /// `to` should fetch `key` from one of `from`.
    Replicate {
        key: Key,
        to: WorkerAddr,
        from: Vec<WorkerAddr>,
        nbytes: u64,
    },
    /// `from` should release its replica of `key`.
    Drop { key: Key, from: WorkerAddr },
}

/// Instructions issued but not yet confirmed, with the cycle they were
/// issued in.
#[derive(Debug, Default)]
pub struct PendingInstructions {
    replicate: BTreeMap<Key, BTreeMap<WorkerAddr, u64>>,
    drop: BTreeMap<Key, BTreeMap<WorkerAddr, u64>>,
}

impl PendingInstructions {
    pub fn replicate_count(&self, key: &str) -> usize {
        self.replicate.get(key).map_or(0, BTreeMap::len)
    }

    pub fn drop_count(&self, key: &str) -> usize {
        self.drop.get(key).map_or(0, BTreeMap::len)
    }

    pub fn replicates_to(&self, key: &str, worker: &str) -> bool {
        self.replicate.get(key).is_some_and(|m| m.contains_key(worker))
    }

    pub fn drops_from(&self, key: &str, worker: &str) -> bool {
        self.drop.get(key).is_some_and(|m| m.contains_key(worker))
    }

    /// Whether `worker` is waiting to receive any copy.
    pub fn is_destination(&self, worker: &str) -> bool {
        self.replicate.values().any(|m| m.contains_key(worker))
    }

    pub fn is_empty(&self) -> bool {
        self.replicate.is_empty() && self.drop.is_empty()
    }

    pub fn len(&self) -> usize {
        self.replicate.values().map(BTreeMap::len).sum::<usize>()
            + self.drop.values().map(BTreeMap::len).sum::<usize>()
    }

    fn insert_replicate(&mut self, key: &str, worker: &str, cycle: u64) {
        self.replicate
            .entry(key.to_string())
            .or_default()
            .insert(worker.to_string(), cycle);
    }

    fn insert_drop(&mut self, key: &str, worker: &str, cycle: u64) {
        self.drop
            .entry(key.to_string())
            .or_default()
            .insert(worker.to_string(), cycle);
    }

    fn remove(map: &mut BTreeMap<Key, BTreeMap<WorkerAddr, u64>>, key: &str, worker: &str) -> bool {
        let Some(inner) = map.get_mut(key) else {
            return false;
        };
        let removed = inner.remove(worker).is_some();
        if inner.is_empty() {
            map.remove(key);
        }
        removed
    }

    fn retain(
        map: &mut BTreeMap<Key, BTreeMap<WorkerAddr, u64>>,
        mut keep: impl FnMut(&str, &str, u64) -> bool,
    ) {
        for (key, inner) in map.iter_mut() {
            inner.retain(|worker, cycle| keep(key, worker, *cycle));
        }
        map.retain(|_, inner| !inner.is_empty());
    }
}

pub struct ActiveMemoryManager {
    config: AmmConfig,
    policies: Vec<Box<dyn Policy>>,
    pending: PendingInstructions,
    cycle: u64,
}

impl std::fmt::Debug for ActiveMemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveMemoryManager")
            .field("policies", &self.policies)
            .field("pending", &self.pending)
            .field("cycle", &self.cycle)
            .finish()
    }
}

impl ActiveMemoryManager {
    /// Build a manager with the policies listed in the config.
    pub fn new(config: AmmConfig) -> Self {
        let policies = config
            .policies
            .iter()
            .map(|name| match name {
                PolicyName::ReduceReplicas => Box::new(ReduceReplicas) as Box<dyn Policy>,
            })
            .collect();
        Self {
            config,
            policies,
            pending: PendingInstructions::default(),
            cycle: 0,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn add_policy(&mut self, policy: Box<dyn Policy>) {
        debug!(policy = %policy.name(), "amm policy installed");
        self.policies.push(policy);
    }

    pub fn policy_names(&self) -> Vec<String> {
        self.policies.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn pending(&self) -> &PendingInstructions {
        &self.pending
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// `worker` now holds `key` (or kept it after refusing a drop).
    pub fn confirm_replica(&mut self, key: &str, worker: &str) {
        if PendingInstructions::remove(&mut self.pending.replicate, key, worker) {
            trace!(key = %key, worker = %worker, "amm replicate confirmed");
        }
        if PendingInstructions::remove(&mut self.pending.drop, key, worker) {
            debug!(key = %key, worker = %worker, "amm drop rejected by worker");
        }
    }

    /// `worker` released its replica of `key`.
    pub fn confirm_drop(&mut self, key: &str, worker: &str) {
        if PendingInstructions::remove(&mut self.pending.drop, key, worker) {
            trace!(key = %key, worker = %worker, "amm drop confirmed");
        }
    }

    pub fn remove_worker(&mut self, worker: &str) {
        PendingInstructions::retain(&mut self.pending.replicate, |_, w, _| w != worker);
        PendingInstructions::retain(&mut self.pending.drop, |_, w, _| w != worker);
    }

    /// One AMM cycle.
    pub fn run_once(&mut self, state: &SchedulerState) -> Vec<AmmInstruction> {
        self.cycle += 1;
        let cycle = self.cycle;
        self.expire_and_prune(state);

        let view = AmmView {
            state,
            pending: &self.pending,
        };
        self.policies.retain(|p| {
            let done = p.done(&view);
            if done {
                debug!(policy = %p.name(), "amm policy finished");
            }
            !done
        });

        let mut suggestions = Vec::new();
        for policy in self.policies.iter_mut() {
            suggestions.extend(policy.suggest(&view));
        }

        // Suggestions already covered by pending instructions.
        let mut already_pending: BTreeMap<(bool, Key), usize> = BTreeMap::new();
        for s in &suggestions {
            let (is_replicate, key) = match s {
                Suggestion::Replicate { key, .. } => (true, key),
                Suggestion::Drop { key, .. } => (false, key),
            };
            let count = if is_replicate {
                self.pending.replicate_count(key)
            } else {
                self.pending.drop_count(key)
            };
            already_pending.entry((is_replicate, key.clone())).or_insert(count);
        }
        let mut covered = |is_replicate: bool, key: &Key| -> bool {
            match already_pending.get_mut(&(is_replicate, key.clone())) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    true
                }
                _ => false,
            }
        };

        let mut out = Vec::new();
        let mut replicated: BTreeSet<Key> = BTreeSet::new();

        for s in &suggestions {
            if let Suggestion::Replicate { key, candidates } = s {
                if covered(true, key) {
                    continue;
                }
                if let Some(instr) = self.accept_replicate(state, key, candidates.as_ref(), cycle) {
                    replicated.insert(key.clone());
                    out.push(instr);
                }
            }
        }

        for s in &suggestions {
            if let Suggestion::Drop { key, candidates } = s {
                if covered(false, key) {
                    continue;
                }
                if replicated.contains(key) {
                    debug!(key = %key, "amm conflict: drop rejected in favour of replicate");
                    continue;
                }
                if let Some(instr) = self.accept_drop(state, key, candidates.as_ref(), cycle) {
                    out.push(instr);
                }
            }
        }

        out
    }

    fn expire_and_prune(&mut self, state: &SchedulerState) {
        let cycle = self.cycle;
        let ttl = self.config.pending_ttl;
        let live = |key: &str| state.task(key).filter(|t| t.state == TaskState::Memory);

        PendingInstructions::retain(&mut self.pending.replicate, |key, worker, issued| {
            let fresh = issued + ttl > cycle;
            let useful = live(key).is_some_and(|t| !t.who_has.contains(worker))
                && state.worker(worker).is_some();
            if fresh && !useful {
                trace!(key = %key, worker = %worker, "pending replicate obsolete");
            }
            fresh && useful
        });
        PendingInstructions::retain(&mut self.pending.drop, |key, worker, issued| {
            let fresh = issued + ttl > cycle;
            let useful = live(key).is_some_and(|t| t.who_has.contains(worker));
            fresh && useful
        });
    }

    fn accept_replicate(
        &mut self,
        state: &SchedulerState,
        key: &str,
        candidates: Option<&BTreeSet<WorkerAddr>>,
        cycle: u64,
    ) -> Option<AmmInstruction> {
        let ts = state.task(key)?;
        if ts.state != TaskState::Memory || ts.who_has.is_empty() {
            return None;
        }
        let projected = ts.who_has.len() + self.pending.replicate_count(key);
        if projected >= self.config.max_replicas {
            debug!(key = %key, projected, "amm replicate rejected: max_replicas");
            return None;
        }

        let to = state
            .running_workers()
            .filter(|ws| !ts.who_has.contains(&ws.address))
            .filter(|ws| !self.pending.replicates_to(key, &ws.address))
            .filter(|ws| candidates.is_none_or(|c| c.contains(&ws.address)))
            .min_by_key(|ws| (ws.nbytes, ws.address.clone()))?
            .address
            .clone();

        self.pending.insert_replicate(key, &to, cycle);
        debug!(key = %key, to = %to, "amm replicate accepted");
        Some(AmmInstruction::Replicate {
            key: key.to_string(),
            to,
            from: ts.who_has.iter().cloned().collect(),
            nbytes: ts.nbytes.unwrap_or(0),
        })
    }

    fn accept_drop(
        &mut self,
        state: &SchedulerState,
        key: &str,
        candidates: Option<&BTreeSet<WorkerAddr>>,
        cycle: u64,
    ) -> Option<AmmInstruction> {
        let ts = state.task(key)?;
        if ts.state != TaskState::Memory {
            return None;
        }
        if self.pending.replicate_count(key) > 0 {
            debug!(key = %key, "amm drop rejected: copy in flight");
            return None;
        }

        let holders: Vec<&WorkerAddr> = ts
            .who_has
            .iter()
            .filter(|w| !self.pending.drops_from(key, w))
            .collect();
        if holders.len() <= 1 {
            debug!(
                key = %key,
                referenced = ts.is_referenced(),
                "amm drop rejected: would remove the last replica"
            );
            return None;
        }

        let needed_on = |worker: &str| {
            ts.dependents.iter().any(|d| {
                state.task(d).is_some_and(|dt| {
                    dt.state == TaskState::Processing && dt.processing_on.as_deref() == Some(worker)
                })
            })
        };

        let from = holders
            .into_iter()
            .filter(|w| candidates.is_none_or(|c| c.contains(*w)))
            .filter(|w| !self.pending.is_destination(w.as_str()))
            .filter(|w| !needed_on(w.as_str()))
            .filter_map(|w| state.worker(w))
            .max_by_key(|ws| {
                (
                    ws.status == WorkerStatus::ClosingGracefully,
                    ws.nbytes,
                    Reverse(ws.address.clone()),
                )
            })?
            .address
            .clone();

        self.pending.insert_drop(key, &from, cycle);
        debug!(key = %key, from = %from, "amm drop accepted");
        Some(AmmInstruction::Drop {
            key: key.to_string(),
            from,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use crate::config::SchedulerConfig;
    use crate::scheduler::{TaskInfo, WorkerInfo};
    use crate::types::{Priority, Resources, RunSpec};

    fn state(workers: &[&str]) -> SchedulerState {
        let now = Instant::now();
        let mut state = SchedulerState::new(SchedulerConfig::default(), now);
        for w in workers {
            state.workers.insert(
                w.to_string(),
                WorkerInfo::new(w.to_string(), 1, Resources::new(), 1 << 30, now),
            );
        }
        state
    }

    fn in_memory(state: &mut SchedulerState, key: &str, holders: &[&str]) {
        let mut ts = TaskInfo::new(key.to_string(), RunSpec::default(), Priority::default(), 3);
        ts.state = TaskState::Memory;
        ts.nbytes = Some(100);
        state.tasks.insert(key.to_string(), ts);
        for h in holders {
            state.add_replica(key, h);
        }
    }

    #[test]
    fn reduce_replicas_keeps_one_copy_and_is_idempotent() {
        let mut st = state(&["a", "b", "c"]);
        in_memory(&mut st, "x", &["a", "b", "c"]);
        let mut amm = ActiveMemoryManager::new(AmmConfig::default());

        let first = amm.run_once(&st);
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|i| matches!(i, AmmInstruction::Drop { .. })));
        assert_eq!(amm.pending().drop_count("x"), 2);

        let second = amm.run_once(&st);
        assert!(second.is_empty());
    }

    #[test]
    fn pending_instructions_expire() {
        let mut st = state(&["a", "b"]);
        in_memory(&mut st, "x", &["a", "b"]);
        let config = AmmConfig {
            pending_ttl: 2,
            ..AmmConfig::default()
        };
        let mut amm = ActiveMemoryManager::new(config);

        assert_eq!(amm.run_once(&st).len(), 1);
        assert!(amm.run_once(&st).is_empty());
        // Third cycle: the unconfirmed drop expired and is re-evaluated.
        assert_eq!(amm.run_once(&st).len(), 1);
    }

    #[test]
    fn confirmed_drop_clears_pending() {
        let mut st = state(&["a", "b"]);
        in_memory(&mut st, "x", &["a", "b"]);
        let mut amm = ActiveMemoryManager::new(AmmConfig::default());

        let AmmInstruction::Drop { from, .. } = amm.run_once(&st).remove(0) else {
            panic!("expected a drop");
        };
        st.remove_replica("x", &from);
        amm.confirm_drop("x", &from);
        assert!(amm.pending().is_empty());
        assert!(amm.run_once(&st).is_empty());
    }

    #[test]
    fn drop_prefers_heaviest_holder() {
        let mut st = state(&["a", "b"]);
        in_memory(&mut st, "x", &["a", "b"]);
        in_memory(&mut st, "ballast", &["b"]);
        let mut amm = ActiveMemoryManager::new(AmmConfig::default());

        let instructions = amm.run_once(&st);
        assert_eq!(
            instructions,
            vec![AmmInstruction::Drop {
                key: "x".into(),
                from: "b".into()
            }]
        );
    }
}
