// src/scheduler/transitions.rs

//! The recommendation-driven transition engine.
//!
//! Handlers never move a task directly; they produce [`Recommendations`]
//! (key -> desired state) and hand them to [`SchedulerState::transitions`],
//! which applies them first-in first-out until none remain. Each applied
//! step may yield further recommendations and push messages for workers
//! and clients into the outbox.
//!
//! A recommendation is an intent. When the task has already moved on by
//! the time its recommendation is popped (for example a `Forgotten`
//! recommendation for a task that was re-requested meanwhile) the
//! recommendation is dropped. The actual state changes all go through
//! [`SchedulerState::set_state`], which rejects anything outside the
//! transition table.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use tracing::{debug, trace};

use crate::errors::{FlotillaError, Result};
use crate::protocol::{ClientMessage, ComputeTask, WorkerMessage};
use crate::scheduler::decide::decide_worker;
use crate::scheduler::{SchedulerCommand, SchedulerState, TaskState};
use crate::types::{Key, WorkerAddr};

/// Ordered set of pending recommendations. A later recommendation for a
/// key that is still queued replaces the earlier target in place.
#[derive(Debug, Default, Clone)]
pub struct Recommendations {
    order: VecDeque<Key>,
    targets: HashMap<Key, TaskState>,
}

impl Recommendations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: impl Into<Key>, finish: TaskState) {
        let key = key.into();
        if self.targets.insert(key.clone(), finish).is_none() {
            self.order.push_back(key);
        }
    }

    pub fn pop(&mut self) -> Option<(Key, TaskState)> {
        let key = self.order.pop_front()?;
        let finish = self.targets.remove(&key)?;
        Some((key, finish))
    }

    pub fn extend(&mut self, other: Recommendations) {
        let Recommendations { order, mut targets } = other;
        for key in order {
            if let Some(finish) = targets.remove(&key) {
                self.push(key, finish);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }
}

impl SchedulerState {
    /// Apply recommendations until the queue drains.
    pub(crate) fn transitions(
        &mut self,
        mut recs: Recommendations,
        stimulus_id: &str,
        out: &mut Vec<SchedulerCommand>,
    ) -> Result<()> {
        let max = self.config.transition_counter_max;
        let mut applied = 0usize;

        while let Some((key, finish)) = recs.pop() {
            applied += 1;
            if max > 0 && applied > max {
                self.log_event(
                    "transition-loop",
                    Some(&key),
                    format!("more than {max} transitions"),
                    stimulus_id,
                );
                return Err(FlotillaError::TransitionLoop(applied));
            }
            let next = self.transition(&key, finish, stimulus_id, out)?;
            recs.extend(next);
        }
        Ok(())
    }

    /// Resolve one recommendation against the task's current state.
    fn transition(
        &mut self,
        key: &str,
        finish: TaskState,
        stimulus_id: &str,
        out: &mut Vec<SchedulerCommand>,
    ) -> Result<Recommendations> {
        use TaskState::*;

        let Some(start) = self.task_state(key) else {
            trace!(key = %key, %finish, "recommendation for forgotten task dropped");
            return Ok(Recommendations::new());
        };

        match (start, finish) {
            (Released, Waiting) => self.released_waiting(key, stimulus_id),
            (Erred, Waiting) => self.erred_waiting(key, stimulus_id),
            (Waiting | NoWorker, Processing) => self.schedule(key, stimulus_id, out),
            (Waiting | Processing, Erred) => self.to_erred(key, stimulus_id, out),
            (Memory, Released) => self.memory_released(key, stimulus_id, out),
            (Waiting | NoWorker | Processing | Erred, Released) => {
                self.to_released(key, stimulus_id, out)
            }
            (Released, Forgotten) => self.released_forgotten(key, stimulus_id),

            (start, finish) if start == finish => {
                trace!(key = %key, %start, "recommendation already satisfied");
                Ok(Recommendations::new())
            }

            // Every push is chosen from the task's state at push time and
            // only the task's own pop moves it, so anything else is a bug.
            // `memory` and `no-worker` in particular are never recommended.
            _ => Err(self.invalid_transition(key, start, finish, stimulus_id)),
        }
    }

    /// The single mutation point for `TaskInfo::state`.
    pub(crate) fn set_state(&mut self, key: &str, finish: TaskState, stimulus_id: &str) -> Result<()> {
        let start = self.task_mut(key)?.state;
        if !start.can_transition_to(finish) {
            return Err(self.invalid_transition(key, start, finish, stimulus_id));
        }
        self.task_mut(key)?.state = finish;
        self.record_transition(key, start, finish, stimulus_id);
        debug!(key = %key, %start, %finish, stimulus_id = %stimulus_id, "transition");
        Ok(())
    }

    fn released_waiting(&mut self, key: &str, stimulus_id: &str) -> Result<Recommendations> {
        if !self.task_mut(key)?.is_referenced() {
            trace!(key = %key, "unreferenced task not moved to waiting");
            return Ok(Recommendations::new());
        }
        self.set_state(key, TaskState::Waiting, stimulus_id)?;
        self.resolve_dependencies(key)
    }

    fn erred_waiting(&mut self, key: &str, stimulus_id: &str) -> Result<Recommendations> {
        let ts = self.task_mut(key)?;
        ts.exception = None;
        ts.exception_blame = None;
        self.set_state(key, TaskState::Waiting, stimulus_id)?;
        self.resolve_dependencies(key)
    }

    /// Compute `waiting_on` for a task that just entered `waiting`, pin
    /// its dependencies and request the missing ones.
    fn resolve_dependencies(&mut self, key: &str) -> Result<Recommendations> {
        let mut recs = Recommendations::new();
        let deps: Vec<Key> = self.task_mut(key)?.dependencies.iter().cloned().collect();

        let mut waiting_on = BTreeSet::new();
        let mut erred_dep: Option<Key> = None;

        for dep in &deps {
            let in_memory = self.in_memory(dep);
            let d = self.task_mut(dep)?;
            d.waiters.insert(key.to_string());
            if in_memory {
                continue;
            }
            waiting_on.insert(dep.clone());
            match d.state {
                TaskState::Released => recs.push(dep.clone(), TaskState::Waiting),
                TaskState::Erred => {
                    erred_dep.get_or_insert_with(|| dep.clone());
                }
                _ => {}
            }
        }

        let inherited = match &erred_dep {
            Some(dep) => {
                let d = self.task_mut(dep)?;
                Some((d.exception.clone(), d.exception_blame.clone()))
            }
            None => None,
        };

        let ts = self.task_mut(key)?;
        let ready = waiting_on.is_empty();
        ts.waiting_on = waiting_on;

        if let Some((exception, blame)) = inherited {
            ts.exception = exception;
            ts.exception_blame = blame;
            recs.push(key, TaskState::Erred);
        } else if ready {
            recs.push(key, TaskState::Processing);
        }
        Ok(recs)
    }

    /// `waiting`/`no-worker` -> `processing`, or `waiting` -> `no-worker`
    /// when no worker qualifies.
    fn schedule(
        &mut self,
        key: &str,
        stimulus_id: &str,
        out: &mut Vec<SchedulerCommand>,
    ) -> Result<Recommendations> {
        let ts = self.task_mut(key)?;
        let start = ts.state;
        if !ts.waiting_on.is_empty() {
            trace!(key = %key, "dependencies went missing before scheduling");
            return Ok(Recommendations::new());
        }

        match decide_worker(self, key) {
            Some(worker) => {
                if start == TaskState::NoWorker {
                    self.unrunnable.remove(key);
                    self.task_mut(key)?.no_worker_since = None;
                }
                self.set_state(key, TaskState::Processing, stimulus_id)?;
                let estimate = self.estimate_duration(key);
                self.set_processing(key, &worker, estimate);
                let msg = self.compute_task_msg(key, stimulus_id)?;
                debug!(key = %key, worker = %worker, ?estimate, "assigned task");
                out.push(SchedulerCommand::SendToWorker {
                    worker,
                    msg: WorkerMessage::ComputeTask(msg),
                });
            }
            None if start == TaskState::Waiting => {
                self.set_state(key, TaskState::NoWorker, stimulus_id)?;
                let now = self.now;
                let ts = self.task_mut(key)?;
                ts.no_worker_since = Some(now);
                ts.unrunnable_warned = false;
                self.unrunnable.insert(key.to_string());
                debug!(key = %key, "no worker satisfies restrictions");
            }
            None => {}
        }
        Ok(Recommendations::new())
    }

    /// Build the `task-assign` message for a task being processed.
    pub(crate) fn compute_task_msg(&self, key: &str, stimulus_id: &str) -> Result<ComputeTask> {
        let ts = self
            .tasks
            .get(key)
            .ok_or_else(|| FlotillaError::TaskNotFound(key.to_string()))?;

        let mut who_has: BTreeMap<Key, Vec<WorkerAddr>> = BTreeMap::new();
        let mut nbytes: BTreeMap<Key, u64> = BTreeMap::new();
        for dep in &ts.dependencies {
            if let Some(d) = self.tasks.get(dep) {
                who_has.insert(dep.clone(), d.who_has.iter().cloned().collect());
                nbytes.insert(dep.clone(), d.nbytes.unwrap_or(0));
            }
        }

        Ok(ComputeTask {
            key: key.to_string(),
            run_spec: ts.run_spec.clone(),
            priority: ts.priority,
            who_has,
            nbytes,
            resource_restrictions: ts.resource_restrictions.clone(),
            duration: self.estimate_duration(key),
            stimulus_id: stimulus_id.to_string(),
        })
    }

    /// `processing` -> `memory` on a successful report from `worker`.
    pub(crate) fn processing_memory(
        &mut self,
        key: &str,
        worker: &str,
        nbytes: u64,
        duration: std::time::Duration,
        stimulus_id: &str,
        out: &mut Vec<SchedulerCommand>,
    ) -> Result<Recommendations> {
        let mut recs = Recommendations::new();

        self.clear_processing(key);
        self.record_duration(key, duration);
        self.set_state(key, TaskState::Memory, stimulus_id)?;
        let ts = self.task_mut(key)?;
        ts.nbytes = Some(nbytes);
        ts.waiting_on.clear();
        self.add_replica(key, worker);

        let ts = self.task_mut(key)?;
        let dependents: Vec<Key> = ts.dependents.iter().cloned().collect();
        let deps: Vec<Key> = ts.dependencies.iter().cloned().collect();
        let clients: Vec<_> = ts.who_wants.iter().cloned().collect();
        let referenced = ts.is_referenced();

        for dependent in &dependents {
            let d = self.task_mut(dependent)?;
            d.waiting_on.remove(key);
            if d.state == TaskState::Waiting && d.waiting_on.is_empty() {
                recs.push(dependent.clone(), TaskState::Processing);
            }
        }

        for dep in &deps {
            let d = self.task_mut(dep)?;
            d.waiters.remove(key);
            if !d.is_referenced() && d.state == TaskState::Memory {
                recs.push(dep.clone(), TaskState::Released);
            }
        }

        for client in clients {
            out.push(SchedulerCommand::SendToClient {
                client,
                msg: ClientMessage::KeyInMemory {
                    key: key.to_string(),
                    nbytes,
                },
            });
        }

        if !referenced {
            recs.push(key, TaskState::Released);
        }
        Ok(recs)
    }

    /// `waiting`/`processing` -> `erred`. The exception and blame must be
    /// set on the task before recommending this.
    fn to_erred(
        &mut self,
        key: &str,
        stimulus_id: &str,
        out: &mut Vec<SchedulerCommand>,
    ) -> Result<Recommendations> {
        let mut recs = Recommendations::new();
        let ts = self.task_mut(key)?;
        let (Some(exception), Some(blame)) = (ts.exception.clone(), ts.exception_blame.clone())
        else {
            return Err(FlotillaError::InvalidState(format!(
                "'{key}' recommended erred without an exception"
            )));
        };

        self.clear_processing(key);
        self.set_state(key, TaskState::Erred, stimulus_id)?;

        let ts = self.task_mut(key)?;
        ts.waiting_on.clear();
        let deps: Vec<Key> = ts.dependencies.iter().cloned().collect();
        let dependents: Vec<Key> = ts.dependents.iter().cloned().collect();
        let clients: Vec<_> = ts.who_wants.iter().cloned().collect();

        for dep in &deps {
            let d = self.task_mut(dep)?;
            d.waiters.remove(key);
            if !d.is_referenced() && d.state == TaskState::Memory {
                recs.push(dep.clone(), TaskState::Released);
            }
        }

        for dependent in &dependents {
            let d = self.task_mut(dependent)?;
            if d.state == TaskState::Waiting {
                d.exception = Some(exception.clone());
                d.exception_blame = Some(blame.clone());
                recs.push(dependent.clone(), TaskState::Erred);
            }
        }

        for client in clients {
            out.push(SchedulerCommand::SendToClient {
                client,
                msg: ClientMessage::KeyErred {
                    key: key.to_string(),
                    exception: exception.clone(),
                    blame: blame.clone(),
                },
            });
        }
        Ok(recs)
    }

    /// `memory` -> `released`: free every replica and push dependents back
    /// through dependency resolution.
    fn memory_released(
        &mut self,
        key: &str,
        stimulus_id: &str,
        out: &mut Vec<SchedulerCommand>,
    ) -> Result<Recommendations> {
        let mut recs = Recommendations::new();

        let holders: Vec<WorkerAddr> = self.task_mut(key)?.who_has.iter().cloned().collect();
        for worker in holders {
            self.remove_replica(key, &worker);
            out.push(SchedulerCommand::SendToWorker {
                worker,
                msg: WorkerMessage::FreeKeys {
                    keys: vec![key.to_string()],
                    stimulus_id: stimulus_id.to_string(),
                },
            });
        }
        self.set_state(key, TaskState::Released, stimulus_id)?;

        let dependents: Vec<Key> = self.task_mut(key)?.dependents.iter().cloned().collect();
        for dependent in &dependents {
            let d = self.task_mut(dependent)?;
            match d.state {
                TaskState::Waiting => {
                    d.waiting_on.insert(key.to_string());
                }
                TaskState::Processing | TaskState::NoWorker => {
                    recs.push(dependent.clone(), TaskState::Released);
                }
                _ => {}
            }
        }

        recs.extend(self.after_release(key)?);
        Ok(recs)
    }

    /// `waiting`/`no-worker`/`processing`/`erred` -> `released`.
    fn to_released(
        &mut self,
        key: &str,
        stimulus_id: &str,
        out: &mut Vec<SchedulerCommand>,
    ) -> Result<Recommendations> {
        if let Some(worker) = self.clear_processing(key) {
            if self.workers.contains_key(&worker) {
                out.push(SchedulerCommand::SendToWorker {
                    worker,
                    msg: WorkerMessage::FreeKeys {
                        keys: vec![key.to_string()],
                        stimulus_id: stimulus_id.to_string(),
                    },
                });
            }
        }
        self.unrunnable.remove(key);

        self.set_state(key, TaskState::Released, stimulus_id)?;
        let ts = self.task_mut(key)?;
        ts.no_worker_since = None;
        ts.exception = None;
        ts.exception_blame = None;
        ts.waiting_on.clear();

        self.after_release(key)
    }

    /// Common tail of every `-> released` transition.
    fn after_release(&mut self, key: &str) -> Result<Recommendations> {
        let mut recs = Recommendations::new();
        let ts = self.task_mut(key)?;

        if ts.is_referenced() {
            recs.push(key, TaskState::Waiting);
            return Ok(recs);
        }

        let deps: Vec<Key> = ts.dependencies.iter().cloned().collect();
        let forget = ts.dependents.is_empty();
        for dep in &deps {
            let d = self.task_mut(dep)?;
            d.waiters.remove(key);
            if !d.is_referenced() {
                self.recommend_release(dep, &mut recs);
            }
        }
        if forget {
            recs.push(key, TaskState::Forgotten);
        }
        Ok(recs)
    }

    /// Recommend the next step towards forgetting an unreferenced task.
    pub(crate) fn recommend_release(&self, key: &str, recs: &mut Recommendations) {
        let Some(ts) = self.tasks.get(key) else {
            return;
        };
        match ts.state {
            TaskState::Memory | TaskState::Waiting | TaskState::NoWorker | TaskState::Processing => {
                recs.push(key, TaskState::Released);
            }
            // Erred tasks stay around while dependents carry their blame.
            TaskState::Erred if ts.dependents.is_empty() => recs.push(key, TaskState::Released),
            TaskState::Released if ts.dependents.is_empty() => {
                recs.push(key, TaskState::Forgotten);
            }
            _ => {}
        }
    }

    fn released_forgotten(&mut self, key: &str, stimulus_id: &str) -> Result<Recommendations> {
        let mut recs = Recommendations::new();
        let ts = self.task_mut(key)?;
        if ts.is_referenced() || !ts.dependents.is_empty() || !ts.who_has.is_empty() {
            trace!(key = %key, "task still needed; not forgotten");
            return Ok(recs);
        }

        self.set_state(key, TaskState::Forgotten, stimulus_id)?;
        let Some(ts) = self.tasks.remove(key) else {
            return Ok(recs);
        };
        self.unrunnable.remove(key);

        for dep in &ts.dependencies {
            let Some(d) = self.tasks.get_mut(dep) else {
                continue;
            };
            d.dependents.remove(key);
            d.waiters.remove(key);
            if !d.is_referenced() && d.dependents.is_empty() {
                self.recommend_release(dep, &mut recs);
            }
        }
        debug!(key = %key, "forgot task");
        Ok(recs)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::config::SchedulerConfig;
    use crate::scheduler::TaskInfo;
    use crate::types::{Priority, RunSpec};

    fn released(config: SchedulerConfig, keys: &[&str]) -> SchedulerState {
        let mut state = SchedulerState::new(config, Instant::now());
        for k in keys {
            state.tasks.insert(
                k.to_string(),
                TaskInfo::new(k.to_string(), RunSpec::default(), Priority::default(), 3),
            );
        }
        state
    }

    #[test]
    fn later_recommendation_replaces_target_in_place() {
        let mut recs = Recommendations::new();
        recs.push("a", TaskState::Waiting);
        recs.push("b", TaskState::Released);
        recs.push("a", TaskState::Released);
        assert_eq!(recs.len(), 2);
        assert_eq!(recs.pop(), Some(("a".to_string(), TaskState::Released)));
        assert_eq!(recs.pop(), Some(("b".to_string(), TaskState::Released)));
        assert!(recs.pop().is_none());
    }

    #[test]
    fn extend_preserves_order() {
        let mut a = Recommendations::new();
        a.push("x", TaskState::Waiting);
        let mut b = Recommendations::new();
        b.push("y", TaskState::Processing);
        b.push("x", TaskState::Released);
        a.extend(b);
        assert_eq!(a.pop(), Some(("x".to_string(), TaskState::Released)));
        assert_eq!(a.pop(), Some(("y".to_string(), TaskState::Processing)));
    }

    #[test]
    fn transition_outside_the_table_is_a_logged_fault() {
        let mut state = released(SchedulerConfig::default(), &["x"]);
        let mut recs = Recommendations::new();
        recs.push("x", TaskState::Memory);
        let mut out = Vec::new();

        let err = state.transitions(recs, "bogus", &mut out).unwrap_err();
        assert!(matches!(err, FlotillaError::InvalidTransition { .. }));
        assert!(err.is_fault());
        assert_eq!(state.task_state("x"), Some(TaskState::Released));
        let events = state.events("invalid-transition");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].stimulus_id, "bogus");
        assert!(out.is_empty());
    }

    #[test]
    fn recommendations_the_table_cannot_apply_are_faults() {
        for (start, finish) in [
            (TaskState::Released, TaskState::Processing),
            (TaskState::Released, TaskState::Erred),
            (TaskState::Released, TaskState::NoWorker),
        ] {
            let mut state = released(SchedulerConfig::default(), &["x"]);
            assert_eq!(state.task_state("x"), Some(start));
            let mut recs = Recommendations::new();
            recs.push("x", finish);

            let err = state.transitions(recs, "stale", &mut Vec::new()).unwrap_err();
            assert!(
                matches!(err, FlotillaError::InvalidTransition { .. }),
                "{} -> {} gave {:?}",
                start,
                finish,
                err
            );
            assert_eq!(state.events("invalid-transition").len(), 1);
            assert_eq!(state.task_state("x"), Some(start));
        }
    }

    #[test]
    fn satisfied_recommendation_is_a_no_op() {
        let mut state = released(SchedulerConfig::default(), &["x"]);
        let mut recs = Recommendations::new();
        recs.push("x", TaskState::Released);
        let mut out = Vec::new();

        state.transitions(recs, "again", &mut out).unwrap();
        assert_eq!(state.task_state("x"), Some(TaskState::Released));
        assert!(state.events("invalid-transition").is_empty());
        assert!(out.is_empty());
    }

    #[test]
    fn runaway_transitions_hit_the_counter_limit() {
        let config = SchedulerConfig {
            transition_counter_max: 1,
            ..SchedulerConfig::default()
        };
        let mut state = released(config, &["a", "b"]);
        let mut recs = Recommendations::new();
        recs.push("a", TaskState::Forgotten);
        recs.push("b", TaskState::Forgotten);

        let err = state.transitions(recs, "loop", &mut Vec::new()).unwrap_err();
        assert!(matches!(err, FlotillaError::TransitionLoop(2)));
        assert_eq!(state.events("transition-loop").len(), 1);
        assert_eq!(state.task_state("a"), None);
        assert_eq!(state.task_state("b"), Some(TaskState::Released));
    }
}
