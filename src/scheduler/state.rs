// src/scheduler/state.rs

//! Scheduler graph index: tasks, workers, clients and the bookkeeping
//! helpers that keep them symmetric.
//!
//! Every structural mutation of replicas or processing assignments goes
//! through the helpers here; the transition engine (`transitions.rs`)
//! decides *when* to call them.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::{Duration, Instant};

use tracing::error;

use crate::config::SchedulerConfig;
use crate::errors::{FlotillaError, Result};
use crate::scheduler::{TaskInfo, TaskState, WorkerInfo};
use crate::types::{ClientId, Key, StimulusId, WorkerAddr, key_prefix};

/// One applied transition.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionRecord {
    pub key: Key,
    pub start: TaskState,
    pub finish: TaskState,
    pub stimulus_id: StimulusId,
    pub at: Instant,
}

/// Noteworthy scheduler event kept for inspection (invalid transitions,
/// abandoned steals, unrunnable warnings).
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerLogEvent {
    pub topic: &'static str,
    pub key: Option<Key>,
    pub detail: String,
    pub stimulus_id: StimulusId,
}

/// Running average of observed durations for one key prefix.
#[derive(Debug, Clone, Copy, Default)]
struct PrefixStats {
    total: Duration,
    count: u32,
}

impl PrefixStats {
    fn average(&self) -> Option<Duration> {
        (self.count > 0).then(|| self.total / self.count)
    }
}

const EVENT_LOG_LENGTH: usize = 10_000;

#[derive(Debug)]
pub struct SchedulerState {
    pub tasks: BTreeMap<Key, TaskInfo>,
    pub workers: BTreeMap<WorkerAddr, WorkerInfo>,
    /// Client id -> keys it wants.
    pub clients: BTreeMap<ClientId, BTreeSet<Key>>,
    /// Keys currently in `no-worker`.
    pub unrunnable: BTreeSet<Key>,
    pub config: SchedulerConfig,
    /// Clock reading of the event being handled.
    pub now: Instant,

    /// Submission counter feeding [`crate::types::Priority::generation`].
    pub(crate) generation: u64,
    /// Transitions applied since start-up.
    pub transition_counter: u64,

    prefixes: BTreeMap<String, PrefixStats>,
    story: VecDeque<TransitionRecord>,
    events: VecDeque<SchedulerLogEvent>,
}

impl SchedulerState {
    pub fn new(config: SchedulerConfig, now: Instant) -> Self {
        Self {
            tasks: BTreeMap::new(),
            workers: BTreeMap::new(),
            clients: BTreeMap::new(),
            unrunnable: BTreeSet::new(),
            config,
            now,
            generation: 0,
            transition_counter: 0,
            prefixes: BTreeMap::new(),
            story: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    pub fn task(&self, key: &str) -> Option<&TaskInfo> {
        self.tasks.get(key)
    }

    pub fn task_state(&self, key: &str) -> Option<TaskState> {
        self.tasks.get(key).map(|t| t.state)
    }

    pub fn worker(&self, addr: &str) -> Option<&WorkerInfo> {
        self.workers.get(addr)
    }

    pub fn running_workers(&self) -> impl Iterator<Item = &WorkerInfo> {
        self.workers.values().filter(|w| w.is_running())
    }

    pub(crate) fn task_mut(&mut self, key: &str) -> Result<&mut TaskInfo> {
        self.tasks
            .get_mut(key)
            .ok_or_else(|| FlotillaError::TaskNotFound(key.to_string()))
    }

    // ---- replicas -------------------------------------------------------

    /// Record that `worker` holds `key`. Returns false if it already did.
    pub(crate) fn add_replica(&mut self, key: &str, worker: &str) -> bool {
        let Some(ws) = self.workers.get_mut(worker) else {
            return false;
        };
        let Some(ts) = self.tasks.get_mut(key) else {
            return false;
        };
        if !ts.who_has.insert(worker.to_string()) {
            return false;
        }
        ws.has_what.insert(key.to_string());
        ws.nbytes += ts.nbytes.unwrap_or(0);
        true
    }

    /// Forget that `worker` holds `key`. Returns false if it did not.
    pub(crate) fn remove_replica(&mut self, key: &str, worker: &str) -> bool {
        let nbytes = match self.tasks.get_mut(key) {
            Some(ts) => {
                if !ts.who_has.remove(worker) {
                    return false;
                }
                ts.nbytes.unwrap_or(0)
            }
            None => return false,
        };
        if let Some(ws) = self.workers.get_mut(worker) {
            ws.has_what.remove(key);
            ws.nbytes = ws.nbytes.saturating_sub(nbytes);
        }
        true
    }

    // ---- processing -----------------------------------------------------

    pub(crate) fn set_processing(&mut self, key: &str, worker: &str, estimate: Duration) {
        if let Some(ws) = self.workers.get_mut(worker) {
            ws.processing.insert(key.to_string(), estimate);
            ws.occupancy += estimate;
        }
        if let Some(ts) = self.tasks.get_mut(key) {
            ts.processing_on = Some(worker.to_string());
        }
    }

    /// Detach `key` from the worker it is processing on, if any.
    pub(crate) fn clear_processing(&mut self, key: &str) -> Option<WorkerAddr> {
        let ts = self.tasks.get_mut(key)?;
        let worker = ts.processing_on.take()?;
        ts.long_running = false;
        if let Some(ws) = self.workers.get_mut(&worker) {
            if let Some(estimate) = ws.processing.remove(key) {
                if !ws.long_running.remove(key) {
                    ws.occupancy = ws.occupancy.saturating_sub(estimate);
                }
            }
        }
        Some(worker)
    }

    /// The task left its execution slot on `worker`.
    pub(crate) fn mark_long_running(&mut self, key: &str, worker: &str) -> bool {
        let Some(ws) = self.workers.get_mut(worker) else {
            return false;
        };
        let Some(estimate) = ws.processing.get(key).copied() else {
            return false;
        };
        if ws.long_running.insert(key.to_string()) {
            ws.occupancy = ws.occupancy.saturating_sub(estimate);
        }
        if let Some(ts) = self.tasks.get_mut(key) {
            ts.long_running = true;
        }
        true
    }

    // ---- durations ------------------------------------------------------

    /// Estimated compute time: the submitted duration, else the prefix
    /// average, else the configured default.
    pub fn estimate_duration(&self, key: &str) -> Duration {
        if let Some(d) = self.tasks.get(key).and_then(|t| t.duration) {
            return d;
        }
        self.prefixes
            .get(key_prefix(key))
            .and_then(PrefixStats::average)
            .unwrap_or(self.config.default_task_duration)
    }

    /// Zero means the worker did not time an execution (it gathered the
    /// value instead), so it is not a sample.
    pub(crate) fn record_duration(&mut self, key: &str, observed: Duration) {
        if observed.is_zero() {
            return;
        }
        let stats = self.prefixes.entry(key_prefix(key).to_string()).or_default();
        stats.total += observed;
        stats.count += 1;
    }

    // ---- story and events -----------------------------------------------

    pub(crate) fn record_transition(
        &mut self,
        key: &str,
        start: TaskState,
        finish: TaskState,
        stimulus_id: &str,
    ) {
        self.transition_counter += 1;
        if self.config.transition_log_length == 0 {
            return;
        }
        if self.story.len() >= self.config.transition_log_length {
            self.story.pop_front();
        }
        self.story.push_back(TransitionRecord {
            key: key.to_string(),
            start,
            finish,
            stimulus_id: stimulus_id.to_string(),
            at: self.now,
        });
    }

    /// Transition records touching any of `keys`, oldest first.
    pub fn story(&self, keys: &[&str]) -> Vec<TransitionRecord> {
        self.story
            .iter()
            .filter(|r| keys.contains(&r.key.as_str()))
            .cloned()
            .collect()
    }

    /// Stimulus ids that touched `key`, oldest first and deduplicated.
    pub fn stimuli_for(&self, key: &str) -> Vec<StimulusId> {
        let mut out: Vec<StimulusId> = Vec::new();
        for r in self.story.iter().filter(|r| r.key == key) {
            if out.last() != Some(&r.stimulus_id) {
                out.push(r.stimulus_id.clone());
            }
        }
        out
    }

    pub(crate) fn log_event(
        &mut self,
        topic: &'static str,
        key: Option<&str>,
        detail: String,
        stimulus_id: &str,
    ) {
        if self.events.len() >= EVENT_LOG_LENGTH {
            self.events.pop_front();
        }
        self.events.push_back(SchedulerLogEvent {
            topic,
            key: key.map(str::to_string),
            detail,
            stimulus_id: stimulus_id.to_string(),
        });
    }

    /// Logged events for one topic, e.g. `"invalid-transition"`.
    pub fn events(&self, topic: &str) -> Vec<SchedulerLogEvent> {
        self.events.iter().filter(|e| e.topic == topic).cloned().collect()
    }

    /// Record and return an invalid-transition fault.
    pub(crate) fn invalid_transition(
        &mut self,
        key: &str,
        start: TaskState,
        finish: TaskState,
        stimulus_id: &str,
    ) -> FlotillaError {
        error!(
            key = %key,
            %start,
            %finish,
            stimulus_id = %stimulus_id,
            "invalid scheduler transition"
        );
        self.log_event(
            "invalid-transition",
            Some(key),
            format!("{start} -> {finish}"),
            stimulus_id,
        );
        FlotillaError::InvalidTransition {
            key: key.to_string(),
            start: start.to_string(),
            finish: finish.to_string(),
            stimulus_id: stimulus_id.to_string(),
        }
    }

    // ---- validation -----------------------------------------------------

    /// Check every cross-index invariant. Intended for tests and debug
    /// builds; returns the first violation found.
    pub fn validate_state(&self) -> Result<()> {
        for (key, ts) in &self.tasks {
            self.validate_task(key, ts)?;
        }

        for (addr, ws) in &self.workers {
            for key in &ws.has_what {
                let holds = self.tasks.get(key).is_some_and(|t| t.who_has.contains(addr));
                if !holds {
                    return invalid(format!("{addr} has_what '{key}' but who_has disagrees"));
                }
            }
            for key in ws.processing.keys() {
                let assigned = self
                    .tasks
                    .get(key)
                    .is_some_and(|t| t.processing_on.as_deref() == Some(addr.as_str()));
                if !assigned {
                    return invalid(format!("{addr} processes '{key}' but task disagrees"));
                }
            }
            if !ws.long_running.is_subset(&ws.processing.keys().cloned().collect()) {
                return invalid(format!("{addr} long_running is not a subset of processing"));
            }
            let expected: Duration = ws
                .processing
                .iter()
                .filter(|(k, _)| !ws.long_running.contains(*k))
                .map(|(_, d)| *d)
                .sum();
            if expected != ws.occupancy {
                return invalid(format!(
                    "{addr} occupancy {:?} does not match processing estimates {:?}",
                    ws.occupancy, expected
                ));
            }
            let nbytes: u64 = ws
                .has_what
                .iter()
                .filter_map(|k| self.tasks.get(k).and_then(|t| t.nbytes))
                .sum();
            if nbytes != ws.nbytes {
                return invalid(format!("{addr} nbytes {} != replica sum {nbytes}", ws.nbytes));
            }
        }

        for (client, keys) in &self.clients {
            for key in keys {
                let wanted = self.tasks.get(key).is_some_and(|t| t.who_wants.contains(client));
                if !wanted {
                    return invalid(format!("client {client} wants '{key}' but who_wants disagrees"));
                }
            }
        }

        Ok(())
    }

    fn validate_task(&self, key: &str, ts: &TaskInfo) -> Result<()> {
        for dep in &ts.dependencies {
            let Some(d) = self.tasks.get(dep) else {
                return invalid(format!("'{key}' depends on forgotten '{dep}'"));
            };
            if !d.dependents.contains(key) {
                return invalid(format!("'{dep}' does not list dependent '{key}'"));
            }
        }
        for dep in &ts.dependents {
            let linked = self.tasks.get(dep).is_some_and(|d| d.dependencies.contains(key));
            if !linked {
                return invalid(format!("'{key}' lists dependent '{dep}' which disagrees"));
            }
        }
        for w in &ts.who_has {
            let holds = self.workers.get(w).is_some_and(|ws| ws.has_what.contains(key));
            if !holds {
                return invalid(format!("'{key}' who_has {w} but has_what disagrees"));
            }
        }
        for client in &ts.who_wants {
            let wants = self.clients.get(client).is_some_and(|keys| keys.contains(key));
            if !wants {
                return invalid(format!("'{key}' wanted by {client} but client disagrees"));
            }
        }

        match ts.state {
            TaskState::Processing => {
                let Some(worker) = ts.processing_on.as_deref() else {
                    return invalid(format!("'{key}' processing without a worker"));
                };
                let listed = self
                    .workers
                    .get(worker)
                    .is_some_and(|ws| ws.processing.contains_key(key));
                if !listed {
                    return invalid(format!("'{key}' processing on {worker} which disagrees"));
                }
                for dep in &ts.dependencies {
                    if !self.in_memory(dep) {
                        return invalid(format!("'{key}' processing before '{dep}' is in memory"));
                    }
                }
            }
            TaskState::Memory => {
                if ts.who_has.is_empty() {
                    return invalid(format!("'{key}' in memory without replicas"));
                }
            }
            TaskState::Waiting => {
                let missing: BTreeSet<Key> = ts
                    .dependencies
                    .iter()
                    .filter(|d| !self.in_memory(d))
                    .cloned()
                    .collect();
                if missing != ts.waiting_on {
                    return invalid(format!(
                        "'{key}' waiting_on {:?} but unsatisfied dependencies are {:?}",
                        ts.waiting_on, missing
                    ));
                }
            }
            TaskState::NoWorker => {
                if !self.unrunnable.contains(key) {
                    return invalid(format!("'{key}' in no-worker but not tracked as unrunnable"));
                }
            }
            TaskState::Erred => {
                if ts.exception.is_none() {
                    return invalid(format!("'{key}' erred without an exception"));
                }
            }
            TaskState::Released | TaskState::Forgotten => {}
        }

        if ts.state != TaskState::Processing && ts.processing_on.is_some() {
            return invalid(format!("'{key}' in {} but assigned to a worker", ts.state));
        }
        if ts.state != TaskState::Memory && !ts.who_has.is_empty() {
            return invalid(format!("'{key}' in {} but has replicas", ts.state));
        }
        Ok(())
    }

    /// A key counts as in memory only while some worker holds it.
    pub fn in_memory(&self, key: &str) -> bool {
        self.tasks
            .get(key)
            .is_some_and(|t| t.state == TaskState::Memory && !t.who_has.is_empty())
    }
}

fn invalid(msg: String) -> Result<()> {
    Err(FlotillaError::InvalidState(msg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Priority, Resources, RunSpec};

    fn state_with(keys: &[&str], workers: &[&str]) -> SchedulerState {
        let now = Instant::now();
        let mut state = SchedulerState::new(SchedulerConfig::default(), now);
        for k in keys {
            state.tasks.insert(
                k.to_string(),
                TaskInfo::new(k.to_string(), RunSpec::default(), Priority::default(), 3),
            );
        }
        for w in workers {
            state.workers.insert(
                w.to_string(),
                WorkerInfo::new(w.to_string(), 1, Resources::new(), 1 << 20, now),
            );
        }
        state
    }

    #[test]
    fn replicas_are_symmetric_and_sized() {
        let mut state = state_with(&["x"], &["w1", "w2"]);
        state.tasks.get_mut("x").unwrap().nbytes = Some(10);
        state.tasks.get_mut("x").unwrap().state = TaskState::Memory;

        assert!(state.add_replica("x", "w1"));
        assert!(!state.add_replica("x", "w1"));
        assert!(state.add_replica("x", "w2"));
        assert_eq!(state.workers["w1"].nbytes, 10);
        state.validate_state().unwrap();

        assert!(state.remove_replica("x", "w1"));
        assert!(!state.remove_replica("x", "w1"));
        assert_eq!(state.workers["w1"].nbytes, 0);
        assert_eq!(state.tasks["x"].replica_count(), 1);
        state.validate_state().unwrap();
    }

    #[test]
    fn removing_an_unknown_replica_changes_nothing() {
        let mut state = state_with(&["x"], &["w1", "w2"]);
        state.tasks.get_mut("x").unwrap().nbytes = Some(10);
        state.tasks.get_mut("x").unwrap().state = TaskState::Memory;
        assert!(state.add_replica("x", "w1"));

        assert!(!state.remove_replica("x", "w2"));
        assert!(!state.remove_replica("missing", "w1"));
        assert_eq!(state.workers["w1"].nbytes, 10);
        assert_eq!(state.workers["w2"].nbytes, 0);
        assert_eq!(state.tasks["x"].replica_count(), 1);
        state.validate_state().unwrap();
    }

    #[test]
    fn long_running_tasks_leave_occupancy() {
        let mut state = state_with(&["x"], &["w1"]);
        state.tasks.get_mut("x").unwrap().state = TaskState::Processing;
        state.set_processing("x", "w1", Duration::from_secs(2));
        assert_eq!(state.workers["w1"].occupancy, Duration::from_secs(2));

        assert!(state.mark_long_running("x", "w1"));
        assert_eq!(state.workers["w1"].occupancy, Duration::ZERO);
        state.validate_state().unwrap();

        assert_eq!(state.clear_processing("x").as_deref(), Some("w1"));
        assert_eq!(state.workers["w1"].occupancy, Duration::ZERO);
        assert!(state.workers["w1"].processing.is_empty());
    }

    #[test]
    fn duration_estimate_prefers_history_over_default() {
        let mut state = state_with(&["inc-1", "inc-2"], &[]);
        assert_eq!(state.estimate_duration("inc-1"), Duration::from_millis(500));
        state.record_duration("inc-1", Duration::from_secs(1));
        state.record_duration("inc-9", Duration::from_secs(3));
        assert_eq!(state.estimate_duration("inc-2"), Duration::from_secs(2));

        state.tasks.get_mut("inc-2").unwrap().duration = Some(Duration::from_millis(10));
        assert_eq!(state.estimate_duration("inc-2"), Duration::from_millis(10));
    }

    #[test]
    fn untimed_completions_leave_the_average_alone() {
        let mut state = state_with(&["inc-1"], &[]);
        state.record_duration("inc-1", Duration::from_secs(2));
        state.record_duration("inc-2", Duration::ZERO);
        state.record_duration("inc-3", Duration::ZERO);
        assert_eq!(state.estimate_duration("inc-1"), Duration::from_secs(2));

        state.record_duration("other-1", Duration::ZERO);
        assert_eq!(state.estimate_duration("other-1"), Duration::from_millis(500));
    }

    #[test]
    fn story_is_bounded() {
        let mut config = SchedulerConfig::default();
        config.transition_log_length = 2;
        let mut state = SchedulerState::new(config, Instant::now());
        state.record_transition("a", TaskState::Released, TaskState::Waiting, "s1");
        state.record_transition("a", TaskState::Waiting, TaskState::Processing, "s2");
        state.record_transition("a", TaskState::Processing, TaskState::Memory, "s3");
        let story = state.story(&["a"]);
        assert_eq!(story.len(), 2);
        assert_eq!(story[0].stimulus_id, "s2");
        assert_eq!(state.transition_counter, 3);
        assert_eq!(state.stimuli_for("a"), vec!["s2", "s3"]);
    }
}
