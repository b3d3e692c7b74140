// src/worker/state.rs

//! Sans-IO worker state machine.
//!
//! [`WorkerState::handle_stimulus`] consumes one [`WorkerEvent`], updates the
//! per-key bookkeeping and returns the [`Instruction`]s the runtime must
//! carry out. It never blocks, spawns, or talks to the network.
//!
//! A key can be present locally for three reasons, tracked separately:
//!
//! - the scheduler asked this worker to compute it (`run_spec` is set);
//! - the AMM asked for a replica (`wanted_replica`);
//! - a local task needs it as a dependency (it has active dependents).
//!
//! A key that has none of these reasons, is released, and is not the
//! dependency of anything local is forgotten.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, error, trace, warn};

use crate::config::ResolvedWorker;
use crate::errors::{FlotillaError, Result};
use crate::protocol::{ComputeTask, FetchResponse, WorkerMetrics, WorkerRegistration, WorkerReport};
use crate::types::{
    ExceptionRef, Key, Priority, Resources, RunSpec, StimulusId, WorkerAddr, resources_satisfy,
};

use super::events::{Instruction, WorkerEvent};
use super::memory::DataStore;
use super::task_state::WorkerTaskState;

use WorkerTaskState::*;

const LOG_LENGTH: usize = 10_000;

/// Priority of keys fetched only to hold a replica: after everything else.
const REPLICA_PRIORITY: Priority = Priority {
    user: i64::MAX,
    generation: u64::MAX,
    order: u64::MAX,
};

/// Static parameters of one worker.
#[derive(Debug, Clone)]
pub struct WorkerStateConfig {
    pub address: WorkerAddr,
    pub nthreads: usize,
    pub resources: Resources,
    pub memory_limit: u64,
    pub transfer_incoming_count_limit: usize,
    pub transfer_message_bytes_limit: u64,
}

impl WorkerStateConfig {
    pub fn new(address: impl Into<WorkerAddr>, nthreads: usize) -> Self {
        Self {
            address: address.into(),
            nthreads,
            resources: Resources::new(),
            memory_limit: 1 << 30,
            transfer_incoming_count_limit: 4,
            transfer_message_bytes_limit: 50_000_000,
        }
    }

    pub fn from_resolved(worker: &ResolvedWorker) -> Self {
        Self {
            address: worker.name.clone(),
            nthreads: worker.nthreads,
            resources: worker.resources.clone(),
            memory_limit: worker.memory_limit,
            transfer_incoming_count_limit: worker.settings.transfer_incoming_count_limit,
            transfer_message_bytes_limit: worker.settings.transfer_message_bytes_limit,
        }
    }
}

/// Local bookkeeping for one key.
#[derive(Debug, Clone)]
pub struct WorkerTask {
    pub key: Key,
    pub state: WorkerTaskState,
    /// Present while the scheduler wants this worker to compute the key.
    pub run_spec: Option<RunSpec>,
    pub priority: Priority,
    pub dependencies: BTreeSet<Key>,
    pub dependents: BTreeSet<Key>,
    /// Dependencies not in local memory yet.
    pub waiting_for_data: BTreeSet<Key>,
    /// Peers believed to hold the key (never this worker).
    pub who_has: BTreeSet<WorkerAddr>,
    /// Peer the key is being fetched from.
    pub coming_from: Option<WorkerAddr>,
    pub nbytes: Option<u64>,
    pub resource_restrictions: Resources,
    pub duration: Duration,
    pub exception: Option<ExceptionRef>,
    /// Stamp of the latest `Execute`.
    pub generation: u64,
    /// For `cancelled`/`resumed`: what was in progress.
    pub previous: Option<WorkerTaskState>,
    /// For `resumed`: where to go once the in-progress work is abandoned.
    pub next: Option<WorkerTaskState>,
    pub wanted_replica: bool,
}

impl WorkerTask {
    fn new(key: Key, priority: Priority) -> Self {
        Self {
            key,
            state: Released,
            run_spec: None,
            priority,
            dependencies: BTreeSet::new(),
            dependents: BTreeSet::new(),
            waiting_for_data: BTreeSet::new(),
            who_has: BTreeSet::new(),
            coming_from: None,
            nbytes: None,
            resource_restrictions: Resources::new(),
            duration: Duration::ZERO,
            exception: None,
            generation: 0,
            previous: None,
            next: None,
            wanted_replica: false,
        }
    }

    /// The execution slot this task holds, if any.
    fn computing_as(&self) -> Option<WorkerTaskState> {
        match self.state {
            Executing | LongRunning => Some(self.state),
            Cancelled | Resumed => self.previous.filter(|p| p.is_computing()),
            _ => None,
        }
    }

    fn is_flying(&self) -> bool {
        self.state == Flight || (matches!(self.state, Cancelled | Resumed) && self.previous == Some(Flight))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerTransition {
    pub key: Key,
    pub start: WorkerTaskState,
    pub finish: WorkerTaskState,
    pub stimulus_id: StimulusId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerLogEvent {
    pub topic: &'static str,
    pub key: Key,
    pub detail: String,
    pub stimulus_id: StimulusId,
}

#[derive(Debug, Default)]
struct Transfer {
    keys: BTreeSet<Key>,
    nbytes: u64,
}

#[derive(Debug)]
pub struct WorkerState {
    address: WorkerAddr,
    nthreads: usize,
    resources: Resources,
    memory_limit: u64,
    transfer_count_limit: usize,
    transfer_bytes_limit: u64,
    tasks: BTreeMap<Key, WorkerTask>,
    data: Box<dyn DataStore>,
    executing: BTreeSet<Key>,
    long_running: BTreeSet<Key>,
    in_flight: BTreeMap<WorkerAddr, Transfer>,
    generation: u64,
    story: VecDeque<WorkerTransition>,
    events: VecDeque<WorkerLogEvent>,
}

impl WorkerState {
    /// Build the state around an existing data store. Keys already in the
    /// store are adopted as `memory` and announced on registration.
    pub fn new(config: WorkerStateConfig, data: Box<dyn DataStore>) -> Self {
        let mut tasks = BTreeMap::new();
        for key in data.keys() {
            let mut ts = WorkerTask::new(key.clone(), Priority::default());
            ts.state = Memory;
            ts.nbytes = data.nbytes(&key);
            tasks.insert(key, ts);
        }
        Self {
            address: config.address,
            nthreads: config.nthreads.max(1),
            resources: config.resources,
            memory_limit: config.memory_limit,
            transfer_count_limit: config.transfer_incoming_count_limit.max(1),
            transfer_bytes_limit: config.transfer_message_bytes_limit,
            tasks,
            data,
            executing: BTreeSet::new(),
            long_running: BTreeSet::new(),
            in_flight: BTreeMap::new(),
            generation: 0,
            story: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    // ---- queries --------------------------------------------------------

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn nthreads(&self) -> usize {
        self.nthreads
    }

    pub fn task(&self, key: &str) -> Option<&WorkerTask> {
        self.tasks.get(key)
    }

    pub fn task_state(&self, key: &str) -> Option<WorkerTaskState> {
        self.tasks.get(key).map(|ts| ts.state)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &WorkerTask> {
        self.tasks.values()
    }

    pub fn executing(&self) -> &BTreeSet<Key> {
        &self.executing
    }

    pub fn long_running(&self) -> &BTreeSet<Key> {
        &self.long_running
    }

    /// Peers with an outstanding gather request, and the keys requested.
    pub fn in_flight(&self) -> BTreeMap<WorkerAddr, BTreeSet<Key>> {
        self.in_flight
            .iter()
            .map(|(peer, t)| (peer.clone(), t.keys.clone()))
            .collect()
    }

    pub fn in_flight_bytes(&self) -> u64 {
        self.in_flight.values().map(|t| t.nbytes).sum()
    }

    pub fn data(&self) -> &dyn DataStore {
        self.data.as_ref()
    }

    /// Transition records touching `key`.
    pub fn story(&self, key: &str) -> Vec<WorkerTransition> {
        self.story.iter().filter(|t| t.key == key).cloned().collect()
    }

    pub fn events(&self, topic: &str) -> Vec<WorkerLogEvent> {
        self.events.iter().filter(|e| e.topic == topic).cloned().collect()
    }

    pub fn metrics(&self) -> WorkerMetrics {
        WorkerMetrics {
            memory_bytes: self.data.memory_bytes(),
            spilled_bytes: self.data.spilled_bytes(),
            spilled_count: self.data.spilled_count() as u64,
            executing: self.executing.len(),
            ready: self
                .tasks
                .values()
                .filter(|ts| matches!(ts.state, Ready | Constrained))
                .count(),
            in_flight: self.in_flight.values().map(|t| t.keys.len()).sum(),
        }
    }

    /// Handshake announcing the keys held locally.
    pub fn registration(&self) -> WorkerRegistration {
        WorkerRegistration {
            address: self.address.clone(),
            nthreads: self.nthreads,
            resources: self.resources.clone(),
            memory_limit: self.memory_limit,
            keys: self
                .tasks
                .values()
                .filter(|ts| ts.state == Memory)
                .map(|ts| (ts.key.clone(), ts.nbytes.unwrap_or(0)))
                .collect(),
        }
    }

    /// Serve a peer's gather request from local memory.
    pub fn get_data(&mut self, keys: &[Key]) -> Result<FetchResponse> {
        let mut response = FetchResponse::default();
        for key in keys {
            let value = if self.task_state(key) == Some(Memory) {
                self.data.get(key)?
            } else {
                None
            };
            match value {
                Some(value) => {
                    response.data.insert(key.clone(), value);
                }
                None => response.missing.push(key.clone()),
            }
        }
        Ok(response)
    }

    /// Run-spec and dependency values for an `Execute` instruction.
    pub fn execution_inputs(&mut self, key: &str) -> Result<(RunSpec, BTreeMap<Key, Bytes>)> {
        let ts = self.task_ref(key)?;
        let run_spec = ts
            .run_spec
            .clone()
            .ok_or_else(|| FlotillaError::InvalidState(format!("'{key}' has no run-spec")))?;
        let deps: Vec<Key> = ts.dependencies.iter().cloned().collect();
        let mut values = BTreeMap::new();
        for dep in deps {
            let value = self.data.get(&dep)?.ok_or_else(|| {
                FlotillaError::InvalidState(format!("dependency '{dep}' of '{key}' not in memory"))
            })?;
            values.insert(dep, value);
        }
        Ok((run_spec, values))
    }

    // ---- entry point ----------------------------------------------------

    pub fn handle_stimulus(&mut self, event: WorkerEvent) -> Result<Vec<Instruction>> {
        let sid = event.stimulus_id().to_string();
        trace!(worker = %self.address, stimulus_id = %sid, "worker stimulus");
        let mut out = Vec::new();

        match event {
            WorkerEvent::ComputeTask(msg) => self.handle_compute_task(msg, &mut out)?,
            WorkerEvent::FreeKeys { keys, .. } => {
                for key in keys {
                    self.release_key(&key, &sid, &mut out)?;
                }
            }
            WorkerEvent::StealRequest { key, .. } => self.handle_steal_request(key, &sid, &mut out)?,
            WorkerEvent::AcquireReplicas {
                who_has, nbytes, ..
            } => self.handle_acquire_replicas(who_has, nbytes, &sid, &mut out)?,
            WorkerEvent::RemoveReplicas { keys, .. } => {
                self.handle_remove_replicas(keys, &sid, &mut out)?
            }
            WorkerEvent::RefreshWhoHas { who_has, .. } => {
                self.handle_refresh_who_has(who_has, &sid, &mut out)?
            }
            WorkerEvent::GatherDepSuccess {
                peer,
                data,
                missing,
                ..
            } => self.handle_gather_success(peer, data, missing, &sid, &mut out)?,
            WorkerEvent::GatherDepFailure {
                peer, keys, error, ..
            } => self.handle_gather_failure(peer, keys, error, &sid, &mut out)?,
            WorkerEvent::ExecuteSuccess {
                key,
                generation,
                value,
                duration,
                ..
            } => self.handle_execute_success(key, generation, value, duration, &sid, &mut out)?,
            WorkerEvent::ExecuteFailure {
                key,
                generation,
                exception,
                ..
            } => self.handle_execute_failure(key, generation, exception, &sid, &mut out)?,
            WorkerEvent::ExecuteCancelled { key, generation, .. } => {
                self.handle_execute_stopped(key, generation, false, &sid, &mut out)?
            }
            WorkerEvent::Reschedule { key, generation, .. } => {
                self.handle_execute_stopped(key, generation, true, &sid, &mut out)?
            }
            WorkerEvent::Secede {
                key,
                generation,
                compute_duration,
                ..
            } => self.handle_secede(key, generation, compute_duration, &sid, &mut out)?,
        }

        self.ensure_communicating(&sid, &mut out)?;
        self.ensure_computing(&sid, &mut out)?;
        Ok(out)
    }

    // ---- scheduler messages ---------------------------------------------

    fn handle_compute_task(&mut self, msg: ComputeTask, out: &mut Vec<Instruction>) -> Result<()> {
        let key = msg.key.clone();
        let sid = msg.stimulus_id.as_str();

        for (dep, holders) in &msg.who_has {
            let dt = self.ensure_task(dep, msg.priority);
            dt.priority = dt.priority.min(msg.priority);
            dt.dependents.insert(key.clone());
            if dt.state != Memory {
                if let Some(n) = msg.nbytes.get(dep) {
                    dt.nbytes = Some(*n);
                }
            }
            self.set_who_has(dep, holders);
        }

        let ts = self.ensure_task(&key, msg.priority);
        ts.run_spec = Some(msg.run_spec);
        ts.priority = msg.priority;
        ts.resource_restrictions = msg.resource_restrictions;
        ts.duration = msg.duration;
        ts.dependencies = msg.who_has.keys().cloned().collect();
        let state = ts.state;
        let previous = ts.previous;

        match state {
            Memory => {
                let nbytes = ts.nbytes.unwrap_or(0);
                debug!(worker = %self.address, key = %key, "compute-task for a key already in memory");
                out.push(Instruction::Send(WorkerReport::TaskFinished {
                    key,
                    nbytes,
                    duration: Duration::ZERO,
                    stimulus_id: sid.to_string(),
                }));
            }
            Waiting | Ready | Constrained | Executing | LongRunning => {
                debug!(worker = %self.address, key = %key, %state, "compute-task already in progress");
            }
            Released | Fetch | Missing | Error => self.to_waiting(&key, sid, out)?,
            Flight => {
                self.set_state(&key, Resumed, sid)?;
                let ts = self.task_mut(&key)?;
                ts.previous = Some(Flight);
                ts.next = Some(Waiting);
            }
            Cancelled => match previous {
                Some(Flight) => {
                    self.set_state(&key, Resumed, sid)?;
                    self.task_mut(&key)?.next = Some(Waiting);
                }
                Some(prev) => {
                    self.set_state(&key, prev, sid)?;
                    self.task_mut(&key)?.previous = None;
                }
                None => return Err(self.corrupt(&key, "cancelled without previous state")),
            },
            Resumed => match previous {
                Some(prev) if prev.is_computing() => {
                    self.set_state(&key, prev, sid)?;
                    let ts = self.task_mut(&key)?;
                    ts.previous = None;
                    ts.next = None;
                }
                _ => self.task_mut(&key)?.next = Some(Waiting),
            },
        }
        Ok(())
    }

    fn handle_steal_request(&mut self, key: Key, sid: &str, out: &mut Vec<Instruction>) -> Result<()> {
        let state = self.task_state(&key);
        let computable = self.tasks.get(&key).is_some_and(|ts| ts.run_spec.is_some());
        if computable && state.is_some_and(WorkerTaskState::is_stealable) {
            debug!(worker = %self.address, key = %key, "releasing stolen task");
            self.release_key(&key, sid, out)?;
        }
        out.push(Instruction::Send(WorkerReport::StealResponse {
            key,
            state,
            stimulus_id: sid.to_string(),
        }));
        Ok(())
    }

    fn handle_acquire_replicas(
        &mut self,
        who_has: BTreeMap<Key, Vec<WorkerAddr>>,
        nbytes: BTreeMap<Key, u64>,
        sid: &str,
        out: &mut Vec<Instruction>,
    ) -> Result<()> {
        let mut already = BTreeMap::new();
        for (key, holders) in who_has {
            let ts = self.ensure_task(&key, REPLICA_PRIORITY);
            ts.wanted_replica = true;
            if ts.state == Memory {
                already.insert(key, ts.nbytes.unwrap_or(0));
                continue;
            }
            if let Some(n) = nbytes.get(&key) {
                ts.nbytes = Some(*n);
            }
            self.set_who_has(&key, &holders);
            self.request_data(&key, sid, out)?;
        }
        if !already.is_empty() {
            out.push(Instruction::Send(WorkerReport::AddKeys {
                keys: already,
                stimulus_id: sid.to_string(),
            }));
        }
        Ok(())
    }

    fn handle_remove_replicas(
        &mut self,
        keys: Vec<Key>,
        sid: &str,
        out: &mut Vec<Instruction>,
    ) -> Result<()> {
        let mut rejected = BTreeMap::new();
        for key in keys {
            match self.task_state(&key) {
                Some(Memory) if self.has_active_dependents(&key) => {
                    debug!(worker = %self.address, key = %key, "replica still needed; drop rejected");
                    let nbytes = self.tasks.get(&key).and_then(|ts| ts.nbytes).unwrap_or(0);
                    rejected.insert(key, nbytes);
                }
                Some(Memory) => {
                    self.release_key(&key, sid, out)?;
                    out.push(Instruction::Send(WorkerReport::ReleaseWorkerData {
                        key,
                        stimulus_id: sid.to_string(),
                    }));
                }
                other => {
                    debug!(worker = %self.address, key = %key, state = ?other, "no replica to remove");
                }
            }
        }
        if !rejected.is_empty() {
            out.push(Instruction::Send(WorkerReport::AddKeys {
                keys: rejected,
                stimulus_id: sid.to_string(),
            }));
        }
        Ok(())
    }

    fn handle_refresh_who_has(
        &mut self,
        who_has: BTreeMap<Key, Vec<WorkerAddr>>,
        sid: &str,
        out: &mut Vec<Instruction>,
    ) -> Result<()> {
        for (key, holders) in who_has {
            if !self.tasks.contains_key(&key) {
                continue;
            }
            self.set_who_has(&key, &holders);
            let has_holders = !self.task_ref(&key)?.who_has.is_empty();
            match self.task_state(&key) {
                Some(Missing) if has_holders => self.set_state(&key, Fetch, sid)?,
                Some(Fetch | Missing) if !has_holders && !self.has_active_dependents(&key) => {
                    debug!(worker = %self.address, key = %key, "no holders left; abandoning replica");
                    self.task_mut(&key)?.wanted_replica = false;
                    self.release_unneeded(&key, sid, out)?;
                }
                Some(Fetch) if !has_holders => self.set_state(&key, Missing, sid)?,
                _ => {}
            }
        }
        Ok(())
    }

    // ---- transfers ------------------------------------------------------

    fn handle_gather_success(
        &mut self,
        peer: WorkerAddr,
        mut data: BTreeMap<Key, Bytes>,
        missing: Vec<Key>,
        sid: &str,
        out: &mut Vec<Instruction>,
    ) -> Result<()> {
        let Some(transfer) = self.in_flight.remove(&peer) else {
            debug!(worker = %self.address, peer = %peer, "unexpected gather response");
            return Ok(());
        };
        trace!(worker = %self.address, peer = %peer, received = data.len(), missing = missing.len(), "gather response");

        let mut added = BTreeMap::new();
        for key in transfer.keys {
            let Some(ts) = self.tasks.get_mut(&key) else {
                continue;
            };
            ts.coming_from = None;
            let state = ts.state;

            match data.remove(&key) {
                Some(value) => match state {
                    Flight => {
                        let nbytes = self.store(&key, value, sid)?;
                        added.insert(key, nbytes);
                    }
                    Resumed => {
                        let nbytes = self.store(&key, value, sid)?;
                        out.push(Instruction::Send(WorkerReport::TaskFinished {
                            key,
                            nbytes,
                            duration: Duration::ZERO,
                            stimulus_id: sid.to_string(),
                        }));
                    }
                    Cancelled => self.drop_cancelled(&key, sid, out)?,
                    other => {
                        return Err(self.corrupt(&key, &format!("gathered while {other}")));
                    }
                },
                None => {
                    ts.who_has.remove(&peer);
                    out.push(Instruction::Send(WorkerReport::MissingData {
                        key: key.clone(),
                        errant_worker: peer.clone(),
                        stimulus_id: sid.to_string(),
                    }));
                    self.transfer_lost(&key, state, sid, out)?;
                }
            }
        }

        if !added.is_empty() {
            out.push(Instruction::Send(WorkerReport::AddKeys {
                keys: added,
                stimulus_id: sid.to_string(),
            }));
        }
        Ok(())
    }

    fn handle_gather_failure(
        &mut self,
        peer: WorkerAddr,
        keys: Vec<Key>,
        error: String,
        sid: &str,
        out: &mut Vec<Instruction>,
    ) -> Result<()> {
        warn!(worker = %self.address, peer = %peer, error = %error, keys = keys.len(), "gather from peer failed");
        let transfer = self.in_flight.remove(&peer).unwrap_or_default();

        for ts in self.tasks.values_mut() {
            ts.who_has.remove(&peer);
        }

        // The scheduler still lists `peer` as a holder; without a report it
        // would keep sending us back to it. Replica-only fetches just give up.
        for key in &transfer.keys {
            let orphaned = self
                .tasks
                .get(key)
                .is_some_and(|ts| matches!(ts.state, Flight | Resumed) && ts.who_has.is_empty());
            if orphaned && self.has_active_dependents(key) {
                out.push(Instruction::Send(WorkerReport::MissingData {
                    key: key.clone(),
                    errant_worker: peer.clone(),
                    stimulus_id: sid.to_string(),
                }));
            }
        }

        for key in transfer.keys {
            let Some(ts) = self.tasks.get_mut(&key) else {
                continue;
            };
            ts.coming_from = None;
            let state = ts.state;
            self.transfer_lost(&key, state, sid, out)?;
        }

        let orphaned: Vec<Key> = self
            .tasks
            .values()
            .filter(|ts| ts.state == Fetch && ts.who_has.is_empty())
            .map(|ts| ts.key.clone())
            .collect();
        if !orphaned.is_empty() {
            for key in &orphaned {
                self.set_state(key, Missing, sid)?;
            }
            out.push(Instruction::Send(WorkerReport::RequestRefreshWhoHas {
                keys: orphaned,
                stimulus_id: sid.to_string(),
            }));
        }
        Ok(())
    }

    /// A requested key did not arrive from its peer.
    fn transfer_lost(
        &mut self,
        key: &str,
        state: WorkerTaskState,
        sid: &str,
        out: &mut Vec<Instruction>,
    ) -> Result<()> {
        match state {
            Flight => self.fetch_or_missing(key, sid, out),
            Cancelled => self.drop_cancelled(key, sid, out),
            Resumed => {
                let ts = self.task_mut(key)?;
                ts.previous = None;
                ts.next = None;
                self.to_waiting(key, sid, out)
            }
            other => Err(self.corrupt(key, &format!("transfer lost while {other}"))),
        }
    }

    // ---- executions -----------------------------------------------------

    /// Whether a result belongs to the current execution of `key`.
    fn is_current(&self, key: &str, generation: u64) -> bool {
        let current = self.tasks.get(key).is_some_and(|ts| ts.generation == generation)
            && (self.executing.contains(key) || self.long_running.contains(key));
        if !current {
            debug!(worker = %self.address, key = %key, generation, "stale execution result ignored");
        }
        current
    }

    fn free_slot(&mut self, key: &str) {
        self.executing.remove(key);
        self.long_running.remove(key);
    }

    fn handle_execute_success(
        &mut self,
        key: Key,
        generation: u64,
        value: Bytes,
        duration: Duration,
        sid: &str,
        out: &mut Vec<Instruction>,
    ) -> Result<()> {
        if !self.is_current(&key, generation) {
            return Ok(());
        }
        self.free_slot(&key);
        let state = self.task_ref(&key)?.state;
        match state {
            Executing | LongRunning | Resumed => {
                let nbytes = self.store(&key, value, sid)?;
                out.push(Instruction::Send(WorkerReport::TaskFinished {
                    key,
                    nbytes,
                    duration,
                    stimulus_id: sid.to_string(),
                }));
            }
            Cancelled => self.drop_cancelled(&key, sid, out)?,
            other => return Err(self.corrupt(&key, &format!("result while {other}"))),
        }
        Ok(())
    }

    fn handle_execute_failure(
        &mut self,
        key: Key,
        generation: u64,
        exception: ExceptionRef,
        sid: &str,
        out: &mut Vec<Instruction>,
    ) -> Result<()> {
        if !self.is_current(&key, generation) {
            return Ok(());
        }
        self.free_slot(&key);
        let state = self.task_ref(&key)?.state;
        match state {
            Executing | LongRunning => {
                debug!(worker = %self.address, key = %key, exception = %exception, "task raised");
                self.set_state(&key, Error, sid)?;
                self.task_mut(&key)?.exception = Some(exception.clone());
                out.push(Instruction::Send(WorkerReport::TaskErred {
                    key,
                    exception,
                    stimulus_id: sid.to_string(),
                }));
            }
            Cancelled => self.drop_cancelled(&key, sid, out)?,
            Resumed => self.abandon_resumed_execution(&key, sid, out)?,
            other => return Err(self.corrupt(&key, &format!("failure while {other}"))),
        }
        Ok(())
    }

    /// The execution ended without a result: cancelled by the runner, or
    /// the task asked to be rescheduled.
    fn handle_execute_stopped(
        &mut self,
        key: Key,
        generation: u64,
        reschedule: bool,
        sid: &str,
        out: &mut Vec<Instruction>,
    ) -> Result<()> {
        if !self.is_current(&key, generation) {
            return Ok(());
        }
        self.free_slot(&key);
        let state = self.task_ref(&key)?.state;
        match state {
            Executing | LongRunning => {
                if !reschedule {
                    warn!(worker = %self.address, key = %key, "execution stopped without a cancel request");
                }
                self.set_state(&key, Released, sid)?;
                self.task_mut(&key)?.run_spec = None;
                out.push(Instruction::Send(WorkerReport::Reschedule {
                    key: key.clone(),
                    stimulus_id: sid.to_string(),
                }));
                self.release_unneeded_dependencies(&key, sid, out)?;
                self.forget_if_unneeded(&key, sid, out)?;
            }
            Cancelled => self.drop_cancelled(&key, sid, out)?,
            Resumed => self.abandon_resumed_execution(&key, sid, out)?,
            other => return Err(self.corrupt(&key, &format!("stopped while {other}"))),
        }
        Ok(())
    }

    fn handle_secede(
        &mut self,
        key: Key,
        generation: u64,
        compute_duration: Duration,
        sid: &str,
        out: &mut Vec<Instruction>,
    ) -> Result<()> {
        if !self.executing.contains(&key) || !self.is_current(&key, generation) {
            return Ok(());
        }
        self.executing.remove(&key);
        self.long_running.insert(key.clone());
        let state = self.task_ref(&key)?.state;
        match state {
            Executing => {
                self.set_state(&key, LongRunning, sid)?;
                out.push(Instruction::Send(WorkerReport::LongRunning {
                    key,
                    compute_duration,
                    stimulus_id: sid.to_string(),
                }));
            }
            Cancelled | Resumed => self.task_mut(&key)?.previous = Some(LongRunning),
            other => return Err(self.corrupt(&key, &format!("secede while {other}"))),
        }
        Ok(())
    }

    /// A resumed task's execution ended without a usable result; fetch the
    /// key from a peer instead.
    fn abandon_resumed_execution(
        &mut self,
        key: &str,
        sid: &str,
        out: &mut Vec<Instruction>,
    ) -> Result<()> {
        let ts = self.task_mut(key)?;
        ts.previous = None;
        ts.next = None;
        self.fetch_or_missing(key, sid, out)
    }

    /// Discard whatever a cancelled task produced.
    fn drop_cancelled(&mut self, key: &str, sid: &str, out: &mut Vec<Instruction>) -> Result<()> {
        trace!(worker = %self.address, key = %key, "discarding result of cancelled task");
        self.set_state(key, Released, sid)?;
        self.task_mut(key)?.previous = None;
        self.release_unneeded_dependencies(key, sid, out)?;
        self.forget_if_unneeded(key, sid, out)
    }

    // ---- scheduling -----------------------------------------------------

    /// Start gather requests while under the transfer limits: at most one
    /// request per peer, grouped up to the message byte limit.
    fn ensure_communicating(&mut self, sid: &str, out: &mut Vec<Instruction>) -> Result<()> {
        if self.in_flight.len() >= self.transfer_count_limit {
            return Ok(());
        }
        let mut queue: Vec<(Priority, Key)> = self
            .tasks
            .values()
            .filter(|ts| ts.state == Fetch)
            .map(|ts| (ts.priority, ts.key.clone()))
            .collect();
        queue.sort();

        for (_, key) in &queue {
            if self.in_flight.len() >= self.transfer_count_limit {
                break;
            }
            let ts = self.task_ref(key)?;
            if ts.state != Fetch {
                continue;
            }
            let Some(peer) = ts
                .who_has
                .iter()
                .find(|w| !self.in_flight.contains_key(*w))
                .cloned()
            else {
                continue;
            };

            let mut keys = vec![key.clone()];
            let mut total = ts.nbytes.unwrap_or(0);
            for (_, other) in &queue {
                if other == key {
                    continue;
                }
                let Some(ot) = self.tasks.get(other) else {
                    continue;
                };
                if ot.state != Fetch || !ot.who_has.contains(&peer) {
                    continue;
                }
                let n = ot.nbytes.unwrap_or(0);
                if total + n > self.transfer_bytes_limit {
                    continue;
                }
                total += n;
                keys.push(other.clone());
            }

            for k in &keys {
                self.set_state(k, Flight, sid)?;
                self.task_mut(k)?.coming_from = Some(peer.clone());
            }
            self.in_flight.insert(
                peer.clone(),
                Transfer {
                    keys: keys.iter().cloned().collect(),
                    nbytes: total,
                },
            );
            debug!(worker = %self.address, peer = %peer, keys = keys.len(), total_nbytes = total, "gathering dependencies");
            out.push(Instruction::GatherDep {
                peer,
                keys,
                total_nbytes: total,
                stimulus_id: sid.to_string(),
            });
        }
        Ok(())
    }

    fn available_resources(&self) -> Resources {
        let mut available = self.resources.clone();
        for key in self.executing.iter().chain(&self.long_running) {
            if let Some(ts) = self.tasks.get(key) {
                for (name, amount) in &ts.resource_restrictions {
                    if let Some(have) = available.get_mut(name) {
                        *have -= amount;
                    }
                }
            }
        }
        available
    }

    /// Start executions in priority order while slots are free.
    fn ensure_computing(&mut self, sid: &str, out: &mut Vec<Instruction>) -> Result<()> {
        while self.executing.len() < self.nthreads {
            let available = self.available_resources();
            let next = self
                .tasks
                .values()
                .filter(|ts| {
                    ts.state == Ready
                        || (ts.state == Constrained
                            && resources_satisfy(&available, &ts.resource_restrictions))
                })
                .min_by_key(|ts| (ts.priority, ts.key.clone()))
                .map(|ts| ts.key.clone());
            let Some(key) = next else {
                break;
            };

            self.set_state(&key, Executing, sid)?;
            self.generation += 1;
            let generation = self.generation;
            self.task_mut(&key)?.generation = generation;
            self.executing.insert(key.clone());
            out.push(Instruction::Execute {
                key,
                generation,
                stimulus_id: sid.to_string(),
            });
        }
        Ok(())
    }

    // ---- key lifecycle --------------------------------------------------

    fn ensure_task(&mut self, key: &str, priority: Priority) -> &mut WorkerTask {
        self.tasks
            .entry(key.to_string())
            .or_insert_with(|| WorkerTask::new(key.to_string(), priority))
    }

    fn set_who_has(&mut self, key: &str, holders: &[WorkerAddr]) {
        let me = &self.address;
        if let Some(ts) = self.tasks.get_mut(key) {
            ts.who_has = holders.iter().filter(|w| *w != me).cloned().collect();
        }
    }

    /// Dependents that still need `key` to start.
    fn active_dependents(&self, key: &str) -> Vec<Key> {
        let Some(ts) = self.tasks.get(key) else {
            return Vec::new();
        };
        ts.dependents
            .iter()
            .filter(|d| {
                self.tasks.get(*d).is_some_and(|dt| {
                    dt.run_spec.is_some()
                        && (matches!(dt.state, Waiting | Ready | Constrained)
                            || (dt.state == Resumed && dt.next == Some(Waiting)))
                })
            })
            .cloned()
            .collect()
    }

    fn has_active_dependents(&self, key: &str) -> bool {
        !self.active_dependents(key).is_empty()
    }

    fn is_needed(&self, key: &str) -> bool {
        self.tasks
            .get(key)
            .is_some_and(|ts| ts.run_spec.is_some() || ts.wanted_replica)
            || self.has_active_dependents(key)
    }

    /// Make sure `key`'s value is (or will be) in local memory.
    fn request_data(&mut self, key: &str, sid: &str, out: &mut Vec<Instruction>) -> Result<()> {
        let ts = self.task_ref(key)?;
        match (ts.state, ts.previous) {
            (Released | Error, _) => self.fetch_or_missing(key, sid, out),
            (Cancelled, Some(Flight)) => {
                self.set_state(key, Flight, sid)?;
                self.task_mut(key)?.previous = None;
                Ok(())
            }
            (Cancelled, _) => {
                self.set_state(key, Resumed, sid)?;
                self.task_mut(key)?.next = Some(Fetch);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn fetch_or_missing(&mut self, key: &str, sid: &str, out: &mut Vec<Instruction>) -> Result<()> {
        if self.task_ref(key)?.who_has.is_empty() {
            self.set_state(key, Missing, sid)?;
            out.push(Instruction::Send(WorkerReport::RequestRefreshWhoHas {
                keys: vec![key.to_string()],
                stimulus_id: sid.to_string(),
            }));
        } else {
            self.set_state(key, Fetch, sid)?;
        }
        Ok(())
    }

    /// Compute path: wait for missing dependencies, or queue for execution.
    fn to_waiting(&mut self, key: &str, sid: &str, out: &mut Vec<Instruction>) -> Result<()> {
        let deps: Vec<Key> = self.task_ref(key)?.dependencies.iter().cloned().collect();
        let mut waiting = BTreeSet::new();
        for dep in deps {
            if self.task_state(&dep) != Some(Memory) {
                self.request_data(&dep, sid, out)?;
                waiting.insert(dep);
            }
        }
        self.set_state(key, Waiting, sid)?;
        let ready = waiting.is_empty();
        self.task_mut(key)?.waiting_for_data = waiting;
        if ready {
            self.to_ready(key, sid)?;
        }
        Ok(())
    }

    fn to_ready(&mut self, key: &str, sid: &str) -> Result<()> {
        let finish = if self.task_ref(key)?.resource_restrictions.is_empty() {
            Ready
        } else {
            Constrained
        };
        self.set_state(key, finish, sid)
    }

    /// Put `value` in the data store and move `key` to memory.
    fn store(&mut self, key: &str, value: Bytes, sid: &str) -> Result<u64> {
        let nbytes = value.len() as u64;
        self.data.insert(key.to_string(), value)?;
        self.set_state(key, Memory, sid)?;
        let ts = self.task_mut(key)?;
        ts.nbytes = Some(nbytes);
        ts.previous = None;
        ts.next = None;
        ts.exception = None;

        let dependents: Vec<Key> = ts.dependents.iter().cloned().collect();
        for d in dependents {
            let ready = match self.tasks.get_mut(&d) {
                Some(dt) => {
                    dt.waiting_for_data.remove(key);
                    dt.state == Waiting && dt.waiting_for_data.is_empty()
                }
                None => false,
            };
            if ready {
                self.to_ready(&d, sid)?;
            }
        }
        Ok(nbytes)
    }

    /// The scheduler no longer wants this worker to compute or hold `key`.
    fn release_key(&mut self, key: &str, sid: &str, out: &mut Vec<Instruction>) -> Result<()> {
        let Some(ts) = self.tasks.get_mut(key) else {
            return Ok(());
        };
        ts.run_spec = None;
        ts.wanted_replica = false;
        let state = ts.state;
        let generation = ts.generation;

        match state {
            Executing | LongRunning => {
                self.set_state(key, Cancelled, sid)?;
                self.task_mut(key)?.previous = Some(state);
                out.push(Instruction::CancelExecution {
                    key: key.to_string(),
                    generation,
                });
            }
            Flight | Fetch | Missing if self.has_active_dependents(key) => {
                debug!(worker = %self.address, key = %key, "still needed by a local task");
            }
            Flight => {
                self.set_state(key, Cancelled, sid)?;
                self.task_mut(key)?.previous = Some(Flight);
            }
            Resumed => {
                self.set_state(key, Cancelled, sid)?;
                self.task_mut(key)?.next = None;
            }
            Cancelled => {}
            Memory => {
                self.data.remove(key)?;
                self.set_state(key, Released, sid)?;
                let needy = self.active_dependents(key);
                if needy.is_empty() {
                    self.forget_if_unneeded(key, sid, out)?;
                } else {
                    for d in &needy {
                        let dt = self.task_mut(d)?;
                        dt.waiting_for_data.insert(key.to_string());
                        if matches!(dt.state, Ready | Constrained) {
                            self.set_state(d, Waiting, sid)?;
                        }
                    }
                    self.request_data(key, sid, out)?;
                }
            }
            Waiting | Ready | Constrained | Fetch | Missing | Error => {
                self.set_state(key, Released, sid)?;
                self.release_unneeded_dependencies(key, sid, out)?;
                self.forget_if_unneeded(key, sid, out)?;
            }
            Released => self.forget_if_unneeded(key, sid, out)?,
        }
        Ok(())
    }

    fn release_unneeded_dependencies(
        &mut self,
        key: &str,
        sid: &str,
        out: &mut Vec<Instruction>,
    ) -> Result<()> {
        let deps: Vec<Key> = self.task_ref(key)?.dependencies.iter().cloned().collect();
        for dep in deps {
            self.release_unneeded(&dep, sid, out)?;
        }
        Ok(())
    }

    /// Stop acquiring a dependency nothing local needs any more. Replicas
    /// already in memory stay until the scheduler frees them.
    fn release_unneeded(&mut self, key: &str, sid: &str, out: &mut Vec<Instruction>) -> Result<()> {
        if !self.tasks.contains_key(key) || self.is_needed(key) {
            return Ok(());
        }
        let state = self.task_ref(key)?.state;
        match state {
            Fetch | Missing => {
                self.set_state(key, Released, sid)?;
                self.forget_if_unneeded(key, sid, out)?;
            }
            Flight => {
                self.set_state(key, Cancelled, sid)?;
                self.task_mut(key)?.previous = Some(Flight);
            }
            Resumed => {
                self.set_state(key, Cancelled, sid)?;
                self.task_mut(key)?.next = None;
            }
            Released => self.forget_if_unneeded(key, sid, out)?,
            _ => {}
        }
        Ok(())
    }

    /// Remove released keys nothing refers to, cascading to dependencies.
    fn forget_if_unneeded(&mut self, key: &str, sid: &str, out: &mut Vec<Instruction>) -> Result<()> {
        let mut stack = vec![key.to_string()];
        while let Some(key) = stack.pop() {
            let forgettable = self.tasks.get(&key).is_some_and(|ts| {
                ts.state == Released
                    && ts.run_spec.is_none()
                    && !ts.wanted_replica
                    && ts.dependents.is_empty()
            });
            if !forgettable {
                continue;
            }
            let Some(ts) = self.tasks.remove(&key) else {
                continue;
            };
            trace!(worker = %self.address, key = %key, stimulus_id = %sid, "forgotten");
            for dep in ts.dependencies {
                if let Some(dt) = self.tasks.get_mut(&dep) {
                    dt.dependents.remove(&key);
                }
                self.release_unneeded(&dep, sid, out)?;
                stack.push(dep);
            }
        }
        Ok(())
    }

    // ---- bookkeeping ----------------------------------------------------

    fn task_ref(&self, key: &str) -> Result<&WorkerTask> {
        self.tasks
            .get(key)
            .ok_or_else(|| FlotillaError::TaskNotFound(key.to_string()))
    }

    fn task_mut(&mut self, key: &str) -> Result<&mut WorkerTask> {
        self.tasks
            .get_mut(key)
            .ok_or_else(|| FlotillaError::TaskNotFound(key.to_string()))
    }

    fn set_state(&mut self, key: &str, finish: WorkerTaskState, sid: &str) -> Result<()> {
        let start = self.task_ref(key)?.state;
        if start == finish {
            return Ok(());
        }
        if !start.can_transition_to(finish) {
            return Err(self.invalid_transition(key, start, finish, sid));
        }
        self.task_mut(key)?.state = finish;
        trace!(worker = %self.address, key = %key, %start, %finish, stimulus_id = %sid, "worker transition");
        self.story.push_back(WorkerTransition {
            key: key.to_string(),
            start,
            finish,
            stimulus_id: sid.to_string(),
        });
        if self.story.len() > LOG_LENGTH {
            self.story.pop_front();
        }
        Ok(())
    }

    fn log_event(&mut self, topic: &'static str, key: &str, detail: String, sid: &str) {
        self.events.push_back(WorkerLogEvent {
            topic,
            key: key.to_string(),
            detail,
            stimulus_id: sid.to_string(),
        });
        if self.events.len() > LOG_LENGTH {
            self.events.pop_front();
        }
    }

    fn invalid_transition(
        &mut self,
        key: &str,
        start: WorkerTaskState,
        finish: WorkerTaskState,
        sid: &str,
    ) -> FlotillaError {
        error!(worker = %self.address, key = %key, %start, %finish, stimulus_id = %sid, "invalid worker transition");
        self.log_event("invalid-transition", key, format!("{start} -> {finish}"), sid);
        FlotillaError::InvalidTransition {
            key: key.to_string(),
            start: start.to_string(),
            finish: finish.to_string(),
            stimulus_id: sid.to_string(),
        }
    }

    fn corrupt(&self, key: &str, what: &str) -> FlotillaError {
        error!(worker = %self.address, key = %key, "{what}");
        FlotillaError::InvalidState(format!("worker {} key '{key}': {what}", self.address))
    }

    /// Check every cross-index invariant of the worker state.
    pub fn validate_state(&self) -> Result<()> {
        let fail = |msg: String| -> Result<()> {
            Err(FlotillaError::InvalidState(format!(
                "worker {}: {msg}",
                self.address
            )))
        };

        for (key, ts) in &self.tasks {
            for dep in &ts.dependencies {
                if !self.tasks.get(dep).is_some_and(|dt| dt.dependents.contains(key)) {
                    return fail(format!("'{key}' -> '{dep}' dependency link is one-sided"));
                }
            }
            for d in &ts.dependents {
                if !self.tasks.get(d).is_some_and(|dt| dt.dependencies.contains(key)) {
                    return fail(format!("'{d}' -> '{key}' dependent link is one-sided"));
                }
            }

            match ts.computing_as() {
                Some(Executing) if !self.executing.contains(key) => {
                    return fail(format!("'{key}' executing without a slot"));
                }
                Some(LongRunning) if !self.long_running.contains(key) => {
                    return fail(format!("'{key}' long-running but not tracked"));
                }
                None if self.executing.contains(key) || self.long_running.contains(key) => {
                    return fail(format!("'{key}' holds a slot while {}", ts.state));
                }
                _ => {}
            }

            if ts.is_flying() {
                let tracked = ts
                    .coming_from
                    .as_ref()
                    .and_then(|peer| self.in_flight.get(peer))
                    .is_some_and(|t| t.keys.contains(key));
                if !tracked {
                    return fail(format!("'{key}' in flight without a gather request"));
                }
            } else if ts.coming_from.is_some() {
                return fail(format!("'{key}' has a source peer while {}", ts.state));
            }

            if (ts.state == Memory) != self.data.contains(key) {
                return fail(format!("'{key}' is {} but data presence disagrees", ts.state));
            }
            if ts.state == Memory && ts.nbytes.is_none() {
                return fail(format!("'{key}' in memory without a size"));
            }

            match ts.state {
                Ready | Constrained | Executing => {
                    if !ts.waiting_for_data.is_empty() {
                        return fail(format!("'{key}' is {} but waits for data", ts.state));
                    }
                    if ts.state != Executing
                        && ts.dependencies.iter().any(|d| self.task_state(d) != Some(Memory))
                    {
                        return fail(format!("'{key}' is {} with a dependency not in memory", ts.state));
                    }
                }
                Waiting => {
                    if ts.waiting_for_data.is_empty() {
                        return fail(format!("'{key}' waiting for nothing"));
                    }
                    for d in &ts.waiting_for_data {
                        if !ts.dependencies.contains(d) || self.task_state(d) == Some(Memory) {
                            return fail(format!("'{key}' waits on '{d}' needlessly"));
                        }
                    }
                }
                Cancelled => {
                    if !matches!(ts.previous, Some(Executing | LongRunning | Flight)) {
                        return fail(format!("'{key}' cancelled from {:?}", ts.previous));
                    }
                }
                Resumed => {
                    if ts.previous.is_none() || ts.next.is_none() {
                        return fail(format!("'{key}' resumed without previous/next"));
                    }
                }
                Error => {
                    if ts.exception.is_none() {
                        return fail(format!("'{key}' in error without exception"));
                    }
                }
                _ => {}
            }
        }

        for key in self.data.keys() {
            if self.task_state(&key) != Some(Memory) {
                return fail(format!("data for '{key}' without a memory task"));
            }
        }
        for (peer, transfer) in &self.in_flight {
            for key in &transfer.keys {
                let ok = self
                    .tasks
                    .get(key)
                    .is_some_and(|ts| ts.is_flying() && ts.coming_from.as_ref() == Some(peer));
                if !ok {
                    return fail(format!("gather from {peer} lists '{key}' which is not in flight"));
                }
            }
        }
        if self.executing.len() > self.nthreads {
            return fail(format!(
                "{} executions on {} threads",
                self.executing.len(),
                self.nthreads
            ));
        }
        if self.in_flight.len() > self.transfer_count_limit {
            return fail(format!("{} concurrent gathers", self.in_flight.len()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(nthreads: usize) -> WorkerState {
        WorkerState::new(
            WorkerStateConfig::new("w1", nthreads),
            Box::new(BTreeMap::<Key, Bytes>::new()),
        )
    }

    fn compute(key: &str, deps: &[(&str, &[&str])]) -> WorkerEvent {
        WorkerEvent::ComputeTask(ComputeTask {
            key: key.into(),
            run_spec: RunSpec::new(Bytes::from_static(b"spec")),
            priority: Priority::default(),
            who_has: deps
                .iter()
                .map(|(d, holders)| (d.to_string(), holders.iter().map(|h| h.to_string()).collect()))
                .collect(),
            nbytes: deps.iter().map(|(d, _)| (d.to_string(), 10)).collect(),
            resource_restrictions: Resources::new(),
            duration: Duration::from_millis(1),
            stimulus_id: format!("compute-{key}"),
        })
    }

    fn success(key: &str, generation: u64) -> WorkerEvent {
        WorkerEvent::ExecuteSuccess {
            key: key.into(),
            generation,
            value: Bytes::from_static(b"value"),
            duration: Duration::from_millis(3),
            stimulus_id: format!("done-{key}"),
        }
    }

    #[test]
    fn task_without_dependencies_executes_immediately() {
        let mut ws = state(1);
        let out = ws.handle_stimulus(compute("a", &[])).unwrap();
        assert_eq!(
            out,
            vec![Instruction::Execute {
                key: "a".into(),
                generation: 1,
                stimulus_id: "compute-a".into()
            }]
        );
        ws.validate_state().unwrap();

        let out = ws.handle_stimulus(success("a", 1)).unwrap();
        assert!(matches!(
            &out[..],
            [Instruction::Send(WorkerReport::TaskFinished { key, nbytes: 5, .. })] if key == "a"
        ));
        assert_eq!(ws.task_state("a"), Some(Memory));
        ws.validate_state().unwrap();
    }

    #[test]
    fn slots_bound_concurrent_executions() {
        let mut ws = state(1);
        ws.handle_stimulus(compute("a", &[])).unwrap();
        let out = ws.handle_stimulus(compute("b", &[])).unwrap();
        assert!(out.is_empty());
        assert_eq!(ws.task_state("b"), Some(Ready));

        let out = ws.handle_stimulus(success("a", 1)).unwrap();
        assert!(out.iter().any(|i| matches!(i, Instruction::Execute { key, .. } if key == "b")));
        ws.validate_state().unwrap();
    }

    #[test]
    fn stale_generation_is_ignored() {
        let mut ws = state(1);
        ws.handle_stimulus(compute("a", &[])).unwrap();
        let out = ws.handle_stimulus(success("a", 7)).unwrap();
        assert!(out.is_empty());
        assert_eq!(ws.task_state("a"), Some(Executing));
    }

    #[test]
    fn dependency_is_fetched_then_task_runs() {
        let mut ws = state(1);
        let out = ws.handle_stimulus(compute("b", &[("a", &["w2"])])).unwrap();
        assert!(matches!(
            &out[..],
            [Instruction::GatherDep { peer, keys, total_nbytes: 10, .. }] if peer == "w2" && keys == &["a".to_string()]
        ));
        assert_eq!(ws.task_state("a"), Some(Flight));
        assert_eq!(ws.task_state("b"), Some(Waiting));
        ws.validate_state().unwrap();

        let out = ws
            .handle_stimulus(WorkerEvent::GatherDepSuccess {
                peer: "w2".into(),
                data: BTreeMap::from([("a".to_string(), Bytes::from_static(b"1"))]),
                missing: vec![],
                stimulus_id: "gathered".into(),
            })
            .unwrap();
        assert!(out.iter().any(|i| matches!(i, Instruction::Send(WorkerReport::AddKeys { keys, .. }) if keys.contains_key("a"))));
        assert!(out.iter().any(|i| matches!(i, Instruction::Execute { key, .. } if key == "b")));
        ws.validate_state().unwrap();
    }

    #[test]
    fn free_keys_during_execution_cancels_and_discards() {
        let mut ws = state(1);
        ws.handle_stimulus(compute("a", &[])).unwrap();
        let out = ws
            .handle_stimulus(WorkerEvent::FreeKeys {
                keys: vec!["a".into()],
                stimulus_id: "free".into(),
            })
            .unwrap();
        assert_eq!(
            out,
            vec![Instruction::CancelExecution {
                key: "a".into(),
                generation: 1
            }]
        );
        assert_eq!(ws.task_state("a"), Some(Cancelled));
        ws.validate_state().unwrap();

        let out = ws.handle_stimulus(success("a", 1)).unwrap();
        assert!(out.is_empty());
        assert_eq!(ws.task_state("a"), None);
        assert!(!ws.data().contains("a"));
        ws.validate_state().unwrap();
    }

    #[test]
    fn resumed_task_keeps_its_result() {
        let mut ws = state(1);
        ws.handle_stimulus(compute("a", &[])).unwrap();
        ws.handle_stimulus(WorkerEvent::FreeKeys {
            keys: vec!["a".into()],
            stimulus_id: "free".into(),
        })
        .unwrap();
        // Requested again as a replica before the result arrives.
        ws.handle_stimulus(WorkerEvent::AcquireReplicas {
            who_has: BTreeMap::from([("a".to_string(), vec!["w2".to_string()])]),
            nbytes: BTreeMap::new(),
            stimulus_id: "acquire".into(),
        })
        .unwrap();
        assert_eq!(ws.task_state("a"), Some(Resumed));
        ws.validate_state().unwrap();

        let out = ws.handle_stimulus(success("a", 1)).unwrap();
        assert!(matches!(&out[..], [Instruction::Send(WorkerReport::TaskFinished { .. })]));
        assert_eq!(ws.task_state("a"), Some(Memory));
        ws.validate_state().unwrap();
    }

    #[test]
    fn steal_request_releases_queued_task() {
        let mut ws = state(1);
        ws.handle_stimulus(compute("a", &[])).unwrap();
        ws.handle_stimulus(compute("b", &[])).unwrap();

        let out = ws
            .handle_stimulus(WorkerEvent::StealRequest {
                key: "b".into(),
                stimulus_id: "steal".into(),
            })
            .unwrap();
        assert_eq!(
            out,
            vec![Instruction::Send(WorkerReport::StealResponse {
                key: "b".into(),
                state: Some(Ready),
                stimulus_id: "steal".into()
            })]
        );
        assert_eq!(ws.task_state("b"), None);

        let out = ws
            .handle_stimulus(WorkerEvent::StealRequest {
                key: "a".into(),
                stimulus_id: "steal-2".into(),
            })
            .unwrap();
        assert!(matches!(
            &out[..],
            [Instruction::Send(WorkerReport::StealResponse { state: Some(Executing), .. })]
        ));
        assert_eq!(ws.task_state("a"), Some(Executing));
    }

    #[test]
    fn secede_frees_the_slot() {
        let mut ws = state(1);
        ws.handle_stimulus(compute("a", &[])).unwrap();
        ws.handle_stimulus(compute("b", &[])).unwrap();
        let out = ws
            .handle_stimulus(WorkerEvent::Secede {
                key: "a".into(),
                generation: 1,
                compute_duration: Duration::from_millis(5),
                stimulus_id: "secede".into(),
            })
            .unwrap();
        assert!(out.iter().any(|i| matches!(i, Instruction::Send(WorkerReport::LongRunning { .. }))));
        assert!(out.iter().any(|i| matches!(i, Instruction::Execute { key, .. } if key == "b")));
        assert_eq!(ws.task_state("a"), Some(LongRunning));
        ws.validate_state().unwrap();
    }

    #[test]
    fn invalid_transition_is_logged_and_returned() {
        let mut ws = state(1);
        ws.handle_stimulus(compute("a", &[])).unwrap();
        let err = ws.set_state("a", Fetch, "bogus").unwrap_err();
        assert!(matches!(err, FlotillaError::InvalidTransition { .. }));
        assert_eq!(ws.events("invalid-transition").len(), 1);
    }
}
