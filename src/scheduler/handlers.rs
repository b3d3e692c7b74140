// src/scheduler/handlers.rs

//! Event handlers for the scheduler core.
//!
//! Each handler inspects the event, adjusts bookkeeping that is not a
//! state transition (replicas, heartbeats, client references), builds
//! recommendations and runs the transition engine.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::errors::Result;
use crate::graph::{TaskSpec, validate_submission};
use crate::protocol::{
    ClientMessage, KeyStatus, WorkerMessage, WorkerMetrics, WorkerRegistration, WorkerReport,
};
use crate::scheduler::transitions::Recommendations;
use crate::scheduler::{SchedulerCommand, SchedulerCore, TaskInfo, TaskState, WorkerInfo, WorkerStatus};
use crate::types::{ClientId, ExceptionRef, Key, Priority, WorkerAddr, new_stimulus_id};

fn free_keys(worker: &str, keys: Vec<Key>, stimulus_id: &str) -> SchedulerCommand {
    SchedulerCommand::SendToWorker {
        worker: worker.to_string(),
        msg: WorkerMessage::FreeKeys {
            keys,
            stimulus_id: stimulus_id.to_string(),
        },
    }
}

impl SchedulerCore {
    // ---- workers --------------------------------------------------------

    pub(crate) fn handle_add_worker(
        &mut self,
        reg: WorkerRegistration,
        out: &mut Vec<SchedulerCommand>,
    ) -> Result<()> {
        let stimulus_id = new_stimulus_id("add-worker");
        let addr = reg.address.clone();

        if self.state.workers.contains_key(&addr) {
            warn!(worker = %addr, "worker registered twice; dropping previous incarnation");
            self.remove_worker(&addr, "re-registered", &stimulus_id, out)?;
        }

        let now = self.state.now;
        self.state.workers.insert(
            addr.clone(),
            WorkerInfo::new(addr.clone(), reg.nthreads, reg.resources, reg.memory_limit, now),
        );
        info!(worker = %addr, nthreads = reg.nthreads, keys = reg.keys.len(), "worker added");

        let mut to_free = Vec::new();
        for (key, nbytes) in reg.keys {
            match self.state.tasks.get_mut(&key) {
                Some(ts) if ts.state == TaskState::Memory => {
                    ts.nbytes.get_or_insert(nbytes);
                    self.state.add_replica(&key, &addr);
                }
                _ => to_free.push(key),
            }
        }
        if !to_free.is_empty() {
            debug!(worker = %addr, keys = ?to_free, "freeing unknown keys on new worker");
            out.push(free_keys(&addr, to_free, &stimulus_id));
        }

        let mut recs = Recommendations::new();
        for key in &self.state.unrunnable {
            recs.push(key.clone(), TaskState::Processing);
        }
        self.state.transitions(recs, &stimulus_id, out)
    }

    /// Remove a worker: requeue or fail its processing tasks and drop its
    /// replicas. Graceful retirement uses the same path once the worker
    /// holds no unique data.
    pub(crate) fn remove_worker(
        &mut self,
        addr: &str,
        reason: &str,
        stimulus_id: &str,
        out: &mut Vec<SchedulerCommand>,
    ) -> Result<()> {
        let Some(ws) = self.state.workers.get_mut(addr) else {
            debug!(worker = %addr, "remove for unknown worker ignored");
            return Ok(());
        };
        ws.status = WorkerStatus::Closed;
        let processing: Vec<Key> = ws.processing.keys().cloned().collect();
        let has_what: Vec<Key> = ws.has_what.iter().cloned().collect();
        info!(
            worker = %addr,
            reason = %reason,
            processing = processing.len(),
            replicas = has_what.len(),
            "removing worker"
        );

        let mut recs = Recommendations::new();
        for key in processing {
            self.state.clear_processing(&key);
            let ts = self.state.task_mut(&key)?;
            if ts.retries > 0 {
                ts.retries -= 1;
                debug!(key = %key, retries_left = ts.retries, "requeueing task from lost worker");
                recs.push(key, TaskState::Released);
            } else {
                warn!(key = %key, worker = %addr, "task lost with worker and out of retries");
                ts.exception = Some(ExceptionRef::killed_worker(&key, addr));
                ts.exception_blame = Some(key.clone());
                recs.push(key, TaskState::Erred);
            }
        }

        for key in has_what {
            self.state.remove_replica(&key, addr);
            let lost = self
                .state
                .task(&key)
                .is_some_and(|t| t.state == TaskState::Memory && t.who_has.is_empty());
            if lost {
                debug!(key = %key, worker = %addr, "last replica lost");
                recs.push(key, TaskState::Released);
            }
        }

        self.state.workers.remove(addr);
        self.stealing.remove_worker(addr);
        self.amm.remove_worker(addr);
        self.retiring.remove(addr);

        self.state.transitions(recs, stimulus_id, out)
    }

    pub(crate) fn handle_heartbeat(&mut self, worker: &str, metrics: WorkerMetrics) {
        let now = self.state.now;
        match self.state.workers.get_mut(worker) {
            Some(ws) => {
                ws.last_seen = now;
                ws.metrics = metrics;
            }
            None => debug!(worker = %worker, "heartbeat from unknown worker"),
        }
    }

    /// Remove workers whose heartbeats stopped and warn about tasks that
    /// have been unrunnable for too long.
    pub(crate) fn check_heartbeats(&mut self, out: &mut Vec<SchedulerCommand>) -> Result<()> {
        let now = self.state.now;
        let timeout = self.state.config.heartbeat_timeout;
        let dead: Vec<WorkerAddr> = self
            .state
            .workers
            .values()
            .filter(|ws| now.saturating_duration_since(ws.last_seen) > timeout)
            .map(|ws| ws.address.clone())
            .collect();

        for addr in dead {
            warn!(worker = %addr, ?timeout, "worker missed heartbeats; removing");
            let stimulus_id = new_stimulus_id("heartbeat-timeout");
            self.remove_worker(&addr, "heartbeat timeout", &stimulus_id, out)?;
            out.push(SchedulerCommand::DisconnectWorker { worker: addr });
        }

        self.warn_unrunnable();
        Ok(())
    }

    fn warn_unrunnable(&mut self) {
        let now = self.state.now;
        let threshold = self.state.config.unrunnable_warning;
        let overdue: Vec<Key> = self
            .state
            .unrunnable
            .iter()
            .filter(|key| {
                self.state.tasks.get(*key).is_some_and(|ts| {
                    !ts.unrunnable_warned
                        && ts
                            .no_worker_since
                            .is_some_and(|since| now.saturating_duration_since(since) > threshold)
                })
            })
            .cloned()
            .collect();

        for key in overdue {
            let Some(ts) = self.state.tasks.get_mut(&key) else {
                continue;
            };
            ts.unrunnable_warned = true;
            let restrictions = format!("{:?}", ts.resource_restrictions);
            warn!(
                key = %key,
                restrictions = %restrictions,
                "task has been unrunnable for too long; no worker satisfies its resources"
            );
            self.state
                .log_event("unrunnable", Some(&key), restrictions, "unrunnable-check");
        }
    }

    // ---- worker reports -------------------------------------------------

    pub(crate) fn handle_report(
        &mut self,
        worker: &str,
        report: WorkerReport,
        out: &mut Vec<SchedulerCommand>,
    ) -> Result<()> {
        if !self.state.workers.contains_key(worker) {
            debug!(worker = %worker, ?report, "report from unknown worker ignored");
            return Ok(());
        }

        match report {
            WorkerReport::TaskFinished {
                key,
                nbytes,
                duration,
                stimulus_id,
            } => self.handle_task_finished(worker, &key, nbytes, duration, &stimulus_id, out),
            WorkerReport::TaskErred {
                key,
                exception,
                stimulus_id,
            } => self.handle_task_erred(worker, &key, exception, &stimulus_id, out),
            WorkerReport::MissingData {
                key,
                errant_worker,
                stimulus_id,
            } => self.handle_missing_data(worker, &key, &errant_worker, &stimulus_id, out),
            WorkerReport::RequestRefreshWhoHas { keys, stimulus_id } => {
                out.push(self.refresh_who_has(worker, &keys, &stimulus_id));
                Ok(())
            }
            WorkerReport::AddKeys { keys, stimulus_id } => {
                self.handle_add_keys(worker, keys, &stimulus_id, out);
                Ok(())
            }
            WorkerReport::ReleaseWorkerData { key, stimulus_id } => {
                self.handle_release_worker_data(worker, &key, &stimulus_id, out)
            }
            WorkerReport::StealResponse {
                key,
                state,
                stimulus_id,
            } => self
                .stealing
                .handle_response(&mut self.state, worker, &key, state, &stimulus_id, out),
            WorkerReport::LongRunning {
                key,
                compute_duration,
                ..
            } => {
                if self.is_processing_on(&key, worker) {
                    self.state.mark_long_running(&key, worker);
                    debug!(key = %key, worker = %worker, ?compute_duration, "task seceded");
                }
                Ok(())
            }
            WorkerReport::Reschedule { key, stimulus_id } => {
                if !self.is_processing_on(&key, worker) {
                    return Ok(());
                }
                debug!(key = %key, worker = %worker, "worker asked to reschedule task");
                let mut recs = Recommendations::new();
                recs.push(key, TaskState::Released);
                self.state.transitions(recs, &stimulus_id, out)
            }
        }
    }

    fn is_processing_on(&self, key: &str, worker: &str) -> bool {
        self.state.task(key).is_some_and(|t| {
            t.state == TaskState::Processing && t.processing_on.as_deref() == Some(worker)
        })
    }

    fn handle_task_finished(
        &mut self,
        worker: &str,
        key: &str,
        nbytes: u64,
        duration: Duration,
        stimulus_id: &str,
        out: &mut Vec<SchedulerCommand>,
    ) -> Result<()> {
        if self.is_processing_on(key, worker) {
            let recs = self
                .state
                .processing_memory(key, worker, nbytes, duration, stimulus_id, out)?;
            return self.state.transitions(recs, stimulus_id, out);
        }

        match self.state.task_state(key) {
            Some(TaskState::Memory) => {
                if let Some(ts) = self.state.tasks.get_mut(key) {
                    ts.nbytes.get_or_insert(nbytes);
                }
                self.state.add_replica(key, worker);
                self.amm.confirm_replica(key, worker);
            }
            other => {
                debug!(key = %key, worker = %worker, state = ?other, "stale task-finished; freeing");
                out.push(free_keys(worker, vec![key.to_string()], stimulus_id));
            }
        }
        Ok(())
    }

    fn handle_task_erred(
        &mut self,
        worker: &str,
        key: &str,
        exception: ExceptionRef,
        stimulus_id: &str,
        out: &mut Vec<SchedulerCommand>,
    ) -> Result<()> {
        if !self.is_processing_on(key, worker) {
            debug!(key = %key, worker = %worker, "stale task-erred ignored");
            return Ok(());
        }
        info!(key = %key, worker = %worker, exception = %exception, "task erred");
        let ts = self.state.task_mut(key)?;
        ts.exception = Some(exception);
        ts.exception_blame = Some(key.to_string());

        let mut recs = Recommendations::new();
        recs.push(key, TaskState::Erred);
        self.state.transitions(recs, stimulus_id, out)?;
        out.push(free_keys(worker, vec![key.to_string()], stimulus_id));
        Ok(())
    }

    fn handle_missing_data(
        &mut self,
        reporter: &str,
        key: &str,
        errant: &str,
        stimulus_id: &str,
        out: &mut Vec<SchedulerCommand>,
    ) -> Result<()> {
        if self.state.task(key).is_none() {
            return Ok(());
        }
        if self.state.remove_replica(key, errant) {
            debug!(key = %key, errant = %errant, reporter = %reporter, "replica reported missing");
            self.amm.confirm_drop(key, errant);
            if self.state.workers.contains_key(errant) {
                out.push(free_keys(errant, vec![key.to_string()], stimulus_id));
            }
        }

        let Some(ts) = self.state.task(key) else {
            return Ok(());
        };
        if ts.state != TaskState::Memory {
            return Ok(());
        }
        if ts.who_has.is_empty() {
            let mut recs = Recommendations::new();
            recs.push(key, TaskState::Released);
            self.state.transitions(recs, stimulus_id, out)
        } else {
            out.push(self.refresh_who_has(reporter, &[key.to_string()], stimulus_id));
            Ok(())
        }
    }

    fn refresh_who_has(&self, worker: &str, keys: &[Key], stimulus_id: &str) -> SchedulerCommand {
        let who_has: BTreeMap<Key, Vec<WorkerAddr>> = keys
            .iter()
            .map(|key| {
                let holders = self
                    .state
                    .task(key)
                    .filter(|t| t.state == TaskState::Memory)
                    .map(|t| t.who_has.iter().cloned().collect())
                    .unwrap_or_default();
                (key.clone(), holders)
            })
            .collect();
        SchedulerCommand::SendToWorker {
            worker: worker.to_string(),
            msg: WorkerMessage::RefreshWhoHas {
                who_has,
                stimulus_id: stimulus_id.to_string(),
            },
        }
    }

    fn handle_add_keys(
        &mut self,
        worker: &str,
        keys: BTreeMap<Key, u64>,
        stimulus_id: &str,
        out: &mut Vec<SchedulerCommand>,
    ) {
        let mut to_free = Vec::new();
        for (key, nbytes) in keys {
            match self.state.tasks.get_mut(&key) {
                Some(ts) if ts.state == TaskState::Memory => {
                    ts.nbytes.get_or_insert(nbytes);
                    self.state.add_replica(&key, worker);
                    self.amm.confirm_replica(&key, worker);
                }
                _ => to_free.push(key),
            }
        }
        if !to_free.is_empty() {
            out.push(free_keys(worker, to_free, stimulus_id));
        }
    }

    fn handle_release_worker_data(
        &mut self,
        worker: &str,
        key: &str,
        stimulus_id: &str,
        out: &mut Vec<SchedulerCommand>,
    ) -> Result<()> {
        self.amm.confirm_drop(key, worker);
        if !self.state.remove_replica(key, worker) {
            return Ok(());
        }
        let lost = self
            .state
            .task(key)
            .is_some_and(|t| t.state == TaskState::Memory && t.who_has.is_empty());
        if lost {
            warn!(key = %key, worker = %worker, "last replica released by worker");
            let mut recs = Recommendations::new();
            recs.push(key, TaskState::Released);
            self.state.transitions(recs, stimulus_id, out)?;
        }
        Ok(())
    }

    // ---- clients --------------------------------------------------------

    pub(crate) fn handle_submit_graph(
        &mut self,
        client: ClientId,
        tasks: Vec<TaskSpec>,
        wanted: Option<Vec<Key>>,
        stimulus_id: &str,
        out: &mut Vec<SchedulerCommand>,
    ) -> Result<()> {
        let order = match validate_submission(&tasks, |k| self.state.tasks.contains_key(k)) {
            Ok(order) => order,
            Err(err) => {
                warn!(client = %client, error = %err, "graph submission rejected");
                out.push(SchedulerCommand::SendToClient {
                    client,
                    msg: ClientMessage::SubmitRejected {
                        reason: err.to_string(),
                    },
                });
                return Ok(());
            }
        };

        let wanted: Vec<Key> = wanted.unwrap_or_else(|| tasks.iter().map(|t| t.key.clone()).collect());
        let submitted: BTreeSet<&str> = tasks.iter().map(|t| t.key.as_str()).collect();
        if let Some(unknown) = wanted
            .iter()
            .find(|k| !submitted.contains(k.as_str()) && !self.state.tasks.contains_key(*k))
        {
            out.push(SchedulerCommand::SendToClient {
                client,
                msg: ClientMessage::SubmitRejected {
                    reason: format!("wanted key '{unknown}' is neither submitted nor known"),
                },
            });
            return Ok(());
        }

        self.state.generation += 1;
        let generation = self.state.generation;
        let by_key: HashMap<&str, &TaskSpec> = tasks.iter().map(|t| (t.key.as_str(), t)).collect();

        let mut created = Vec::new();
        for (position, key) in order.iter().enumerate() {
            if self.state.tasks.contains_key(key) {
                debug!(key = %key, "resubmitted key deduplicated");
                continue;
            }
            let Some(spec) = by_key.get(key.as_str()) else {
                continue;
            };
            let retries = spec.retries.unwrap_or(self.state.config.allowed_failures);
            let priority = Priority::new(spec.priority, generation, position as u64);
            let mut ts = TaskInfo::new(key.clone(), spec.run_spec.clone(), priority, retries);
            ts.resource_restrictions = spec.resources.clone();
            ts.duration = spec.duration;
            ts.dependencies = spec.dependencies.iter().cloned().collect();
            for dep in &spec.dependencies {
                if let Some(d) = self.state.tasks.get_mut(dep) {
                    d.dependents.insert(key.clone());
                }
            }
            self.state.tasks.insert(key.clone(), ts);
            created.push(key.clone());
        }
        info!(
            client = %client,
            submitted = tasks.len(),
            created = created.len(),
            wanted = wanted.len(),
            "graph submitted"
        );

        let mut recs = Recommendations::new();
        let wanted_set: BTreeSet<&Key> = wanted.iter().collect();
        for key in &wanted {
            self.state
                .clients
                .entry(client.clone())
                .or_default()
                .insert(key.clone());
            let ts = self.state.task_mut(key)?;
            ts.who_wants.insert(client.clone());
            match ts.state {
                TaskState::Released => recs.push(key.clone(), TaskState::Waiting),
                TaskState::Memory => out.push(SchedulerCommand::SendToClient {
                    client: client.clone(),
                    msg: ClientMessage::KeyInMemory {
                        key: key.clone(),
                        nbytes: ts.nbytes.unwrap_or(0),
                    },
                }),
                TaskState::Erred => {
                    if let (Some(exception), Some(blame)) =
                        (ts.exception.clone(), ts.exception_blame.clone())
                    {
                        out.push(SchedulerCommand::SendToClient {
                            client: client.clone(),
                            msg: ClientMessage::KeyErred {
                                key: key.clone(),
                                exception,
                                blame,
                            },
                        });
                    }
                }
                _ => {}
            }
        }

        // Submitted keys nothing depends on and nobody wants are dropped
        // once the wanted keys have pinned their dependencies.
        for key in created.iter().filter(|k| !wanted_set.contains(k)) {
            recs.push(key.clone(), TaskState::Forgotten);
        }

        self.state.transitions(recs, stimulus_id, out)
    }

    pub(crate) fn handle_release_keys(
        &mut self,
        client: &str,
        keys: Vec<Key>,
        stimulus_id: &str,
        out: &mut Vec<SchedulerCommand>,
    ) -> Result<()> {
        let mut recs = Recommendations::new();
        for key in keys {
            let removed = self
                .state
                .clients
                .get_mut(client)
                .is_some_and(|wanted| wanted.remove(&key));
            if !removed {
                continue;
            }
            let Some(ts) = self.state.tasks.get_mut(&key) else {
                continue;
            };
            ts.who_wants.remove(client);
            if ts.is_referenced() {
                continue;
            }
            if ts.state == TaskState::Erred {
                recs.push(key, TaskState::Released);
            } else {
                self.state.recommend_release(&key, &mut recs);
            }
        }
        if self.state.clients.get(client).is_some_and(BTreeSet::is_empty) {
            self.state.clients.remove(client);
        }
        self.state.transitions(recs, stimulus_id, out)
    }

    /// Cancel `keys` and everything depending on them.
    pub(crate) fn handle_cancel(
        &mut self,
        keys: Vec<Key>,
        stimulus_id: &str,
        out: &mut Vec<SchedulerCommand>,
    ) -> Result<()> {
        let mut cancelled: BTreeSet<Key> = BTreeSet::new();
        let mut stack: Vec<Key> = keys;
        while let Some(key) = stack.pop() {
            let Some(ts) = self.state.tasks.get(&key) else {
                continue;
            };
            stack.extend(ts.dependents.iter().cloned());
            cancelled.insert(key);
        }
        if cancelled.is_empty() {
            return Ok(());
        }
        info!(count = cancelled.len(), "cancelling keys");

        // Strip every reference first so no released key bounces back to
        // waiting on behalf of another cancelled key.
        let mut notify: Vec<(ClientId, Key)> = Vec::new();
        let mut outside_deps: BTreeSet<Key> = BTreeSet::new();
        for key in &cancelled {
            let ts = self.state.task_mut(key)?;
            let clients = std::mem::take(&mut ts.who_wants);
            let deps: Vec<Key> = ts.dependencies.iter().cloned().collect();
            for client in clients {
                if let Some(wanted) = self.state.clients.get_mut(&client) {
                    wanted.remove(key);
                }
                notify.push((client, key.clone()));
            }
            for dep in deps {
                if let Some(d) = self.state.tasks.get_mut(&dep) {
                    d.waiters.remove(key);
                }
                if !cancelled.contains(&dep) {
                    outside_deps.insert(dep);
                }
            }
        }
        self.state.clients.retain(|_, wanted| !wanted.is_empty());

        let mut recs = Recommendations::new();
        for key in &cancelled {
            match self.state.task_state(key) {
                Some(TaskState::Released) => self.state.recommend_release(key, &mut recs),
                Some(_) => recs.push(key.clone(), TaskState::Released),
                None => {}
            }
        }
        for dep in &outside_deps {
            if self.state.task(dep).is_some_and(|d| !d.is_referenced()) {
                self.state.recommend_release(dep, &mut recs);
            }
        }
        self.state.transitions(recs, stimulus_id, out)?;

        for (client, key) in notify {
            out.push(SchedulerCommand::SendToClient {
                client,
                msg: ClientMessage::KeyCancelled { key },
            });
        }
        Ok(())
    }

    /// Explicit retry of erred keys and their erred dependencies.
    pub(crate) fn handle_retry(
        &mut self,
        client: ClientId,
        keys: Vec<Key>,
        stimulus_id: &str,
        out: &mut Vec<SchedulerCommand>,
    ) -> Result<()> {
        // Post-order walk through erred dependencies: dependencies first.
        let mut order: Vec<Key> = Vec::new();
        let mut seen: BTreeSet<Key> = BTreeSet::new();
        let mut stack: Vec<(Key, bool)> = keys.iter().rev().map(|k| (k.clone(), false)).collect();
        while let Some((key, expanded)) = stack.pop() {
            if expanded {
                order.push(key);
                continue;
            }
            let Some(ts) = self.state.task(&key) else {
                continue;
            };
            if ts.state != TaskState::Erred || !seen.insert(key.clone()) {
                continue;
            }
            let deps: Vec<Key> = ts.dependencies.iter().cloned().collect();
            stack.push((key, true));
            for dep in deps.into_iter().rev() {
                stack.push((dep, false));
            }
        }

        if order.is_empty() {
            out.push(SchedulerCommand::SendToClient {
                client,
                msg: ClientMessage::RetryRejected {
                    keys,
                    reason: "no erred keys to retry".to_string(),
                },
            });
            return Ok(());
        }

        let origins: Vec<Key> = order
            .iter()
            .filter(|k| {
                self.state
                    .task(k)
                    .is_some_and(|t| t.exception_blame.as_deref() == Some(k.as_str()))
            })
            .cloned()
            .collect();
        let exhausted: Vec<Key> = origins
            .iter()
            .filter(|k| self.state.task(k).is_some_and(|t| t.retries == 0))
            .cloned()
            .collect();
        if !exhausted.is_empty() {
            warn!(keys = ?exhausted, "retry rejected; retry budget exhausted");
            out.push(SchedulerCommand::SendToClient {
                client,
                msg: ClientMessage::RetryRejected {
                    keys: exhausted,
                    reason: "retry budget exhausted".to_string(),
                },
            });
            return Ok(());
        }

        for key in &origins {
            let ts = self.state.task_mut(key)?;
            ts.retries -= 1;
        }
        info!(client = %client, keys = order.len(), "retrying erred keys");

        let mut recs = Recommendations::new();
        for key in order {
            recs.push(key, TaskState::Waiting);
        }
        self.state.transitions(recs, stimulus_id, out)
    }

    pub(crate) fn handle_query(&self, client: ClientId, key: Key, out: &mut Vec<SchedulerCommand>) {
        let status = match self.state.task(&key) {
            None => KeyStatus::Unknown,
            Some(ts) => match ts.state {
                TaskState::Memory => KeyStatus::InMemory {
                    who_has: ts.who_has.iter().cloned().collect(),
                    nbytes: ts.nbytes.unwrap_or(0),
                },
                TaskState::Erred => match (&ts.exception, &ts.exception_blame) {
                    (Some(exception), Some(blame)) => KeyStatus::Erred {
                        exception: exception.clone(),
                        blame: blame.clone(),
                    },
                    _ => KeyStatus::Pending(TaskState::Erred),
                },
                other => KeyStatus::Pending(other),
            },
        };
        out.push(SchedulerCommand::SendToClient {
            client,
            msg: ClientMessage::KeyStatus { key, status },
        });
    }
}
