// src/worker/runtime.rs

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WorkerDefaults;
use crate::errors::{FlotillaError, Result};
use crate::protocol::{FetchResponse, SchedulerEvent, WorkerMessage};
use crate::types::{ExceptionRef, Key, WorkerAddr, new_stimulus_id};

use super::events::{Instruction, WorkerEvent};
use super::execution::{TaskContext, TaskRunner};
use super::state::WorkerState;

/// Run `f` where it may block on file IO. On a multi-threaded runtime the
/// current thread hands its other tasks off first.
fn blocking_io<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current().map(|h| h.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(f),
        _ => f(),
    }
}

/// A peer asking this worker for data.
#[derive(Debug)]
pub struct FetchRequest {
    pub keys: Vec<Key>,
    pub from: WorkerAddr,
    pub reply: oneshot::Sender<FetchResponse>,
}

/// How a worker reaches its peers for dependency transfers.
pub trait PeerClient: Send + Sync {
    fn fetch(
        &self,
        peer: &str,
        keys: Vec<Key>,
        from: &str,
    ) -> Pin<Box<dyn Future<Output = Result<FetchResponse>> + Send + '_>>;
}

/// Channels connecting one worker runtime to the rest of the cluster.
#[derive(Debug)]
pub struct WorkerChannels {
    pub scheduler_tx: mpsc::Sender<SchedulerEvent>,
    pub messages_rx: mpsc::Receiver<WorkerMessage>,
    pub fetch_rx: mpsc::Receiver<FetchRequest>,
}

/// Async shell around [`WorkerState`].
///
/// Feeds scheduler messages, execution outcomes and transfer results into
/// the state machine and carries out the returned instructions: executions
/// run on spawned Tokio tasks through the [`TaskRunner`], transfers through
/// the [`PeerClient`].
pub struct WorkerRuntime {
    state: WorkerState,
    settings: WorkerDefaults,
    channels: WorkerChannels,
    events_tx: mpsc::Sender<WorkerEvent>,
    events_rx: mpsc::Receiver<WorkerEvent>,
    runner: Arc<dyn TaskRunner>,
    peers: Arc<dyn PeerClient>,
    shutdown: CancellationToken,
    /// Cancellation handle of the live execution of each key.
    executions: BTreeMap<Key, (u64, CancellationToken)>,
}

impl fmt::Debug for WorkerRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerRuntime")
            .field("state", &self.state)
            .field("executions", &self.executions.len())
            .finish_non_exhaustive()
    }
}

impl WorkerRuntime {
    pub fn new(
        state: WorkerState,
        settings: WorkerDefaults,
        channels: WorkerChannels,
        runner: Arc<dyn TaskRunner>,
        peers: Arc<dyn PeerClient>,
        shutdown: CancellationToken,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(1024);
        Self {
            state,
            settings,
            channels,
            events_tx,
            events_rx,
            runner,
            peers,
            shutdown,
            executions: BTreeMap::new(),
        }
    }

    pub fn address(&self) -> &str {
        self.state.address()
    }

    /// Main event loop. Registers with the scheduler, then runs until the
    /// scheduler closes the worker, the connection drops, or `shutdown`
    /// fires. Returns the final local state.
    pub async fn run(mut self) -> Result<WorkerState> {
        let address = self.state.address().to_string();
        info!(worker = %address, nthreads = self.state.nthreads(), "worker runtime started");

        let registration = SchedulerEvent::AddWorker(self.state.registration());
        if self.channels.scheduler_tx.send(registration).await.is_err() {
            return Err(FlotillaError::ConnectionClosed(format!(
                "scheduler unreachable from {address}"
            )));
        }

        let mut heartbeat = time::interval(self.settings.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!(worker = %address, "shutdown requested");
                    break;
                }
                maybe = self.channels.messages_rx.recv() => match maybe {
                    Some(WorkerMessage::Close { reason }) => {
                        info!(worker = %address, reason = %reason, "closed by scheduler");
                        break;
                    }
                    Some(msg) => match WorkerEvent::from_message(msg) {
                        Some(event) => event,
                        None => continue,
                    },
                    None => {
                        info!(worker = %address, "scheduler connection closed");
                        break;
                    }
                },
                Some(request) = self.channels.fetch_rx.recv() => {
                    self.serve_fetch(request);
                    continue;
                }
                Some(event) = self.events_rx.recv() => event,
                _ = heartbeat.tick() => {
                    let beat = SchedulerEvent::Heartbeat {
                        worker: address.clone(),
                        metrics: self.state.metrics(),
                    };
                    if self.channels.scheduler_tx.send(beat).await.is_err() {
                        warn!(worker = %address, "scheduler gone; stopping");
                        break;
                    }
                    continue;
                }
            };

            match self.dispatch(event).await {
                Ok(()) => {}
                Err(FlotillaError::ConnectionClosed(what)) => {
                    warn!(worker = %address, what = %what, "scheduler gone; stopping");
                    break;
                }
                Err(err) => {
                    self.cancel_executions();
                    return Err(err);
                }
            }
        }

        self.cancel_executions();
        info!(worker = %address, "worker runtime exiting");
        Ok(self.state)
    }

    fn cancel_executions(&self) {
        for (key, (_, token)) in &self.executions {
            debug!(worker = %self.state.address(), key = %key, "cancelling execution on exit");
            token.cancel();
        }
    }

    /// Feed one event to the state machine and carry out the resulting
    /// instructions, including follow-up events they produce.
    async fn dispatch(&mut self, event: WorkerEvent) -> Result<()> {
        let mut queue = VecDeque::from([event]);

        while let Some(event) = queue.pop_front() {
            self.forget_finished_execution(&event);
            let state = &mut self.state;
            let handled = if state.data().uses_disk() {
                blocking_io(|| state.handle_stimulus(event))
            } else {
                state.handle_stimulus(event)
            };
            let instructions = match handled {
                Ok(instructions) => instructions,
                Err(err) => {
                    error!(
                        worker = %self.state.address(),
                        error = %err,
                        fault = err.is_fault(),
                        "worker state machine failed; stopping"
                    );
                    return Err(err);
                }
            };
            for instruction in instructions {
                if let Some(follow_up) = self.execute(instruction).await? {
                    queue.push_back(follow_up);
                }
            }
        }
        Ok(())
    }

    fn forget_finished_execution(&mut self, event: &WorkerEvent) {
        let (key, generation) = match event {
            WorkerEvent::ExecuteSuccess { key, generation, .. }
            | WorkerEvent::ExecuteFailure { key, generation, .. }
            | WorkerEvent::ExecuteCancelled { key, generation, .. }
            | WorkerEvent::Reschedule { key, generation, .. } => (key, *generation),
            _ => return,
        };
        if self.executions.get(key).is_some_and(|(g, _)| *g == generation) {
            self.executions.remove(key);
        }
    }

    async fn execute(&mut self, instruction: Instruction) -> Result<Option<WorkerEvent>> {
        match instruction {
            Instruction::Execute {
                key, generation, ..
            } => return Ok(self.start_execution(key, generation)),
            Instruction::CancelExecution { key, generation } => {
                match self.executions.get(&key) {
                    Some((g, token)) if *g == generation => {
                        debug!(worker = %self.state.address(), key = %key, "cancelling execution");
                        token.cancel();
                    }
                    _ => debug!(worker = %self.state.address(), key = %key, "no live execution to cancel"),
                }
            }
            Instruction::GatherDep { peer, keys, total_nbytes, .. } => {
                self.start_gather(peer, keys, total_nbytes);
            }
            Instruction::Send(report) => {
                let event = SchedulerEvent::Report {
                    worker: self.state.address().to_string(),
                    report,
                };
                if self.channels.scheduler_tx.send(event).await.is_err() {
                    return Err(FlotillaError::ConnectionClosed(format!(
                        "report from {}",
                        self.state.address()
                    )));
                }
            }
        }
        Ok(None)
    }

    /// Spawn the runner for `key`. Returns a failure event right away when
    /// the inputs cannot be assembled.
    fn start_execution(&mut self, key: Key, generation: u64) -> Option<WorkerEvent> {
        let (run_spec, dependencies) = match self.state.execution_inputs(&key) {
            Ok(inputs) => inputs,
            Err(err) => {
                error!(worker = %self.state.address(), key = %key, error = %err, "cannot start execution");
                let summary = format!("{err:#}");
                return Some(WorkerEvent::ExecuteFailure {
                    key,
                    generation,
                    exception: ExceptionRef::new(summary.clone(), summary),
                    stimulus_id: new_stimulus_id("task-erred"),
                });
            }
        };

        let token = self.shutdown.child_token();
        self.executions
            .insert(key.clone(), (generation, token.clone()));
        let ctx = TaskContext::new(key.clone(), generation, token, self.events_tx.clone());
        let runner = Arc::clone(&self.runner);
        let events_tx = self.events_tx.clone();
        debug!(worker = %self.state.address(), key = %key, generation, "execution started");

        tokio::spawn(async move {
            let started = Instant::now();
            let outcome = runner.run(ctx, run_spec, dependencies).await;
            let event = outcome.into_event(key, generation, started.elapsed());
            if events_tx.send(event).await.is_err() {
                debug!("worker gone; execution outcome dropped");
            }
        });
        None
    }

    fn start_gather(&self, peer: WorkerAddr, keys: Vec<Key>, total_nbytes: u64) {
        let peers = Arc::clone(&self.peers);
        let events_tx = self.events_tx.clone();
        let me = self.state.address().to_string();
        let timeout = self.settings.fetch_timeout;
        debug!(worker = %me, peer = %peer, keys = keys.len(), total_nbytes, "gather started");

        tokio::spawn(async move {
            let result = time::timeout(timeout, peers.fetch(&peer, keys.clone(), &me)).await;
            let event = match result {
                Ok(Ok(response)) => WorkerEvent::GatherDepSuccess {
                    peer,
                    data: response.data,
                    missing: response.missing,
                    stimulus_id: new_stimulus_id("gather-dep-success"),
                },
                Ok(Err(err)) => WorkerEvent::GatherDepFailure {
                    peer,
                    keys,
                    error: err.to_string(),
                    stimulus_id: new_stimulus_id("gather-dep-failure"),
                },
                Err(_) => WorkerEvent::GatherDepFailure {
                    peer,
                    keys,
                    error: format!("timed out after {timeout:?}"),
                    stimulus_id: new_stimulus_id("gather-dep-timeout"),
                },
            };
            if events_tx.send(event).await.is_err() {
                debug!(worker = %me, "worker gone; gather result dropped");
            }
        });
    }

    fn serve_fetch(&mut self, request: FetchRequest) {
        let state = &mut self.state;
        let read = if state.data().uses_disk() {
            blocking_io(|| state.get_data(&request.keys))
        } else {
            state.get_data(&request.keys)
        };
        let response = match read {
            Ok(response) => response,
            Err(err) => {
                warn!(worker = %self.state.address(), from = %request.from, error = %err, "failed to read data for peer");
                FetchResponse {
                    data: BTreeMap::new(),
                    missing: request.keys.clone(),
                }
            }
        };
        debug!(
            worker = %self.state.address(),
            from = %request.from,
            sent = response.data.len(),
            missing = response.missing.len(),
            "served peer fetch"
        );
        if request.reply.send(response).is_err() {
            debug!(worker = %self.state.address(), from = %request.from, "peer gave up on fetch");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn disk_work_runs_in_place_on_a_multi_threaded_runtime() {
        let thread = std::thread::current().id();
        let ran_on = blocking_io(|| std::thread::current().id());
        assert_eq!(ran_on, thread);
    }

    #[tokio::test]
    async fn disk_work_runs_inline_on_a_current_thread_runtime() {
        assert_eq!(blocking_io(|| 7), 7);
    }

    #[test]
    fn disk_work_runs_outside_a_runtime() {
        assert_eq!(blocking_io(|| "done"), "done");
    }
}
