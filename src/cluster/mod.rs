// src/cluster/mod.rs

//! In-process cluster: one scheduler and a set of workers, each on its own
//! Tokio task, wired together with channels.

pub mod transport;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigFile, ResolvedWorker};
use crate::errors::{FlotillaError, Result};
use crate::graph::TaskSpec;
use crate::protocol::{ClientMessage, KeyStatus, SchedulerEvent};
use crate::scheduler::{SchedulerCore, SchedulerRuntime};
use crate::types::{ClientId, ExceptionRef, Key, WorkerAddr, new_stimulus_id};
use crate::worker::{
    DataStore, PeerClient, SpillBuffer, TaskRunner, WorkerChannels, WorkerRuntime, WorkerState,
    WorkerStateConfig,
};

pub use transport::{ChannelPeers, ChannelSchedulerComms, Registry, SharedRegistry, WorkerEndpoint};

const CHANNEL_CAPACITY: usize = 1024;

struct WorkerHandle {
    shutdown: CancellationToken,
    task: JoinHandle<Result<WorkerState>>,
}

/// A running scheduler plus its workers.
pub struct LocalCluster {
    registry: SharedRegistry,
    scheduler_tx: mpsc::Sender<SchedulerEvent>,
    scheduler: JoinHandle<Result<SchedulerCore>>,
    workers: BTreeMap<WorkerAddr, WorkerHandle>,
    runner: Arc<dyn TaskRunner>,
}

impl std::fmt::Debug for LocalCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCluster")
            .field("workers", &self.workers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl LocalCluster {
    /// Start the scheduler and every worker declared in `config`.
    pub async fn start(config: &ConfigFile, runner: Arc<dyn TaskRunner>) -> Result<Self> {
        let registry = Registry::shared();
        let (scheduler_tx, scheduler_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let runtime = SchedulerRuntime::new(
            config.scheduler().clone(),
            config.amm().clone(),
            scheduler_rx,
            ChannelSchedulerComms::new(registry.clone()),
        );
        let scheduler = tokio::spawn(runtime.run());

        let mut cluster = Self {
            registry,
            scheduler_tx,
            scheduler,
            workers: BTreeMap::new(),
            runner,
        };
        for worker in config.resolved_workers() {
            cluster.add_worker(&worker).await?;
        }
        info!(workers = cluster.workers.len(), "local cluster started");
        Ok(cluster)
    }

    /// Start one more worker and register it with the scheduler.
    pub async fn add_worker(&mut self, worker: &ResolvedWorker) -> Result<()> {
        if self.workers.contains_key(&worker.name) {
            return Err(FlotillaError::ConfigError(format!(
                "worker '{}' already running",
                worker.name
            )));
        }
        let (messages, messages_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (fetch, fetch_rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.registry
            .write()
            .await
            .workers
            .insert(worker.name.clone(), WorkerEndpoint { messages, fetch });

        let state = WorkerState::new(WorkerStateConfig::from_resolved(worker), data_store(worker)?);
        let shutdown = CancellationToken::new();
        let runtime = WorkerRuntime::new(
            state,
            worker.settings.clone(),
            WorkerChannels {
                scheduler_tx: self.scheduler_tx.clone(),
                messages_rx,
                fetch_rx,
            },
            Arc::clone(&self.runner),
            Arc::new(ChannelPeers::new(self.registry.clone())),
            shutdown.clone(),
        );
        let task = tokio::spawn(runtime.run());
        debug!(worker = %worker.name, "worker spawned");
        self.workers
            .insert(worker.name.clone(), WorkerHandle { shutdown, task });
        Ok(())
    }

    /// Workers whose runtime has not been joined yet.
    pub fn workers(&self) -> Vec<WorkerAddr> {
        self.workers.keys().cloned().collect()
    }

    /// Connect a client.
    pub async fn client(&self, id: impl Into<ClientId>) -> ClientHandle {
        let id = id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.registry.write().await.clients.insert(id.clone(), tx);
        ClientHandle {
            id,
            scheduler_tx: self.scheduler_tx.clone(),
            rx,
            peers: ChannelPeers::new(self.registry.clone()),
            outcomes: BTreeMap::new(),
        }
    }

    /// Ask the scheduler to retire `worker` gracefully. The worker exits
    /// once its unique data has been replicated elsewhere; see
    /// [`LocalCluster::join_worker`].
    pub async fn retire_worker(&self, worker: &str) -> Result<()> {
        send(
            &self.scheduler_tx,
            SchedulerEvent::RetireWorker {
                worker: worker.to_string(),
                stimulus_id: new_stimulus_id("retire-worker"),
            },
        )
        .await
    }

    /// Wait for a worker's runtime to exit on its own.
    pub async fn join_worker(&mut self, worker: &str) -> Result<WorkerState> {
        let handle = self
            .workers
            .remove(worker)
            .ok_or_else(|| FlotillaError::WorkerNotFound(worker.to_string()))?;
        join(worker, handle.task).await
    }

    /// Abruptly stop a worker, losing its data, and tell the scheduler.
    pub async fn kill_worker(&mut self, worker: &str) -> Result<WorkerState> {
        let handle = self
            .workers
            .remove(worker)
            .ok_or_else(|| FlotillaError::WorkerNotFound(worker.to_string()))?;
        warn!(worker = %worker, "killing worker");
        handle.shutdown.cancel();
        self.registry.write().await.workers.remove(worker);
        let state = join(worker, handle.task).await;
        send(
            &self.scheduler_tx,
            SchedulerEvent::RemoveWorker {
                worker: worker.to_string(),
                reason: "killed".to_string(),
                stimulus_id: new_stimulus_id("worker-killed"),
            },
        )
        .await?;
        state
    }

    /// Stop every worker, then the scheduler; returns the scheduler core
    /// for inspection.
    pub async fn shutdown(mut self) -> Result<SchedulerCore> {
        for (name, handle) in std::mem::take(&mut self.workers) {
            handle.shutdown.cancel();
            if let Err(err) = join(&name, handle.task).await {
                warn!(worker = %name, error = %err, "worker exited with an error");
            }
        }
        send(&self.scheduler_tx, SchedulerEvent::ShutdownRequested).await?;
        let core = self
            .scheduler
            .await
            .map_err(|err| FlotillaError::Other(anyhow!("scheduler task panicked: {err}")))??;
        info!("local cluster stopped");
        Ok(core)
    }
}

fn data_store(worker: &ResolvedWorker) -> Result<Box<dyn DataStore>> {
    let target = worker.settings.memory_target(worker.memory_limit);
    let directory = worker
        .settings
        .spill_directory
        .as_ref()
        .map(|dir| dir.join(&worker.name));
    Ok(Box::new(SpillBuffer::new(target, directory.as_deref())?))
}

async fn join(worker: &str, task: JoinHandle<Result<WorkerState>>) -> Result<WorkerState> {
    task.await
        .map_err(|err| FlotillaError::Other(anyhow!("worker {worker} panicked: {err}")))?
}

async fn send(tx: &mpsc::Sender<SchedulerEvent>, event: SchedulerEvent) -> Result<()> {
    tx.send(event)
        .await
        .map_err(|_| FlotillaError::ConnectionClosed("scheduler".to_string()))
}

/// Final outcome of a key as seen by a client.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyOutcome {
    Memory { nbytes: u64 },
    Erred { exception: ExceptionRef, blame: Key },
    Cancelled,
}

/// A client connection to a [`LocalCluster`].
#[derive(Debug)]
pub struct ClientHandle {
    id: ClientId,
    scheduler_tx: mpsc::Sender<SchedulerEvent>,
    rx: mpsc::UnboundedReceiver<ClientMessage>,
    peers: ChannelPeers,
    outcomes: BTreeMap<Key, KeyOutcome>,
}

impl ClientHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Submit a graph and hold every key in it.
    pub async fn submit(&mut self, tasks: Vec<TaskSpec>) -> Result<()> {
        self.submit_graph(tasks, None).await
    }

    /// Submit a graph and hold only `wanted`.
    pub async fn submit_wanted(&mut self, tasks: Vec<TaskSpec>, wanted: Vec<Key>) -> Result<()> {
        self.submit_graph(tasks, Some(wanted)).await
    }

    async fn submit_graph(&mut self, tasks: Vec<TaskSpec>, wanted: Option<Vec<Key>>) -> Result<()> {
        for task in &tasks {
            self.outcomes.remove(&task.key);
        }
        debug!(client = %self.id, tasks = tasks.len(), "submitting graph");
        send(
            &self.scheduler_tx,
            SchedulerEvent::SubmitGraph {
                client: self.id.clone(),
                tasks,
                wanted,
                stimulus_id: new_stimulus_id("submit-graph"),
            },
        )
        .await
    }

    pub async fn release(&mut self, keys: Vec<Key>) -> Result<()> {
        for key in &keys {
            self.outcomes.remove(key);
        }
        send(
            &self.scheduler_tx,
            SchedulerEvent::ReleaseKeys {
                client: self.id.clone(),
                keys,
                stimulus_id: new_stimulus_id("client-releases-keys"),
            },
        )
        .await
    }

    pub async fn cancel(&mut self, keys: Vec<Key>) -> Result<()> {
        send(
            &self.scheduler_tx,
            SchedulerEvent::Cancel {
                keys,
                stimulus_id: new_stimulus_id("cancel"),
            },
        )
        .await
    }

    pub async fn retry(&mut self, keys: Vec<Key>) -> Result<()> {
        for key in &keys {
            self.outcomes.remove(key);
        }
        send(
            &self.scheduler_tx,
            SchedulerEvent::Retry {
                client: self.id.clone(),
                keys,
                stimulus_id: new_stimulus_id("client-retry"),
            },
        )
        .await
    }

    /// Receive the next scheduler message, remembering key outcomes.
    pub async fn next_message(&mut self) -> Result<ClientMessage> {
        let msg = self
            .rx
            .recv()
            .await
            .ok_or_else(|| FlotillaError::ConnectionClosed("scheduler".to_string()))?;
        match &msg {
            ClientMessage::KeyInMemory { key, nbytes } => {
                self.outcomes
                    .insert(key.clone(), KeyOutcome::Memory { nbytes: *nbytes });
            }
            ClientMessage::KeyErred {
                key,
                exception,
                blame,
            } => {
                self.outcomes.insert(
                    key.clone(),
                    KeyOutcome::Erred {
                        exception: exception.clone(),
                        blame: blame.clone(),
                    },
                );
            }
            ClientMessage::KeyCancelled { key } => {
                self.outcomes.insert(key.clone(), KeyOutcome::Cancelled);
            }
            _ => {}
        }
        Ok(msg)
    }

    /// Outcome recorded so far for `key`.
    pub fn outcome(&self, key: &str) -> Option<&KeyOutcome> {
        self.outcomes.get(key)
    }

    /// Wait until every key in `keys` reached memory, erred or was
    /// cancelled.
    pub async fn wait_for_keys(&mut self, keys: &[Key]) -> Result<BTreeMap<Key, KeyOutcome>> {
        while let Some(pending) = keys.iter().find(|k| !self.outcomes.contains_key(*k)) {
            let pending = pending.clone();
            match self.next_message().await? {
                ClientMessage::SubmitRejected { reason } => {
                    return Err(FlotillaError::Other(anyhow!("graph rejected: {reason}")));
                }
                ClientMessage::RetryRejected { keys, reason } => {
                    return Err(FlotillaError::Other(anyhow!(
                        "retry of {keys:?} rejected: {reason}"
                    )));
                }
                other => debug!(client = %self.id, waiting_for = %pending, msg = ?other, "client message"),
            }
        }
        Ok(keys
            .iter()
            .filter_map(|k| self.outcomes.get(k).map(|o| (k.clone(), o.clone())))
            .collect())
    }

    /// Ask the scheduler for the current status of `key`.
    pub async fn query(&mut self, key: &str) -> Result<KeyStatus> {
        send(
            &self.scheduler_tx,
            SchedulerEvent::QueryKey {
                client: self.id.clone(),
                key: key.to_string(),
            },
        )
        .await?;
        loop {
            if let ClientMessage::KeyStatus { key: k, status } = self.next_message().await? {
                if k == key {
                    return Ok(status);
                }
            }
        }
    }

    /// Fetch the values of in-memory keys from the workers holding them.
    pub async fn gather(&mut self, keys: &[Key]) -> Result<BTreeMap<Key, Bytes>> {
        let mut values = BTreeMap::new();
        for key in keys {
            let holders = match self.query(key).await? {
                KeyStatus::InMemory { who_has, .. } => who_has,
                other => {
                    return Err(FlotillaError::InvalidState(format!(
                        "cannot gather '{key}': {other:?}"
                    )));
                }
            };
            let mut found = None;
            for worker in &holders {
                match self.peers.fetch(worker, vec![key.clone()], &self.id).await {
                    Ok(mut response) => {
                        if let Some(value) = response.data.remove(key) {
                            found = Some(value);
                            break;
                        }
                    }
                    Err(err) => debug!(client = %self.id, worker = %worker, error = %err, "gather attempt failed"),
                }
            }
            let value = found.ok_or_else(|| {
                FlotillaError::ConnectionClosed(format!("no holder of '{key}' answered"))
            })?;
            values.insert(key.clone(), value);
        }
        Ok(values)
    }
}
