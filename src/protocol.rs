// src/protocol.rs

//! Logical message set exchanged between clients, the scheduler and the
//! workers.
//!
//! Framing and delivery belong to the transport; within this crate the
//! messages travel over Tokio channels (see [`crate::cluster`]).

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;

use crate::graph::TaskSpec;
use crate::scheduler::TaskState;
use crate::types::{ClientId, ExceptionRef, Key, Priority, Resources, RunSpec, StimulusId, WorkerAddr};
use crate::worker::WorkerTaskState;

/// `task-assign`: the scheduler asks a worker to compute `key`.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputeTask {
    pub key: Key,
    pub run_spec: RunSpec,
    pub priority: Priority,
    /// Holders of every dependency, as known to the scheduler.
    pub who_has: BTreeMap<Key, Vec<WorkerAddr>>,
    /// Result sizes of the dependencies.
    pub nbytes: BTreeMap<Key, u64>,
    pub resource_restrictions: Resources,
    pub duration: Duration,
    pub stimulus_id: StimulusId,
}

/// Messages sent by the scheduler to one worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    ComputeTask(ComputeTask),
    /// Forget these keys: cancel computations, drop data.
    FreeKeys {
        keys: Vec<Key>,
        stimulus_id: StimulusId,
    },
    /// Work stealing: release `key` if it has not started yet.
    StealRequest { key: Key, stimulus_id: StimulusId },
    /// AMM replicate: fetch these keys from the listed holders.
    AcquireReplicas {
        who_has: BTreeMap<Key, Vec<WorkerAddr>>,
        nbytes: BTreeMap<Key, u64>,
        stimulus_id: StimulusId,
    },
    /// AMM drop: release these replicas unless they are needed locally.
    RemoveReplicas {
        keys: Vec<Key>,
        stimulus_id: StimulusId,
    },
    /// Updated holder lists for keys the worker asked about.
    RefreshWhoHas {
        who_has: BTreeMap<Key, Vec<WorkerAddr>>,
        stimulus_id: StimulusId,
    },
    /// The scheduler is done with this worker.
    Close { reason: String },
}

/// Reports sent by a worker to the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerReport {
    /// `task-finished`: the result stays on the worker.
    TaskFinished {
        key: Key,
        nbytes: u64,
        duration: Duration,
        stimulus_id: StimulusId,
    },
    /// `task-erred`.
    TaskErred {
        key: Key,
        exception: ExceptionRef,
        stimulus_id: StimulusId,
    },
    /// A peer that was supposed to hold `key` did not have it.
    MissingData {
        key: Key,
        errant_worker: WorkerAddr,
        stimulus_id: StimulusId,
    },
    /// The worker knows no reachable holder for these keys.
    RequestRefreshWhoHas {
        keys: Vec<Key>,
        stimulus_id: StimulusId,
    },
    /// New replicas acquired (or kept after a rejected drop).
    AddKeys {
        keys: BTreeMap<Key, u64>,
        stimulus_id: StimulusId,
    },
    /// A replica was released after a drop request.
    ReleaseWorkerData { key: Key, stimulus_id: StimulusId },
    /// Answer to a [`WorkerMessage::StealRequest`]: the task's local state
    /// before the request was handled.
    StealResponse {
        key: Key,
        state: Option<WorkerTaskState>,
        stimulus_id: StimulusId,
    },
    /// The task left its execution slot and keeps running in the background.
    LongRunning {
        key: Key,
        compute_duration: Duration,
        stimulus_id: StimulusId,
    },
    /// The task asked to be scheduled again from scratch.
    Reschedule { key: Key, stimulus_id: StimulusId },
}

impl WorkerReport {
    pub fn stimulus_id(&self) -> &str {
        match self {
            WorkerReport::TaskFinished { stimulus_id, .. }
            | WorkerReport::TaskErred { stimulus_id, .. }
            | WorkerReport::MissingData { stimulus_id, .. }
            | WorkerReport::RequestRefreshWhoHas { stimulus_id, .. }
            | WorkerReport::AddKeys { stimulus_id, .. }
            | WorkerReport::ReleaseWorkerData { stimulus_id, .. }
            | WorkerReport::StealResponse { stimulus_id, .. }
            | WorkerReport::LongRunning { stimulus_id, .. }
            | WorkerReport::Reschedule { stimulus_id, .. } => stimulus_id,
        }
    }
}

/// Summary a worker sends with every heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerMetrics {
    /// Bytes of results held in RAM.
    pub memory_bytes: u64,
    /// Bytes of results spilled to disk.
    pub spilled_bytes: u64,
    pub spilled_count: u64,
    pub executing: usize,
    pub ready: usize,
    pub in_flight: usize,
}

/// Handshake sent by a worker when it (re)connects.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerRegistration {
    pub address: WorkerAddr,
    pub nthreads: usize,
    pub resources: Resources,
    pub memory_limit: u64,
    /// Keys (and their sizes) the worker already holds.
    pub keys: BTreeMap<Key, u64>,
}

/// Everything the scheduler core reacts to.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    AddWorker(WorkerRegistration),
    RemoveWorker {
        worker: WorkerAddr,
        reason: String,
        stimulus_id: StimulusId,
    },
    Heartbeat {
        worker: WorkerAddr,
        metrics: WorkerMetrics,
    },
    Report {
        worker: WorkerAddr,
        report: WorkerReport,
    },
    /// `submit-graph`. `wanted` lists the keys the client holds; `None`
    /// means every submitted key.
    SubmitGraph {
        client: ClientId,
        tasks: Vec<TaskSpec>,
        wanted: Option<Vec<Key>>,
        stimulus_id: StimulusId,
    },
    /// `release-keys`.
    ReleaseKeys {
        client: ClientId,
        keys: Vec<Key>,
        stimulus_id: StimulusId,
    },
    /// `cancel`.
    Cancel {
        keys: Vec<Key>,
        stimulus_id: StimulusId,
    },
    /// Explicit retry of erred keys.
    Retry {
        client: ClientId,
        keys: Vec<Key>,
        stimulus_id: StimulusId,
    },
    QueryKey { client: ClientId, key: Key },
    /// Gracefully retire a worker, moving its unique data elsewhere.
    RetireWorker {
        worker: WorkerAddr,
        stimulus_id: StimulusId,
    },
    /// Timer: drop workers whose heartbeats stopped.
    CheckHeartbeats,
    /// Timer: run one work-stealing balance pass.
    Balance,
    /// Timer: run one active memory manager cycle.
    RunAmm,
    ShutdownRequested,
}

/// Status of a key as reported to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyStatus {
    Unknown,
    Pending(TaskState),
    InMemory { who_has: Vec<WorkerAddr>, nbytes: u64 },
    Erred { exception: ExceptionRef, blame: Key },
}

/// Messages sent by the scheduler to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    KeyInMemory { key: Key, nbytes: u64 },
    KeyErred {
        key: Key,
        exception: ExceptionRef,
        blame: Key,
    },
    KeyCancelled { key: Key },
    KeyStatus { key: Key, status: KeyStatus },
    SubmitRejected { reason: String },
    RetryRejected { keys: Vec<Key>, reason: String },
}

/// Peer-to-peer data transfer answer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchResponse {
    pub data: BTreeMap<Key, Bytes>,
    /// Requested keys the peer does not hold.
    pub missing: Vec<Key>,
}
