// src/scheduler/task_info.rs

//! Scheduler-side task record.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use crate::scheduler::TaskState;
use crate::types::{ClientId, ExceptionRef, Key, Priority, Resources, RunSpec, WorkerAddr};

/// Everything the scheduler knows about one key.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub key: Key,
    pub run_spec: RunSpec,
    pub state: TaskState,
    pub priority: Priority,

    /// Keys this task consumes.
    pub dependencies: BTreeSet<Key>,
    /// Keys that consume this task.
    pub dependents: BTreeSet<Key>,
    /// Dependencies not in memory yet (meaningful while `waiting`).
    pub waiting_on: BTreeSet<Key>,
    /// Dependents that still need this key's data.
    pub waiters: BTreeSet<Key>,
    /// Clients holding a reference to this key.
    pub who_wants: BTreeSet<ClientId>,

    /// Workers holding a replica.
    pub who_has: BTreeSet<WorkerAddr>,
    /// The single worker this task is assigned to while `processing`.
    pub processing_on: Option<WorkerAddr>,
    /// Size of the result, once known.
    pub nbytes: Option<u64>,

    pub resource_restrictions: Resources,
    /// Caller-provided runtime estimate.
    pub duration: Option<Duration>,
    /// Retry budget left for worker-loss requeues and explicit retries.
    pub retries: u32,
    /// Set while the task runs outside an execution slot.
    pub long_running: bool,

    pub exception: Option<ExceptionRef>,
    /// Key whose failure caused this task to err (itself for the origin).
    pub exception_blame: Option<Key>,

    /// When the task entered `no-worker`.
    pub no_worker_since: Option<Instant>,
    /// Whether the unrunnable warning was already logged.
    pub unrunnable_warned: bool,
}

impl TaskInfo {
    pub fn new(key: Key, run_spec: RunSpec, priority: Priority, retries: u32) -> Self {
        Self {
            key,
            run_spec,
            state: TaskState::Released,
            priority,
            dependencies: BTreeSet::new(),
            dependents: BTreeSet::new(),
            waiting_on: BTreeSet::new(),
            waiters: BTreeSet::new(),
            who_wants: BTreeSet::new(),
            who_has: BTreeSet::new(),
            processing_on: None,
            nbytes: None,
            resource_restrictions: Resources::new(),
            duration: None,
            retries,
            long_running: false,
            exception: None,
            exception_blame: None,
            no_worker_since: None,
            unrunnable_warned: false,
        }
    }

    /// Logical refcount: clients plus dependents that still need the key.
    pub fn refcount(&self) -> usize {
        self.who_wants.len() + self.waiters.len()
    }

    pub fn is_referenced(&self) -> bool {
        self.refcount() > 0
    }

    /// Number of in-memory copies.
    pub fn replica_count(&self) -> usize {
        self.who_has.len()
    }
}
