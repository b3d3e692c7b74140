// src/scheduler/worker_info.rs

//! Scheduler-side bookkeeping for one worker.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::{Duration, Instant};

use crate::protocol::WorkerMetrics;
use crate::types::{Key, Resources, WorkerAddr};

/// Lifecycle of a worker as seen by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Accepts new tasks.
    Running,
    /// Being retired: keeps running its tasks, receives nothing new.
    ClosingGracefully,
    Closed,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerStatus::Running => "running",
            WorkerStatus::ClosingGracefully => "closing-gracefully",
            WorkerStatus::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub address: WorkerAddr,
    pub nthreads: usize,
    pub resources: Resources,
    pub memory_limit: u64,
    pub status: WorkerStatus,

    /// Tasks assigned to this worker, with the estimate used for occupancy.
    pub processing: BTreeMap<Key, Duration>,
    /// Processing tasks that left their execution slot.
    pub long_running: BTreeSet<Key>,
    /// Keys with a replica on this worker ("has-what").
    pub has_what: BTreeSet<Key>,
    /// Total bytes of replicas held here.
    pub nbytes: u64,

    /// Sum of estimated durations of processing (non long-running) tasks.
    pub occupancy: Duration,

    pub metrics: WorkerMetrics,
    pub last_seen: Instant,
}

impl WorkerInfo {
    pub fn new(
        address: WorkerAddr,
        nthreads: usize,
        resources: Resources,
        memory_limit: u64,
        now: Instant,
    ) -> Self {
        Self {
            address,
            nthreads,
            resources,
            memory_limit,
            status: WorkerStatus::Running,
            processing: BTreeMap::new(),
            long_running: BTreeSet::new(),
            has_what: BTreeSet::new(),
            nbytes: 0,
            occupancy: Duration::ZERO,
            metrics: WorkerMetrics::default(),
            last_seen: now,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == WorkerStatus::Running
    }

    /// Processing tasks that still hold (or wait for) an execution slot.
    pub fn active_processing(&self) -> usize {
        self.processing.len() - self.long_running.len()
    }

    /// More queued work than slots.
    pub fn is_saturated(&self) -> bool {
        self.active_processing() > self.nthreads
    }

    /// At least one slot without work.
    pub fn is_idle(&self) -> bool {
        self.active_processing() < self.nthreads
    }

    /// Occupancy per execution slot, in seconds.
    pub fn load(&self) -> f64 {
        self.occupancy.as_secs_f64() / self.nthreads.max(1) as f64
    }
}
