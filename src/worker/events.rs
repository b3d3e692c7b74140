// src/worker/events.rs

//! Stimuli consumed by [`super::WorkerState`] and the instructions it
//! returns.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;

use crate::protocol::{ComputeTask, WorkerMessage, WorkerReport};
use crate::types::{ExceptionRef, Key, StimulusId, WorkerAddr};

/// Everything that can change a worker's local state.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    ComputeTask(ComputeTask),
    FreeKeys {
        keys: Vec<Key>,
        stimulus_id: StimulusId,
    },
    StealRequest {
        key: Key,
        stimulus_id: StimulusId,
    },
    AcquireReplicas {
        who_has: BTreeMap<Key, Vec<WorkerAddr>>,
        nbytes: BTreeMap<Key, u64>,
        stimulus_id: StimulusId,
    },
    RemoveReplicas {
        keys: Vec<Key>,
        stimulus_id: StimulusId,
    },
    RefreshWhoHas {
        who_has: BTreeMap<Key, Vec<WorkerAddr>>,
        stimulus_id: StimulusId,
    },
    /// A peer answered a gather request. Requested keys absent from both
    /// `data` and `missing` are treated as missing.
    GatherDepSuccess {
        peer: WorkerAddr,
        data: BTreeMap<Key, Bytes>,
        missing: Vec<Key>,
        stimulus_id: StimulusId,
    },
    /// Network error or fetch timeout.
    GatherDepFailure {
        peer: WorkerAddr,
        keys: Vec<Key>,
        error: String,
        stimulus_id: StimulusId,
    },
    ExecuteSuccess {
        key: Key,
        generation: u64,
        value: Bytes,
        duration: Duration,
        stimulus_id: StimulusId,
    },
    ExecuteFailure {
        key: Key,
        generation: u64,
        exception: ExceptionRef,
        stimulus_id: StimulusId,
    },
    /// The runner observed the cancellation token and stopped.
    ExecuteCancelled {
        key: Key,
        generation: u64,
        stimulus_id: StimulusId,
    },
    /// The task asked to be scheduled again.
    Reschedule {
        key: Key,
        generation: u64,
        stimulus_id: StimulusId,
    },
    /// The task left its execution slot.
    Secede {
        key: Key,
        generation: u64,
        compute_duration: Duration,
        stimulus_id: StimulusId,
    },
}

impl WorkerEvent {
    /// Map a scheduler message onto a stimulus. `Close` is handled by the
    /// runtime and has no counterpart.
    pub fn from_message(msg: WorkerMessage) -> Option<WorkerEvent> {
        let event = match msg {
            WorkerMessage::ComputeTask(task) => WorkerEvent::ComputeTask(task),
            WorkerMessage::FreeKeys { keys, stimulus_id } => {
                WorkerEvent::FreeKeys { keys, stimulus_id }
            }
            WorkerMessage::StealRequest { key, stimulus_id } => {
                WorkerEvent::StealRequest { key, stimulus_id }
            }
            WorkerMessage::AcquireReplicas {
                who_has,
                nbytes,
                stimulus_id,
            } => WorkerEvent::AcquireReplicas {
                who_has,
                nbytes,
                stimulus_id,
            },
            WorkerMessage::RemoveReplicas { keys, stimulus_id } => {
                WorkerEvent::RemoveReplicas { keys, stimulus_id }
            }
            WorkerMessage::RefreshWhoHas {
                who_has,
                stimulus_id,
            } => WorkerEvent::RefreshWhoHas {
                who_has,
                stimulus_id,
            },
            WorkerMessage::Close { .. } => return None,
        };
        Some(event)
    }

    pub fn stimulus_id(&self) -> &str {
        match self {
            WorkerEvent::ComputeTask(task) => &task.stimulus_id,
            WorkerEvent::FreeKeys { stimulus_id, .. }
            | WorkerEvent::StealRequest { stimulus_id, .. }
            | WorkerEvent::AcquireReplicas { stimulus_id, .. }
            | WorkerEvent::RemoveReplicas { stimulus_id, .. }
            | WorkerEvent::RefreshWhoHas { stimulus_id, .. }
            | WorkerEvent::GatherDepSuccess { stimulus_id, .. }
            | WorkerEvent::GatherDepFailure { stimulus_id, .. }
            | WorkerEvent::ExecuteSuccess { stimulus_id, .. }
            | WorkerEvent::ExecuteFailure { stimulus_id, .. }
            | WorkerEvent::ExecuteCancelled { stimulus_id, .. }
            | WorkerEvent::Reschedule { stimulus_id, .. }
            | WorkerEvent::Secede { stimulus_id, .. } => stimulus_id,
        }
    }
}

/// Side effects requested by the worker state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// Start computing `key`; results must carry `generation`.
    Execute {
        key: Key,
        generation: u64,
        stimulus_id: StimulusId,
    },
    /// Fetch `keys` from `peer` in a single request.
    GatherDep {
        peer: WorkerAddr,
        keys: Vec<Key>,
        total_nbytes: u64,
        stimulus_id: StimulusId,
    },
    Send(WorkerReport),
    /// Signal the running execution of `key` to stop.
    CancelExecution { key: Key, generation: u64 },
}
