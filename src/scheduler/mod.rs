// src/scheduler/mod.rs

//! The scheduler: task-graph state machine, worker bookkeeping, work
//! stealing and the active memory manager's host.
//!
//! The pure core state machine lives in [`core`] (with its handlers in
//! [`handlers`] and the transition engine in [`transitions`]); the
//! async/IO shell is implemented in [`runtime`].

use crate::protocol::{ClientMessage, WorkerMessage};
use crate::types::{ClientId, WorkerAddr};

/// Side effects requested by the core from the IO shell.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerCommand {
    SendToWorker { worker: WorkerAddr, msg: WorkerMessage },
    SendToClient { client: ClientId, msg: ClientMessage },
    /// Drop the connection to a worker the core already removed.
    DisconnectWorker { worker: WorkerAddr },
}

/// Result of handling one event.
#[derive(Debug, Default)]
pub struct SchedulerStep {
    pub commands: Vec<SchedulerCommand>,
    pub keep_running: bool,
}

pub mod core;
pub mod decide;
pub mod handlers;
pub mod runtime;
pub mod state;
pub mod stealing;
pub mod task_info;
pub mod task_state;
pub mod transitions;
pub mod worker_info;

pub use core::SchedulerCore;
pub use decide::decide_worker;
pub use runtime::{SchedulerComms, SchedulerRuntime};
pub use state::{SchedulerLogEvent, SchedulerState, TransitionRecord};
pub use stealing::{InFlightSteal, WorkStealing};
pub use task_info::TaskInfo;
pub use task_state::TaskState;
pub use transitions::Recommendations;
pub use worker_info::{WorkerInfo, WorkerStatus};
