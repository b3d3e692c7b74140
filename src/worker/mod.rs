// src/worker/mod.rs

//! The worker: local task state machine, result storage and execution.
//!
//! [`WorkerState`] is the pure core; [`WorkerRuntime`] is the async shell
//! that runs tasks through a [`TaskRunner`] and fetches dependencies from
//! peers through a [`PeerClient`].

pub mod events;
pub mod execution;
pub mod memory;
pub mod runtime;
pub mod state;
pub mod task_state;

pub use events::{Instruction, WorkerEvent};
pub use execution::{ShellRunner, TaskContext, TaskOutcome, TaskRunner};
pub use memory::{DataStore, SpillBuffer};
pub use runtime::{FetchRequest, PeerClient, WorkerChannels, WorkerRuntime};
pub use state::{WorkerLogEvent, WorkerState, WorkerStateConfig, WorkerTask, WorkerTransition};
pub use task_state::WorkerTaskState;
