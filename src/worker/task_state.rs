// src/worker/task_state.rs

//! Worker-local task states and their transition table.

use std::fmt;

use serde::Serialize;

/// State of a key on one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerTaskState {
    Released,
    /// Assigned for compute; some dependencies are not local yet.
    Waiting,
    /// Needed from a peer; not requested yet.
    Fetch,
    /// Needed from a peer, but no holder is known.
    Missing,
    /// Requested from a peer.
    Flight,
    /// All dependencies local; queued for an execution slot.
    Ready,
    /// Like `Ready`, but blocked on custom resources.
    Constrained,
    Executing,
    /// Seceded from its execution slot.
    LongRunning,
    Memory,
    Error,
    /// Released while executing or in flight; the result will be discarded.
    Cancelled,
    /// Cancelled, then requested again before the result arrived.
    Resumed,
}

impl WorkerTaskState {
    pub fn can_transition_to(self, finish: WorkerTaskState) -> bool {
        use WorkerTaskState::*;
        match (self, finish) {
            (Released, Waiting | Fetch | Missing | Ready | Constrained) => true,
            (Waiting, Ready | Constrained | Released) => true,
            (Fetch, Flight | Missing | Waiting | Released) => true,
            (Missing, Fetch | Waiting | Released) => true,
            (Flight, Memory | Fetch | Missing | Cancelled | Resumed) => true,
            (Ready | Constrained, Executing | Waiting | Released) => true,
            (Executing, Memory | Error | LongRunning | Cancelled | Released) => true,
            (LongRunning, Memory | Error | Cancelled | Released) => true,
            (Memory, Released) => true,
            (Error, Released | Waiting | Fetch | Missing) => true,
            (Cancelled, Released | Executing | LongRunning | Flight | Resumed) => true,
            (Resumed, Memory | Cancelled | Executing | LongRunning | Fetch | Missing | Waiting) => {
                true
            }
            _ => false,
        }
    }

    /// States whose task occupies (or occupied) an execution slot.
    pub fn is_computing(self) -> bool {
        matches!(self, WorkerTaskState::Executing | WorkerTaskState::LongRunning)
    }

    /// A scheduler steal may take the task away in this state.
    pub fn is_stealable(self) -> bool {
        matches!(
            self,
            WorkerTaskState::Waiting | WorkerTaskState::Ready | WorkerTaskState::Constrained
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerTaskState::Released => "released",
            WorkerTaskState::Waiting => "waiting",
            WorkerTaskState::Fetch => "fetch",
            WorkerTaskState::Missing => "missing",
            WorkerTaskState::Flight => "flight",
            WorkerTaskState::Ready => "ready",
            WorkerTaskState::Constrained => "constrained",
            WorkerTaskState::Executing => "executing",
            WorkerTaskState::LongRunning => "long-running",
            WorkerTaskState::Memory => "memory",
            WorkerTaskState::Error => "error",
            WorkerTaskState::Cancelled => "cancelled",
            WorkerTaskState::Resumed => "resumed",
        }
    }
}

impl fmt::Display for WorkerTaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::WorkerTaskState::*;

    #[test]
    fn flight_must_be_cancelled_before_release() {
        assert!(!Flight.can_transition_to(Released));
        assert!(Flight.can_transition_to(Cancelled));
        assert!(Cancelled.can_transition_to(Released));
    }

    #[test]
    fn executing_results_land_in_memory_or_error() {
        assert!(Executing.can_transition_to(Memory));
        assert!(Executing.can_transition_to(Error));
        assert!(!Executing.can_transition_to(Ready));
        assert!(!Memory.can_transition_to(Executing));
    }

    #[test]
    fn only_queued_tasks_are_stealable() {
        assert!(Ready.is_stealable());
        assert!(Waiting.is_stealable());
        assert!(!Executing.is_stealable());
        assert!(!Memory.is_stealable());
    }
}
