// src/scheduler/task_state.rs

//! Scheduler-side task states and the table of legal transitions.

use std::fmt;

/// State of a task in the scheduler's graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskState {
    /// Known but not needed right now (or waiting to be forgotten).
    Released,
    /// Needed; some dependencies are not in memory yet.
    Waiting,
    /// Runnable, but no worker satisfies its resource restrictions.
    NoWorker,
    /// Assigned to exactly one worker.
    Processing,
    /// At least one replica exists on some worker.
    Memory,
    /// The computation (or one of its dependencies) failed.
    Erred,
    /// Removed from every index.
    Forgotten,
}

impl TaskState {
    /// Whether the scheduler may move a task from `self` to `finish`.
    ///
    /// Every mutation site goes through this check; anything not listed is
    /// a bookkeeping bug.
    pub fn can_transition_to(self, finish: TaskState) -> bool {
        use TaskState::*;
        match (self, finish) {
            (Released, Waiting)
            | (Waiting, Processing)
            | (Waiting, NoWorker)
            | (NoWorker, Processing)
            | (Processing, Memory)
            | (Processing, Erred)
            | (Waiting, Erred)
            | (Erred, Waiting)
            | (Memory, Released)
            | (Released, Forgotten) => true,
            // Cancellation, worker loss and dependency loss.
            (Waiting | NoWorker | Processing | Erred, Released) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Released => "released",
            TaskState::Waiting => "waiting",
            TaskState::NoWorker => "no-worker",
            TaskState::Processing => "processing",
            TaskState::Memory => "memory",
            TaskState::Erred => "erred",
            TaskState::Forgotten => "forgotten",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::TaskState::*;

    #[test]
    fn table_matches_lifecycle() {
        assert!(Released.can_transition_to(Waiting));
        assert!(Waiting.can_transition_to(Processing));
        assert!(NoWorker.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Memory));
        assert!(Memory.can_transition_to(Released));
        assert!(Released.can_transition_to(Forgotten));
        assert!(Erred.can_transition_to(Waiting));
        assert!(Processing.can_transition_to(Released));
    }

    #[test]
    fn shortcuts_are_rejected() {
        assert!(!Released.can_transition_to(Processing));
        assert!(!Waiting.can_transition_to(Memory));
        assert!(!Memory.can_transition_to(Forgotten));
        assert!(!Memory.can_transition_to(Processing));
        assert!(!Forgotten.can_transition_to(Released));
        assert!(!Released.can_transition_to(Released));
        assert!(!Erred.can_transition_to(Processing));
    }
}
