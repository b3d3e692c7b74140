// src/amm/policy.rs

//! The policy seam of the active memory manager.

use std::collections::BTreeSet;
use std::fmt;

use crate::amm::PendingInstructions;
use crate::scheduler::SchedulerState;
use crate::types::{Key, WorkerAddr};

/// What a policy would like to happen to one key.
///
/// `candidates` narrows the set of workers the manager may pick from
/// (destinations for a replicate, sources for a drop); `None` means any
/// eligible worker. The manager always chooses the concrete worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Suggestion {
    /// One more replica of `key`.
    Replicate {
        key: Key,
        candidates: Option<BTreeSet<WorkerAddr>>,
    },
    /// One less replica of `key`.
    Drop {
        key: Key,
        candidates: Option<BTreeSet<WorkerAddr>>,
    },
}

impl Suggestion {
    pub fn replicate(key: impl Into<Key>) -> Self {
        Suggestion::Replicate {
            key: key.into(),
            candidates: None,
        }
    }

    pub fn drop(key: impl Into<Key>) -> Self {
        Suggestion::Drop {
            key: key.into(),
            candidates: None,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Suggestion::Replicate { key, .. } | Suggestion::Drop { key, .. } => key,
        }
    }
}

/// Read-only view handed to policies each cycle.
#[derive(Debug, Clone, Copy)]
pub struct AmmView<'a> {
    pub state: &'a SchedulerState,
    pub pending: &'a PendingInstructions,
}

/// A replication/eviction policy.
///
/// Policies describe the *total* change they want each cycle; instructions
/// still pending from earlier cycles are subtracted by the manager, so a
/// policy does not need to remember what it asked for before.
pub trait Policy: fmt::Debug + Send {
    fn name(&self) -> &str;

    fn suggest(&mut self, view: &AmmView<'_>) -> Vec<Suggestion>;

    /// Whether the policy has nothing left to do and can be uninstalled.
    fn done(&self, _view: &AmmView<'_>) -> bool {
        false
    }
}
