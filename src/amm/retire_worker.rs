// src/amm/retire_worker.rs

use crate::amm::{AmmView, Policy, Suggestion};
use crate::scheduler::TaskState;
use crate::types::WorkerAddr;

/// Copy every key only held by a retiring worker somewhere else.
///
/// Uninstalls itself once the worker is gone.
#[derive(Debug)]
pub struct RetireWorker {
    address: WorkerAddr,
    name: String,
}

impl RetireWorker {
    pub fn new(address: impl Into<WorkerAddr>) -> Self {
        let address = address.into();
        let name = format!("retire-worker-{address}");
        Self { address, name }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl Policy for RetireWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn suggest(&mut self, view: &AmmView<'_>) -> Vec<Suggestion> {
        let Some(ws) = view.state.worker(&self.address) else {
            return Vec::new();
        };
        ws.has_what
            .iter()
            .filter(|key| {
                view.state
                    .task(key)
                    .is_some_and(|ts| ts.state == TaskState::Memory && ts.who_has.len() == 1)
            })
            .map(|key| Suggestion::replicate(key.clone()))
            .collect()
    }

    fn done(&self, view: &AmmView<'_>) -> bool {
        view.state.worker(&self.address).is_none()
    }
}
