// src/amm/reduce_replicas.rs

use crate::amm::{AmmView, Policy, Suggestion};
use crate::scheduler::TaskState;

/// Drop surplus replicas so every in-memory key keeps exactly one copy.
///
/// Keys with a copy in flight are left alone until it lands.
#[derive(Debug, Default)]
pub struct ReduceReplicas;

impl Policy for ReduceReplicas {
    fn name(&self) -> &str {
        "reduce-replicas"
    }

    fn suggest(&mut self, view: &AmmView<'_>) -> Vec<Suggestion> {
        let mut out = Vec::new();
        for (key, ts) in &view.state.tasks {
            if ts.state != TaskState::Memory || ts.who_has.len() <= 1 {
                continue;
            }
            if view.pending.replicate_count(key) > 0 {
                continue;
            }
            let surplus = ts.who_has.len() - 1;
            out.extend(std::iter::repeat_with(|| Suggestion::drop(key.clone())).take(surplus));
        }
        out
    }
}
