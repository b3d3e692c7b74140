// src/types.rs

//! Identifiers and small value types shared by the scheduler, the workers
//! and the active memory manager.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Content-addressed identifier of a task and of its result.
pub type Key = String;

/// Network address (or logical name) of a worker.
pub type WorkerAddr = String;

/// Identifier of a connected client.
pub type ClientId = String;

/// Identifier of the event that caused a state change.
pub type StimulusId = String;

/// Declared custom resources, e.g. `{"GPU": 1.0}`.
pub type Resources = BTreeMap<String, f64>;

static STIMULUS_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a fresh stimulus id such as `task-finished-42`.
pub fn new_stimulus_id(prefix: &str) -> StimulusId {
    let n = STIMULUS_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{n}")
}

/// Whether `total` covers every amount listed in `required`.
pub fn resources_satisfy(total: &Resources, required: &Resources) -> bool {
    required
        .iter()
        .all(|(name, need)| total.get(name).is_some_and(|have| have >= need))
}

/// Opaque, codec-serialized description of how to compute a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSpec(pub Bytes);

impl RunSpec {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Captured computation failure.
///
/// `summary` is a short human readable line used in logs; `payload` is the
/// codec-serialized exception which only the client ever decodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionRef {
    pub summary: String,
    pub payload: Bytes,
}

impl ExceptionRef {
    pub fn new(summary: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            summary: summary.into(),
            payload: payload.into(),
        }
    }

    /// Exception attached to tasks whose workers kept dying under them.
    pub fn killed_worker(key: &str, worker: &str) -> Self {
        let summary = format!(
            "KilledWorker: task '{key}' was lost with worker '{worker}' and has no retries left"
        );
        Self {
            payload: Bytes::from(summary.clone()),
            summary,
        }
    }
}

impl fmt::Display for ExceptionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary)
    }
}

/// Scheduling priority; smaller sorts first and runs first.
///
/// Ordered by negated user priority, then submission generation (older
/// graphs first), then position in the graph's topological order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Priority {
    pub user: i64,
    pub generation: u64,
    pub order: u64,
}

impl Priority {
    pub fn new(user_priority: i64, generation: u64, order: u64) -> Self {
        Self {
            user: -user_priority,
            generation,
            order,
        }
    }
}

/// Built-in active memory manager policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyName {
    /// Drop surplus replicas of keys nobody needs in more than one place.
    ReduceReplicas,
}

impl FromStr for PolicyName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "reduce-replicas" | "reduce_replicas" => Ok(PolicyName::ReduceReplicas),
            other => Err(format!(
                "invalid amm policy: {other} (expected \"reduce-replicas\")"
            )),
        }
    }
}

/// First dash-separated component of a key, used to group durations.
pub fn key_prefix(key: &str) -> &str {
    key.split('-').next().unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_orders_higher_user_priority_first() {
        let urgent = Priority::new(10, 0, 5);
        let normal = Priority::new(0, 0, 0);
        assert!(urgent < normal);

        let older = Priority::new(0, 1, 9);
        let newer = Priority::new(0, 2, 0);
        assert!(older < newer);
    }

    #[test]
    fn resources_must_cover_every_tag() {
        let total: Resources = [("GPU".to_string(), 2.0), ("MEM".to_string(), 1.0)].into();
        let need_gpu: Resources = [("GPU".to_string(), 1.0)].into();
        let need_tpu: Resources = [("TPU".to_string(), 1.0)].into();
        assert!(resources_satisfy(&total, &need_gpu));
        assert!(!resources_satisfy(&total, &need_tpu));
        assert!(resources_satisfy(&total, &Resources::new()));
    }

    #[test]
    fn key_prefix_takes_leading_component() {
        assert_eq!(key_prefix("inc-abc123"), "inc");
        assert_eq!(key_prefix("plain"), "plain");
    }
}
