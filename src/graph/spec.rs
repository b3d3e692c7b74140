// src/graph/spec.rs

use std::time::Duration;

use crate::types::{Key, Resources, RunSpec};

/// One task of a submitted graph.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSpec {
    pub key: Key,
    pub run_spec: RunSpec,
    /// Keys whose results this task consumes.
    pub dependencies: Vec<Key>,
    /// User priority; higher runs earlier.
    pub priority: i64,
    /// Retry budget; `None` uses `[scheduler].allowed_failures`.
    pub retries: Option<u32>,
    /// Custom resources a worker must declare to run this task.
    pub resources: Resources,
    /// Caller-provided runtime estimate, if any.
    pub duration: Option<Duration>,
}

impl TaskSpec {
    pub fn new(key: impl Into<Key>, run_spec: RunSpec) -> Self {
        Self {
            key: key.into(),
            run_spec,
            dependencies: Vec::new(),
            priority: 0,
            retries: None,
            resources: Resources::new(),
            duration: None,
        }
    }

    /// Build a task whose key is derived from its run-spec and
    /// dependencies, so identical computations share a key.
    pub fn content_addressed(prefix: &str, run_spec: RunSpec, dependencies: Vec<Key>) -> Self {
        let key = tokenize(prefix, &run_spec, &dependencies);
        Self {
            dependencies,
            ..Self::new(key, run_spec)
        }
    }
}

/// Derive a content-addressed key: `<prefix>-<16 hex chars of blake3>`.
pub fn tokenize(prefix: &str, run_spec: &RunSpec, dependencies: &[Key]) -> Key {
    let mut hasher = blake3::Hasher::new();
    hasher.update(run_spec.as_bytes());
    for dep in dependencies {
        hasher.update(&[0]);
        hasher.update(dep.as_bytes());
    }
    let hex = hasher.finalize().to_hex();
    format!("{prefix}-{}", &hex.as_str()[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_computations_share_a_key() {
        let a = TaskSpec::content_addressed("inc", RunSpec::new("x + 1"), vec!["x".into()]);
        let b = TaskSpec::content_addressed("inc", RunSpec::new("x + 1"), vec!["x".into()]);
        let c = TaskSpec::content_addressed("inc", RunSpec::new("x + 1"), vec!["y".into()]);
        assert_eq!(a.key, b.key);
        assert_ne!(a.key, c.key);
        assert!(a.key.starts_with("inc-"));
    }
}
