use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use flotilla::types::{ExceptionRef, Key, RunSpec};
use flotilla::worker::{TaskContext, TaskOutcome, TaskRunner};

/// What the fake runner does for a key.
#[derive(Debug, Clone)]
pub enum Behaviour {
    /// Succeed with `key(dep1,dep2,...)` built from the dependency values.
    Succeed,
    /// Succeed with this exact value.
    Value(Bytes),
    /// Raise with this message on every attempt.
    Fail(String),
    /// Raise on the first `n` attempts, then succeed.
    FailTimes(usize, String),
    /// Run until cancelled.
    Block,
    /// Sleep, then succeed (cancellable).
    Delay(Duration),
    /// Secede, sleep, then succeed.
    Secede(Duration),
    /// Ask to be rescheduled on the first `n` attempts, then succeed.
    RescheduleTimes(usize),
}

/// A fake task runner that:
/// - records which keys were run, in order
/// - behaves per key as configured, succeeding by default.
#[derive(Clone, Default)]
pub struct FakeRunner {
    behaviours: Arc<Mutex<BTreeMap<Key, Behaviour>>>,
    executed: Arc<Mutex<Vec<Key>>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, key: &str, behaviour: Behaviour) -> Self {
        self.set(key, behaviour);
        self
    }

    pub fn set(&self, key: &str, behaviour: Behaviour) {
        self.behaviours
            .lock()
            .unwrap()
            .insert(key.to_string(), behaviour);
    }

    /// Keys in the order their executions started.
    pub fn executed(&self) -> Vec<Key> {
        self.executed.lock().unwrap().clone()
    }

    pub fn attempts(&self, key: &str) -> usize {
        self.executed.lock().unwrap().iter().filter(|k| *k == key).count()
    }

    /// Default result: `key(v1,v2)` over the dependency values in key order.
    pub fn default_value(key: &str, dependencies: &BTreeMap<Key, Bytes>) -> Bytes {
        let inner: Vec<String> = dependencies
            .values()
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .collect();
        Bytes::from(format!("{key}({})", inner.join(",")))
    }
}

impl TaskRunner for FakeRunner {
    fn run(
        &self,
        ctx: TaskContext,
        _run_spec: RunSpec,
        dependencies: BTreeMap<Key, Bytes>,
    ) -> Pin<Box<dyn Future<Output = TaskOutcome> + Send + '_>> {
        let key = ctx.key().to_string();
        let attempt = {
            let mut guard = self.executed.lock().unwrap();
            guard.push(key.clone());
            guard.iter().filter(|k| **k == key).count()
        };
        let behaviour = self
            .behaviours
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or(Behaviour::Succeed);

        Box::pin(async move {
            let value = Self::default_value(&key, &dependencies);
            match behaviour {
                Behaviour::Succeed => TaskOutcome::Success(value),
                Behaviour::Value(v) => TaskOutcome::Success(v),
                Behaviour::Fail(msg) => TaskOutcome::Failed(ExceptionRef::new(msg.clone(), msg)),
                Behaviour::FailTimes(n, msg) if attempt <= n => {
                    TaskOutcome::Failed(ExceptionRef::new(msg.clone(), msg))
                }
                Behaviour::FailTimes(..) => TaskOutcome::Success(value),
                Behaviour::Block => {
                    ctx.cancelled().await;
                    TaskOutcome::Cancelled
                }
                Behaviour::Delay(d) => tokio::select! {
                    _ = tokio::time::sleep(d) => TaskOutcome::Success(value),
                    _ = ctx.cancelled() => TaskOutcome::Cancelled,
                },
                Behaviour::Secede(d) => {
                    ctx.secede().await;
                    tokio::time::sleep(d).await;
                    TaskOutcome::Success(value)
                }
                Behaviour::RescheduleTimes(n) if attempt <= n => TaskOutcome::Reschedule,
                Behaviour::RescheduleTimes(_) => TaskOutcome::Success(value),
            }
        })
    }
}
