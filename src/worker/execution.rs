// src/worker/execution.rs

//! Task execution seam.
//!
//! The worker runtime hands each `Execute` instruction to a [`TaskRunner`]
//! in its own Tokio task. Production uses [`ShellRunner`]; tests plug in
//! runners that complete (or fail, or block) on demand.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::Context;
use bytes::Bytes;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::codec::{Codec, JsonCodec, ShellCommand, ShellFailure};
use crate::types::{ExceptionRef, Key, RunSpec, new_stimulus_id};

use super::events::WorkerEvent;

/// How a single execution ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Success(Bytes),
    Failed(ExceptionRef),
    /// Stopped after the cancellation token fired.
    Cancelled,
    /// The task wants to be scheduled again from scratch.
    Reschedule,
}

impl TaskOutcome {
    pub(crate) fn into_event(self, key: Key, generation: u64, duration: Duration) -> WorkerEvent {
        match self {
            TaskOutcome::Success(value) => WorkerEvent::ExecuteSuccess {
                key,
                generation,
                value,
                duration,
                stimulus_id: new_stimulus_id("task-finished"),
            },
            TaskOutcome::Failed(exception) => WorkerEvent::ExecuteFailure {
                key,
                generation,
                exception,
                stimulus_id: new_stimulus_id("task-erred"),
            },
            TaskOutcome::Cancelled => WorkerEvent::ExecuteCancelled {
                key,
                generation,
                stimulus_id: new_stimulus_id("execute-cancelled"),
            },
            TaskOutcome::Reschedule => WorkerEvent::Reschedule {
                key,
                generation,
                stimulus_id: new_stimulus_id("reschedule"),
            },
        }
    }
}

/// Handle given to a running task.
#[derive(Debug, Clone)]
pub struct TaskContext {
    key: Key,
    generation: u64,
    started: Instant,
    cancel: CancellationToken,
    events: mpsc::Sender<WorkerEvent>,
}

impl TaskContext {
    pub(crate) fn new(
        key: Key,
        generation: u64,
        cancel: CancellationToken,
        events: mpsc::Sender<WorkerEvent>,
    ) -> Self {
        Self {
            key,
            generation,
            started: Instant::now(),
            cancel,
            events,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the worker asked this execution to stop.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Leave the execution slot and keep running in the background.
    pub async fn secede(&self) {
        let event = WorkerEvent::Secede {
            key: self.key.clone(),
            generation: self.generation,
            compute_duration: self.started.elapsed(),
            stimulus_id: new_stimulus_id("secede"),
        };
        if self.events.send(event).await.is_err() {
            debug!(key = %self.key, "worker gone; secede ignored");
        }
    }
}

/// Something that can compute a task from its run-spec and dependency
/// values.
pub trait TaskRunner: Send + Sync {
    fn run(
        &self,
        ctx: TaskContext,
        run_spec: RunSpec,
        dependencies: BTreeMap<Key, Bytes>,
    ) -> Pin<Box<dyn Future<Output = TaskOutcome> + Send + '_>>;
}

/// Runs a [`ShellCommand`] with `sh -c`.
///
/// Dependency values are exposed as `FLOTILLA_DEP_<KEY>` environment
/// variables (key upper-cased, non-alphanumerics replaced by `_`, trailing
/// newlines trimmed). Standard output becomes the result; a non-zero exit
/// becomes an exception carrying a [`ShellFailure`].
#[derive(Debug, Clone, Default)]
pub struct ShellRunner {
    codec: JsonCodec,
}

impl ShellRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn env_var_name(key: &str) -> String {
        let suffix: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("FLOTILLA_DEP_{suffix}")
    }

    async fn run_inner(
        &self,
        ctx: &TaskContext,
        run_spec: &RunSpec,
        dependencies: &BTreeMap<Key, Bytes>,
    ) -> anyhow::Result<TaskOutcome> {
        let spec: ShellCommand = self
            .codec
            .decode(run_spec.as_bytes())
            .with_context(|| format!("decoding run-spec of '{}'", ctx.key))?;

        info!(key = %ctx.key, cmd = %spec.cmd, "starting task process");

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&spec.cmd);
        for (dep, value) in dependencies {
            let text = String::from_utf8_lossy(value);
            cmd.env(Self::env_var_name(dep), text.trim_end_matches('\n'));
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .with_context(|| format!("spawning process for '{}'", ctx.key))?;

        let output = tokio::select! {
            output = child.wait_with_output() => {
                output.with_context(|| format!("waiting for process of '{}'", ctx.key))?
            }
            _ = ctx.cancelled() => {
                info!(key = %ctx.key, "execution cancelled; killing process");
                return Ok(TaskOutcome::Cancelled);
            }
        };

        let code = output.status.code();
        info!(
            key = %ctx.key,
            exit_code = code.unwrap_or(-1),
            success = output.status.success(),
            "task process exited"
        );

        if output.status.success() {
            return Ok(TaskOutcome::Success(Bytes::from(output.stdout)));
        }

        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let summary = match code {
            Some(code) => format!("'{}' exited with code {code}", ctx.key),
            None => format!("'{}' was terminated by a signal", ctx.key),
        };
        let payload = self.codec.encode(&ShellFailure {
            exit_code: code,
            stderr,
        })?;
        Ok(TaskOutcome::Failed(ExceptionRef::new(summary, payload)))
    }
}

impl TaskRunner for ShellRunner {
    fn run(
        &self,
        ctx: TaskContext,
        run_spec: RunSpec,
        dependencies: BTreeMap<Key, Bytes>,
    ) -> Pin<Box<dyn Future<Output = TaskOutcome> + Send + '_>> {
        Box::pin(async move {
            match self.run_inner(&ctx, &run_spec, &dependencies).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    error!(key = %ctx.key, error = %err, "task execution error");
                    let summary = format!("{err:#}");
                    ExceptionRef::new(summary.clone(), summary).into()
                }
            }
        })
    }
}

impl From<ExceptionRef> for TaskOutcome {
    fn from(exception: ExceptionRef) -> Self {
        TaskOutcome::Failed(exception)
    }
}
