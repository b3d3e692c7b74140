#![allow(dead_code)]

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use flotilla::config::{AmmConfig, SchedulerConfig};
use flotilla::graph::TaskSpec;
use flotilla::protocol::{
    ClientMessage, ComputeTask, SchedulerEvent, WorkerMessage, WorkerRegistration, WorkerReport,
};
use flotilla::scheduler::{SchedulerCommand, SchedulerCore, TaskState};
use flotilla::types::{ExceptionRef, Key, Resources, WorkerAddr, new_stimulus_id};

/// Drives a [`SchedulerCore`] by hand, checking every invariant after
/// each step.
pub struct Harness {
    pub core: SchedulerCore,
    pub now: Instant,
}

impl Harness {
    /// Default scheduler settings; the AMM only runs for retirements.
    pub fn new() -> Self {
        let amm = AmmConfig {
            enabled: false,
            ..AmmConfig::default()
        };
        Self::with_config(SchedulerConfig::default(), amm)
    }

    pub fn with_config(scheduler: SchedulerConfig, amm: AmmConfig) -> Self {
        let now = Instant::now();
        Self {
            core: SchedulerCore::new(scheduler, amm, now),
            now,
        }
    }

    pub fn step(&mut self, event: SchedulerEvent) -> Vec<SchedulerCommand> {
        let step = self.core.step(event, self.now).expect("scheduler step failed");
        self.core
            .validate_state()
            .expect("scheduler state invalid after step");
        step.commands
    }

    pub fn advance(&mut self, by: Duration) {
        self.now += by;
    }

    pub fn add_worker(&mut self, addr: &str, nthreads: usize) -> Vec<SchedulerCommand> {
        self.add_worker_with(addr, nthreads, Resources::new())
    }

    pub fn add_worker_with(
        &mut self,
        addr: &str,
        nthreads: usize,
        resources: Resources,
    ) -> Vec<SchedulerCommand> {
        self.step(SchedulerEvent::AddWorker(WorkerRegistration {
            address: addr.to_string(),
            nthreads,
            resources,
            memory_limit: 1 << 30,
            keys: BTreeMap::new(),
        }))
    }

    pub fn remove_worker(&mut self, addr: &str) -> Vec<SchedulerCommand> {
        self.step(SchedulerEvent::RemoveWorker {
            worker: addr.to_string(),
            reason: "test".to_string(),
            stimulus_id: new_stimulus_id("remove-worker"),
        })
    }

    pub fn submit(&mut self, client: &str, tasks: Vec<TaskSpec>) -> Vec<SchedulerCommand> {
        self.step(SchedulerEvent::SubmitGraph {
            client: client.to_string(),
            tasks,
            wanted: None,
            stimulus_id: new_stimulus_id("submit-graph"),
        })
    }

    pub fn submit_wanted(
        &mut self,
        client: &str,
        tasks: Vec<TaskSpec>,
        wanted: &[&str],
    ) -> Vec<SchedulerCommand> {
        self.step(SchedulerEvent::SubmitGraph {
            client: client.to_string(),
            tasks,
            wanted: Some(wanted.iter().map(|k| k.to_string()).collect()),
            stimulus_id: new_stimulus_id("submit-graph"),
        })
    }

    pub fn report(&mut self, worker: &str, report: WorkerReport) -> Vec<SchedulerCommand> {
        self.step(SchedulerEvent::Report {
            worker: worker.to_string(),
            report,
        })
    }

    pub fn finish(&mut self, worker: &str, key: &str, nbytes: u64) -> Vec<SchedulerCommand> {
        self.report(
            worker,
            WorkerReport::TaskFinished {
                key: key.to_string(),
                nbytes,
                duration: Duration::from_millis(10),
                stimulus_id: new_stimulus_id("task-finished"),
            },
        )
    }

    pub fn fail(&mut self, worker: &str, key: &str, msg: &str) -> Vec<SchedulerCommand> {
        self.report(
            worker,
            WorkerReport::TaskErred {
                key: key.to_string(),
                exception: ExceptionRef::new(msg, msg.to_string()),
                stimulus_id: new_stimulus_id("task-erred"),
            },
        )
    }

    /// A worker now holds `key` too.
    pub fn add_keys(&mut self, worker: &str, keys: &[(&str, u64)]) -> Vec<SchedulerCommand> {
        self.report(
            worker,
            WorkerReport::AddKeys {
                keys: keys.iter().map(|(k, n)| (k.to_string(), *n)).collect(),
                stimulus_id: new_stimulus_id("add-keys"),
            },
        )
    }

    pub fn state_of(&self, key: &str) -> Option<TaskState> {
        self.core.state().task_state(key)
    }

    pub fn holders(&self, key: &str) -> Vec<WorkerAddr> {
        self.core
            .state()
            .task(key)
            .map(|t| t.who_has.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// `(worker, key)` of every compute assignment, in order.
pub fn assignments(cmds: &[SchedulerCommand]) -> Vec<(WorkerAddr, Key)> {
    compute_msgs(cmds)
        .into_iter()
        .map(|(worker, msg)| (worker, msg.key))
        .collect()
}

pub fn compute_msgs(cmds: &[SchedulerCommand]) -> Vec<(WorkerAddr, ComputeTask)> {
    cmds.iter()
        .filter_map(|cmd| match cmd {
            SchedulerCommand::SendToWorker {
                worker,
                msg: WorkerMessage::ComputeTask(msg),
            } => Some((worker.clone(), msg.clone())),
            _ => None,
        })
        .collect()
}

/// `(worker, key)` of every key freed on a worker.
pub fn freed(cmds: &[SchedulerCommand]) -> Vec<(WorkerAddr, Key)> {
    cmds.iter()
        .filter_map(|cmd| match cmd {
            SchedulerCommand::SendToWorker {
                worker,
                msg: WorkerMessage::FreeKeys { keys, .. },
            } => Some(keys.iter().map(|k| (worker.clone(), k.clone())).collect::<Vec<_>>()),
            _ => None,
        })
        .flatten()
        .collect()
}

pub fn client_msgs(cmds: &[SchedulerCommand], client: &str) -> Vec<ClientMessage> {
    cmds.iter()
        .filter_map(|cmd| match cmd {
            SchedulerCommand::SendToClient { client: c, msg } if c == client => Some(msg.clone()),
            _ => None,
        })
        .collect()
}

pub fn worker_msgs(cmds: &[SchedulerCommand], worker: &str) -> Vec<WorkerMessage> {
    cmds.iter()
        .filter_map(|cmd| match cmd {
            SchedulerCommand::SendToWorker { worker: w, msg } if w == worker => Some(msg.clone()),
            _ => None,
        })
        .collect()
}
