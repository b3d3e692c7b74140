// src/scheduler/core.rs

//! Pure scheduler core.
//!
//! [`SchedulerCore`] consumes [`SchedulerEvent`]s and produces
//! [`SchedulerCommand`]s for the IO shell (`scheduler::runtime`). It owns
//! the graph index, work stealing and the active memory manager, and has
//! no channels, no Tokio types and performs no IO. The clock is passed in
//! with every event so tests control time.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::amm::{ActiveMemoryManager, AmmInstruction, RetireWorker};
use crate::config::{AmmConfig, SchedulerConfig};
use crate::errors::Result;
use crate::protocol::{SchedulerEvent, WorkerMessage};
use crate::scheduler::stealing::WorkStealing;
use crate::scheduler::{SchedulerCommand, SchedulerState, SchedulerStep, WorkerStatus};
use crate::types::{Key, WorkerAddr, new_stimulus_id};

#[derive(Debug)]
pub struct SchedulerCore {
    pub(crate) state: SchedulerState,
    pub(crate) stealing: WorkStealing,
    pub(crate) amm: ActiveMemoryManager,
    /// Workers being retired gracefully.
    pub(crate) retiring: BTreeSet<WorkerAddr>,
}

impl SchedulerCore {
    pub fn new(scheduler: SchedulerConfig, amm: AmmConfig, now: Instant) -> Self {
        Self {
            state: SchedulerState::new(scheduler, now),
            stealing: WorkStealing::new(),
            amm: ActiveMemoryManager::new(amm),
            retiring: BTreeSet::new(),
        }
    }

    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    pub fn amm(&self) -> &ActiveMemoryManager {
        &self.amm
    }

    pub fn amm_mut(&mut self) -> &mut ActiveMemoryManager {
        &mut self.amm
    }

    pub fn stealing(&self) -> &WorkStealing {
        &self.stealing
    }

    pub fn retiring(&self) -> &BTreeSet<WorkerAddr> {
        &self.retiring
    }

    pub fn validate_state(&self) -> Result<()> {
        self.state.validate_state()
    }

    /// Handle a single event at time `now`, returning the commands for the
    /// IO shell.
    pub fn step(&mut self, event: SchedulerEvent, now: Instant) -> Result<SchedulerStep> {
        self.state.now = now;
        let mut out = Vec::new();

        match event {
            SchedulerEvent::AddWorker(reg) => self.handle_add_worker(reg, &mut out)?,
            SchedulerEvent::RemoveWorker {
                worker,
                reason,
                stimulus_id,
            } => self.remove_worker(&worker, &reason, &stimulus_id, &mut out)?,
            SchedulerEvent::Heartbeat { worker, metrics } => self.handle_heartbeat(&worker, metrics),
            SchedulerEvent::Report { worker, report } => {
                self.handle_report(&worker, report, &mut out)?
            }
            SchedulerEvent::SubmitGraph {
                client,
                tasks,
                wanted,
                stimulus_id,
            } => self.handle_submit_graph(client, tasks, wanted, &stimulus_id, &mut out)?,
            SchedulerEvent::ReleaseKeys {
                client,
                keys,
                stimulus_id,
            } => self.handle_release_keys(&client, keys, &stimulus_id, &mut out)?,
            SchedulerEvent::Cancel { keys, stimulus_id } => {
                self.handle_cancel(keys, &stimulus_id, &mut out)?
            }
            SchedulerEvent::Retry {
                client,
                keys,
                stimulus_id,
            } => self.handle_retry(client, keys, &stimulus_id, &mut out)?,
            SchedulerEvent::QueryKey { client, key } => self.handle_query(client, key, &mut out),
            SchedulerEvent::RetireWorker {
                worker,
                stimulus_id,
            } => self.retire_worker(&worker, &stimulus_id, &mut out),
            SchedulerEvent::CheckHeartbeats => self.check_heartbeats(&mut out)?,
            SchedulerEvent::Balance => {
                self.stealing.balance(&self.state, &mut out);
            }
            SchedulerEvent::RunAmm => {
                if self.amm.enabled() || !self.retiring.is_empty() {
                    self.run_amm(&new_stimulus_id("amm"), &mut out);
                }
            }
            SchedulerEvent::ShutdownRequested => {
                info!("scheduler shutdown requested");
                return Ok(SchedulerStep {
                    commands: out,
                    keep_running: false,
                });
            }
        }

        if !self.retiring.is_empty() {
            self.check_retirements(&mut out)?;
        }

        Ok(SchedulerStep {
            commands: out,
            keep_running: true,
        })
    }

    /// Run one AMM cycle and turn its decisions into worker messages.
    pub(crate) fn run_amm(&mut self, stimulus_id: &str, out: &mut Vec<SchedulerCommand>) {
        let instructions = self.amm.run_once(&self.state);
        if instructions.is_empty() {
            return;
        }
        debug!(count = instructions.len(), "amm issued instructions");

        let mut acquire: BTreeMap<WorkerAddr, (BTreeMap<Key, Vec<WorkerAddr>>, BTreeMap<Key, u64>)> =
            BTreeMap::new();
        let mut remove: BTreeMap<WorkerAddr, Vec<Key>> = BTreeMap::new();

        for instruction in instructions {
            match instruction {
                AmmInstruction::Replicate {
                    key,
                    to,
                    from,
                    nbytes,
                } => {
                    let entry = acquire.entry(to).or_default();
                    entry.0.insert(key.clone(), from);
                    entry.1.insert(key, nbytes);
                }
                AmmInstruction::Drop { key, from } => {
                    remove.entry(from).or_default().push(key);
                }
            }
        }

        for (worker, (who_has, nbytes)) in acquire {
            out.push(SchedulerCommand::SendToWorker {
                worker,
                msg: WorkerMessage::AcquireReplicas {
                    who_has,
                    nbytes,
                    stimulus_id: stimulus_id.to_string(),
                },
            });
        }
        for (worker, keys) in remove {
            out.push(SchedulerCommand::SendToWorker {
                worker,
                msg: WorkerMessage::RemoveReplicas {
                    keys,
                    stimulus_id: stimulus_id.to_string(),
                },
            });
        }
    }

    fn retire_worker(&mut self, worker: &str, stimulus_id: &str, out: &mut Vec<SchedulerCommand>) {
        let Some(ws) = self.state.workers.get_mut(worker) else {
            warn!(worker = %worker, "cannot retire unknown worker");
            return;
        };
        if ws.status == WorkerStatus::Running {
            ws.status = WorkerStatus::ClosingGracefully;
        }
        if self.retiring.insert(worker.to_string()) {
            info!(worker = %worker, replicas = ws.has_what.len(), "retiring worker");
            self.amm.add_policy(Box::new(RetireWorker::new(worker)));
        }
        self.run_amm(stimulus_id, out);
    }

    /// Close retiring workers that hold no unique data and run nothing.
    fn check_retirements(&mut self, out: &mut Vec<SchedulerCommand>) -> Result<()> {
        let done: Vec<WorkerAddr> = self
            .retiring
            .iter()
            .filter(|addr| {
                self.state.workers.get(*addr).is_none_or(|ws| {
                    ws.processing.is_empty()
                        && ws.has_what.iter().all(|key| {
                            self.state.task(key).is_some_and(|t| t.who_has.len() > 1)
                        })
                })
            })
            .cloned()
            .collect();

        for addr in done {
            self.retiring.remove(&addr);
            if !self.state.workers.contains_key(&addr) {
                continue;
            }
            info!(worker = %addr, "worker retired");
            let stimulus_id = new_stimulus_id("retire-worker");
            out.push(SchedulerCommand::SendToWorker {
                worker: addr.clone(),
                msg: WorkerMessage::Close {
                    reason: "retired".to_string(),
                },
            });
            self.remove_worker(&addr, "retired", &stimulus_id, out)?;
            out.push(SchedulerCommand::DisconnectWorker { worker: addr });
        }
        Ok(())
    }
}
