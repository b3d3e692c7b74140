// src/scheduler/stealing.rs

//! Work stealing: move queued tasks from saturated workers to idle ones.
//!
//! A steal is a two-step handshake. The scheduler sends `StealRequest` to
//! the victim and keeps the task `processing` there; only when the victim
//! confirms it had not started the task is it reassigned to the thief.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, info};

use crate::errors::Result;
use crate::protocol::WorkerMessage;
use crate::scheduler::decide::transfer_cost;
use crate::scheduler::transitions::Recommendations;
use crate::scheduler::{SchedulerCommand, SchedulerState, TaskState, WorkerStatus};
use crate::types::{Key, Priority, WorkerAddr, new_stimulus_id, resources_satisfy};
use crate::worker::WorkerTaskState;

/// A steal request waiting for the victim's answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightSteal {
    pub victim: WorkerAddr,
    pub thief: WorkerAddr,
}

#[derive(Debug, Default)]
pub struct WorkStealing {
    in_flight: BTreeMap<Key, InFlightSteal>,
}

/// Projected load of one worker while a balance pass is planning.
#[derive(Debug, Clone, Copy)]
struct Projection {
    occupancy: Duration,
    active: usize,
    nthreads: usize,
}

impl WorkStealing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_flight(&self) -> &BTreeMap<Key, InFlightSteal> {
        &self.in_flight
    }

    pub fn is_stealing(&self, key: &str) -> bool {
        self.in_flight.contains_key(key)
    }

    /// One balancing pass. Returns the number of steal requests sent.
    pub fn balance(&mut self, state: &SchedulerState, out: &mut Vec<SchedulerCommand>) -> usize {
        if !state.config.work_stealing {
            return 0;
        }

        let running: Vec<_> = state.running_workers().collect();
        if running.len() < 2 {
            return 0;
        }
        let total: Duration = running.iter().map(|w| w.occupancy).sum();
        let average = total / running.len() as u32;

        let mut projections: BTreeMap<WorkerAddr, Projection> = state
            .workers
            .values()
            .filter(|w| w.status != WorkerStatus::Closed)
            .map(|w| {
                (
                    w.address.clone(),
                    Projection {
                        occupancy: w.occupancy,
                        active: w.active_processing(),
                        nthreads: w.nthreads,
                    },
                )
            })
            .collect();

        let mut victims: Vec<_> = state
            .workers
            .values()
            .filter(|w| w.status != WorkerStatus::Closed)
            .filter(|w| w.is_saturated() && w.occupancy > average)
            .collect();
        victims.sort_by(|a, b| b.occupancy.cmp(&a.occupancy).then(a.address.cmp(&b.address)));

        let thieves: Vec<_> = running.iter().filter(|w| w.is_idle()).copied().collect();
        if victims.is_empty() || thieves.is_empty() {
            return 0;
        }

        let stimulus_id = new_stimulus_id("steal");
        let mut sent = 0;

        for victim in victims {
            // Lowest priority first.
            let mut candidates: Vec<(Priority, &Key, Duration)> = victim
                .processing
                .iter()
                .filter(|(key, _)| !victim.long_running.contains(*key))
                .filter(|(key, _)| !self.in_flight.contains_key(*key))
                .filter_map(|(key, estimate)| {
                    let ts = state.tasks.get(key)?;
                    (ts.state == TaskState::Processing).then_some((ts.priority, key, *estimate))
                })
                .collect();
            candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(b.1)));

            for (_, key, estimate) in candidates {
                let Some(v) = projections.get(&victim.address).copied() else {
                    break;
                };
                if v.active <= v.nthreads {
                    break;
                }
                let Some(ts) = state.tasks.get(key) else {
                    continue;
                };

                let best = thieves
                    .iter()
                    .filter(|t| t.address != victim.address)
                    .filter(|t| resources_satisfy(&t.resources, &ts.resource_restrictions))
                    .filter_map(|t| {
                        let p = projections.get(&t.address)?;
                        if p.active >= p.nthreads {
                            return None;
                        }
                        let cost = transfer_cost(state, key, t);
                        let worthwhile =
                            cost < estimate && p.occupancy + cost + estimate < v.occupancy;
                        worthwhile.then_some((p.occupancy, t.address.clone()))
                    })
                    .min();

                let Some((_, thief)) = best else {
                    continue;
                };

                debug!(
                    key = %key,
                    victim = %victim.address,
                    thief = %thief,
                    ?estimate,
                    "requesting steal"
                );
                self.in_flight.insert(
                    key.clone(),
                    InFlightSteal {
                        victim: victim.address.clone(),
                        thief: thief.clone(),
                    },
                );
                out.push(SchedulerCommand::SendToWorker {
                    worker: victim.address.clone(),
                    msg: WorkerMessage::StealRequest {
                        key: key.clone(),
                        stimulus_id: stimulus_id.clone(),
                    },
                });

                if let Some(p) = projections.get_mut(&victim.address) {
                    p.occupancy = p.occupancy.saturating_sub(estimate);
                    p.active -= 1;
                }
                if let Some(p) = projections.get_mut(&thief) {
                    p.occupancy += estimate;
                    p.active += 1;
                }
                sent += 1;
            }
        }

        sent
    }

    /// Handle the victim's answer to a steal request.
    ///
    /// `reported` is the task's local state on the victim before the
    /// request was handled (`None` if the victim did not know it).
    pub fn handle_response(
        &mut self,
        state: &mut SchedulerState,
        victim: &str,
        key: &str,
        reported: Option<WorkerTaskState>,
        stimulus_id: &str,
        out: &mut Vec<SchedulerCommand>,
    ) -> Result<()> {
        let Some(steal) = self.in_flight.remove(key) else {
            debug!(key = %key, worker = %victim, "steal response without a request");
            return Ok(());
        };
        if steal.victim != victim {
            debug!(key = %key, worker = %victim, "steal response from unexpected worker");
            return Ok(());
        }

        let still_on_victim = state.task(key).is_some_and(|t| {
            t.state == TaskState::Processing && t.processing_on.as_deref() == Some(victim)
        });
        let released_by_victim = matches!(
            reported,
            None | Some(
                WorkerTaskState::Released
                    | WorkerTaskState::Waiting
                    | WorkerTaskState::Ready
                    | WorkerTaskState::Constrained
            )
        );

        if !still_on_victim || !released_by_victim {
            debug!(key = %key, victim = %victim, ?reported, "steal abandoned");
            state.log_event(
                "steal-abandoned",
                Some(key),
                format!("victim {victim} reported {reported:?}"),
                stimulus_id,
            );
            return Ok(());
        }

        state.clear_processing(key);

        let thief_ok = state.workers.get(&steal.thief).is_some_and(|t| {
            t.is_running()
                && state
                    .tasks
                    .get(key)
                    .is_some_and(|ts| resources_satisfy(&t.resources, &ts.resource_restrictions))
        });

        if thief_ok {
            let estimate = state.estimate_duration(key);
            state.set_processing(key, &steal.thief, estimate);
            let msg = state.compute_task_msg(key, stimulus_id)?;
            info!(key = %key, victim = %victim, thief = %steal.thief, "task stolen");
            state.log_event(
                "steal",
                Some(key),
                format!("{victim} -> {}", steal.thief),
                stimulus_id,
            );
            out.push(SchedulerCommand::SendToWorker {
                worker: steal.thief,
                msg: WorkerMessage::ComputeTask(msg),
            });
            return Ok(());
        }

        debug!(key = %key, thief = %steal.thief, "thief gone; rescheduling");
        let mut recs = Recommendations::new();
        recs.push(key, TaskState::Released);
        state.transitions(recs, stimulus_id, out)
    }

    /// Forget steals whose victim left. Steals towards a departed thief
    /// stay so the answer can reschedule the task.
    pub fn remove_worker(&mut self, addr: &str) {
        self.in_flight.retain(|_, s| s.victim != addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use crate::config::SchedulerConfig;
    use crate::scheduler::{TaskInfo, WorkerInfo};
    use crate::types::{Resources, RunSpec};

    fn busy_cluster() -> SchedulerState {
        let now = Instant::now();
        let mut state = SchedulerState::new(SchedulerConfig::default(), now);
        for w in ["busy", "idle"] {
            state.workers.insert(
                w.to_string(),
                WorkerInfo::new(w.to_string(), 1, Resources::new(), 1 << 30, now),
            );
        }
        for i in 0..4u64 {
            let key = format!("t-{i}");
            let mut ts = TaskInfo::new(key.clone(), RunSpec::default(), Priority::new(0, 1, i), 3);
            ts.state = TaskState::Processing;
            state.tasks.insert(key.clone(), ts);
            state.set_processing(&key, "busy", Duration::from_secs(1));
        }
        state
    }

    #[test]
    fn steals_lowest_priority_task_towards_idle_worker() {
        let state = busy_cluster();
        let mut stealing = WorkStealing::new();
        let mut out = Vec::new();

        let sent = stealing.balance(&state, &mut out);
        assert_eq!(sent, 1);
        let steal = stealing.in_flight().get("t-3").unwrap();
        assert_eq!(steal.victim, "busy");
        assert_eq!(steal.thief, "idle");
        assert!(matches!(
            &out[0],
            SchedulerCommand::SendToWorker { worker, msg: WorkerMessage::StealRequest { key, .. } }
                if worker == "busy" && key == "t-3"
        ));

        // A second pass does not re-request the same task.
        let mut out = Vec::new();
        stealing.balance(&state, &mut out);
        assert!(!out.iter().any(|c| matches!(
            c,
            SchedulerCommand::SendToWorker { msg: WorkerMessage::StealRequest { key, .. }, .. } if key == "t-3"
        )));
    }

    #[test]
    fn confirmed_steal_moves_task() {
        let mut state = busy_cluster();
        let mut stealing = WorkStealing::new();
        let mut out = Vec::new();
        stealing.balance(&state, &mut out);

        let mut out = Vec::new();
        stealing
            .handle_response(&mut state, "busy", "t-3", Some(WorkerTaskState::Ready), "s", &mut out)
            .unwrap();
        assert_eq!(state.tasks["t-3"].processing_on.as_deref(), Some("idle"));
        assert!(state.workers["idle"].processing.contains_key("t-3"));
        assert!(!state.workers["busy"].processing.contains_key("t-3"));
        state.validate_state().unwrap();
    }

    #[test]
    fn executing_task_is_not_stolen() {
        let mut state = busy_cluster();
        let mut stealing = WorkStealing::new();
        let mut out = Vec::new();
        stealing.balance(&state, &mut out);

        let mut out = Vec::new();
        stealing
            .handle_response(
                &mut state,
                "busy",
                "t-3",
                Some(WorkerTaskState::Executing),
                "s",
                &mut out,
            )
            .unwrap();
        assert_eq!(state.tasks["t-3"].processing_on.as_deref(), Some("busy"));
        assert!(out.is_empty());
        assert_eq!(state.events("steal-abandoned").len(), 1);
    }
}
