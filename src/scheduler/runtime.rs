// src/scheduler/runtime.rs

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{AmmConfig, SchedulerConfig};
use crate::errors::Result;
use crate::protocol::{ClientMessage, SchedulerEvent, WorkerMessage};
use crate::types::new_stimulus_id;

use super::{SchedulerCommand, SchedulerCore};

/// How the scheduler reaches workers and clients.
///
/// The in-process cluster uses channels (see
/// [`crate::cluster::transport::ChannelSchedulerComms`]); tests can provide
/// their own implementation that records the traffic.
pub trait SchedulerComms: Send + Sync {
    fn send_to_worker(
        &self,
        worker: &str,
        msg: WorkerMessage,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    fn send_to_client(
        &self,
        client: &str,
        msg: ClientMessage,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    fn disconnect_worker(&self, worker: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Drives the scheduler core in response to `SchedulerEvent`s and timers,
/// and delegates message delivery to a [`SchedulerComms`].
///
/// Pure IO shell around [`SchedulerCore`]: it reads events from the
/// channel, turns timer ticks into events, and executes the commands the
/// core returns. A failed send to a worker is fed back into the core as a
/// worker removal.
pub struct SchedulerRuntime<C: SchedulerComms> {
    core: SchedulerCore,
    event_rx: mpsc::Receiver<SchedulerEvent>,
    comms: C,
    config: SchedulerConfig,
    amm: AmmConfig,
}

impl<C: SchedulerComms> fmt::Debug for SchedulerRuntime<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerRuntime")
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}

impl<C: SchedulerComms> SchedulerRuntime<C> {
    pub fn new(
        config: SchedulerConfig,
        amm: AmmConfig,
        event_rx: mpsc::Receiver<SchedulerEvent>,
        comms: C,
    ) -> Self {
        let core = SchedulerCore::new(config.clone(), amm.clone(), Instant::now());
        Self {
            core,
            event_rx,
            comms,
            config,
            amm,
        }
    }

    /// Main event loop.
    ///
    /// - Consumes `SchedulerEvent`s from `event_rx`.
    /// - Emits heartbeat-check, balance and AMM events on their intervals.
    /// - Executes the commands returned by the core.
    pub async fn run(mut self) -> Result<SchedulerCore> {
        info!("scheduler runtime started");

        let mut heartbeat_check = time::interval(self.config.heartbeat_check_interval);
        let mut balance = time::interval(self.config.work_stealing_interval);
        let mut amm = time::interval(self.amm.interval);
        for timer in [&mut heartbeat_check, &mut balance, &mut amm] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        loop {
            let event = tokio::select! {
                maybe = self.event_rx.recv() => match maybe {
                    Some(event) => event,
                    None => {
                        info!("scheduler event channel closed; exiting");
                        break;
                    }
                },
                _ = heartbeat_check.tick() => SchedulerEvent::CheckHeartbeats,
                _ = balance.tick(), if self.config.work_stealing => SchedulerEvent::Balance,
                _ = amm.tick() => SchedulerEvent::RunAmm,
            };

            if !self.dispatch(event).await? {
                info!("core requested exit; stopping scheduler runtime");
                break;
            }
        }

        info!("scheduler runtime exiting");
        Ok(self.core)
    }

    /// Feed one event to the core and execute the resulting commands,
    /// including follow-up removals for unreachable workers. Returns
    /// whether the loop should keep running.
    async fn dispatch(&mut self, event: SchedulerEvent) -> Result<bool> {
        let mut queue = vec![event];

        while let Some(event) = queue.pop() {
            debug!(?event, "scheduler received event");
            let step = match self.core.step(event, Instant::now()) {
                Ok(step) => step,
                Err(err) => {
                    // A failed step can leave the core half-updated.
                    error!(error = %err, fault = err.is_fault(), "scheduler state machine failed; stopping");
                    return Err(err);
                }
            };

            for command in step.commands {
                if let Some(follow_up) = self.execute_command(command).await {
                    queue.push(follow_up);
                }
            }

            if !step.keep_running {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Execute a single command; returns an event when a worker turned
    /// out to be unreachable.
    async fn execute_command(&mut self, command: SchedulerCommand) -> Option<SchedulerEvent> {
        match command {
            SchedulerCommand::SendToWorker { worker, msg } => {
                if let Err(err) = self.comms.send_to_worker(&worker, msg).await {
                    warn!(worker = %worker, error = %err, "worker unreachable");
                    return Some(SchedulerEvent::RemoveWorker {
                        worker,
                        reason: "connection lost".to_string(),
                        stimulus_id: new_stimulus_id("worker-unreachable"),
                    });
                }
            }
            SchedulerCommand::SendToClient { client, msg } => {
                if let Err(err) = self.comms.send_to_client(&client, msg).await {
                    debug!(client = %client, error = %err, "client unreachable; message dropped");
                }
            }
            SchedulerCommand::DisconnectWorker { worker } => {
                if let Err(err) = self.comms.disconnect_worker(&worker).await {
                    debug!(worker = %worker, error = %err, "disconnect failed");
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FlotillaError;
    use crate::graph::TaskSpec;
    use crate::types::RunSpec;

    struct Discard;

    impl SchedulerComms for Discard {
        fn send_to_worker(
            &self,
            _worker: &str,
            _msg: WorkerMessage,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }

        fn send_to_client(
            &self,
            _client: &str,
            _msg: ClientMessage,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }

        fn disconnect_worker(&self, _worker: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn state_machine_fault_stops_the_runtime() {
        let config = SchedulerConfig {
            transition_counter_max: 1,
            ..SchedulerConfig::default()
        };
        let (tx, rx) = mpsc::channel(8);
        let runtime = SchedulerRuntime::new(config, AmmConfig::default(), rx, Discard);
        let handle = tokio::spawn(runtime.run());

        tx.send(SchedulerEvent::SubmitGraph {
            client: "c1".into(),
            tasks: vec![
                TaskSpec::new("a", RunSpec::default()),
                TaskSpec::new("b", RunSpec::default()),
            ],
            wanted: None,
            stimulus_id: "submit".into(),
        })
        .await
        .unwrap();

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("runtime kept running after a fault")
            .unwrap();
        let err = result.unwrap_err();
        assert!(matches!(err, FlotillaError::TransitionLoop(_)));
        assert!(err.is_fault());
    }
}
