// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::config::duration;
use crate::types::{PolicyName, Resources};

/// Raw top-level configuration as read from a TOML file.
///
/// ```toml
/// [scheduler]
/// allowed_failures = 3
/// heartbeat_timeout = "60s"
///
/// [amm]
/// interval = "2s"
/// policies = ["reduce-replicas"]
///
/// [worker]
/// fetch_timeout = "10s"
///
/// [workers.alpha]
/// nthreads = 2
///
/// [workers.gpu]
/// nthreads = 1
/// resources = { GPU = 1 }
///
/// [task.load]
/// cmd = "cat data.csv"
///
/// [task.count]
/// cmd = "wc -l"
/// after = ["load"]
/// ```
///
/// All sections are optional and have reasonable defaults. This type is
/// *unvalidated*; convert it into [`ConfigFile`] with `TryFrom`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawConfigFile {
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub amm: AmmConfig,

    /// Defaults shared by every worker, from `[worker]`.
    #[serde(default)]
    pub worker: WorkerDefaults,

    /// Workers of the local cluster, from `[workers.<name>]`.
    #[serde(default)]
    pub workers: BTreeMap<String, WorkerConfig>,

    /// Tasks from `[task.<key>]`.
    #[serde(default)]
    pub task: BTreeMap<String, TaskConfig>,
}

/// Validated configuration.
///
/// Only constructed through `TryFrom<RawConfigFile>` (see
/// [`crate::config::validate`]).
#[derive(Debug, Clone)]
pub struct ConfigFile {
    scheduler: SchedulerConfig,
    amm: AmmConfig,
    worker: WorkerDefaults,
    workers: BTreeMap<String, WorkerConfig>,
    task: BTreeMap<String, TaskConfig>,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(raw: RawConfigFile) -> Self {
        Self {
            scheduler: raw.scheduler,
            amm: raw.amm,
            worker: raw.worker,
            workers: raw.workers,
            task: raw.task,
        }
    }

    pub fn scheduler(&self) -> &SchedulerConfig {
        &self.scheduler
    }

    pub fn amm(&self) -> &AmmConfig {
        &self.amm
    }

    pub fn worker_defaults(&self) -> &WorkerDefaults {
        &self.worker
    }

    pub fn workers(&self) -> &BTreeMap<String, WorkerConfig> {
        &self.workers
    }

    pub fn tasks(&self) -> &BTreeMap<String, TaskConfig> {
        &self.task
    }

    /// Per-worker settings with `[worker]` defaults applied.
    pub fn resolved_workers(&self) -> Vec<ResolvedWorker> {
        self.workers
            .iter()
            .map(|(name, w)| ResolvedWorker {
                name: name.clone(),
                nthreads: w.nthreads.unwrap_or(self.worker.nthreads),
                memory_limit: w.memory_limit.unwrap_or(self.worker.memory_limit),
                resources: w.resources.clone(),
                settings: self.worker.clone(),
            })
            .collect()
    }
}

/// `[scheduler]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Default retry budget for tasks that do not set `retries`.
    #[serde(default = "default_allowed_failures")]
    pub allowed_failures: u32,

    /// Workers silent for longer than this are removed.
    #[serde(default = "default_heartbeat_timeout", deserialize_with = "duration::deserialize")]
    pub heartbeat_timeout: Duration,

    #[serde(
        default = "default_heartbeat_check_interval",
        deserialize_with = "duration::deserialize"
    )]
    pub heartbeat_check_interval: Duration,

    #[serde(default = "default_true")]
    pub work_stealing: bool,

    #[serde(
        default = "default_work_stealing_interval",
        deserialize_with = "duration::deserialize"
    )]
    pub work_stealing_interval: Duration,

    /// Estimate used for tasks with no submitted duration and no history.
    #[serde(
        default = "default_task_duration",
        deserialize_with = "duration::deserialize"
    )]
    pub default_task_duration: Duration,

    /// Assumed network bandwidth in bytes per second.
    #[serde(default = "default_bandwidth")]
    pub bandwidth: u64,

    /// How long a task may sit in `no-worker` before a warning is logged.
    #[serde(
        default = "default_unrunnable_warning",
        deserialize_with = "duration::deserialize"
    )]
    pub unrunnable_warning: Duration,

    /// Number of transition records kept for `story` queries.
    #[serde(default = "default_transition_log_length")]
    pub transition_log_length: usize,

    /// Upper bound on transitions applied by one engine run; 0 disables it.
    #[serde(default)]
    pub transition_counter_max: usize,
}

fn default_allowed_failures() -> u32 {
    3
}

fn default_heartbeat_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_heartbeat_check_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_true() -> bool {
    true
}

fn default_work_stealing_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_task_duration() -> Duration {
    Duration::from_millis(500)
}

fn default_bandwidth() -> u64 {
    100_000_000
}

fn default_unrunnable_warning() -> Duration {
    Duration::from_secs(10)
}

fn default_transition_log_length() -> usize {
    100_000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            allowed_failures: default_allowed_failures(),
            heartbeat_timeout: default_heartbeat_timeout(),
            heartbeat_check_interval: default_heartbeat_check_interval(),
            work_stealing: true,
            work_stealing_interval: default_work_stealing_interval(),
            default_task_duration: default_task_duration(),
            bandwidth: default_bandwidth(),
            unrunnable_warning: default_unrunnable_warning(),
            transition_log_length: default_transition_log_length(),
            transition_counter_max: 0,
        }
    }
}

/// `[amm]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct AmmConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_amm_interval", deserialize_with = "duration::deserialize")]
    pub interval: Duration,

    /// Policies installed at start-up, in evaluation order.
    #[serde(default = "default_policies")]
    pub policies: Vec<PolicyName>,

    /// Upper bound on replicas of one key, pending copies included.
    #[serde(default = "default_max_replicas")]
    pub max_replicas: usize,

    /// Cycles after which an unconfirmed instruction is forgotten.
    #[serde(default = "default_pending_ttl")]
    pub pending_ttl: u64,
}

fn default_amm_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_policies() -> Vec<PolicyName> {
    vec![PolicyName::ReduceReplicas]
}

fn default_max_replicas() -> usize {
    4
}

fn default_pending_ttl() -> u64 {
    3
}

impl Default for AmmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_amm_interval(),
            policies: default_policies(),
            max_replicas: default_max_replicas(),
            pending_ttl: default_pending_ttl(),
        }
    }
}

/// `[worker]` section: settings shared by every worker.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerDefaults {
    #[serde(default = "default_nthreads")]
    pub nthreads: usize,

    /// Memory limit in bytes.
    #[serde(default = "default_memory_limit")]
    pub memory_limit: u64,

    #[serde(
        default = "default_heartbeat_interval",
        deserialize_with = "duration::deserialize"
    )]
    pub heartbeat_interval: Duration,

    /// A peer fetch taking longer than this counts as a network failure.
    #[serde(default = "default_fetch_timeout", deserialize_with = "duration::deserialize")]
    pub fetch_timeout: Duration,

    /// Concurrent outgoing fetch requests.
    #[serde(default = "default_transfer_incoming_count_limit")]
    pub transfer_incoming_count_limit: usize,

    /// Soft cap on the bytes requested from one peer at once.
    #[serde(default = "default_transfer_message_bytes_limit")]
    pub transfer_message_bytes_limit: u64,

    /// Share of `memory_limit` kept in RAM before results spill to disk.
    #[serde(default = "default_memory_target_fraction")]
    pub memory_target_fraction: f64,

    /// Where spilled results go; results never spill when unset.
    #[serde(default)]
    pub spill_directory: Option<PathBuf>,
}

fn default_nthreads() -> usize {
    1
}

fn default_memory_limit() -> u64 {
    1 << 30
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_fetch_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_transfer_incoming_count_limit() -> usize {
    4
}

fn default_transfer_message_bytes_limit() -> u64 {
    50_000_000
}

fn default_memory_target_fraction() -> f64 {
    0.6
}

impl Default for WorkerDefaults {
    fn default() -> Self {
        Self {
            nthreads: default_nthreads(),
            memory_limit: default_memory_limit(),
            heartbeat_interval: default_heartbeat_interval(),
            fetch_timeout: default_fetch_timeout(),
            transfer_incoming_count_limit: default_transfer_incoming_count_limit(),
            transfer_message_bytes_limit: default_transfer_message_bytes_limit(),
            memory_target_fraction: default_memory_target_fraction(),
            spill_directory: None,
        }
    }
}

impl WorkerDefaults {
    /// Bytes kept in RAM for a worker with the given memory limit.
    pub fn memory_target(&self, memory_limit: u64) -> u64 {
        (memory_limit as f64 * self.memory_target_fraction) as u64
    }
}

/// `[workers.<name>]` section.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct WorkerConfig {
    #[serde(default)]
    pub nthreads: Option<usize>,

    #[serde(default)]
    pub memory_limit: Option<u64>,

    /// Custom resources, e.g. `{ GPU = 1 }`.
    #[serde(default)]
    pub resources: Resources,
}

/// A worker's settings after applying `[worker]` defaults.
#[derive(Debug, Clone)]
pub struct ResolvedWorker {
    pub name: String,
    pub nthreads: usize,
    pub memory_limit: u64,
    pub resources: Resources,
    pub settings: WorkerDefaults,
}

/// `[task.<key>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    /// Shell command; its stdout becomes the task's result.
    pub cmd: String,

    /// Keys whose results this task consumes.
    #[serde(default)]
    pub after: Vec<String>,

    /// Higher runs earlier.
    #[serde(default)]
    pub priority: i64,

    /// Overrides `[scheduler].allowed_failures`.
    #[serde(default)]
    pub retries: Option<u32>,

    #[serde(default)]
    pub resources: Resources,

    /// Runtime estimate used before any history exists.
    #[serde(default, deserialize_with = "duration::deserialize_option")]
    pub duration: Option<Duration>,
}
