#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use flotilla::config::{ConfigFile, RawConfigFile, TaskConfig, WorkerConfig};
use flotilla::errors::Result;
use flotilla::graph::TaskSpec;
use flotilla::types::{Key, PolicyName, RunSpec};

/// Builder for `ConfigFile` with timers short enough for tests.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        let mut config = RawConfigFile::default();
        config.scheduler.heartbeat_timeout = Duration::from_secs(5);
        config.scheduler.heartbeat_check_interval = Duration::from_millis(100);
        config.scheduler.work_stealing_interval = Duration::from_millis(50);
        config.amm.interval = Duration::from_millis(50);
        config.worker.heartbeat_interval = Duration::from_millis(100);
        config.worker.fetch_timeout = Duration::from_secs(2);
        Self { config }
    }

    pub fn with_worker(mut self, name: &str, nthreads: usize) -> Self {
        self.config.workers.insert(
            name.to_string(),
            WorkerConfig {
                nthreads: Some(nthreads),
                ..WorkerConfig::default()
            },
        );
        self
    }

    pub fn with_worker_resource(mut self, name: &str, resource: &str, amount: f64) -> Self {
        self.config
            .workers
            .entry(name.to_string())
            .or_default()
            .resources
            .insert(resource.to_string(), amount);
        self
    }

    pub fn with_task(mut self, name: &str, task: TaskConfig) -> Self {
        self.config.task.insert(name.to_string(), task);
        self
    }

    pub fn with_allowed_failures(mut self, n: u32) -> Self {
        self.config.scheduler.allowed_failures = n;
        self
    }

    pub fn with_work_stealing(mut self, enabled: bool) -> Self {
        self.config.scheduler.work_stealing = enabled;
        self
    }

    pub fn with_amm(mut self, enabled: bool) -> Self {
        self.config.amm.enabled = enabled;
        self
    }

    pub fn with_amm_policies(mut self, policies: Vec<PolicyName>) -> Self {
        self.config.amm.policies = policies;
        self
    }

    pub fn with_spill_directory(mut self, dir: &Path, memory_limit: u64) -> Self {
        self.config.worker.spill_directory = Some(dir.to_path_buf());
        self.config.worker.memory_limit = memory_limit;
        self
    }

    pub fn raw(self) -> RawConfigFile {
        self.config
    }

    pub fn try_build(self) -> Result<ConfigFile> {
        ConfigFile::try_from(self.config)
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `TaskConfig`.
pub struct TaskConfigBuilder {
    task: TaskConfig,
}

impl TaskConfigBuilder {
    pub fn new(cmd: &str) -> Self {
        Self {
            task: TaskConfig {
                cmd: cmd.to_string(),
                after: vec![],
                priority: 0,
                retries: None,
                resources: BTreeMap::new(),
                duration: None,
            },
        }
    }

    pub fn after(mut self, dep: &str) -> Self {
        self.task.after.push(dep.to_string());
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.task.priority = priority;
        self
    }

    pub fn build(self) -> TaskConfig {
        self.task
    }
}

/// Builder for a submitted `TaskSpec`. The run-spec defaults to the key.
pub struct TaskSpecBuilder {
    spec: TaskSpec,
}

impl TaskSpecBuilder {
    pub fn new(key: &str) -> Self {
        Self {
            spec: TaskSpec::new(key, RunSpec::new(Bytes::copy_from_slice(key.as_bytes()))),
        }
    }

    pub fn after(mut self, dep: &str) -> Self {
        self.spec.dependencies.push(dep.to_string());
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.spec.priority = priority;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.spec.retries = Some(retries);
        self
    }

    pub fn resource(mut self, name: &str, amount: f64) -> Self {
        self.spec.resources.insert(name.to_string(), amount);
        self
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        self.spec.duration = Some(duration);
        self
    }

    pub fn build(self) -> TaskSpec {
        self.spec
    }
}

/// Linear chain `k0 -> k1 -> ... -> k{n-1}` with the given key prefix.
pub fn chain(prefix: &str, n: usize) -> Vec<TaskSpec> {
    (0..n)
        .map(|i| {
            let mut b = TaskSpecBuilder::new(&format!("{prefix}{i}"));
            if i > 0 {
                b = b.after(&format!("{prefix}{}", i - 1));
            }
            b.build()
        })
        .collect()
}

/// Keys of a submission, in order.
pub fn keys(tasks: &[TaskSpec]) -> Vec<Key> {
    tasks.iter().map(|t| t.key.clone()).collect()
}
