// src/config/validate.rs

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::{FlotillaError, Result};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = FlotillaError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(ConfigFile::new_unchecked(raw))
    }
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    ensure_has_workers(cfg)?;
    validate_limits(cfg)?;
    validate_task_dependencies(cfg)?;
    validate_dag(cfg)?;
    Ok(())
}

fn ensure_has_workers(cfg: &RawConfigFile) -> Result<()> {
    if cfg.workers.is_empty() {
        return Err(FlotillaError::ConfigError(
            "config must contain at least one [workers.<name>] section".to_string(),
        ));
    }
    Ok(())
}

fn config_error(msg: String) -> Result<()> {
    Err(FlotillaError::ConfigError(msg))
}

fn validate_limits(cfg: &RawConfigFile) -> Result<()> {
    let worker = &cfg.worker;

    if worker.nthreads == 0 {
        return config_error("[worker].nthreads must be >= 1 (got 0)".to_string());
    }
    for (name, w) in cfg.workers.iter() {
        if w.nthreads == Some(0) {
            return config_error(format!("[workers.{name}].nthreads must be >= 1 (got 0)"));
        }
        if w.memory_limit == Some(0) {
            return config_error(format!("[workers.{name}].memory_limit must be > 0"));
        }
        if let Some((res, amount)) = w.resources.iter().find(|(_, v)| **v < 0.0) {
            return config_error(format!(
                "[workers.{name}].resources.{res} must not be negative (got {amount})"
            ));
        }
    }
    if worker.transfer_incoming_count_limit == 0 {
        return config_error("[worker].transfer_incoming_count_limit must be >= 1".to_string());
    }
    if worker.transfer_message_bytes_limit == 0 {
        return config_error("[worker].transfer_message_bytes_limit must be > 0".to_string());
    }
    if !(worker.memory_target_fraction > 0.0 && worker.memory_target_fraction <= 1.0) {
        return config_error(format!(
            "[worker].memory_target_fraction must be in (0, 1] (got {})",
            worker.memory_target_fraction
        ));
    }
    if worker.heartbeat_interval.is_zero() {
        return config_error("[worker].heartbeat_interval must be > 0".to_string());
    }
    if cfg.scheduler.heartbeat_timeout <= worker.heartbeat_interval {
        return config_error(format!(
            "[scheduler].heartbeat_timeout ({:?}) must exceed [worker].heartbeat_interval ({:?})",
            cfg.scheduler.heartbeat_timeout, worker.heartbeat_interval
        ));
    }
    if cfg.scheduler.bandwidth == 0 {
        return config_error("[scheduler].bandwidth must be > 0".to_string());
    }
    if cfg.amm.max_replicas == 0 {
        return config_error("[amm].max_replicas must be >= 1 (got 0)".to_string());
    }
    if cfg.amm.pending_ttl == 0 {
        return config_error("[amm].pending_ttl must be >= 1 (got 0)".to_string());
    }
    if cfg.amm.interval.is_zero() {
        return config_error("[amm].interval must be > 0".to_string());
    }

    Ok(())
}

fn validate_task_dependencies(cfg: &RawConfigFile) -> Result<()> {
    for (name, task) in cfg.task.iter() {
        for dep in task.after.iter() {
            if dep == name {
                return config_error(format!(
                    "task '{name}' cannot depend on itself in `after`"
                ));
            }
            if !cfg.task.contains_key(dep) {
                return config_error(format!(
                    "task '{name}' has unknown dependency '{dep}' in `after`"
                ));
            }
        }
    }
    Ok(())
}

fn validate_dag(cfg: &RawConfigFile) -> Result<()> {
    // Edge direction: dep -> task.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for name in cfg.task.keys() {
        graph.add_node(name.as_str());
    }

    for (name, task) in cfg.task.iter() {
        for dep in task.after.iter() {
            graph.add_edge(dep.as_str(), name.as_str(), ());
        }
    }

    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => Err(FlotillaError::GraphCycle(format!(
            "cycle detected in task graph involving task '{}'",
            cycle.node_id()
        ))),
    }
}
