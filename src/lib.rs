// src/lib.rs

pub mod amm;
pub mod cli;
pub mod cluster;
pub mod codec;
pub mod config;
pub mod errors;
pub mod graph;
pub mod logging;
pub mod protocol;
pub mod scheduler;
pub mod types;
pub mod worker;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::cli::CliArgs;
use crate::cluster::{KeyOutcome, LocalCluster};
use crate::codec::{Codec, JsonCodec, ShellCommand};
use crate::config::{ConfigFile, load_and_validate};
use crate::graph::TaskSpec;
use crate::types::{Key, RunSpec};
use crate::worker::ShellRunner;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - a local cluster (scheduler + configured workers)
/// - graph submission and result collection
/// - Ctrl-C handling
pub async fn run(args: CliArgs) -> Result<()> {
    let cfg = load_and_validate(&args.config)
        .with_context(|| format!("loading config from {}", args.config))?;

    if args.dry_run {
        print_dry_run(&cfg);
        return Ok(());
    }

    let tasks = task_specs(&cfg)?;
    let keys: Vec<Key> = tasks.iter().map(|t| t.key.clone()).collect();
    if keys.is_empty() {
        warn!("config declares no [task.*] sections; nothing to run");
        return Ok(());
    }

    let mut cluster = LocalCluster::start(&cfg, Arc::new(ShellRunner::new())).await?;
    let mut client = cluster.client("cli").await;
    info!(tasks = keys.len(), workers = cluster.workers().len(), "submitting graph");
    client.submit(tasks).await?;

    if let Some(worker) = &args.retire {
        info!(worker = %worker, "retiring worker");
        cluster.retire_worker(worker).await?;
    }

    let outcomes = tokio::select! {
        outcomes = client.wait_for_keys(&keys) => outcomes?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("listening for Ctrl+C")?;
            warn!("interrupted; cancelling outstanding tasks");
            client.cancel(keys.clone()).await?;
            cluster.shutdown().await?;
            anyhow::bail!("interrupted");
        }
    };

    let finished: Vec<Key> = outcomes
        .iter()
        .filter(|(_, o)| matches!(o, KeyOutcome::Memory { .. }))
        .map(|(k, _)| k.clone())
        .collect();
    let values = client.gather(&finished).await?;

    let mut failed = 0;
    for key in &keys {
        match outcomes.get(key) {
            Some(KeyOutcome::Memory { .. }) => {
                let text = values
                    .get(key)
                    .map(|v| String::from_utf8_lossy(v).trim_end().to_string())
                    .unwrap_or_default();
                println!("{key}: {text}");
            }
            Some(KeyOutcome::Erred { exception, blame }) => {
                failed += 1;
                if blame == key {
                    println!("{key}: FAILED: {exception}");
                } else {
                    println!("{key}: FAILED (caused by {blame}): {exception}");
                }
            }
            Some(KeyOutcome::Cancelled) | None => {
                failed += 1;
                println!("{key}: cancelled");
            }
        }
    }

    if let Some(worker) = &args.retire {
        match cluster.join_worker(worker).await {
            Ok(state) => debug!(worker = %worker, held = state.data().keys().len(), "retired worker exited"),
            Err(err) => warn!(worker = %worker, error = %err, "retired worker did not exit cleanly"),
        }
    }
    cluster.shutdown().await?;

    if failed > 0 {
        anyhow::bail!("{failed} of {} task(s) did not complete", keys.len());
    }
    Ok(())
}

/// Turn the `[task.*]` sections into a submission. Keys are the section
/// names; run-specs are JSON-encoded shell commands.
pub fn task_specs(cfg: &ConfigFile) -> Result<Vec<TaskSpec>> {
    let codec = JsonCodec;
    cfg.tasks()
        .iter()
        .map(|(name, task)| {
            let run_spec = codec
                .encode(&ShellCommand {
                    cmd: task.cmd.clone(),
                })
                .with_context(|| format!("encoding run-spec of '{name}'"))?;
            Ok(TaskSpec {
                key: name.clone(),
                run_spec: RunSpec::new(run_spec),
                dependencies: task.after.clone(),
                priority: task.priority,
                retries: task.retries,
                resources: task.resources.clone(),
                duration: task.duration,
            })
        })
        .collect()
}

fn print_dry_run(cfg: &ConfigFile) {
    println!("flotilla dry-run");
    println!("================");
    println!();

    println!("scheduler:");
    let s = cfg.scheduler();
    println!("  allowed_failures:  {}", s.allowed_failures);
    println!("  heartbeat_timeout: {:?}", s.heartbeat_timeout);
    println!("  work_stealing:     {}", s.work_stealing);
    println!();

    let amm = cfg.amm();
    println!("amm:");
    println!("  enabled:  {}", amm.enabled);
    println!("  interval: {:?}", amm.interval);
    println!("  policies: {:?}", amm.policies);
    println!();

    let workers = cfg.resolved_workers();
    println!("workers ({}):", workers.len());
    for w in &workers {
        println!("  - {} (nthreads: {}, memory_limit: {})", w.name, w.nthreads, w.memory_limit);
        if !w.resources.is_empty() {
            println!("      resources: {:?}", w.resources);
        }
    }
    println!();

    println!("tasks ({}):", cfg.tasks().len());
    for (name, task) in cfg.tasks() {
        println!("  - {name}");
        println!("      cmd: {}", task.cmd);
        if !task.after.is_empty() {
            println!("      after: {:?}", task.after);
        }
        if task.priority != 0 {
            println!("      priority: {}", task.priority);
        }
        if let Some(retries) = task.retries {
            println!("      retries: {retries}");
        }
        if !task.resources.is_empty() {
            println!("      resources: {:?}", task.resources);
        }
    }

    debug!("dry-run complete (no execution)");
}
