use std::collections::BTreeMap;
use std::error::Error;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use flotilla::cli::CliArgs;
use flotilla::cluster::{KeyOutcome, LocalCluster};
use flotilla::config::ResolvedWorker;
use flotilla::protocol::{ClientMessage, KeyStatus};
use flotilla::worker::ShellRunner;
use flotilla_test_utils::builders::{ConfigFileBuilder, TaskConfigBuilder, TaskSpecBuilder, chain, keys};
use flotilla_test_utils::fake_runner::{Behaviour, FakeRunner};
use flotilla_test_utils::{eventually, init_tracing, with_timeout};
use tempfile::tempdir;

type TestResult = Result<(), Box<dyn Error>>;

/// Settings for one extra worker started after the cluster.
fn extra_worker(name: &str) -> ResolvedWorker {
    ConfigFileBuilder::new()
        .with_worker(name, 1)
        .build()
        .resolved_workers()
        .remove(0)
}

async fn holders(client: &mut flotilla::cluster::ClientHandle, key: &str) -> Vec<String> {
    match client.query(key).await {
        Ok(KeyStatus::InMemory { who_has, .. }) => who_has.into_iter().collect(),
        other => panic!("expected '{key}' in memory, got {other:?}"),
    }
}

#[tokio::test]
async fn chain_values_flow_between_workers() -> TestResult {
    init_tracing();
    let cfg = ConfigFileBuilder::new()
        .with_worker("w1", 1)
        .with_worker("w2", 1)
        .build();
    let runner = FakeRunner::new();
    let cluster = LocalCluster::start(&cfg, Arc::new(runner.clone())).await?;
    let mut client = cluster.client("c1").await;

    let tasks = chain("t", 3);
    let wanted = keys(&tasks);
    client.submit(tasks).await?;
    let outcomes = with_timeout(client.wait_for_keys(&wanted)).await?;
    assert!(outcomes.values().all(|o| matches!(o, KeyOutcome::Memory { .. })));

    let values = client.gather(&wanted).await?;
    assert_eq!(values["t0"], Bytes::from_static(b"t0()"));
    assert_eq!(values["t1"], Bytes::from_static(b"t1(t0())"));
    assert_eq!(values["t2"], Bytes::from_static(b"t2(t1(t0()))"));
    assert_eq!(runner.executed(), wanted);

    let core = cluster.shutdown().await?;
    core.validate_state()?;
    Ok(())
}

#[tokio::test]
async fn failure_is_blamed_on_its_origin() -> TestResult {
    init_tracing();
    let cfg = ConfigFileBuilder::new().with_worker("w1", 1).build();
    let runner = FakeRunner::new().with("a", Behaviour::Fail("boom".into()));
    let cluster = LocalCluster::start(&cfg, Arc::new(runner)).await?;
    let mut client = cluster.client("c1").await;

    client
        .submit(vec![
            TaskSpecBuilder::new("a").build(),
            TaskSpecBuilder::new("b").after("a").build(),
        ])
        .await?;
    let outcomes = with_timeout(client.wait_for_keys(&["b".to_string()])).await?;
    let Some(KeyOutcome::Erred { exception, blame }) = outcomes.get("b") else {
        panic!("expected b to err, got {outcomes:?}");
    };
    assert_eq!(blame, "a");
    assert_eq!(exception.summary, "boom");

    let status = with_timeout(client.query("b")).await?;
    assert!(matches!(status, KeyStatus::Erred { ref blame, .. } if blame == "a"));

    cluster.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn retry_recomputes_a_flaky_task() -> TestResult {
    init_tracing();
    let cfg = ConfigFileBuilder::new().with_worker("w1", 1).build();
    let runner = FakeRunner::new().with("flaky", Behaviour::FailTimes(1, "transient".into()));
    let cluster = LocalCluster::start(&cfg, Arc::new(runner.clone())).await?;
    let mut client = cluster.client("c1").await;
    let key = vec!["flaky".to_string()];

    client.submit(vec![TaskSpecBuilder::new("flaky").retries(1).build()]).await?;
    let outcomes = with_timeout(client.wait_for_keys(&key)).await?;
    assert!(matches!(outcomes["flaky"], KeyOutcome::Erred { .. }));

    client.retry(key.clone()).await?;
    let outcomes = with_timeout(client.wait_for_keys(&key)).await?;
    assert!(matches!(outcomes["flaky"], KeyOutcome::Memory { .. }));
    assert_eq!(runner.attempts("flaky"), 2);

    cluster.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn task_on_a_killed_worker_completes_elsewhere() -> TestResult {
    init_tracing();
    let cfg = ConfigFileBuilder::new()
        .with_worker("w1", 1)
        .with_work_stealing(false)
        .build();
    let runner = FakeRunner::new().with("slow", Behaviour::Block);
    let mut cluster = LocalCluster::start(&cfg, Arc::new(runner.clone())).await?;
    let mut client = cluster.client("c1").await;

    client.submit(vec![TaskSpecBuilder::new("slow").build()]).await?;
    eventually(|| runner.attempts("slow") == 1).await;

    cluster.add_worker(&extra_worker("w2")).await?;
    runner.set("slow", Behaviour::Succeed);
    cluster.kill_worker("w1").await?;

    let outcomes = with_timeout(client.wait_for_keys(&["slow".to_string()])).await?;
    assert!(matches!(outcomes["slow"], KeyOutcome::Memory { .. }));
    assert_eq!(runner.attempts("slow"), 2);
    assert_eq!(with_timeout(holders(&mut client, "slow")).await, vec!["w2".to_string()]);

    cluster.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn lost_result_is_recomputed_for_a_later_dependent() -> TestResult {
    init_tracing();
    let cfg = ConfigFileBuilder::new().with_worker("w1", 1).build();
    let runner = FakeRunner::new();
    let mut cluster = LocalCluster::start(&cfg, Arc::new(runner.clone())).await?;
    let mut client = cluster.client("c1").await;

    client.submit(vec![TaskSpecBuilder::new("x").build()]).await?;
    with_timeout(client.wait_for_keys(&["x".to_string()])).await?;

    cluster.add_worker(&extra_worker("w2")).await?;
    cluster.kill_worker("w1").await?;

    client.submit(vec![TaskSpecBuilder::new("y").after("x").build()]).await?;
    let outcomes = with_timeout(client.wait_for_keys(&["y".to_string()])).await?;
    assert!(matches!(outcomes["y"], KeyOutcome::Memory { .. }));
    assert_eq!(runner.attempts("x"), 2);

    let values = with_timeout(client.gather(&["y".to_string()])).await?;
    assert_eq!(values["y"], Bytes::from_static(b"y(x())"));

    cluster.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn retired_worker_hands_its_results_over() -> TestResult {
    init_tracing();
    let cfg = ConfigFileBuilder::new().with_worker("w1", 1).build();
    let runner = FakeRunner::new();
    let mut cluster = LocalCluster::start(&cfg, Arc::new(runner.clone())).await?;
    let mut client = cluster.client("c1").await;

    let wanted: Vec<String> = (0..3).map(|i| format!("k{i}")).collect();
    client
        .submit(wanted.iter().map(|k| TaskSpecBuilder::new(k).build()).collect())
        .await?;
    with_timeout(client.wait_for_keys(&wanted)).await?;

    cluster.add_worker(&extra_worker("w2")).await?;
    cluster.retire_worker("w1").await?;
    let retired = with_timeout(cluster.join_worker("w1")).await?;
    assert_eq!(retired.address(), "w1");
    assert_eq!(cluster.workers(), vec!["w2".to_string()]);

    for key in &wanted {
        assert_eq!(with_timeout(holders(&mut client, key)).await, vec!["w2".to_string()]);
    }
    let values = with_timeout(client.gather(&wanted)).await?;
    assert_eq!(values["k1"], Bytes::from_static(b"k1()"));
    assert_eq!(runner.executed().len(), 3);

    cluster.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn cancelled_task_stops_running() -> TestResult {
    init_tracing();
    let cfg = ConfigFileBuilder::new().with_worker("w1", 1).build();
    let runner = FakeRunner::new().with("stuck", Behaviour::Block);
    let cluster = LocalCluster::start(&cfg, Arc::new(runner.clone())).await?;
    let mut client = cluster.client("c1").await;

    client
        .submit(vec![
            TaskSpecBuilder::new("stuck").build(),
            TaskSpecBuilder::new("after").after("stuck").build(),
        ])
        .await?;
    eventually(|| runner.attempts("stuck") == 1).await;

    client.cancel(vec!["stuck".to_string()]).await?;
    let wanted = vec!["stuck".to_string(), "after".to_string()];
    let outcomes = with_timeout(client.wait_for_keys(&wanted)).await?;
    assert!(outcomes.values().all(|o| *o == KeyOutcome::Cancelled));
    assert_eq!(with_timeout(client.query("stuck")).await?, KeyStatus::Unknown);
    assert_eq!(runner.attempts("after"), 0);

    cluster.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn seceded_task_frees_its_slot() -> TestResult {
    init_tracing();
    let cfg = ConfigFileBuilder::new().with_worker("w1", 1).build();
    let runner =
        FakeRunner::new().with("long", Behaviour::Secede(Duration::from_millis(300)));
    let cluster = LocalCluster::start(&cfg, Arc::new(runner)).await?;
    let mut client = cluster.client("c1").await;

    client
        .submit(vec![
            TaskSpecBuilder::new("long").priority(10).build(),
            TaskSpecBuilder::new("short").build(),
        ])
        .await?;

    let mut finished = Vec::new();
    while finished.len() < 2 {
        if let ClientMessage::KeyInMemory { key, .. } = with_timeout(client.next_message()).await? {
            finished.push(key);
        }
    }
    assert_eq!(finished, vec!["short".to_string(), "long".to_string()]);

    cluster.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn resource_restricted_task_runs_on_a_capable_worker() -> TestResult {
    init_tracing();
    let cfg = ConfigFileBuilder::new()
        .with_worker("cpu", 2)
        .with_worker("gpu", 1)
        .with_worker_resource("gpu", "GPU", 1.0)
        .build();
    let cluster = LocalCluster::start(&cfg, Arc::new(FakeRunner::new())).await?;
    let mut client = cluster.client("c1").await;

    client
        .submit(vec![
            TaskSpecBuilder::new("render").resource("GPU", 1.0).build(),
            TaskSpecBuilder::new("encode").after("render").build(),
        ])
        .await?;
    let wanted = vec!["render".to_string(), "encode".to_string()];
    with_timeout(client.wait_for_keys(&wanted)).await?;
    assert_eq!(with_timeout(holders(&mut client, "render")).await, vec!["gpu".to_string()]);

    cluster.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn results_over_the_memory_target_spill_to_disk() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let big = Bytes::from(vec![b'a'; 80]);
    let cfg = ConfigFileBuilder::new()
        .with_worker("w1", 1)
        .with_spill_directory(dir.path(), 100)
        .build();
    let runner = FakeRunner::new()
        .with("p", Behaviour::Value(big.clone()))
        .with("q", Behaviour::Value(big.clone()));
    let cluster = LocalCluster::start(&cfg, Arc::new(runner)).await?;
    let mut client = cluster.client("c1").await;

    let wanted = vec!["p".to_string(), "q".to_string()];
    client
        .submit(wanted.iter().map(|k| TaskSpecBuilder::new(k).build()).collect())
        .await?;
    with_timeout(client.wait_for_keys(&wanted)).await?;

    // 60-byte target: only the most recent result stays in RAM.
    let spilled = fs::read_dir(dir.path().join("w1"))?.count();
    assert_eq!(spilled, 1);

    let values = with_timeout(client.gather(&wanted)).await?;
    assert_eq!(values, BTreeMap::from([("p".to_string(), big.clone()), ("q".to_string(), big)]));
    assert_eq!(fs::read_dir(dir.path().join("w1"))?.count(), 1);

    cluster.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn shell_tasks_from_config_see_their_dependencies() -> TestResult {
    init_tracing();
    let cfg = ConfigFileBuilder::new()
        .with_worker("w1", 1)
        .with_task("hello", TaskConfigBuilder::new("echo hello").build())
        .with_task(
            "greet",
            TaskConfigBuilder::new("echo \"$FLOTILLA_DEP_HELLO world\"")
                .after("hello")
                .build(),
        )
        .with_task("bad", TaskConfigBuilder::new("echo oops >&2; exit 3").build())
        .build();
    let tasks = flotilla::task_specs(&cfg)?;
    let wanted = keys(&tasks);
    let cluster = LocalCluster::start(&cfg, Arc::new(ShellRunner::new())).await?;
    let mut client = cluster.client("cli").await;

    client.submit(tasks).await?;
    let outcomes = with_timeout(client.wait_for_keys(&wanted)).await?;
    let Some(KeyOutcome::Erred { exception, .. }) = outcomes.get("bad") else {
        panic!("expected bad to err, got {outcomes:?}");
    };
    assert!(exception.summary.contains("exited with code 3"));

    let values = with_timeout(client.gather(&["greet".to_string()])).await?;
    assert_eq!(values["greet"], Bytes::from_static(b"hello world\n"));

    cluster.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn run_executes_a_config_file() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let path = dir.path().join("Flotilla.toml");
    fs::write(
        &path,
        r#"
[workers.alpha]
nthreads = 2

[task.one]
cmd = "echo 1"

[task.two]
cmd = "echo $((FLOTILLA_DEP_ONE + 1))"
after = ["one"]
"#,
    )?;

    let args = |dry_run| CliArgs {
        config: path.display().to_string(),
        log_level: None,
        dry_run,
        retire: None,
    };
    with_timeout(flotilla::run(args(true))).await?;
    with_timeout(flotilla::run(args(false))).await?;
    Ok(())
}

#[tokio::test]
async fn run_fails_when_a_task_fails() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let path = dir.path().join("Flotilla.toml");
    fs::write(
        &path,
        r#"
[workers.alpha]

[task.broken]
cmd = "exit 1"
"#,
    )?;

    let args = CliArgs {
        config: path.display().to_string(),
        log_level: None,
        dry_run: false,
        retire: None,
    };
    let err = with_timeout(flotilla::run(args)).await.unwrap_err();
    assert!(err.to_string().contains("1 of 1 task(s) did not complete"));
    Ok(())
}
