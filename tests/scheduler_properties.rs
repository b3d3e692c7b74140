mod common;

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use flotilla::config::{AmmConfig, SchedulerConfig};
use flotilla::graph::TaskSpec;
use flotilla::protocol::{SchedulerEvent, WorkerMessage, WorkerReport};
use flotilla::scheduler::{SchedulerCommand, TaskState};
use flotilla::types::new_stimulus_id;
use flotilla_test_utils::builders::TaskSpecBuilder;
use proptest::prelude::*;

use common::{Harness, assignments};

// Acyclic by construction: task i may only depend on tasks 0..i.
fn dag_strategy(max_tasks: usize) -> impl Strategy<Value = Vec<Vec<usize>>> {
    (1..=max_tasks).prop_flat_map(|n| {
        proptest::collection::vec(proptest::collection::vec(any::<usize>(), 0..3), n).prop_map(
            |raw| {
                raw.into_iter()
                    .enumerate()
                    .map(|(i, picks)| {
                        let deps: BTreeSet<usize> = if i == 0 {
                            BTreeSet::new()
                        } else {
                            picks.into_iter().map(|p| p % i).collect()
                        };
                        deps.into_iter().collect()
                    })
                    .collect()
            },
        )
    })
}

fn name(i: usize) -> String {
    format!("t{i}")
}

fn specs(deps: &[Vec<usize>]) -> Vec<TaskSpec> {
    deps.iter()
        .enumerate()
        .map(|(i, ds)| {
            ds.iter()
                .fold(TaskSpecBuilder::new(&name(i)), |b, d| b.after(&name(*d)))
                .build()
        })
        .collect()
}

/// Whether task `i` or anything it transitively depends on fails.
fn tainted(deps: &[Vec<usize>], failing: &BTreeSet<usize>) -> Vec<bool> {
    let mut out = vec![false; deps.len()];
    for i in 0..deps.len() {
        out[i] = failing.contains(&i) || deps[i].iter().any(|d| out[*d]);
    }
    out
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn every_key_ends_in_memory_or_erred(
        deps in dag_strategy(12),
        nworkers in 1usize..4,
        failing_picks in proptest::collection::vec(0usize..12, 0..3),
        kill_after in proptest::option::of(0usize..8),
    ) {
        let n = deps.len();
        let failing: BTreeSet<usize> = failing_picks.into_iter().filter(|i| *i < n).collect();
        let failing_keys: BTreeSet<String> = failing.iter().map(|i| name(*i)).collect();

        let mut h = Harness::new();
        for w in 0..nworkers {
            h.add_worker(&format!("w{w}"), 1);
        }

        let mut queue: VecDeque<(String, String)> = assignments(&h.submit("c1", specs(&deps))).into();
        let mut completions = 0;
        let mut killed = false;
        let mut steps = 0;

        while let Some((worker, key)) = queue.pop_front() {
            steps += 1;
            prop_assert!(steps < 10_000, "simulation did not settle");

            let current = h.core.state().task(&key).is_some_and(|t| {
                t.state == TaskState::Processing && t.processing_on.as_deref() == Some(worker.as_str())
            });
            if !current {
                continue;
            }

            let cmds = if failing_keys.contains(&key) {
                h.fail(&worker, &key, "boom")
            } else {
                h.finish(&worker, &key, 1)
            };
            queue.extend(assignments(&cmds));
            completions += 1;

            if !killed && nworkers > 1 && kill_after == Some(completions) {
                killed = true;
                queue.extend(assignments(&h.remove_worker("w0")));
            }
        }

        let expected = tainted(&deps, &failing);
        for (i, erred) in expected.iter().enumerate() {
            let key = name(i);
            let state = h.state_of(&key);
            if *erred {
                prop_assert_eq!(state, Some(TaskState::Erred), "{} should have erred", key);
            } else {
                prop_assert_eq!(state, Some(TaskState::Memory), "{} should be in memory", key);
                prop_assert!(!h.holders(&key).is_empty());
            }
        }
        prop_assert!(h.core.state().workers.values().all(|w| w.processing.is_empty()));
    }

    #[test]
    fn reduce_replicas_converges_to_one_copy(
        nworkers in 2usize..5,
        layout in proptest::collection::vec(proptest::collection::vec(any::<bool>(), 4), 1..6),
    ) {
        let mut h = Harness::with_config(SchedulerConfig::default(), AmmConfig::default());
        let workers: Vec<String> = (0..nworkers).map(|w| format!("w{w}")).collect();
        for w in &workers {
            h.add_worker(w, 1);
        }

        let tasks: Vec<TaskSpec> = (0..layout.len())
            .map(|i| TaskSpecBuilder::new(&format!("k{i}")).build())
            .collect();
        let placed: BTreeMap<String, String> = assignments(&h.submit("c1", tasks))
            .into_iter()
            .map(|(w, k)| (k, w))
            .collect();
        for (i, copies) in layout.iter().enumerate() {
            let key = format!("k{i}");
            let computed_on = placed[&key].clone();
            h.finish(&computed_on, &key, 10);
            for (w, holds) in workers.iter().zip(copies) {
                if *holds && *w != computed_on {
                    h.add_keys(w, &[(key.as_str(), 10)]);
                }
            }
        }

        for _ in 0..10 {
            let cmds = h.step(SchedulerEvent::RunAmm);
            if cmds.is_empty() {
                break;
            }
            for cmd in cmds {
                if let SchedulerCommand::SendToWorker {
                    worker,
                    msg: WorkerMessage::RemoveReplicas { keys, .. },
                } = cmd
                {
                    for key in keys {
                        h.report(
                            &worker,
                            WorkerReport::ReleaseWorkerData {
                                key,
                                stimulus_id: new_stimulus_id("release-worker-data"),
                            },
                        );
                    }
                }
            }
            for i in 0..layout.len() {
                let key = format!("k{}", i);
                prop_assert!(!h.holders(&key).is_empty(), "{} lost its last replica", key);
            }
        }

        for i in 0..layout.len() {
            let key = format!("k{i}");
            prop_assert_eq!(h.state_of(&key), Some(TaskState::Memory));
            prop_assert_eq!(h.holders(&key).len(), 1);
        }
    }
}
