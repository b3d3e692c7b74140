// src/graph/validate.rs

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::errors::{FlotillaError, Result};
use crate::graph::TaskSpec;
use crate::types::Key;

/// Validate a graph submission and return its keys in topological order
/// (dependencies before dependents).
///
/// `is_known` answers whether a key already exists in the scheduler; a
/// dependency must either be part of the submission or already known.
pub fn validate_submission(
    tasks: &[TaskSpec],
    is_known: impl Fn(&str) -> bool,
) -> Result<Vec<Key>> {
    let by_key: HashMap<&str, &TaskSpec> = tasks.iter().map(|t| (t.key.as_str(), t)).collect();

    for task in tasks {
        for dep in &task.dependencies {
            if dep == &task.key {
                return Err(FlotillaError::GraphCycle(format!(
                    "task '{}' depends on itself",
                    task.key
                )));
            }
            if !by_key.contains_key(dep.as_str()) && !is_known(dep) {
                return Err(FlotillaError::UnknownDependency {
                    task: task.key.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    // Edge direction: dep -> task. Dependencies outside the submission are
    // already in the scheduler and cannot close a cycle through new keys.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for task in tasks {
        graph.add_node(task.key.as_str());
    }
    for task in tasks {
        for dep in &task.dependencies {
            if by_key.contains_key(dep.as_str()) {
                graph.add_edge(dep.as_str(), task.key.as_str(), ());
            }
        }
    }

    match toposort(&graph, None) {
        Ok(order) => Ok(order.into_iter().map(str::to_string).collect()),
        Err(cycle) => Err(FlotillaError::GraphCycle(format!(
            "cycle detected in task graph involving '{}'",
            cycle.node_id()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RunSpec;

    fn task(key: &str, deps: &[&str]) -> TaskSpec {
        let mut spec = TaskSpec::new(key, RunSpec::new(key.to_string()));
        spec.dependencies = deps.iter().map(|d| d.to_string()).collect();
        spec
    }

    #[test]
    fn orders_dependencies_first() {
        let tasks = vec![task("c", &["b"]), task("b", &["a"]), task("a", &[])];
        let order = validate_submission(&tasks, |_| false).unwrap();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn rejects_cycles() {
        let tasks = vec![task("a", &["b"]), task("b", &["a"])];
        let err = validate_submission(&tasks, |_| false).unwrap_err();
        assert!(matches!(err, FlotillaError::GraphCycle(_)));
    }

    #[test]
    fn unknown_dependency_is_reported() {
        let tasks = vec![task("a", &["ghost"])];
        let err = validate_submission(&tasks, |_| false).unwrap_err();
        assert!(matches!(err, FlotillaError::UnknownDependency { .. }));

        let ok = validate_submission(&tasks, |k| k == "ghost").unwrap();
        assert_eq!(ok, vec!["a"]);
    }
}
