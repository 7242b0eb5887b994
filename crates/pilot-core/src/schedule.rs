//! Start-order planning over the manifest dependency graph.
//!
//! Pure: builds batches with Kahn's algorithm, rejects cycles and
//! unknown references before anything is launched.

use std::collections::{HashMap, HashSet};

use crate::error::ManifestError;
use crate::manifest::ProcessSpec;

/// Precomputed launch plan: topological batches plus the reverse
/// order used for fleet teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartPlan {
    batches: Vec<Vec<String>>,
    stop_order: Vec<String>,
}

impl StartPlan {
    /// Batches in launch order. Within a batch, names keep the
    /// manifest's declaration order; members of one batch may start
    /// concurrently.
    pub fn batches(&self) -> &[Vec<String>] {
        &self.batches
    }

    /// Reverse-topological order for teardown: dependents stop before
    /// the processes they depend on.
    pub fn stop_order(&self) -> &[String] {
        &self.stop_order
    }

    /// Flattened launch order.
    pub fn start_order(&self) -> impl Iterator<Item = &str> {
        self.batches.iter().flatten().map(String::as_str)
    }
}

/// Compute the start plan for a set of specs.
///
/// Edges run dependency → dependent. Fails with `UnknownDependency`
/// when an edge references a name outside the manifest and with
/// `CycleDetected` when the graph is not a DAG.
pub fn plan(specs: &[ProcessSpec]) -> Result<StartPlan, ManifestError> {
    let known: HashSet<&str> = specs.iter().map(|s| s.name.as_str()).collect();

    let mut indegree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for spec in specs {
        let entry = indegree.entry(spec.name.as_str()).or_insert(0);
        *entry += spec.dependencies.len();
        for dep in &spec.dependencies {
            if !known.contains(dep.as_str()) {
                return Err(ManifestError::UnknownDependency {
                    process: spec.name.clone(),
                    dependency: dep.clone(),
                });
            }
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(spec.name.as_str());
        }
    }

    let mut batches: Vec<Vec<String>> = Vec::new();
    let mut placed = 0usize;
    // Kahn's algorithm, one rank per iteration. Declaration order is
    // the stable tiebreak within a rank.
    loop {
        let batch: Vec<String> = specs
            .iter()
            .filter(|s| indegree.get(s.name.as_str()) == Some(&0))
            .map(|s| s.name.clone())
            .collect();
        if batch.is_empty() {
            break;
        }
        for name in &batch {
            indegree.remove(name.as_str());
            for dependent in dependents.get(name.as_str()).into_iter().flatten() {
                if let Some(count) = indegree.get_mut(dependent) {
                    *count -= 1;
                }
            }
        }
        placed += batch.len();
        batches.push(batch);
    }

    if placed != specs.len() {
        // Everything left has an unsatisfiable in-degree: a cycle, or
        // a node downstream of one.
        let mut stuck: Vec<String> = specs
            .iter()
            .filter(|s| indegree.contains_key(s.name.as_str()))
            .map(|s| s.name.clone())
            .collect();
        stuck.sort();
        return Err(ManifestError::CycleDetected(stuck));
    }

    let stop_order: Vec<String> = batches.iter().flatten().rev().cloned().collect();

    Ok(StartPlan { batches, stop_order })
}
