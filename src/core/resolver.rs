//! Stack dependency DAG and deployment order.
//!
//! An app stack depends on the cluster it runs in and on every pipeline
//! whose repositories it pulls from. The order is computed with Kahn's
//! algorithm and deterministic (alphabetical) tie-breaking.

use super::types::*;
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet, VecDeque};

/// Direct dependencies of every stack declared in the config.
pub fn stack_dependencies(config: &ForgeConfig) -> IndexMap<String, Vec<String>> {
    let mut deps: IndexMap<String, Vec<String>> = IndexMap::new();
    for name in config.clusters.keys().chain(config.pipelines.keys()) {
        deps.insert(name.clone(), Vec::new());
    }
    for (name, app) in &config.apps {
        let mut d = vec![app.cluster.clone()];
        for container in app.containers.values() {
            if let ImageSource::Pipeline { stack, .. } = &container.image {
                if !d.contains(stack) {
                    d.push(stack.clone());
                }
            }
        }
        deps.insert(name.clone(), d);
    }
    deps
}

/// Build a topological deployment order.
/// Uses Kahn's algorithm with alphabetical tie-breaking for determinism.
pub fn build_stack_order(config: &ForgeConfig) -> Result<Vec<String>, String> {
    topo_order(&stack_dependencies(config))
}

/// Topologically sort a dependency map (node → nodes it depends on).
pub fn topo_order(deps: &IndexMap<String, Vec<String>>) -> Result<Vec<String>, String> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for id in deps.keys() {
        in_degree.insert(id.as_str(), 0);
        dependents.insert(id.as_str(), Vec::new());
    }

    for (id, needs) in deps {
        for dep in needs {
            let Some(list) = dependents.get_mut(dep.as_str()) else {
                return Err(format!("stack '{}' depends on unknown '{}'", id, dep));
            };
            list.push(id.as_str());
            *in_degree.entry(id.as_str()).or_insert(0) += 1;
        }
    }

    let mut zero_degree: Vec<&str> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(id, _)| *id)
        .collect();
    zero_degree.sort_unstable();
    let mut queue: VecDeque<&str> = zero_degree.into_iter().collect();

    let mut order = Vec::new();
    while let Some(current) = queue.pop_front() {
        order.push(current.to_string());

        let mut next_ready: Vec<&str> = Vec::new();
        if let Some(children) = dependents.get(current) {
            for &child in children {
                if let Some(degree) = in_degree.get_mut(child) {
                    *degree -= 1;
                    if *degree == 0 {
                        next_ready.push(child);
                    }
                }
            }
        }
        next_ready.sort_unstable();
        queue.extend(next_ready);
    }

    if order.len() != deps.len() {
        let ordered: HashSet<&str> = order.iter().map(String::as_str).collect();
        let mut cycle_members: Vec<&str> = deps
            .keys()
            .map(String::as_str)
            .filter(|id| !ordered.contains(id))
            .collect();
        cycle_members.sort_unstable();
        return Err(format!(
            "dependency cycle detected involving: {}",
            cycle_members.join(", ")
        ));
    }

    Ok(order)
}
