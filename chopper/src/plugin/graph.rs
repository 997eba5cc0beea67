//! Dependency graph resolution for plugins.

use std::collections::{HashMap, VecDeque};

use super::types::PluginId;
use crate::{Error, Result};

/// Compute a boot order in which every plugin follows all of its dependencies.
///
/// `nodes` pairs each plugin with its declared dependencies, in registration
/// order. Plugins without mutual constraints keep their registration order.
///
/// Fails with `MissingDependency` for the first dependency that names an
/// unregistered plugin, and with `CyclicDependency` (listing one concrete
/// cycle) if the graph is not acyclic.
pub fn resolve_boot_order(nodes: &[(PluginId, Vec<PluginId>)]) -> Result<Vec<PluginId>> {
    let n = nodes.len();

    let id_to_idx: HashMap<&PluginId, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, (id, _))| (id, i))
        .collect();

    let mut in_degree: Vec<usize> = vec![0; n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut dependencies: Vec<Vec<usize>> = vec![Vec::new(); n];

    for (i, (id, deps)) in nodes.iter().enumerate() {
        for dep in deps {
            let Some(&dep_idx) = id_to_idx.get(dep) else {
                return Err(Error::MissingDependency {
                    plugin: id.clone(),
                    dependency: dep.clone(),
                });
            };
            dependents[dep_idx].push(i);
            dependencies[i].push(dep_idx);
            in_degree[i] += 1;
        }
    }

    // Kahn's algorithm
    let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order: Vec<PluginId> = Vec::with_capacity(n);

    while let Some(node) = queue.pop_front() {
        order.push(nodes[node].0.clone());

        for &dependent in &dependents[node] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                queue.push_back(dependent);
            }
        }
    }

    if order.len() < n {
        let cycle = find_cycle(&in_degree, &dependencies)
            .into_iter()
            .map(|i| nodes[i].0.clone())
            .collect();
        return Err(Error::CyclicDependency { cycle });
    }

    Ok(order)
}

/// Walk unresolved nodes along their unresolved dependencies until a node
/// repeats. Every unresolved node has at least one unresolved dependency, so
/// the walk always closes a loop.
fn find_cycle(in_degree: &[usize], dependencies: &[Vec<usize>]) -> Vec<usize> {
    let Some(start) = (0..in_degree.len()).find(|&i| in_degree[i] > 0) else {
        return Vec::new();
    };

    let mut path: Vec<usize> = Vec::new();
    let mut position: HashMap<usize, usize> = HashMap::new();
    let mut current = start;

    loop {
        if let Some(&pos) = position.get(&current) {
            let mut cycle = path.split_off(pos);
            cycle.push(current);
            return cycle;
        }
        position.insert(current, path.len());
        path.push(current);

        match dependencies[current].iter().find(|&&d| in_degree[d] > 0) {
            Some(&next) => current = next,
            None => return path,
        }
    }
}
