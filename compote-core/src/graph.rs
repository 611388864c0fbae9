//! Service dependency resolution.
//!
//! Computes the batched startup order for a compose document: each batch is a
//! set of services with no outstanding dependencies, safe to start
//! concurrently. Batch composition and intra-batch ordering are deterministic
//! across invocations (ascending service name).

use crate::error::{CompoteError, Result};
use crate::manifest::ComposeFile;
use std::collections::{BTreeMap, BTreeSet};

/// Verify the dependency graph contains no cycles.
///
/// On failure the error carries the offending path (e.g. `a -> b -> a`).
pub fn ensure_acyclic(compose: &ComposeFile) -> Result<()> {
    let mut visited = BTreeSet::new();

    for name in compose.services.keys() {
        if visited.contains(name.as_str()) {
            continue;
        }
        let mut stack = Vec::new();
        visit(compose, name, &mut visited, &mut stack)?;
    }

    Ok(())
}

fn visit<'a>(
    compose: &'a ComposeFile,
    node: &'a str,
    visited: &mut BTreeSet<&'a str>,
    stack: &mut Vec<&'a str>,
) -> Result<()> {
    if let Some(pos) = stack.iter().position(|n| *n == node) {
        let mut path: Vec<&str> = stack[pos..].to_vec();
        path.push(node);
        return Err(CompoteError::CircularDependency { path: path.join(" -> ") });
    }

    if visited.contains(node) {
        return Ok(());
    }

    stack.push(node);
    if let Some(service) = compose.services.get(node) {
        for dep in service.dependencies() {
            if compose.services.contains_key(dep) {
                visit(compose, dep, visited, stack)?;
            }
        }
    }
    stack.pop();
    visited.insert(node);

    Ok(())
}

/// Compute the batched startup order for every service in the manifest.
pub fn resolve_startup_order(compose: &ComposeFile) -> Result<Vec<Vec<String>>> {
    resolve_startup_order_for(compose, None)
}

/// Compute the batched startup order for a subset of services.
///
/// With a filter, only the named services are batched; dependency edges to
/// services outside the subset are ignored. Unknown names are rejected.
pub fn resolve_startup_order_for(
    compose: &ComposeFile,
    filter: Option<&[String]>,
) -> Result<Vec<Vec<String>>> {
    let subset: BTreeSet<&str> = match filter {
        Some(names) => {
            let mut subset = BTreeSet::new();
            for name in names {
                if !compose.services.contains_key(name) {
                    return Err(CompoteError::ServiceNotFound { service: name.clone() });
                }
                subset.insert(name.as_str());
            }
            subset
        }
        None => compose.services.keys().map(String::as_str).collect(),
    };

    // Kahn's algorithm, draining every zero-indegree node into one batch per
    // round. BTreeMap iteration keeps each batch sorted by name.
    let mut indegree: BTreeMap<&str, usize> = subset.iter().map(|n| (*n, 0)).collect();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for name in &subset {
        let service = &compose.services[*name];
        for dep in service.dependencies() {
            if !compose.services.contains_key(dep) {
                return Err(CompoteError::MissingDependency {
                    service: name.to_string(),
                    dependency: dep.to_string(),
                });
            }
            if !subset.contains(dep) {
                continue;
            }
            dependents.entry(dep).or_default().push(*name);
            *indegree.get_mut(*name).expect("indegree initialized for subset") += 1;
        }
    }

    let mut batches = Vec::new();
    let mut remaining = subset.len();

    while remaining > 0 {
        let ready: Vec<&str> =
            indegree.iter().filter(|(_, d)| **d == 0).map(|(n, _)| *n).collect();

        if ready.is_empty() {
            // Unreachable after ensure_acyclic, but report rather than spin.
            return ensure_acyclic(compose).map(|_| Vec::new());
        }

        for name in &ready {
            indegree.remove(name);
            for dependent in dependents.get(name).into_iter().flatten() {
                if let Some(d) = indegree.get_mut(dependent) {
                    *d -= 1;
                }
            }
        }

        remaining -= ready.len();
        batches.push(ready.into_iter().map(str::to_string).collect());
    }

    Ok(batches)
}

/// Inverse health-dependency map: for each service, the services that require
/// it to reach healthy status before they start.
pub fn health_dependencies(compose: &ComposeFile) -> BTreeMap<String, Vec<String>> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for (name, service) in &compose.services {
        for dep in service.dependencies() {
            if service.depends_on.requires_healthy(dep) {
                map.entry(dep.to_string()).or_default().push(name.clone());
            }
        }
    }

    map
}
