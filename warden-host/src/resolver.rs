//! Dependency resolution between registered plugins.

use crate::descriptor::PluginDescriptor;
use crate::error::{HostResult, PluginHostError};
use std::collections::{HashMap, HashSet};

/// Returns the load order for `root`: every transitive dependency first,
/// `root` last. Each dependency must be registered with a version that
/// satisfies the declared range.
pub fn resolve_load_order(
    root: &str,
    registry: &HashMap<String, PluginDescriptor>,
) -> HostResult<Vec<String>> {
    if !registry.contains_key(root) {
        return Err(PluginHostError::PluginNotFound(root.to_string()));
    }

    let mut order = Vec::new();
    let mut done = HashSet::new();
    let mut stack = Vec::new();
    visit(root, registry, &mut stack, &mut done, &mut order)?;
    Ok(order)
}

fn visit(
    id: &str,
    registry: &HashMap<String, PluginDescriptor>,
    stack: &mut Vec<String>,
    done: &mut HashSet<String>,
    order: &mut Vec<String>,
) -> HostResult<()> {
    if done.contains(id) {
        return Ok(());
    }
    if let Some(pos) = stack.iter().position(|s| s == id) {
        let mut chain = stack[pos..].to_vec();
        chain.push(id.to_string());
        return Err(PluginHostError::CyclicDependency { chain });
    }

    let descriptor = registry
        .get(id)
        .ok_or_else(|| PluginHostError::PluginNotFound(id.to_string()))?;

    stack.push(id.to_string());
    for (dependency, requirement) in descriptor.manifest().dependency_requirements()? {
        let satisfied = registry
            .get(&dependency)
            .is_some_and(|dep| requirement.matches(dep.version()));
        if !satisfied {
            return Err(PluginHostError::UnresolvedDependency {
                plugin_id: id.to_string(),
                dependency,
                requirement: requirement.to_string(),
            });
        }
        visit(&dependency, registry, stack, done, order)?;
    }
    stack.pop();

    done.insert(id.to_string());
    order.push(id.to_string());
    Ok(())
}
