//! "Requires" edges between plugins.

use indexmap::{IndexMap, IndexSet};

use hostguard_core::{PluginError, PluginResult};

/// A plugin and its edges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyNode {
    pub name: String,
    /// Plugins this one requires.
    pub dependencies: IndexSet<String>,
    /// Registered plugins that require this one.
    pub dependents: IndexSet<String>,
}

/// Dependency graph over named plugins.
///
/// Dependencies may name plugins that are not registered yet; the back edge is
/// filled in when the dependency registers.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: IndexMap<String, DependencyNode>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `name`, or replace its dependencies if it is already present.
    ///
    /// A dependency on itself is kept as a forward edge and shows up as a
    /// one-member cycle; a plugin is never listed among its own dependents.
    pub fn add_node(&mut self, name: &str, dependencies: &[String]) {
        if let Some(previous) = self.nodes.get(name).map(|node| node.dependencies.clone()) {
            for dependency in &previous {
                if let Some(node) = self.nodes.get_mut(dependency) {
                    node.dependents.shift_remove(name);
                }
            }
        }

        let dependents: IndexSet<String> = self
            .nodes
            .values()
            .filter(|node| node.name != name && node.dependencies.contains(name))
            .map(|node| node.name.clone())
            .collect();

        let dependencies: IndexSet<String> = dependencies.iter().cloned().collect();

        for dependency in dependencies.iter().filter(|dependency| dependency.as_str() != name) {
            if let Some(node) = self.nodes.get_mut(dependency) {
                node.dependents.insert(name.to_string());
            }
        }

        self.nodes.insert(
            name.to_string(),
            DependencyNode {
                name: name.to_string(),
                dependencies,
                dependents,
            },
        );
    }

    /// Drop `name` and every back edge pointing at it. Forward edges of its
    /// dependents are kept, so they show up as missing.
    pub fn remove_node(&mut self, name: &str) -> Option<DependencyNode> {
        let node = self.nodes.shift_remove(name)?;
        for dependency in &node.dependencies {
            if let Some(other) = self.nodes.get_mut(dependency) {
                other.dependents.shift_remove(name);
            }
        }
        Some(node)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn node(&self, name: &str) -> Option<&DependencyNode> {
        self.nodes.get(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn dependencies(&self, name: &str) -> Vec<String> {
        self.nodes
            .get(name)
            .map(|node| node.dependencies.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn dependents(&self, name: &str) -> Vec<String> {
        self.nodes
            .get(name)
            .map(|node| node.dependents.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether `name` declares a dependency on `dependency`.
    pub fn check_dependency(&self, name: &str, dependency: &str) -> bool {
        self.nodes
            .get(name)
            .is_some_and(|node| node.dependencies.contains(dependency))
    }

    /// Dependencies of `name` that are not registered. Unknown `name` yields
    /// an empty list.
    pub fn validate_dependencies(&self, name: &str) -> Vec<String> {
        self.nodes
            .get(name)
            .map(|node| {
                node.dependencies
                    .iter()
                    .filter(|dependency| !self.nodes.contains_key(dependency.as_str()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Order `names` so every plugin comes after its dependencies.
    ///
    /// Only edges between members of `names` count. Among plugins that are
    /// ready at the same time, the one listed first in `names` goes first.
    pub fn resolve_order(&self, names: &[String]) -> PluginResult<Vec<String>> {
        let members: IndexSet<&str> = names.iter().map(String::as_str).collect();

        let mut in_degree: IndexMap<&str, usize> = members
            .iter()
            .map(|&name| {
                let degree = self
                    .nodes
                    .get(name)
                    .map(|node| {
                        node.dependencies
                            .iter()
                            .filter(|dependency| members.contains(dependency.as_str()))
                            .count()
                    })
                    .unwrap_or(0);
                (name, degree)
            })
            .collect();

        let mut order = Vec::with_capacity(members.len());
        loop {
            let ready = in_degree
                .iter()
                .find(|(_, degree)| **degree == 0)
                .map(|(name, _)| *name);
            let Some(next) = ready else {
                break;
            };
            in_degree.shift_remove(next);
            order.push(next.to_string());
            for (name, degree) in in_degree.iter_mut() {
                if self.check_dependency(name, next) {
                    *degree -= 1;
                }
            }
        }

        if in_degree.is_empty() {
            Ok(order)
        } else {
            Err(PluginError::CircularDependency {
                cycle: self.find_cycle(&in_degree.keys().copied().collect::<Vec<_>>()),
            })
        }
    }

    /// Every registered plugin in dependency order.
    pub fn load_order(&self) -> PluginResult<Vec<String>> {
        self.resolve_order(&self.names())
    }

    // Every node in `remaining` has a dependency in `remaining`, so walking
    // dependency edges must revisit a node.
    fn find_cycle(&self, remaining: &[&str]) -> Vec<String> {
        let Some(&start) = remaining.first() else {
            return Vec::new();
        };

        let mut path: Vec<&str> = Vec::new();
        let mut current = start;
        loop {
            if let Some(position) = path.iter().position(|&name| name == current) {
                return path[position..].iter().map(|name| name.to_string()).collect();
            }
            path.push(current);

            let next = self.nodes.get(current).and_then(|node| {
                node.dependencies
                    .iter()
                    .map(String::as_str)
                    .find(|dependency| remaining.contains(dependency))
            });
            match next {
                Some(next) => current = next,
                None => return remaining.iter().map(|name| name.to_string()).collect(),
            }
        }
    }
}
