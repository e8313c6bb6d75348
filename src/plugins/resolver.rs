//! Dependency graph between loaded plugins.
//!
//! Each plugin is a node holding its version and a map of dependency ID to
//! version constraint. Back-edges (dependency -> dependents) are kept next to
//! the nodes and updated under the same lock, so the two views never diverge.
//!
//! Conflicts come in three kinds: a dependency that is not installed, an
//! installed dependency whose version fails the declared constraint, and a
//! cycle. Cycle detection walks the graph with an explicit stack, so deep
//! chains cannot exhaust the call stack.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, RuntimeError};

use super::types::Plugin;
use super::version::{Version, VersionConstraint};

// ---------------------------------------------------------------------------
// Dependency specs
// ---------------------------------------------------------------------------

/// A declared dependency: `id` or `id@constraint`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencySpec {
    pub id: String,
    /// Constraint source text, `*` when none was given.
    pub constraint: String,
}

impl FromStr for DependencySpec {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self> {
        let (id, constraint) = match s.split_once('@') {
            Some((id, constraint)) => (id.trim(), constraint.trim()),
            None => (s.trim(), ""),
        };
        if id.is_empty() {
            return Err(RuntimeError::InvalidMetadata(format!(
                "dependency '{}' has no plugin id",
                s
            )));
        }
        let constraint = if constraint.is_empty() { "*" } else { constraint };
        constraint.parse::<VersionConstraint>()?;
        Ok(Self {
            id: id.to_string(),
            constraint: constraint.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Conflicts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    Missing,
    VersionMismatch,
    Circular,
}

/// A structured dependency problem. Also usable as an error value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictInfo {
    pub plugin_id: String,
    pub dependency_id: String,
    /// Constraint declared by `plugin_id`.
    pub required: String,
    /// Installed version of the dependency, when it exists.
    pub installed: Option<String>,
    pub conflict_type: ConflictType,
}

impl fmt::Display for ConflictInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.conflict_type {
            ConflictType::Missing => write!(
                f,
                "plugin {} requires dependency {} ({}) but it is not installed",
                self.plugin_id, self.dependency_id, self.required
            ),
            ConflictType::VersionMismatch => write!(
                f,
                "plugin {} requires {} {} but version {} is installed",
                self.plugin_id,
                self.dependency_id,
                self.required,
                self.installed.as_deref().unwrap_or("unknown")
            ),
            ConflictType::Circular => write!(
                f,
                "circular dependency detected: {} -> {}",
                self.plugin_id, self.dependency_id
            ),
        }
    }
}

impl std::error::Error for ConflictInfo {}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Node {
    version: String,
    /// Dependency ID -> constraint source.
    dependencies: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct Graph {
    nodes: BTreeMap<String, Node>,
    /// Dependency ID -> IDs of plugins that declare it.
    dependents: BTreeMap<String, BTreeSet<String>>,
    version_cache: HashMap<String, Version>,
}

impl Graph {
    fn detach(&mut self, id: &str) -> Option<Node> {
        let node = self.nodes.remove(id)?;
        for dep in node.dependencies.keys() {
            if let Some(set) = self.dependents.get_mut(dep) {
                set.remove(id);
                if set.is_empty() {
                    self.dependents.remove(dep);
                }
            }
        }
        self.version_cache.remove(id);
        Some(node)
    }

    fn check_edge(&self, from: &str, dep: &str, required: &str) -> Option<ConflictInfo> {
        let conflict = |conflict_type, installed: Option<String>| ConflictInfo {
            plugin_id: from.to_string(),
            dependency_id: dep.to_string(),
            required: required.to_string(),
            installed,
            conflict_type,
        };

        let Some(target) = self.nodes.get(dep) else {
            return Some(conflict(ConflictType::Missing, None));
        };

        let satisfied = match (
            required.parse::<VersionConstraint>(),
            self.version_cache.get(dep),
        ) {
            (Ok(constraint), Some(version)) => constraint.satisfies(version),
            (Ok(constraint), None) => constraint.is_wildcard(),
            (Err(_), _) => false,
        };

        if satisfied {
            None
        } else {
            Some(conflict(
                ConflictType::VersionMismatch,
                Some(target.version.clone()),
            ))
        }
    }
}

/// Thread-safe dependency graph of loaded plugins.
#[derive(Debug, Default)]
pub struct DependencyResolver {
    graph: RwLock<Graph>,
}

impl DependencyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin node and its edges, replacing any previous node with
    /// the same ID.
    pub fn add_plugin(&self, plugin: &Plugin) -> Result<()> {
        let specs = plugin.metadata.dependency_specs()?;
        let version = plugin.metadata.parsed_version().ok();

        let dependencies: BTreeMap<String, String> = specs
            .into_iter()
            .map(|spec| (spec.id, spec.constraint))
            .collect();

        let mut graph = self.graph.write();
        graph.detach(&plugin.id);

        for dep in dependencies.keys() {
            graph
                .dependents
                .entry(dep.clone())
                .or_default()
                .insert(plugin.id.clone());
        }
        if let Some(version) = version {
            graph.version_cache.insert(plugin.id.clone(), version);
        }
        graph.nodes.insert(
            plugin.id.clone(),
            Node {
                version: plugin.version.clone(),
                dependencies,
            },
        );

        debug!(plugin = %plugin.id, "Registered dependency node");
        Ok(())
    }

    /// Remove a node and every edge that references it as a dependent.
    /// Returns false when the plugin was not registered.
    pub fn remove_plugin(&self, id: &str) -> bool {
        self.graph.write().detach(id).is_some()
    }

    pub fn has_plugin(&self, id: &str) -> bool {
        self.graph.read().nodes.contains_key(id)
    }

    pub fn plugin_count(&self) -> usize {
        self.graph.read().nodes.len()
    }

    /// Transitively resolve the dependencies of `id`.
    ///
    /// Returns dependency ID -> installed version. Fails on the first missing
    /// or mismatched dependency found in depth-first order.
    pub fn resolve_dependencies(&self, id: &str) -> Result<BTreeMap<String, String>> {
        let graph = self.graph.read();
        if !graph.nodes.contains_key(id) {
            return Err(RuntimeError::PluginNotFound(id.to_string()));
        }

        let mut resolved = BTreeMap::new();
        let mut visited: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = vec![id];

        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            let Some(node) = graph.nodes.get(current) else {
                continue;
            };
            // Reverse so the first declared dependency is explored first.
            for (dep, required) in node.dependencies.iter().rev() {
                if let Some(conflict) = graph.check_edge(current, dep, required) {
                    return Err(conflict.into());
                }
                if let Some(target) = graph.nodes.get(dep.as_str()) {
                    if dep != id {
                        resolved.insert(dep.clone(), target.version.clone());
                    }
                }
                if !visited.contains(dep.as_str()) {
                    stack.push(dep.as_str());
                }
            }
        }

        Ok(resolved)
    }

    /// Report every missing, mismatched and circular dependency.
    ///
    /// `installed` overrides the graph's view of versions: an entry makes a
    /// dependency count as present at that version even if it has no node.
    pub fn detect_conflicts(&self, installed: &HashMap<String, String>) -> Vec<ConflictInfo> {
        let graph = self.graph.read();
        let mut conflicts = Vec::new();

        for (id, node) in &graph.nodes {
            for (dep, required) in &node.dependencies {
                let conflict = match installed.get(dep) {
                    Some(version) => {
                        let ok = required
                            .parse::<VersionConstraint>()
                            .map(|c| c.satisfies_str(version))
                            .unwrap_or(false);
                        (!ok).then(|| ConflictInfo {
                            plugin_id: id.clone(),
                            dependency_id: dep.clone(),
                            required: required.clone(),
                            installed: Some(version.clone()),
                            conflict_type: ConflictType::VersionMismatch,
                        })
                    }
                    None => graph.check_edge(id, dep, required),
                };
                conflicts.extend(conflict);
            }
        }

        for cycle in find_cycles(&graph) {
            for pair in cycle.windows(2) {
                let required = graph
                    .nodes
                    .get(&pair[0])
                    .and_then(|n| n.dependencies.get(&pair[1]))
                    .cloned()
                    .unwrap_or_else(|| "*".to_string());
                conflicts.push(ConflictInfo {
                    plugin_id: pair[0].clone(),
                    dependency_id: pair[1].clone(),
                    required,
                    installed: graph.nodes.get(&pair[1]).map(|n| n.version.clone()),
                    conflict_type: ConflictType::Circular,
                });
            }
        }

        conflicts
    }

    /// Plugins that declare a dependency on `id`, sorted.
    pub fn get_dependents(&self, id: &str) -> Vec<String> {
        self.graph
            .read()
            .dependents
            .get(id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Direct dependencies of `id` with their constraints.
    pub fn get_dependencies(&self, id: &str) -> BTreeMap<String, String> {
        self.graph
            .read()
            .nodes
            .get(id)
            .map(|n| n.dependencies.clone())
            .unwrap_or_default()
    }

    /// Graphviz rendering of the graph, ordered by plugin ID.
    pub fn generate_dot_graph(&self) -> String {
        let graph = self.graph.read();
        let mut out = String::from("digraph PluginDependencies {\n");
        out.push_str("  rankdir=LR;\n");
        out.push_str("  node [shape=box];\n");

        for (id, node) in &graph.nodes {
            out.push_str(&format!(
                "  \"{}\" [label=\"{}\\nv{}\"];\n",
                escape_dot(id),
                escape_dot(id),
                escape_dot(&node.version)
            ));
        }
        for (id, node) in &graph.nodes {
            for (dep, constraint) in &node.dependencies {
                if !graph.nodes.contains_key(dep) {
                    out.push_str(&format!(
                        "  \"{}\" [style=dashed, color=red];\n",
                        escape_dot(dep)
                    ));
                }
                out.push_str(&format!(
                    "  \"{}\" -> \"{}\" [label=\"{}\"];\n",
                    escape_dot(id),
                    escape_dot(dep),
                    escape_dot(constraint)
                ));
            }
        }

        out.push_str("}\n");
        out
    }
}

fn escape_dot(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Find cycles with an iterative depth-first search.
///
/// Each cycle is returned as a path that starts and ends on the same node,
/// e.g. `[a, b, a]`. Every edge is explored once, so the cost is O(V + E).
fn find_cycles(graph: &Graph) -> Vec<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        OnStack,
        Done,
    }

    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut cycles = Vec::new();

    for root in graph.nodes.keys() {
        if marks.contains_key(root.as_str()) {
            continue;
        }

        // Frames of (node, its dependency iterator); `path` mirrors the frames.
        let mut frames = vec![(root.as_str(), dependency_iter(graph, root))];
        let mut path: Vec<&str> = vec![root.as_str()];
        marks.insert(root.as_str(), Mark::OnStack);

        while let Some((_, deps)) = frames.last_mut() {
            match deps.next() {
                Some(next) => match marks.get(next) {
                    Some(Mark::OnStack) => {
                        if let Some(start) = path.iter().position(|n| *n == next) {
                            let mut cycle: Vec<String> =
                                path[start..].iter().map(|s| s.to_string()).collect();
                            cycle.push(next.to_string());
                            cycles.push(cycle);
                        }
                    }
                    Some(Mark::Done) => {}
                    None => {
                        // Dangling edges to uninstalled plugins are not traversed.
                        if graph.nodes.contains_key(next) {
                            marks.insert(next, Mark::OnStack);
                            path.push(next);
                            frames.push((next, dependency_iter(graph, next)));
                        }
                    }
                },
                None => {
                    if let Some((finished, _)) = frames.pop() {
                        marks.insert(finished, Mark::Done);
                        path.pop();
                    }
                }
            }
        }
    }

    cycles
}

fn dependency_iter<'g>(graph: &'g Graph, id: &str) -> std::vec::IntoIter<&'g str> {
    graph
        .nodes
        .get(id)
        .map(|n| n.dependencies.keys().map(String::as_str).collect::<Vec<_>>())
        .unwrap_or_default()
        .into_iter()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::NoopEngine;
    use crate::plugins::types::PluginMetadata;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn make_plugin(id: &str, version: &str, deps: &[&str]) -> Plugin {
        let metadata = PluginMetadata {
            id: id.to_string(),
            name: id.to_string(),
            version: version.to_string(),
            author: "test".to_string(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            ..Default::default()
        };
        Plugin::new(
            metadata,
            PathBuf::from(format!("{}.lua", id)),
            Arc::new(NoopEngine),
        )
    }

    fn resolver_with(plugins: &[Plugin]) -> DependencyResolver {
        let resolver = DependencyResolver::new();
        for p in plugins {
            resolver.add_plugin(p).unwrap();
        }
        resolver
    }

    #[test]
    fn test_dependency_spec_parsing() {
        let spec: DependencySpec = "core@^1.2".parse().unwrap();
        assert_eq!(spec.id, "core");
        assert_eq!(spec.constraint, "^1.2");

        let bare: DependencySpec = "core".parse().unwrap();
        assert_eq!(bare.constraint, "*");

        assert!("@^1.0".parse::<DependencySpec>().is_err());
        assert!("core@>>1".parse::<DependencySpec>().is_err());
    }

    #[test]
    fn test_resolve_transitive() {
        let resolver = resolver_with(&[
            make_plugin("a", "1.0.0", &["b@^1.0.0"]),
            make_plugin("b", "1.4.0", &["c"]),
            make_plugin("c", "0.3.0", &[]),
        ]);

        let resolved = resolver.resolve_dependencies("a").unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved["b"], "1.4.0");
        assert_eq!(resolved["c"], "0.3.0");
    }

    #[test]
    fn test_resolve_missing_dependency() {
        let resolver = resolver_with(&[make_plugin("a", "1.0.0", &["z"])]);
        let err = resolver.resolve_dependencies("a").unwrap_err();
        match err {
            RuntimeError::Dependency(conflict) => {
                assert_eq!(conflict.conflict_type, ConflictType::Missing);
                assert_eq!(conflict.dependency_id, "z");
                assert!(conflict.to_string().contains("not installed"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_resolve_version_mismatch() {
        let resolver = resolver_with(&[
            make_plugin("a", "1.0.0", &["b@^2.0.0"]),
            make_plugin("b", "1.4.0", &[]),
        ]);
        let err = resolver.resolve_dependencies("a").unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Dependency(ConflictInfo {
                conflict_type: ConflictType::VersionMismatch,
                ..
            })
        ));
        assert_eq!(
            err.to_string(),
            "plugin a requires b ^2.0.0 but version 1.4.0 is installed"
        );
    }

    #[test]
    fn test_resolve_shared_dependency_visited_once() {
        let resolver = resolver_with(&[
            make_plugin("a", "1.0.0", &["b", "c"]),
            make_plugin("b", "1.0.0", &["d"]),
            make_plugin("c", "1.0.0", &["d"]),
            make_plugin("d", "1.0.0", &[]),
        ]);
        let resolved = resolver.resolve_dependencies("a").unwrap();
        assert_eq!(resolved.keys().collect::<Vec<_>>(), vec!["b", "c", "d"]);
    }

    #[test]
    fn test_resolve_unknown_plugin() {
        let resolver = DependencyResolver::new();
        assert!(matches!(
            resolver.resolve_dependencies("ghost"),
            Err(RuntimeError::PluginNotFound(_))
        ));
    }

    #[test]
    fn test_detect_two_node_cycle() {
        let resolver = resolver_with(&[
            make_plugin("a", "1.0.0", &["b"]),
            make_plugin("b", "1.0.0", &["a"]),
        ]);
        let conflicts = resolver.detect_conflicts(&HashMap::new());
        let circular: Vec<_> = conflicts
            .iter()
            .filter(|c| c.conflict_type == ConflictType::Circular)
            .collect();
        assert_eq!(circular.len(), 2);
        let ids: HashSet<&str> = circular
            .iter()
            .flat_map(|c| [c.plugin_id.as_str(), c.dependency_id.as_str()])
            .collect();
        assert!(ids.contains("a") && ids.contains("b"));
        assert!(circular[0].to_string().starts_with("circular dependency detected"));
    }

    #[test]
    fn test_detect_self_cycle() {
        let resolver = resolver_with(&[make_plugin("a", "1.0.0", &["a"])]);
        let conflicts = resolver.detect_conflicts(&HashMap::new());
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_type, ConflictType::Circular);
    }

    #[test]
    fn test_detect_missing_and_mismatch() {
        let resolver = resolver_with(&[
            make_plugin("a", "1.0.0", &["z", "b@>=2.0.0"]),
            make_plugin("b", "1.0.0", &[]),
        ]);
        let conflicts = resolver.detect_conflicts(&HashMap::new());
        assert_eq!(conflicts.len(), 2);
        assert!(conflicts
            .iter()
            .any(|c| c.conflict_type == ConflictType::Missing && c.dependency_id == "z"));
        assert!(conflicts
            .iter()
            .any(|c| c.conflict_type == ConflictType::VersionMismatch && c.dependency_id == "b"));
    }

    #[test]
    fn test_detect_with_installed_override() {
        let resolver = resolver_with(&[make_plugin("a", "1.0.0", &["z@^1.0.0"])]);

        let mut installed = HashMap::new();
        installed.insert("z".to_string(), "1.2.0".to_string());
        assert!(resolver.detect_conflicts(&installed).is_empty());

        installed.insert("z".to_string(), "2.0.0".to_string());
        let conflicts = resolver.detect_conflicts(&installed);
        assert_eq!(conflicts[0].conflict_type, ConflictType::VersionMismatch);
    }

    #[test]
    fn test_long_chain_cycle_detection_terminates() {
        let count = 500;
        let plugins: Vec<Plugin> = (0..count)
            .map(|i| {
                let dep = format!("p{:04}", (i + 1) % count);
                make_plugin(&format!("p{:04}", i), "1.0.0", &[dep.as_str()])
            })
            .collect();
        let resolver = resolver_with(&plugins);
        let conflicts = resolver.detect_conflicts(&HashMap::new());
        assert_eq!(conflicts.len(), count);
        assert!(conflicts
            .iter()
            .all(|c| c.conflict_type == ConflictType::Circular));
    }

    #[test]
    fn test_remove_plugin_cleans_edges() {
        let resolver = resolver_with(&[
            make_plugin("a", "1.0.0", &["b"]),
            make_plugin("b", "1.0.0", &[]),
        ]);
        assert_eq!(resolver.get_dependents("b"), vec!["a".to_string()]);

        assert!(resolver.remove_plugin("a"));
        assert!(resolver.get_dependents("b").is_empty());
        assert!(!resolver.has_plugin("a"));
        assert!(!resolver.remove_plugin("a"));
    }

    #[test]
    fn test_add_plugin_replaces_previous_edges() {
        let resolver = resolver_with(&[make_plugin("a", "1.0.0", &["b"])]);
        resolver
            .add_plugin(&make_plugin("a", "1.1.0", &["c"]))
            .unwrap();
        assert!(resolver.get_dependents("b").is_empty());
        assert_eq!(resolver.get_dependents("c"), vec!["a".to_string()]);
        assert_eq!(resolver.plugin_count(), 1);
    }

    #[test]
    fn test_get_dependencies() {
        let resolver = resolver_with(&[make_plugin("a", "1.0.0", &["b@~1.2.0", "c"])]);
        let deps = resolver.get_dependencies("a");
        assert_eq!(deps["b"], "~1.2.0");
        assert_eq!(deps["c"], "*");
        assert!(resolver.get_dependencies("ghost").is_empty());
    }

    #[test]
    fn test_dot_graph_is_deterministic() {
        let resolver = resolver_with(&[
            make_plugin("b", "1.0.0", &[]),
            make_plugin("a", "1.0.0", &["b@^1.0.0", "z"]),
        ]);
        let dot = resolver.generate_dot_graph();
        assert!(dot.starts_with("digraph PluginDependencies {"));
        assert!(dot.contains("\"a\" -> \"b\" [label=\"^1.0.0\"]"));
        assert!(dot.contains("\"z\" [style=dashed, color=red]"));
        assert!(dot.find("\"a\" [label").unwrap() < dot.find("\"b\" [label").unwrap());
        assert_eq!(dot, resolver.generate_dot_graph());
    }
}
