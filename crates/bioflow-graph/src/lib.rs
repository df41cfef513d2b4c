//! Dependency graph construction and execution layering.
//!
//! Edges come from three sources: explicit `depends_on` entries, implicit
//! `${steps.X.outputs.*}` references found in commands, I/O values and
//! container mount paths, and the structural edges of group steps. The
//! implicit scan runs against the *unresolved* workflow, so the graph stays
//! valid after substitution has erased the references.

use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;
use thiserror::Error;

use bioflow_core::model::{Step, StepKind, Workflow};

// Matches cross-step output references: ${steps.STEP.outputs.OUTPUT}
static OUTPUT_REF_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{steps\.([^.}]+)\.outputs\.[^}]+\}").unwrap());

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("unknown dependency '{dependency}' referenced by step '{step}'")]
    UnknownDependency { dependency: String, step: String },

    #[error("Circular dependency detected: {}", chain.join(" -> "))]
    CircularDependency { chain: Vec<String> },
}

impl From<GraphError> for bioflow_core::Error {
    fn from(err: GraphError) -> Self {
        bioflow_core::Error::Dependency(err.to_string())
    }
}

/// The execution DAG: nodes are step names, an edge `a → b` means
/// `a` must reach a terminal state before `b` starts.
#[derive(Debug)]
pub struct DependencyGraph {
    /// Node names in first-seen order; keeps layering deterministic.
    order: Vec<String>,
    dependencies: HashMap<String, HashSet<String>>,
    dependents: HashMap<String, HashSet<String>>,
}

impl DependencyGraph {
    /// Build the graph for a workflow. Step names are assumed unique
    /// (workflow invariant, enforced by engine pre-flight).
    pub fn build(workflow: &Workflow) -> Result<Self, GraphError> {
        let steps = workflow.all_steps();
        let known: HashSet<&str> = steps.iter().map(|s| s.name.as_str()).collect();

        let mut graph = Self {
            order: steps.iter().map(|s| s.name.clone()).collect(),
            dependencies: steps
                .iter()
                .map(|s| (s.name.clone(), HashSet::new()))
                .collect(),
            dependents: steps
                .iter()
                .map(|s| (s.name.clone(), HashSet::new()))
                .collect(),
        };

        for step in &steps {
            for dep in &step.depends_on {
                if !known.contains(dep.as_str()) {
                    return Err(GraphError::UnknownDependency {
                        dependency: dep.clone(),
                        step: step.name.clone(),
                    });
                }
                graph.add_edge(dep, &step.name);
            }

            for referenced in implicit_references(step) {
                if referenced == step.name {
                    continue;
                }
                if !known.contains(referenced.as_str()) {
                    return Err(GraphError::UnknownDependency {
                        dependency: referenced,
                        step: step.name.clone(),
                    });
                }
                graph.add_edge(&referenced, &step.name);
            }

            if step.is_group() {
                for child in &step.nested_steps {
                    graph.add_edge(&step.name, &child.name);
                }
                if step.kind == StepKind::SequentialGroup {
                    for pair in step.nested_steps.windows(2) {
                        graph.add_edge(&pair[0].name, &pair[1].name);
                    }
                }
            }
        }

        Ok(graph)
    }

    fn add_edge(&mut self, from: &str, to: &str) {
        if let Some(deps) = self.dependencies.get_mut(to) {
            deps.insert(from.to_string());
        }
        if let Some(deps) = self.dependents.get_mut(from) {
            deps.insert(to.to_string());
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Direct predecessors of a step.
    pub fn dependencies_of(&self, name: &str) -> impl Iterator<Item = &str> {
        self.dependencies
            .get(name)
            .into_iter()
            .flat_map(|deps| deps.iter().map(String::as_str))
    }

    /// Peel the graph into execution layers: layer `i` holds exactly the
    /// steps whose deepest predecessor chain has length `i`. The
    /// concatenation of all layers is a topological order.
    pub fn layers(&self) -> Result<Vec<Vec<String>>, GraphError> {
        let mut in_degree: HashMap<&str, usize> = self
            .order
            .iter()
            .map(|name| (name.as_str(), self.dependencies[name].len()))
            .collect();

        let mut layers: Vec<Vec<String>> = Vec::new();
        let mut remaining = self.order.len();

        while remaining > 0 {
            let layer: Vec<String> = self
                .order
                .iter()
                .filter(|name| in_degree.get(name.as_str()) == Some(&0))
                .cloned()
                .collect();

            if layer.is_empty() {
                // Kahn stalled: every remaining node keeps a nonzero
                // in-degree, so a cycle exists among them.
                return Err(self.cycle_error(&in_degree));
            }

            for name in &layer {
                in_degree.remove(name.as_str());
                for dependent in &self.dependents[name] {
                    if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                        *degree -= 1;
                    }
                }
            }

            remaining -= layer.len();
            layers.push(layer);
        }

        Ok(layers)
    }

    // Walk predecessor edges from any stalled node until one repeats,
    // then cut the witness chain out of the walk.
    fn cycle_error(&self, in_degree: &HashMap<&str, usize>) -> GraphError {
        let start = self
            .order
            .iter()
            .find(|name| in_degree.contains_key(name.as_str()))
            .cloned()
            .unwrap_or_default();

        let mut path: Vec<String> = vec![start.clone()];
        let mut current = start;
        loop {
            let next = self.dependencies[&current]
                .iter()
                .find(|dep| in_degree.contains_key(dep.as_str()));
            let Some(next) = next else {
                return GraphError::CircularDependency { chain: path };
            };
            if let Some(pos) = path.iter().position(|name| name == next) {
                let mut chain: Vec<String> = path[pos..].to_vec();
                chain.push(next.clone());
                return GraphError::CircularDependency { chain };
            }
            path.push(next.clone());
            current = next.clone();
        }
    }
}

// Scan the strings of one step for ${steps.X.outputs.*} references.
fn implicit_references(step: &Step) -> Vec<String> {
    let mut found = Vec::new();
    let mut scan = |value: &str| {
        for caps in OUTPUT_REF_REGEX.captures_iter(value) {
            found.push(caps[1].to_string());
        }
    };

    if let Some(command) = &step.command {
        scan(command);
    }
    for io in step.inputs.iter().chain(step.outputs.iter()) {
        scan(&io.value);
    }
    if let Some(container) = &step.container {
        for mount in &container.mounts {
            scan(&mount.host_path);
            scan(&mount.container_path);
        }
    }

    found
}
