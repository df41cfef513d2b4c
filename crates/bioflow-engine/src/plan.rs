//! Pre-flight planning: validation, resolution, graph, resource demands.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use bioflow_core::resources::{parse_duration, HostCapacity, ResourceDemand};
use bioflow_core::{Error, Result, Workflow};
use bioflow_graph::DependencyGraph;
use bioflow_resolver::VariableResolver;

/// Everything the scheduler needs, computed before any step runs.
/// A plan existing means the workflow passed every pre-flight check.
#[derive(Debug)]
pub struct ExecutionPlan {
    /// The fully-resolved workflow; no `${…}` residue anywhere.
    pub workflow: Workflow,
    /// Execution layers in graph order; concatenation is a topological
    /// order of all step names.
    pub layers: Vec<Vec<String>>,
    /// Parsed resource demand per step.
    pub demands: HashMap<String, ResourceDemand>,
}

impl ExecutionPlan {
    /// Build a plan or fail with the first pre-flight error.
    ///
    /// Order matters: structure first, then the graph (built against the
    /// *unresolved* workflow so implicit references are still visible),
    /// then resolution, then resource grammars and capacity.
    pub fn build(
        workflow: &Workflow,
        parameters: &HashMap<String, serde_json::Value>,
        working_dir: &Path,
        temp_dir: &Path,
        capacity: &HostCapacity,
    ) -> Result<Self> {
        validate_structure(workflow)?;

        let graph = DependencyGraph::build(workflow)?;
        let layers = graph.layers()?;

        let resolver = VariableResolver::new(workflow, parameters, working_dir, temp_dir);
        let resolved = resolver.resolve_workflow()?;

        for handler in &resolved.error_handlers {
            if let Some(wait) = &handler.wait_time {
                parse_duration(wait)?;
            }
        }

        let mut demands = HashMap::new();
        for step in resolved.all_steps() {
            let demand = ResourceDemand::from_resources(step.resources.as_ref())?;
            if !capacity.can_ever_fit(&demand) {
                return Err(Error::Resource(format!(
                    "step '{}' requests more than the host provides \
                     (cpu {}, memory {} bytes, gpu {})",
                    step.name, demand.cpus, demand.memory_bytes, demand.gpus
                )));
            }
            demands.insert(step.name.clone(), demand);
        }

        Ok(Self {
            workflow: resolved,
            layers,
            demands,
        })
    }
}

fn validate_structure(workflow: &Workflow) -> Result<()> {
    let mut seen: HashSet<&str> = HashSet::new();
    for step in workflow.all_steps() {
        if !seen.insert(&step.name) {
            return Err(Error::Validation(format!(
                "duplicate step name '{}'",
                step.name
            )));
        }

        if step.is_group() {
            if step.nested_steps.is_empty() {
                return Err(Error::Validation(format!(
                    "group step '{}' has no nested steps",
                    step.name
                )));
            }
            if step.command.is_some() {
                return Err(Error::Validation(format!(
                    "group step '{}' cannot carry a command",
                    step.name
                )));
            }
        } else {
            if step.command.as_deref().is_none_or(str::is_empty) {
                return Err(Error::Validation(format!(
                    "step '{}' has no command",
                    step.name
                )));
            }
            if !step.nested_steps.is_empty() {
                return Err(Error::Validation(format!(
                    "single step '{}' cannot have nested steps",
                    step.name
                )));
            }
        }

        if let Some(container) = &step.container {
            for mount in &container.mounts {
                if !mount.container_path.starts_with('/') {
                    return Err(Error::Validation(format!(
                        "mount '{}' of step '{}' is not absolute",
                        mount.container_path, step.name
                    )));
                }
            }
        }
    }
    Ok(())
}
