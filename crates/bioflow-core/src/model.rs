//! Workflow and step definitions.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A workflow definition: a named, versioned collection of steps plus
/// global configuration. Immutable once constructed; the resolver produces
/// a new, fully-expanded value rather than mutating this one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Workflow name (opaque identifier).
    pub name: String,
    /// Workflow version (opaque identifier).
    pub version: String,
    /// Optional human-readable description.
    #[serde(default)]
    pub description: Option<String>,
    /// Global environment variables, visible to every step.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Steps in declaration order. Step names are unique across the
    /// workflow, including nested group members.
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Error handlers matched against failed steps by name or `"*"`.
    #[serde(default)]
    pub error_handlers: Vec<ErrorHandler>,
}

impl Workflow {
    /// Find a top-level or nested step by name.
    pub fn step(&self, name: &str) -> Option<&Step> {
        fn find<'a>(steps: &'a [Step], name: &str) -> Option<&'a Step> {
            for step in steps {
                if step.name == name {
                    return Some(step);
                }
                if let Some(found) = find(&step.nested_steps, name) {
                    return Some(found);
                }
            }
            None
        }
        find(&self.steps, name)
    }

    /// All steps in declaration order, groups before their members.
    pub fn all_steps(&self) -> Vec<&Step> {
        fn collect<'a>(steps: &'a [Step], out: &mut Vec<&'a Step>) {
            for step in steps {
                out.push(step);
                collect(&step.nested_steps, out);
            }
        }
        let mut out = Vec::new();
        collect(&self.steps, &mut out);
        out
    }

    /// The first error handler matching a step name, if any.
    pub fn error_handler_for(&self, step_name: &str) -> Option<&ErrorHandler> {
        self.error_handlers
            .iter()
            .find(|h| h.on_error == "*" || h.on_error == step_name)
    }
}

/// What kind of node a step is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// One unit of work: a command, local or containerized.
    Single,
    /// Structural parent whose members may run concurrently.
    ParallelGroup,
    /// Structural parent whose members run in declaration order.
    SequentialGroup,
}

/// A single step in a workflow.
///
/// For `kind = single`, exactly one of (`command`, `container` + `command`)
/// is set. Group kinds carry a non-empty `nested_steps` instead; each member
/// implicitly depends on the group parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Step name, unique across the workflow.
    pub name: String,
    /// Step kind.
    pub kind: StepKind,
    /// Shell command, run through `/bin/sh -c`.
    #[serde(default)]
    pub command: Option<String>,
    /// Container to run the command in, if any.
    #[serde(default)]
    pub container: Option<ContainerSpec>,
    /// Declared inputs. Values may hold `${…}` references before resolution.
    #[serde(default)]
    pub inputs: Vec<IoDef>,
    /// Declared outputs.
    #[serde(default)]
    pub outputs: Vec<IoDef>,
    /// Names of steps that must complete before this one starts.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Resource requirements, if any.
    #[serde(default)]
    pub resources: Option<Resources>,
    /// Members of a group step. Empty for `kind = single`.
    #[serde(default)]
    pub nested_steps: Vec<Step>,
}

impl Step {
    /// Whether this step is a structural group node.
    pub fn is_group(&self) -> bool {
        matches!(self.kind, StepKind::ParallelGroup | StepKind::SequentialGroup)
    }

    /// Look up a declared input by name.
    pub fn input(&self, name: &str) -> Option<&IoDef> {
        self.inputs.iter().find(|io| io.name == name)
    }

    /// Look up a declared output by name.
    pub fn output(&self, name: &str) -> Option<&IoDef> {
        self.outputs.iter().find(|io| io.name == name)
    }
}

/// Type of a step input or output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoType {
    File,
    Directory,
    String,
    Integer,
    Float,
    Boolean,
}

/// A declared step input or output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoDef {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: IoType,
    /// A literal after resolution; may hold `${…}` references before.
    pub value: String,
}

/// Container backend kind. Docker is the only supported backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerKind {
    Docker,
}

/// Container configuration for a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub kind: ContainerKind,
    /// Image reference without tag.
    pub image: String,
    /// Image tag; `latest` when absent.
    #[serde(default)]
    pub version: Option<String>,
    /// Additional volume mounts beyond the step working directory.
    #[serde(default)]
    pub mounts: Vec<Mount>,
    /// Container environment, layered over the workflow environment.
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

impl ContainerSpec {
    /// Effective `image:tag` reference.
    pub fn effective_image(&self) -> String {
        format!("{}:{}", self.image, self.version.as_deref().unwrap_or("latest"))
    }
}

/// A volume mount. `container_path` must be absolute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mount {
    pub host_path: String,
    pub container_path: String,
    /// Mount options, appended as `host:container:opt1,opt2`.
    #[serde(default)]
    pub options: Vec<String>,
}

/// Resource requirements for a step.
///
/// `memory` uses the size grammar `^\d+(K|M|G|T)B?$` (binary units);
/// `time` uses the duration grammar `^\d+[smhd]$`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default)]
    pub cpu: Option<u32>,
    #[serde(default)]
    pub memory: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub gpu: Option<u32>,
}

/// What to do when a matched step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorAction {
    Retry,
}

/// A workflow-level error handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorHandler {
    /// Step name to match, or `"*"` for any step.
    pub on_error: String,
    pub action: ErrorAction,
    /// Retry budget. A step is re-run at most this many times.
    #[serde(default)]
    pub max_retries: u32,
    /// Delay before re-running, duration grammar `^\d+[smhd]$`.
    #[serde(default)]
    pub wait_time: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(name: &str) -> Step {
        Step {
            name: name.to_string(),
            kind: StepKind::Single,
            command: Some("true".to_string()),
            container: None,
            inputs: vec![],
            outputs: vec![],
            depends_on: vec![],
            resources: None,
            nested_steps: vec![],
        }
    }

    #[test]
    fn test_effective_image_defaults_to_latest() {
        let spec = ContainerSpec {
            kind: ContainerKind::Docker,
            image: "biocontainers/bwa".to_string(),
            version: None,
            mounts: vec![],
            environment: HashMap::new(),
        };
        assert_eq!(spec.effective_image(), "biocontainers/bwa:latest");

        let pinned = ContainerSpec {
            version: Some("0.7.17".to_string()),
            ..spec
        };
        assert_eq!(pinned.effective_image(), "biocontainers/bwa:0.7.17");
    }

    #[test]
    fn test_step_lookup_descends_into_groups() {
        let group = Step {
            name: "align".to_string(),
            kind: StepKind::ParallelGroup,
            command: None,
            container: None,
            inputs: vec![],
            outputs: vec![],
            depends_on: vec![],
            resources: None,
            nested_steps: vec![single("align_r1"), single("align_r2")],
        };
        let workflow = Workflow {
            name: "wf".to_string(),
            version: "1.0".to_string(),
            description: None,
            env: HashMap::new(),
            steps: vec![single("qc"), group],
            error_handlers: vec![],
        };

        assert!(workflow.step("align_r2").is_some());
        assert!(workflow.step("missing").is_none());

        let names: Vec<_> = workflow.all_steps().iter().map(|s| s.name.clone()).collect();
        assert_eq!(names, vec!["qc", "align", "align_r1", "align_r2"]);
    }

    #[test]
    fn test_error_handler_precedence_is_declaration_order() {
        let workflow = Workflow {
            name: "wf".to_string(),
            version: "1.0".to_string(),
            description: None,
            env: HashMap::new(),
            steps: vec![],
            error_handlers: vec![
                ErrorHandler {
                    on_error: "qc".to_string(),
                    action: ErrorAction::Retry,
                    max_retries: 3,
                    wait_time: None,
                },
                ErrorHandler {
                    on_error: "*".to_string(),
                    action: ErrorAction::Retry,
                    max_retries: 1,
                    wait_time: None,
                },
            ],
        };

        assert_eq!(workflow.error_handler_for("qc").unwrap().max_retries, 3);
        assert_eq!(workflow.error_handler_for("align").unwrap().max_retries, 1);
    }

    #[test]
    fn test_workflow_roundtrips_through_json() {
        let workflow = Workflow {
            name: "variant-calling".to_string(),
            version: "2.1.0".to_string(),
            description: None,
            env: HashMap::from([("REF".to_string(), "/refs/hg38.fa".to_string())]),
            steps: vec![single("qc")],
            error_handlers: vec![],
        };

        let json = serde_json::to_string(&workflow).unwrap();
        let back: Workflow = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "variant-calling");
        assert_eq!(back.steps.len(), 1);
        assert_eq!(back.env.get("REF").unwrap(), "/refs/hg38.fa");
    }
}
