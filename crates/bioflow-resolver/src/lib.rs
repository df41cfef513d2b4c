//! Variable resolution for workflow definitions.
//!
//! Expands `${…}` references in every string-typed field of a workflow
//! against a layered, typed context. Recognized forms:
//! - `${env.KEY}` - Workflow environment variable
//! - `${params.KEY}` - Runtime parameter supplied by the caller
//! - `${resources.KEY}` - Current step's resource field (step context)
//! - `${inputs.NAME}` - Current step's input value (step context)
//! - `${outputs.NAME}` - Current step's output value (step context)
//! - `${steps.STEP.outputs.NAME}` - Another step's declared output value
//! - `${working_dir}`, `${temp_dir}` - Global run paths
//!
//! Chained substitution (a reference whose expansion itself contains
//! references) is handled by a bounded fixed-point pass; anything still
//! unresolved after the bound is an error rather than a silent leftover.

use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;
use thiserror::Error;

use bioflow_core::model::{Step, Workflow};

// Regex for matching ${...} references.
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").unwrap());

/// Fixed-point bound for chained substitution.
const MAX_PASSES: usize = 10;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("unknown reference prefix in '${{{path}}}'")]
    UnknownPrefix { path: String },

    #[error("unknown reference '${{{path}}}': {detail}")]
    UnknownReference { path: String, detail: String },

    #[error("malformed reference '${{{path}}}'")]
    MalformedReference { path: String },

    #[error("could not fully resolve after {MAX_PASSES} passes: '{value}'")]
    Unresolved { value: String },
}

impl From<ResolveError> for bioflow_core::Error {
    fn from(err: ResolveError) -> Self {
        bioflow_core::Error::Validation(err.to_string())
    }
}

/// Resolver for `${…}` references against one workflow and one parameter set.
pub struct VariableResolver<'w> {
    workflow: &'w Workflow,
    parameters: &'w HashMap<String, serde_json::Value>,
    working_dir: String,
    temp_dir: String,
}

impl<'w> VariableResolver<'w> {
    pub fn new(
        workflow: &'w Workflow,
        parameters: &'w HashMap<String, serde_json::Value>,
        working_dir: &Path,
        temp_dir: &Path,
    ) -> Self {
        Self {
            workflow,
            parameters,
            working_dir: working_dir.display().to_string(),
            temp_dir: temp_dir.display().to_string(),
        }
    }

    /// Resolve the whole workflow into a new, fully-expanded value.
    /// The input workflow is never mutated.
    pub fn resolve_workflow(&self) -> Result<Workflow, ResolveError> {
        let mut resolved = self.workflow.clone();

        // Workflow env first, against the global context only.
        for value in resolved.env.values_mut() {
            *value = self.resolve_string(value, None)?;
        }

        for step in &mut resolved.steps {
            self.resolve_step(step)?;
        }

        Ok(resolved)
    }

    fn resolve_step(&self, step: &mut Step) -> Result<(), ResolveError> {
        // I/O values first, then the command, then container fields, so the
        // step context the later fields see is already expanded.
        let ctx = step.clone();
        for io in step.inputs.iter_mut().chain(step.outputs.iter_mut()) {
            io.value = self.resolve_string(&io.value, Some(&ctx))?;
        }

        let ctx = step.clone();
        if let Some(command) = &step.command {
            step.command = Some(self.resolve_string(command, Some(&ctx))?);
        }

        if let Some(container) = &mut step.container {
            for mount in &mut container.mounts {
                mount.host_path = self.resolve_string(&mount.host_path, Some(&ctx))?;
                mount.container_path = self.resolve_string(&mount.container_path, Some(&ctx))?;
            }
            for value in container.environment.values_mut() {
                *value = self.resolve_string(value, Some(&ctx))?;
            }
        }

        for nested in &mut step.nested_steps {
            self.resolve_step(nested)?;
        }

        Ok(())
    }

    /// Resolve all references in one string, iterating up to the
    /// fixed-point bound to expand chained substitutions.
    pub fn resolve_string(
        &self,
        value: &str,
        step: Option<&Step>,
    ) -> Result<String, ResolveError> {
        self.resolve_with_depth(value, step, 0)
    }

    // `depth` counts nested cross-step dereferences; a chain of step
    // outputs referencing each other bottoms out at the same bound as
    // ordinary chained substitution instead of recursing forever.
    fn resolve_with_depth(
        &self,
        value: &str,
        step: Option<&Step>,
        depth: usize,
    ) -> Result<String, ResolveError> {
        if depth >= MAX_PASSES {
            return Err(ResolveError::Unresolved {
                value: value.to_string(),
            });
        }

        let mut current = value.to_string();

        for _ in 0..MAX_PASSES {
            if !VAR_REGEX.is_match(&current) {
                return Ok(current);
            }
            let next = self.substitute_once(&current, step, depth)?;
            if next == current {
                break;
            }
            current = next;
        }

        if VAR_REGEX.is_match(&current) {
            return Err(ResolveError::Unresolved { value: current });
        }
        Ok(current)
    }

    // One substitution pass over every ${...} occurrence. Lookup failures
    // cannot surface through Regex::replace_all, so they are parked in
    // `failure` and returned after the pass.
    fn substitute_once(
        &self,
        value: &str,
        step: Option<&Step>,
        depth: usize,
    ) -> Result<String, ResolveError> {
        let mut failure: Option<ResolveError> = None;

        let replaced = VAR_REGEX.replace_all(value, |caps: &regex::Captures| {
            let path = &caps[1];
            match self.lookup(path, step, depth) {
                Ok(resolved) => resolved,
                Err(err) => {
                    failure.get_or_insert(err);
                    caps[0].to_string()
                }
            }
        });

        match failure {
            Some(err) => Err(err),
            None => Ok(replaced.into_owned()),
        }
    }

    fn lookup(
        &self,
        path: &str,
        step: Option<&Step>,
        depth: usize,
    ) -> Result<String, ResolveError> {
        let parts: Vec<&str> = path.split('.').collect();

        match parts.as_slice() {
            ["working_dir"] => Ok(self.working_dir.clone()),
            ["temp_dir"] => Ok(self.temp_dir.clone()),

            ["env", key] => self.workflow.env.get(*key).cloned().ok_or_else(|| {
                ResolveError::UnknownReference {
                    path: path.to_string(),
                    detail: format!("no environment variable '{key}'"),
                }
            }),

            ["params", key] => self
                .parameters
                .get(*key)
                .map(stringify)
                .ok_or_else(|| ResolveError::UnknownReference {
                    path: path.to_string(),
                    detail: format!("no parameter '{key}'"),
                }),

            ["resources", key] => {
                let step = self.require_step(path, step)?;
                let resources =
                    step.resources
                        .as_ref()
                        .ok_or_else(|| ResolveError::UnknownReference {
                            path: path.to_string(),
                            detail: format!("step '{}' declares no resources", step.name),
                        })?;
                let value = match *key {
                    "cpu" => resources.cpu.map(|v| v.to_string()),
                    "memory" => resources.memory.clone(),
                    "time" => resources.time.clone(),
                    "gpu" => resources.gpu.map(|v| v.to_string()),
                    _ => None,
                };
                value.ok_or_else(|| ResolveError::UnknownReference {
                    path: path.to_string(),
                    detail: format!("no resource '{key}' on step '{}'", step.name),
                })
            }

            ["inputs", name] => {
                let step = self.require_step(path, step)?;
                step.input(name).map(|io| io.value.clone()).ok_or_else(|| {
                    ResolveError::UnknownReference {
                        path: path.to_string(),
                        detail: format!("no input '{name}' on step '{}'", step.name),
                    }
                })
            }

            ["outputs", name] => {
                let step = self.require_step(path, step)?;
                step.output(name).map(|io| io.value.clone()).ok_or_else(|| {
                    ResolveError::UnknownReference {
                        path: path.to_string(),
                        detail: format!("no output '{name}' on step '{}'", step.name),
                    }
                })
            }

            ["steps", step_name, "outputs", output_name] => {
                let target =
                    self.workflow
                        .step(step_name)
                        .ok_or_else(|| ResolveError::UnknownReference {
                            path: path.to_string(),
                            detail: format!("no step '{step_name}'"),
                        })?;
                let value = target
                    .output(output_name)
                    .map(|io| io.value.clone())
                    .ok_or_else(|| ResolveError::UnknownReference {
                        path: path.to_string(),
                        detail: format!("no output '{output_name}' on step '{step_name}'"),
                    })?;
                // The output may itself be a template; expand it against the
                // *owning* step's context, not the referencing step's.
                self.resolve_with_depth(&value, Some(target), depth + 1)
            }

            // A steps reference with the wrong shape is malformed, not unknown.
            ["steps", ..] => Err(ResolveError::MalformedReference {
                path: path.to_string(),
            }),

            [prefix, ..]
                if matches!(
                    *prefix,
                    "env" | "params" | "resources" | "inputs" | "outputs" | "working_dir"
                        | "temp_dir"
                ) =>
            {
                Err(ResolveError::MalformedReference {
                    path: path.to_string(),
                })
            }

            _ => Err(ResolveError::UnknownPrefix {
                path: path.to_string(),
            }),
        }
    }

    fn require_step<'s>(
        &self,
        path: &str,
        step: Option<&'s Step>,
    ) -> Result<&'s Step, ResolveError> {
        step.ok_or_else(|| ResolveError::UnknownReference {
            path: path.to_string(),
            detail: "reference requires a step context".to_string(),
        })
    }
}

// Parameter values are arbitrary JSON; strings substitute without quotes.
fn stringify(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bioflow_core::model::{
        ContainerKind, ContainerSpec, IoDef, IoType, Mount, Resources, StepKind,
    };
    use std::path::PathBuf;

    fn io(name: &str, value: &str) -> IoDef {
        IoDef {
            name: name.to_string(),
            ty: IoType::File,
            value: value.to_string(),
        }
    }

    fn step(name: &str, command: &str) -> Step {
        Step {
            name: name.to_string(),
            kind: StepKind::Single,
            command: Some(command.to_string()),
            container: None,
            inputs: vec![],
            outputs: vec![],
            depends_on: vec![],
            resources: None,
            nested_steps: vec![],
        }
    }

    fn workflow(steps: Vec<Step>) -> Workflow {
        Workflow {
            name: "wf".to_string(),
            version: "1.0".to_string(),
            description: None,
            env: HashMap::from([("REF".to_string(), "/refs/hg38.fa".to_string())]),
            steps,
            error_handlers: vec![],
        }
    }

    fn resolve(
        workflow: &Workflow,
        params: &HashMap<String, serde_json::Value>,
    ) -> Result<Workflow, ResolveError> {
        VariableResolver::new(
            workflow,
            params,
            &PathBuf::from("/work"),
            &PathBuf::from("/work/temp"),
        )
        .resolve_workflow()
    }

    #[test]
    fn test_env_and_global_paths() {
        let wf = workflow(vec![step("qc", "fastqc ${env.REF} -o ${working_dir}/out")]);
        let resolved = resolve(&wf, &HashMap::new()).unwrap();
        assert_eq!(
            resolved.steps[0].command.as_deref(),
            Some("fastqc /refs/hg38.fa -o /work/out")
        );
    }

    #[test]
    fn test_params_stringify_without_quotes() {
        let params = HashMap::from([
            ("sample".to_string(), serde_json::json!("NA12878")),
            ("threads".to_string(), serde_json::json!(8)),
        ]);
        let wf = workflow(vec![step("align", "bwa -t ${params.threads} ${params.sample}")]);
        let resolved = resolve(&wf, &params).unwrap();
        assert_eq!(resolved.steps[0].command.as_deref(), Some("bwa -t 8 NA12878"));
    }

    #[test]
    fn test_chained_substitution_through_inputs() {
        let mut s = step("qc", "cat ${inputs.ref}");
        s.inputs = vec![io("ref", "${env.REF}")];
        let wf = workflow(vec![s]);

        let resolved = resolve(&wf, &HashMap::new()).unwrap();
        // Input expanded first, then the command picks up the literal.
        assert_eq!(resolved.steps[0].inputs[0].value, "/refs/hg38.fa");
        assert_eq!(resolved.steps[0].command.as_deref(), Some("cat /refs/hg38.fa"));
    }

    #[test]
    fn test_cross_step_output_reference() {
        let mut s1 = step("s1", "echo hi > s1.txt");
        s1.outputs = vec![io("out", "s1.txt")];
        let s2 = step("s2", "cat ${steps.s1.outputs.out}");
        let wf = workflow(vec![s1, s2]);

        let resolved = resolve(&wf, &HashMap::new()).unwrap();
        assert_eq!(resolved.steps[1].command.as_deref(), Some("cat s1.txt"));
    }

    #[test]
    fn test_cross_step_output_that_is_itself_a_template() {
        let mut s1 = step("s1", "bwa mem ${inputs.sample} > ${outputs.out}");
        s1.inputs = vec![io("sample", "NA12878")];
        s1.outputs = vec![io("out", "${inputs.sample}.bam")];
        let s2 = step("s2", "samtools index ${steps.s1.outputs.out}");
        let wf = workflow(vec![s1, s2]);

        let resolved = resolve(&wf, &HashMap::new()).unwrap();
        // s1's output expands against s1's own inputs, even when
        // dereferenced from s2 (which has no 'sample' input).
        assert_eq!(resolved.steps[0].outputs[0].value, "NA12878.bam");
        assert_eq!(
            resolved.steps[1].command.as_deref(),
            Some("samtools index NA12878.bam")
        );
    }

    #[test]
    fn test_mutually_referencing_outputs_hit_the_bound() {
        let mut s1 = step("s1", "true");
        s1.outputs = vec![io("out", "${steps.s2.outputs.out}")];
        let mut s2 = step("s2", "true");
        s2.outputs = vec![io("out", "${steps.s1.outputs.out}")];
        let wf = workflow(vec![s1, s2]);

        let err = resolve(&wf, &HashMap::new()).unwrap_err();
        assert!(matches!(err, ResolveError::Unresolved { .. }));
    }

    #[test]
    fn test_resources_reference() {
        let mut s = step("align", "bwa mem -t ${resources.cpu}");
        s.resources = Some(Resources {
            cpu: Some(16),
            memory: Some("32GB".to_string()),
            time: None,
            gpu: None,
        });
        let wf = workflow(vec![s]);
        let resolved = resolve(&wf, &HashMap::new()).unwrap();
        assert_eq!(resolved.steps[0].command.as_deref(), Some("bwa mem -t 16"));
    }

    #[test]
    fn test_container_mounts_resolved() {
        let mut s = step("call", "gatk HaplotypeCaller");
        s.container = Some(ContainerSpec {
            kind: ContainerKind::Docker,
            image: "broadinstitute/gatk".to_string(),
            version: None,
            mounts: vec![Mount {
                host_path: "${working_dir}/refs".to_string(),
                container_path: "/refs".to_string(),
                options: vec![],
            }],
            environment: HashMap::from([("REF".to_string(), "${env.REF}".to_string())]),
        });
        let wf = workflow(vec![s]);

        let resolved = resolve(&wf, &HashMap::new()).unwrap();
        let container = resolved.steps[0].container.as_ref().unwrap();
        assert_eq!(container.mounts[0].host_path, "/work/refs");
        assert_eq!(container.environment.get("REF").unwrap(), "/refs/hg38.fa");
    }

    #[test]
    fn test_literal_workflow_is_a_fixed_point() {
        let mut s1 = step("s1", "echo hi");
        s1.outputs = vec![io("out", "s1.txt")];
        let wf = workflow(vec![s1, step("s2", "echo bye")]);

        let once = resolve(&wf, &HashMap::new()).unwrap();
        let twice = resolve(&once, &HashMap::new()).unwrap();
        assert_eq!(once.steps[0].command, twice.steps[0].command);
        assert_eq!(once.env, twice.env);
    }

    #[test]
    fn test_no_reference_residue_after_resolution() {
        let mut s = step("qc", "cat ${inputs.ref} ${env.REF} ${working_dir}");
        s.inputs = vec![io("ref", "${env.REF}")];
        let wf = workflow(vec![s]);

        let resolved = resolve(&wf, &HashMap::new()).unwrap();
        for step in resolved.all_steps() {
            if let Some(command) = &step.command {
                assert!(!command.contains("${"));
            }
            for io in step.inputs.iter().chain(step.outputs.iter()) {
                assert!(!io.value.contains("${"));
            }
        }
    }

    #[test]
    fn test_unknown_prefix() {
        let wf = workflow(vec![step("qc", "echo ${nope.REF}")]);
        let err = resolve(&wf, &HashMap::new()).unwrap_err();
        assert!(matches!(err, ResolveError::UnknownPrefix { .. }));
    }

    #[test]
    fn test_unknown_env_key() {
        let wf = workflow(vec![step("qc", "echo ${env.MISSING}")]);
        let err = resolve(&wf, &HashMap::new()).unwrap_err();
        assert!(matches!(err, ResolveError::UnknownReference { .. }));
    }

    #[test]
    fn test_malformed_steps_reference() {
        let wf = workflow(vec![step("qc", "echo ${steps.s1.outputs}")]);
        let err = resolve(&wf, &HashMap::new()).unwrap_err();
        assert!(matches!(err, ResolveError::MalformedReference { .. }));
    }

    #[test]
    fn test_reference_cycle_hits_fixed_point_bound() {
        let mut s = step("qc", "echo ${inputs.a}");
        s.inputs = vec![io("a", "${inputs.b}"), io("b", "${inputs.a}")];
        let wf = workflow(vec![s]);

        let err = resolve(&wf, &HashMap::new()).unwrap_err();
        assert!(matches!(err, ResolveError::Unresolved { .. }));
    }

    #[test]
    fn test_step_scoped_reference_without_step_context() {
        let wf = workflow(vec![]);
        let inputs = HashMap::new();
        let resolver = VariableResolver::new(
            &wf,
            &inputs,
            &PathBuf::from("/work"),
            &PathBuf::from("/tmp"),
        );
        let err = resolver.resolve_string("${inputs.ref}", None).unwrap_err();
        assert!(matches!(err, ResolveError::UnknownReference { .. }));
    }
}
