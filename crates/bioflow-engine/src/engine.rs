//! The execution engine: layered dispatch, resource gating, retries,
//! cancellation.

use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use bioflow_core::model::ErrorAction;
use bioflow_core::resources::{HostCapacity, ResourceTracker};
use bioflow_core::{
    Error, Result, RunContext, RunId, RunResult, RunStatus, Step, StepState, StepStatus, Workflow,
};
use bioflow_executor::{ContainerTracker, DockerExecutor, LocalExecutor, StepExecutor};

use crate::plan::ExecutionPlan;

/// Options for one `execute()` call.
pub struct ExecuteOptions {
    /// Root working directory; created if absent.
    pub working_dir: PathBuf,
    /// Temp directory; defaults to `working_dir/temp`.
    pub temp_dir: Option<PathBuf>,
    /// Runtime parameters substituted through `${params.*}`.
    pub parameters: HashMap<String, serde_json::Value>,
    /// Cancellation root. Cancelling it stops the whole run.
    pub cancel: CancellationToken,
}

impl ExecuteOptions {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            temp_dir: None,
            parameters: HashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn temp_dir(mut self, temp_dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(temp_dir.into());
        self
    }

    pub fn parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// The workflow engine. Holds the closed executor set (local, docker),
/// the container tracking set shared with the docker backend, and the
/// host capacity the scheduler budgets against.
pub struct Engine {
    executors: Vec<Arc<dyn StepExecutor>>,
    containers: ContainerTracker,
    capacity: HostCapacity,
}

impl Engine {
    /// Engine against the detected host capacity.
    pub fn new() -> Self {
        Self::with_capacity(HostCapacity::detect())
    }

    /// Engine against an explicit capacity (tests, constrained hosts).
    pub fn with_capacity(capacity: HostCapacity) -> Self {
        let containers = ContainerTracker::new();
        Self {
            executors: vec![
                Arc::new(LocalExecutor::new()),
                Arc::new(DockerExecutor::new(containers.clone())),
            ],
            containers,
            capacity,
        }
    }

    /// Pre-flight only: validate, resolve, build layers. No step runs.
    pub fn plan(
        &self,
        workflow: &Workflow,
        parameters: &HashMap<String, serde_json::Value>,
        working_dir: &std::path::Path,
        temp_dir: &std::path::Path,
    ) -> Result<ExecutionPlan> {
        ExecutionPlan::build(workflow, parameters, working_dir, temp_dir, &self.capacity)
    }

    /// Run a workflow to completion and return the terminal result.
    ///
    /// Never returns an error: pre-flight failures come back as a `failed`
    /// result with no step started, runtime step failures as a `failed`
    /// result with per-step states.
    pub async fn execute(&self, workflow: &Workflow, options: ExecuteOptions) -> RunResult {
        let mut result = RunResult::new(workflow.clone());
        for step in workflow.all_steps() {
            result
                .step_states
                .insert(step.name.clone(), StepState::new(&step.name));
        }

        let working_dir = options.working_dir.clone();
        let temp_dir = options
            .temp_dir
            .clone()
            .unwrap_or_else(|| working_dir.join("temp"));
        if let Err(e) =
            std::fs::create_dir_all(&working_dir).and_then(|()| std::fs::create_dir_all(&temp_dir))
        {
            return finish_failed(result, format!("failed to create run directories: {e}"));
        }

        let plan = match self.plan(workflow, &options.parameters, &working_dir, &temp_dir) {
            Ok(plan) => plan,
            Err(e) => {
                error!(workflow = %workflow.name, error = %e, "Pre-flight failed");
                return finish_failed(result, e.to_string());
            }
        };

        info!(
            workflow = %workflow.name,
            version = %workflow.version,
            steps = plan.workflow.all_steps().len(),
            layers = plan.layers.len(),
            "Workflow started"
        );

        let ctx = Arc::new(RunContext {
            run_id: RunId::new(),
            working_dir,
            temp_dir,
            env: plan.workflow.env.clone(),
            parameters: options.parameters,
        });
        let resolved = Arc::new(plan.workflow.clone());

        let mut tracker = ResourceTracker::new(self.capacity);
        let mut failures: Vec<(String, String)> = Vec::new();

        for (index, layer) in plan.layers.iter().enumerate() {
            if options.cancel.is_cancelled() {
                break;
            }
            debug!(layer = index + 1, total = plan.layers.len(), steps = ?layer, "Executing layer");

            self.run_layer(
                layer,
                &plan,
                &resolved,
                &ctx,
                &mut tracker,
                &options.cancel,
                &mut result.step_states,
                &mut failures,
            )
            .await;

            if !failures.is_empty() {
                // Later layers never start after a failed layer.
                break;
            }
        }

        if options.cancel.is_cancelled() {
            // Invariant: no container spawned by this run outlives it.
            self.containers.stop_all().await;
            for state in result.step_states.values_mut() {
                state.mark_cancelled("Execution cancelled");
            }
            return finish_failed(result, "Execution cancelled".to_string());
        }

        if !failures.is_empty() {
            for state in result.step_states.values_mut() {
                if state.status == StepStatus::Pending {
                    state.mark_cancelled("Cancelled because an earlier step failed");
                }
            }
            let message = failures
                .iter()
                .map(|(name, msg)| format!("Step '{name}' failed: {msg}"))
                .collect::<Vec<_>>()
                .join("; ");
            error!(workflow = %workflow.name, error = %message, "Workflow failed");
            return finish_failed(result, message);
        }

        result.status = RunStatus::Completed;
        result.end_time = Some(Utc::now());
        info!(workflow = %workflow.name, "Workflow completed");
        result
    }

    /// Run one layer to its barrier: dispatch every member (re-queueing
    /// those that cannot allocate resources yet), wait for all of them,
    /// retrying failed steps whose error handler still has budget.
    #[allow(clippy::too_many_arguments)]
    async fn run_layer(
        &self,
        layer: &[String],
        plan: &ExecutionPlan,
        workflow: &Arc<Workflow>,
        ctx: &Arc<RunContext>,
        tracker: &mut ResourceTracker,
        cancel: &CancellationToken,
        states: &mut HashMap<String, StepState>,
        failures: &mut Vec<(String, String)>,
    ) {
        let mut waiting: VecDeque<String> = layer.iter().cloned().collect();
        let mut join_set: JoinSet<(String, Result<StepState>)> = JoinSet::new();
        let mut inflight: HashMap<tokio::task::Id, String> = HashMap::new();

        loop {
            if !cancel.is_cancelled() {
                let mut still_waiting = VecDeque::new();
                while let Some(name) = waiting.pop_front() {
                    let Some(step) = workflow.step(&name) else {
                        continue;
                    };

                    // Group steps are structural: they complete the moment
                    // their predecessors have, without a subprocess.
                    if step.is_group() {
                        if let Some(state) = states.get_mut(&name) {
                            state.mark_running();
                            state.mark_completed(0);
                        }
                        continue;
                    }

                    let demand = plan.demands.get(&name).copied().unwrap_or_default();
                    if !tracker.can_run(&demand) {
                        still_waiting.push_back(name);
                        continue;
                    }

                    tracker.allocate(&demand);
                    if let Some(state) = states.get_mut(&name) {
                        state.mark_running();
                    }
                    self.spawn_step(&mut join_set, &mut inflight, step, ctx, cancel, None);
                }
                waiting = still_waiting;
            }

            if join_set.is_empty() {
                if waiting.is_empty() || cancel.is_cancelled() {
                    break;
                }
                // Nothing is running yet every waiting step was refused:
                // impossible after pre-flight satisfiability, but never spin.
                for name in waiting.drain(..) {
                    if let Some(state) = states.get_mut(&name) {
                        state.mark_failed("resources can never be allocated", None);
                    }
                    failures.push((name, "resources can never be allocated".to_string()));
                }
                break;
            }

            let Some(joined) = join_set.join_next_with_id().await else {
                continue;
            };

            let (name, outcome) = match joined {
                Ok((id, (name, outcome))) => {
                    inflight.remove(&id);
                    (name, outcome)
                }
                Err(join_err) => {
                    let name = inflight.remove(&join_err.id()).unwrap_or_default();
                    (name, Err(Error::Internal(format!("step task died: {join_err}"))))
                }
            };

            let demand = plan.demands.get(&name).copied().unwrap_or_default();
            tracker.release(&demand);

            match outcome {
                Ok(mut state) => {
                    // The executor built a fresh state; the retry tally
                    // lives in the engine's map.
                    state.retry_count = states.get(&name).map(|s| s.retry_count).unwrap_or(0);
                    states.insert(name.clone(), state);
                }
                Err(e) => {
                    warn!(step = %name, error = %e, "Step backend error");
                    if let Some(state) = states.get_mut(&name) {
                        state.mark_failed(e.to_string(), None);
                    }
                }
            }

            let Some(state) = states.get_mut(&name) else {
                continue;
            };
            if state.status != StepStatus::Failed {
                continue;
            }

            if let Some(delay) = self.retry_delay(workflow, &name, state.retry_count) {
                if !cancel.is_cancelled() {
                    if let Some(step) = workflow.step(&name) {
                        info!(step = %name, attempt = state.retry_count + 1, "Retrying step");
                        state.begin_retry();
                        tracker.allocate(&demand);
                        self.spawn_step(&mut join_set, &mut inflight, step, ctx, cancel, delay);
                        continue;
                    }
                }
            }

            failures.push((
                name.clone(),
                state.error_message.clone().unwrap_or_default(),
            ));
        }
    }

    fn spawn_step(
        &self,
        join_set: &mut JoinSet<(String, Result<StepState>)>,
        inflight: &mut HashMap<tokio::task::Id, String>,
        step: &Step,
        ctx: &Arc<RunContext>,
        cancel: &CancellationToken,
        delay: Option<Duration>,
    ) {
        let executor = self.executors.iter().find(|e| e.accepts(step)).cloned();
        let step = step.clone();
        let ctx = Arc::clone(ctx);
        let cancel = cancel.child_token();

        let name = step.name.clone();
        let handle = join_set.spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let outcome = match executor {
                Some(executor) => executor.execute(&step, &ctx, cancel).await,
                None => Err(Error::Validation(format!(
                    "no suitable executor for step '{}'",
                    step.name
                ))),
            };
            (step.name.clone(), outcome)
        });
        inflight.insert(handle.id(), name);
    }

    /// `Some(delay)` when a matching error handler still has retry budget.
    /// First matching handler wins; the delay is pre-flight validated.
    fn retry_delay(
        &self,
        workflow: &Workflow,
        step_name: &str,
        retry_count: u32,
    ) -> Option<Option<Duration>> {
        let handler = workflow.error_handler_for(step_name)?;
        if handler.action != ErrorAction::Retry || retry_count >= handler.max_retries {
            return None;
        }
        let delay = handler
            .wait_time
            .as_deref()
            .and_then(|w| bioflow_core::resources::parse_duration(w).ok());
        Some(delay)
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

fn finish_failed(mut result: RunResult, message: String) -> RunResult {
    result.status = RunStatus::Failed;
    result.error_message = Some(message);
    result.end_time = Some(Utc::now());
    result
}
