//! Local subprocess executor.

use async_trait::async_trait;
use std::collections::HashMap;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use bioflow_core::resources::ResourceDemand;
use bioflow_core::{Error, Result, RunContext, Step, StepKind, StepState};

use crate::StepExecutor;

/// Runs single steps as plain subprocesses through `/bin/sh -c`.
#[derive(Debug, Default)]
pub struct LocalExecutor;

impl LocalExecutor {
    pub fn new() -> Self {
        Self
    }
}

enum WaitOutcome {
    Finished(std::io::Result<Output>),
    TimedOut(Duration),
    Cancelled,
}

#[async_trait]
impl StepExecutor for LocalExecutor {
    fn name(&self) -> &'static str {
        "local"
    }

    fn accepts(&self, step: &Step) -> bool {
        step.kind == StepKind::Single
            && step.command.as_deref().is_some_and(|c| !c.is_empty())
            && step.container.is_none()
    }

    async fn execute(
        &self,
        step: &Step,
        ctx: &RunContext,
        cancel: CancellationToken,
    ) -> Result<StepState> {
        let command = step
            .command
            .as_deref()
            .ok_or_else(|| Error::Internal(format!("step '{}' has no command", step.name)))?;
        let timeout = ResourceDemand::from_resources(step.resources.as_ref())?.timeout;

        let step_dir = ctx.step_dir(&step.name);
        tokio::fs::create_dir_all(&step_dir).await?;

        let mut state = StepState::new(&step.name);
        state.mark_running();

        info!(step = %step.name, command = %command, "Spawning local process");

        let child = Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .current_dir(&step_dir)
            .env_clear()
            .envs(compose_env(ctx))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Spawn(format!("'{command}': {e}")))?;

        // kill_on_drop reaps the child whenever the wait future is dropped,
        // so both the cancellation and timeout arms leave no process behind.
        let wait = child.wait_with_output();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => WaitOutcome::Cancelled,
            outcome = async {
                match timeout {
                    Some(limit) => match tokio::time::timeout(limit, wait).await {
                        Ok(result) => WaitOutcome::Finished(result),
                        Err(_) => WaitOutcome::TimedOut(limit),
                    },
                    None => WaitOutcome::Finished(wait.await),
                }
            } => outcome,
        };

        match outcome {
            WaitOutcome::Cancelled => {
                debug!(step = %step.name, "Local process cancelled");
                state.mark_cancelled("Execution cancelled");
            }
            WaitOutcome::TimedOut(limit) => {
                debug!(step = %step.name, ?limit, "Local process timed out");
                state.mark_cancelled(format!("Step timed out after {}s", limit.as_secs()));
            }
            WaitOutcome::Finished(result) => {
                let output =
                    result.map_err(|e| Error::Internal(format!("failed to wait for process: {e}")))?;
                record_exit(&mut state, &output);
            }
        }

        Ok(state)
    }
}

/// Current process environment, overlaid with the workflow environment.
fn compose_env(ctx: &RunContext) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars().collect();
    env.extend(ctx.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

/// Shared exit-code semantics for both executors: zero is completed,
/// anything else is failed with stderr (falling back to stdout, then a
/// synthetic message). A missing code records as -1.
pub(crate) fn record_exit(state: &mut StepState, output: &Output) {
    let exit_code = output.status.code().unwrap_or(-1);
    if exit_code == 0 {
        state.mark_completed(exit_code);
        return;
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let message = if !stderr.is_empty() {
        stderr
    } else if !stdout.is_empty() {
        stdout
    } else {
        format!("Command failed with exit code {exit_code}")
    };
    state.mark_failed(message, Some(exit_code));
}

#[cfg(test)]
mod tests {
    use super::*;
    use bioflow_core::model::{ContainerKind, ContainerSpec, Resources};
    use bioflow_core::{RunId, StepStatus};
    use std::path::Path;

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

    fn ctx(working_dir: &Path) -> RunContext {
        RunContext {
            run_id: RunId::new(),
            working_dir: working_dir.to_path_buf(),
            temp_dir: working_dir.join("temp"),
            env: HashMap::from([("GREETING".to_string(), "hello".to_string())]),
            parameters: HashMap::new(),
        }
    }

    #[test]
    fn test_accepts_plain_command_steps_only() {
        let executor = LocalExecutor::new();
        assert!(executor.accepts(&step("qc", "fastqc in.fq")));

        let mut empty = step("qc", "");
        empty.command = Some(String::new());
        assert!(!executor.accepts(&empty));

        let mut containerized = step("qc", "fastqc in.fq");
        containerized.container = Some(ContainerSpec {
            kind: ContainerKind::Docker,
            image: "biocontainers/fastqc".to_string(),
            version: None,
            mounts: vec![],
            environment: HashMap::new(),
        });
        assert!(!executor.accepts(&containerized));

        let mut group = step("all", "true");
        group.kind = StepKind::ParallelGroup;
        assert!(!executor.accepts(&group));
    }

    #[tokio::test]
    async fn test_successful_command_completes() {
        let dir = tempfile::tempdir().unwrap();
        let executor = LocalExecutor::new();

        let state = executor
            .execute(&step("hi", "echo hi"), &ctx(dir.path()), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(state.status, StepStatus::Completed);
        assert_eq!(state.exit_code, Some(0));
        assert!(state.start_time.is_some() && state.end_time.is_some());
    }

    #[tokio::test]
    async fn test_step_runs_in_its_own_directory() {
        let dir = tempfile::tempdir().unwrap();
        let executor = LocalExecutor::new();

        let state = executor
            .execute(
                &step("writer", "pwd > where.txt"),
                &ctx(dir.path()),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(state.status, StepStatus::Completed);

        let written = std::fs::read_to_string(dir.path().join("writer/where.txt")).unwrap();
        assert!(written.trim().ends_with("writer"));
    }

    #[tokio::test]
    async fn test_workflow_env_is_visible() {
        let dir = tempfile::tempdir().unwrap();
        let executor = LocalExecutor::new();

        let state = executor
            .execute(
                &step("env", "test \"$GREETING\" = hello"),
                &ctx(dir.path()),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(state.status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails_with_stderr_message() {
        let dir = tempfile::tempdir().unwrap();
        let executor = LocalExecutor::new();

        let state = executor
            .execute(
                &step("bad", "echo broken >&2; exit 3"),
                &ctx(dir.path()),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(state.status, StepStatus::Failed);
        assert_eq!(state.exit_code, Some(3));
        assert_eq!(state.error_message.as_deref(), Some("broken"));
    }

    #[tokio::test]
    async fn test_silent_failure_gets_synthetic_message() {
        let dir = tempfile::tempdir().unwrap();
        let executor = LocalExecutor::new();

        let state = executor
            .execute(&step("silent", "false"), &ctx(dir.path()), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(state.status, StepStatus::Failed);
        assert_eq!(state.exit_code, Some(1));
        assert_eq!(
            state.error_message.as_deref(),
            Some("Command failed with exit code 1")
        );
    }

    #[tokio::test]
    async fn test_cancellation_kills_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let executor = LocalExecutor::new();
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let state = executor
            .execute(&step("sleeper", "sleep 30"), &ctx(dir.path()), cancel)
            .await
            .unwrap();

        assert_eq!(state.status, StepStatus::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_time_limit_cancels_one_step() {
        let dir = tempfile::tempdir().unwrap();
        let executor = LocalExecutor::new();

        let mut slow = step("slow", "sleep 30");
        slow.resources = Some(Resources {
            cpu: None,
            memory: None,
            time: Some("1s".to_string()),
            gpu: None,
        });

        let started = std::time::Instant::now();
        let state = executor
            .execute(&slow, &ctx(dir.path()), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(state.status, StepStatus::Cancelled);
        assert!(state.error_message.as_deref().unwrap().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
