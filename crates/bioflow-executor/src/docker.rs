//! Docker CLI executor.
//!
//! Shells out to the `docker` binary with fixed argument sequences:
//! `docker image inspect <image>:<tag>`, `docker pull <image>:<tag>`,
//! `docker run --rm --name <name> [-e K=V …] [-v HOST:CONTAINER …]
//! <image>:<tag> /bin/sh -c "<command>"`, and `docker stop` / `docker rm`
//! on cancellation.

use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bioflow_core::model::{ContainerKind, ContainerSpec};
use bioflow_core::resources::ResourceDemand;
use bioflow_core::{Error, Result, RunContext, Step, StepKind, StepState};

use crate::local::record_exit;
use crate::{ContainerTracker, StepExecutor};

/// Runs single steps inside Docker containers via the docker CLI.
#[derive(Debug, Default)]
pub struct DockerExecutor {
    tracker: ContainerTracker,
}

impl DockerExecutor {
    pub fn new(tracker: ContainerTracker) -> Self {
        Self { tracker }
    }

    /// Container name for one step of one run. Unique because step names
    /// are unique within a workflow and the run id is a UUID.
    fn container_name(step: &Step, ctx: &RunContext) -> String {
        format!("bioflow-{}-{}", step.name, ctx.run_id)
    }

    /// Make sure `image:tag` exists locally, pulling it if the inspect
    /// probe fails. A failed pull is a backend error, not a step failure.
    async fn ensure_image(&self, image: &str) -> Result<()> {
        let inspect = Command::new("docker")
            .args(["image", "inspect", image])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| Error::Spawn(format!("docker image inspect: {e}")))?;
        if inspect.success() {
            return Ok(());
        }

        info!(image = %image, "Pulling image");
        let pull = Command::new("docker")
            .args(["pull", image])
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Error::Spawn(format!("docker pull: {e}")))?;
        if !pull.status.success() {
            return Err(Error::Container {
                image: image.to_string(),
                message: String::from_utf8_lossy(&pull.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    fn run_args(
        name: &str,
        spec: &ContainerSpec,
        command: &str,
        step_dir: &std::path::Path,
        env: &HashMap<String, String>,
    ) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            name.to_string(),
        ];

        // Stable -e ordering keeps invocations reproducible across runs.
        let mut keys: Vec<&String> = env.keys().collect();
        keys.sort();
        for key in keys {
            args.push("-e".to_string());
            args.push(format!("{key}={}", env[key]));
        }

        // The step working directory is always the first mount.
        args.push("-v".to_string());
        args.push(format!("{}:/workspace", step_dir.display()));
        for mount in &spec.mounts {
            args.push("-v".to_string());
            if mount.options.is_empty() {
                args.push(format!("{}:{}", mount.host_path, mount.container_path));
            } else {
                args.push(format!(
                    "{}:{}:{}",
                    mount.host_path,
                    mount.container_path,
                    mount.options.join(",")
                ));
            }
        }

        args.push(spec.effective_image());
        args.push("/bin/sh".to_string());
        args.push("-c".to_string());
        args.push(command.to_string());
        args
    }
}

#[async_trait]
impl StepExecutor for DockerExecutor {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn accepts(&self, step: &Step) -> bool {
        step.kind == StepKind::Single
            && step.command.as_deref().is_some_and(|c| !c.is_empty())
            && step
                .container
                .as_ref()
                .is_some_and(|c| c.kind == ContainerKind::Docker)
    }

    async fn execute(
        &self,
        step: &Step,
        ctx: &RunContext,
        cancel: CancellationToken,
    ) -> Result<StepState> {
        let spec = step
            .container
            .as_ref()
            .ok_or_else(|| Error::Internal(format!("step '{}' has no container", step.name)))?;
        let command = step
            .command
            .as_deref()
            .ok_or_else(|| Error::Internal(format!("step '{}' has no command", step.name)))?;
        let timeout = ResourceDemand::from_resources(step.resources.as_ref())?.timeout;

        let step_dir = ctx.step_dir(&step.name);
        tokio::fs::create_dir_all(&step_dir).await?;

        let image = spec.effective_image();
        self.ensure_image(&image).await?;

        // Container env layers the container spec over the workflow env;
        // the host process environment does not leak into the container.
        let mut env = ctx.env.clone();
        env.extend(spec.environment.iter().map(|(k, v)| (k.clone(), v.clone())));

        let name = Self::container_name(step, ctx);
        let args = Self::run_args(&name, spec, command, &step_dir, &env);

        let mut state = StepState::new(&step.name);
        state.mark_running();

        info!(step = %step.name, image = %image, container = %name, "Starting container");

        let child = Command::new("docker")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Spawn(format!("docker run: {e}")))?;
        self.tracker.insert(name.clone());

        let wait = child.wait_with_output();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            outcome = async {
                match timeout {
                    Some(limit) => tokio::time::timeout(limit, wait).await.ok(),
                    None => Some(wait.await),
                }
            } => Some(outcome),
        };

        match outcome {
            // Cancelled: kill the client, then stop the container itself.
            None => {
                debug!(step = %step.name, container = %name, "Stopping container on cancellation");
                stop_container(&name).await;
                self.tracker.remove(&name);
                state.mark_cancelled("Execution cancelled");
            }
            // Timed out: same cleanup, different message.
            Some(None) => {
                stop_container(&name).await;
                self.tracker.remove(&name);
                let limit = timeout.unwrap_or(Duration::ZERO);
                state.mark_cancelled(format!("Step timed out after {}s", limit.as_secs()));
            }
            Some(Some(result)) => {
                self.tracker.remove(&name);
                let output = result
                    .map_err(|e| Error::Internal(format!("failed to wait for container: {e}")))?;
                record_exit(&mut state, &output);
            }
        }

        Ok(state)
    }
}

/// `docker stop <name>` then `docker rm <name>`, ignoring failures: the
/// `--rm` flag usually beats us to the removal.
pub async fn stop_container(name: &str) {
    for subcommand in ["stop", "rm"] {
        let result = Command::new("docker")
            .args([subcommand, name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = result {
            warn!(container = %name, error = %e, "docker {subcommand} failed");
        }
    }
}
