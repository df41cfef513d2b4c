//! Execution state machine for steps and runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::model::Workflow;

/// Status of a step during execution.
///
/// `Completed`, `Failed`, `Skipped` and `Cancelled` are terminal and
/// absorbing: once a state reaches one of them, no transition changes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped | StepStatus::Cancelled
        )
    }
}

/// Execution state of one step. Created in `Pending` by the engine and
/// advanced only through the explicit `mark_*` transitions below.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    /// Name of the step this state belongs to.
    pub step_name: String,
    pub status: StepStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    /// Number of times the step has been re-run by an error handler.
    pub retry_count: u32,
    /// Resolved output values recorded for the step.
    pub outputs: HashMap<String, serde_json::Value>,
}

impl StepState {
    pub fn new(step_name: impl Into<String>) -> Self {
        Self {
            step_name: step_name.into(),
            status: StepStatus::Pending,
            start_time: None,
            end_time: None,
            exit_code: None,
            error_message: None,
            retry_count: 0,
            outputs: HashMap::new(),
        }
    }

    pub fn mark_running(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        self.status = StepStatus::Running;
        self.start_time = Some(Utc::now());
    }

    pub fn mark_completed(&mut self, exit_code: i32) {
        if self.status.is_terminal() {
            return;
        }
        self.status = StepStatus::Completed;
        self.end_time = Some(Utc::now());
        self.exit_code = Some(exit_code);
    }

    pub fn mark_failed(&mut self, message: impl Into<String>, exit_code: Option<i32>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = StepStatus::Failed;
        self.end_time = Some(Utc::now());
        self.exit_code = exit_code;
        self.error_message = Some(message.into());
    }

    pub fn mark_cancelled(&mut self, message: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = StepStatus::Cancelled;
        self.end_time = Some(Utc::now());
        self.error_message = Some(message.into());
    }

    pub fn mark_skipped(&mut self, reason: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = StepStatus::Skipped;
        self.end_time = Some(Utc::now());
        self.error_message = Some(reason.into());
    }

    /// Rewind a failed state for another attempt. Unlike the `mark_*`
    /// transitions this deliberately leaves the terminal `Failed` state:
    /// the retry budget is the only gate, and only the engine calls it.
    pub fn begin_retry(&mut self) {
        self.status = StepStatus::Running;
        self.start_time = Some(Utc::now());
        self.end_time = None;
        self.exit_code = None;
        self.error_message = None;
        self.retry_count += 1;
    }
}

/// Overall status of a run. The engine always returns a terminal status;
/// `Running` exists only while execution is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

/// The terminal record returned by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub workflow: Workflow,
    pub status: RunStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub step_states: HashMap<String, StepState>,
    pub error_message: Option<String>,
}

impl RunResult {
    pub fn new(workflow: Workflow) -> Self {
        Self {
            workflow,
            status: RunStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            step_states: HashMap::new(),
            error_message: None,
        }
    }

    /// `Completed` iff every step state is `Completed`.
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }
}
