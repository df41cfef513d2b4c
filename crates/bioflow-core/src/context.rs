//! Run identifiers and the per-run execution context.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

/// A unique identifier for one workflow run.
/// Uses UUIDv7 for time-ordered, sortable IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-run context shared with the step executors. Owned by the engine for
/// the duration of `execute()`; executors only read it.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: RunId,
    /// Root working directory. Each step writes to its own sub-directory.
    pub working_dir: PathBuf,
    pub temp_dir: PathBuf,
    /// Fully-resolved workflow environment.
    pub env: HashMap<String, String>,
    /// Caller-supplied runtime parameters, after resolution.
    pub parameters: HashMap<String, serde_json::Value>,
}

impl RunContext {
    /// The working directory for a step: `working_dir/<step-name>`.
    /// Step names are collision-free by workflow invariant.
    pub fn step_dir(&self, step_name: &str) -> PathBuf {
        self.working_dir.join(step_name)
    }
}
