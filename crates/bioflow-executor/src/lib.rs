//! Step execution backends for BioFlow.
//!
//! Two executors are provided and the set is closed at compile time:
//! - Local subprocess (development and plain shell steps)
//! - Docker CLI (containerized steps)
//!
//! The engine asks each executor in registration order; the first whose
//! `accepts` returns true runs the step.

pub mod docker;
pub mod local;

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use bioflow_core::{Result, RunContext, Step, StepState};

pub use docker::DockerExecutor;
pub use local::LocalExecutor;

/// A backend capable of running a single step.
///
/// `execute` returns `Ok` for every step outcome (completed, failed,
/// cancelled); `Err` is reserved for backend misbehavior such as a spawn
/// failure or an image pull error, which the engine records as a failed
/// step state.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Name of this executor.
    fn name(&self) -> &'static str;

    /// Whether this executor can run the given step.
    fn accepts(&self, step: &Step) -> bool;

    /// Run the step to a terminal state, honoring the cancellation token.
    async fn execute(
        &self,
        step: &Step,
        ctx: &RunContext,
        cancel: CancellationToken,
    ) -> Result<StepState>;
}

/// Shared set of container names started by this run. Executors insert on
/// start and remove on exit; the engine sweeps whatever is left during
/// shutdown so no container outlives a cancelled run.
#[derive(Debug, Clone, Default)]
pub struct ContainerTracker {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl ContainerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>) {
        if let Ok(mut set) = self.inner.lock() {
            set.insert(name.into());
        }
    }

    pub fn remove(&self, name: &str) {
        if let Ok(mut set) = self.inner.lock() {
            set.remove(name);
        }
    }

    /// Take the current contents, leaving the set empty.
    pub fn drain(&self) -> Vec<String> {
        match self.inner.lock() {
            Ok(mut set) => set.drain().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().map(|set| set.is_empty()).unwrap_or(true)
    }

    /// Stop and remove every tracked container. Errors are ignored: the
    /// containers may already be gone by the time the sweep runs.
    pub async fn stop_all(&self) {
        for name in self.drain() {
            docker::stop_container(&name).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_insert_remove_drain() {
        let tracker = ContainerTracker::new();
        assert!(tracker.is_empty());

        tracker.insert("bioflow-qc-1");
        tracker.insert("bioflow-align-1");
        tracker.remove("bioflow-qc-1");

        let left = tracker.drain();
        assert_eq!(left, vec!["bioflow-align-1".to_string()]);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_tracker_clones_share_state() {
        let tracker = ContainerTracker::new();
        let clone = tracker.clone();
        clone.insert("bioflow-call-1");
        assert!(!tracker.is_empty());
    }
}
