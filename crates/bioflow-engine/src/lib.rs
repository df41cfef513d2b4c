//! Layered DAG scheduler and execution engine for BioFlow.
//!
//! The engine turns a validated workflow into an execution plan (variable
//! resolution, dependency graph, resource validation), then walks the
//! plan's layers: every step in a layer is dispatched concurrently to the
//! first accepting executor, the layer barrier waits for all of them, and
//! a failure stops the run before the next layer starts.

pub mod engine;
pub mod plan;

pub use engine::{Engine, ExecuteOptions};
pub use plan::ExecutionPlan;
