//! Planning module for provisioning passes.
//!
//! This module builds the dependency graph, compares desired descriptors
//! with recorded state, orders the resulting operations and executes them.

mod graph;
mod diff;
mod plan;
mod executor;

pub use graph::{DEPENDS_ON, DependencyGraph};
pub use diff::{DiffDetail, DiffEngine, DiffResult, DiffType, ResourceDiff};
pub use plan::{Action, OperationPlan, PlannedOperation};
pub use executor::{ExecutionReport, OperationResult, Outcome, PlanExecutor};
