//! Stack dependency graph.
//!
//! This module provides:
//! - [`StackGraph`] which links references to producers and orders stacks
//! - [`DeploymentPlan`] and its reverse, [`TeardownPlan`]
//! - [`TeardownGuard`] which keeps deletions from breaking live importers

mod builder;
mod plan;
mod teardown;


pub use builder::StackGraph;
pub use plan::{DependencyEdge, DeploymentPlan, EdgeKind, PlannedStack, TeardownPlan};
pub use teardown::TeardownGuard;
