//! Deployment and teardown plans.

use crate::core::{ReferenceSpec, StackDefinition};
use serde::{Deserialize, Serialize};

/// Why one stack must precede another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "via", rename_all = "snake_case")]
pub enum EdgeKind {
    /// The consumer reads a value the producer provides.
    Reference {
        /// The consumer's reference name.
        name: String,
        /// The reference.
        spec: ReferenceSpec,
    },
    /// An explicit ordering dependency.
    DependsOn,
    /// The producer is a nested unit of the consumer's tree.
    Nesting,
}

/// A producer → consumer edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    /// The stack that must succeed first.
    pub producer: String,
    /// The stack that waits.
    pub consumer: String,
    /// What induced the edge.
    #[serde(flatten)]
    pub kind: EdgeKind,
}

/// One stack in plan order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedStack {
    /// Zero-based position in the creation order.
    pub position: usize,
    /// The stack definition.
    pub definition: StackDefinition,
    /// Stacks in this plan that must succeed first, in plan order.
    pub producers: Vec<String>,
}

impl PlannedStack {
    /// Returns the stack name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.definition.name
    }
}

/// A validated, topologically ordered set of stacks.
///
/// Plans are immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentPlan {
    stacks: Vec<PlannedStack>,
    edges: Vec<DependencyEdge>,
}

impl DeploymentPlan {
    pub(crate) fn new(stacks: Vec<PlannedStack>, edges: Vec<DependencyEdge>) -> Self {
        Self { stacks, edges }
    }

    /// Returns the stacks in creation order.
    #[must_use]
    pub fn stacks(&self) -> &[PlannedStack] {
        &self.stacks
    }

    /// Returns every dependency edge.
    #[must_use]
    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    /// Returns the number of stacks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    /// Returns true if the plan has no stacks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }

    /// Returns the stack names in creation order.
    #[must_use]
    pub fn order(&self) -> Vec<&str> {
        self.stacks.iter().map(PlannedStack::name).collect()
    }

    /// Looks up a planned stack.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&PlannedStack> {
        self.stacks.iter().find(|s| s.name() == name)
    }

    /// Returns the stacks that wait on `name`.
    #[must_use]
    pub fn consumers_of(&self, name: &str) -> Vec<&str> {
        self.stacks
            .iter()
            .filter(|s| s.producers.iter().any(|p| p == name))
            .map(PlannedStack::name)
            .collect()
    }

    /// Returns the teardown order: the exact reverse of creation order.
    #[must_use]
    pub fn teardown(&self) -> TeardownPlan {
        TeardownPlan {
            stacks: self.stacks.iter().rev().cloned().collect(),
        }
    }
}

/// Stacks in deletion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownPlan {
    stacks: Vec<PlannedStack>,
}

impl TeardownPlan {
    /// Returns the stacks in deletion order.
    #[must_use]
    pub fn stacks(&self) -> &[PlannedStack] {
        &self.stacks
    }

    /// Returns the stack names in deletion order.
    #[must_use]
    pub fn order(&self) -> Vec<&str> {
        self.stacks.iter().map(PlannedStack::name).collect()
    }

    /// Returns the number of stacks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    /// Returns true if nothing is scheduled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }

    /// Returns the deletion position of `name`.
    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.stacks.iter().position(|s| s.name() == name)
    }
}
