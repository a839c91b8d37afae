//! Building a deployment plan from stack definitions.

use super::plan::{DependencyEdge, DeploymentPlan, EdgeKind, PlannedStack};
use crate::core::{ReferenceSpec, StackDefinition};
use crate::errors::GraphError;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, HashSet};
use tracing::debug;

/// Stack definitions plus what is known to exist outside them.
#[derive(Debug, Clone, Default)]
pub struct StackGraph {
    definitions: Vec<StackDefinition>,
    external_parameters: BTreeSet<String>,
    live_exports: BTreeSet<String>,
}

impl StackGraph {
    /// Creates a graph over `definitions`; declaration order breaks ties.
    #[must_use]
    pub fn new(definitions: impl IntoIterator<Item = StackDefinition>) -> Self {
        Self {
            definitions: definitions.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Declares a parameter path as supplied out of band.
    #[must_use]
    pub fn with_external_parameter(mut self, path: impl Into<String>) -> Self {
        self.external_parameters.insert(path.into());
        self
    }

    /// Declares several parameter paths as supplied out of band.
    #[must_use]
    pub fn with_external_parameters<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.external_parameters.extend(paths.into_iter().map(Into::into));
        self
    }

    /// Declares an export as already live, produced outside this set.
    #[must_use]
    pub fn with_live_export(mut self, name: impl Into<String>) -> Self {
        self.live_exports.insert(name.into());
        self
    }

    /// Declares several exports as already live.
    #[must_use]
    pub fn with_live_exports<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.live_exports.extend(names.into_iter().map(Into::into));
        self
    }

    /// Returns the definitions in declaration order.
    #[must_use]
    pub fn definitions(&self) -> &[StackDefinition] {
        &self.definitions
    }

    /// Validates the definitions, links references to producers, and
    /// orders the stacks so every producer precedes its consumers.
    ///
    /// # Errors
    ///
    /// Returns the first validation or linking error, or
    /// [`GraphError::CycleDetected`] if the dependencies form a cycle.
    pub fn build(&self) -> Result<DeploymentPlan, GraphError> {
        if self.definitions.is_empty() {
            return Err(GraphError::Empty);
        }

        let mut index: HashMap<&str, usize> = HashMap::new();
        for (i, definition) in self.definitions.iter().enumerate() {
            definition.validate()?;
            if index.insert(definition.name.as_str(), i).is_some() {
                return Err(GraphError::DuplicateStack {
                    stack: definition.name.clone(),
                });
            }
        }

        let export_producers = self.unique_producers(
            |d: &StackDefinition| d.exports().map(|(_, export)| export.to_string()).collect(),
            |export, producers| GraphError::DuplicateExport { export, producers },
        )?;
        let parameter_writers = self.unique_producers(
            |d: &StackDefinition| d.parameter_writes.iter().map(|w| w.path.clone()).collect(),
            |path, producers| GraphError::DuplicateParameterWriter { path, producers },
        )?;

        let mut edges = Vec::new();
        let mut predecessors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); self.definitions.len()];

        for (consumer, definition) in self.definitions.iter().enumerate() {
            for reference in &definition.references {
                let unresolved = || GraphError::UnresolvedReference {
                    stack: definition.name.clone(),
                    reference: reference.name.clone(),
                };

                let producer = match &reference.spec {
                    ReferenceSpec::NestedOutput {
                        parent_stack,
                        child_stack,
                        output,
                    } => {
                        if !definition.is_in_tree(parent_stack) {
                            return Err(GraphError::NestedScopeViolation {
                                stack: definition.name.clone(),
                                reference: reference.name.clone(),
                                parent: parent_stack.clone(),
                            });
                        }
                        let producer = index
                            .get(child_stack.as_str())
                            .copied()
                            .filter(|&p| {
                                let child = &self.definitions[p];
                                child.parent.as_deref() == Some(parent_stack.as_str())
                                    && child.output(output).is_some()
                            })
                            .ok_or_else(unresolved)?;
                        Some(producer)
                    }
                    ReferenceSpec::Export { export_name } => {
                        match export_producers.get(export_name.as_str()) {
                            Some(&p) => Some(p),
                            None if self.live_exports.contains(export_name) => None,
                            None => return Err(unresolved()),
                        }
                    }
                    ReferenceSpec::ExternalParameter { path, .. } => {
                        match parameter_writers.get(path.as_str()) {
                            Some(&p) => Some(p),
                            None if self.external_parameters.contains(path) => None,
                            None => return Err(unresolved()),
                        }
                    }
                };

                if let Some(producer) = producer {
                    if producer == consumer {
                        return Err(GraphError::SelfReference {
                            stack: definition.name.clone(),
                            reference: reference.name.clone(),
                        });
                    }
                    predecessors[consumer].insert(producer);
                    edges.push(DependencyEdge {
                        producer: self.definitions[producer].name.clone(),
                        consumer: definition.name.clone(),
                        kind: EdgeKind::Reference {
                            name: reference.name.clone(),
                            spec: reference.spec.clone(),
                        },
                    });
                }
            }

            for dependency in &definition.depends_on {
                let producer = *index.get(dependency.as_str()).ok_or_else(|| {
                    GraphError::UnknownDependency {
                        stack: definition.name.clone(),
                        dependency: dependency.clone(),
                    }
                })?;
                if producer == consumer {
                    return Err(GraphError::SelfReference {
                        stack: definition.name.clone(),
                        reference: dependency.clone(),
                    });
                }
                predecessors[consumer].insert(producer);
                edges.push(DependencyEdge {
                    producer: dependency.clone(),
                    consumer: definition.name.clone(),
                    kind: EdgeKind::DependsOn,
                });
            }

            // A nested unit precedes the stack that owns its tree.
            if let Some(parent) = &definition.parent {
                if parent == &definition.name {
                    return Err(GraphError::SelfReference {
                        stack: definition.name.clone(),
                        reference: parent.clone(),
                    });
                }
                if let Some(&owner) = index.get(parent.as_str()) {
                    predecessors[owner].insert(consumer);
                    edges.push(DependencyEdge {
                        producer: definition.name.clone(),
                        consumer: parent.clone(),
                        kind: EdgeKind::Nesting,
                    });
                }
            }
        }

        let order = self.topological_order(&predecessors)?;
        debug!(stacks = order.len(), edges = edges.len(), "Built deployment plan");

        let stacks = order
            .iter()
            .enumerate()
            .map(|(position, &i)| {
                let mut producers: Vec<usize> = predecessors[i].iter().copied().collect();
                producers.sort_by_key(|p| order.iter().position(|o| o == p));
                PlannedStack {
                    position,
                    definition: self.definitions[i].clone(),
                    producers: producers
                        .into_iter()
                        .map(|p| self.definitions[p].name.clone())
                        .collect(),
                }
            })
            .collect();

        Ok(DeploymentPlan::new(stacks, edges))
    }

    /// Maps each key produced by `keys_of` to its single producing stack.
    fn unique_producers(
        &self,
        keys_of: impl Fn(&StackDefinition) -> Vec<String>,
        duplicate: impl Fn(String, Vec<String>) -> GraphError,
    ) -> Result<BTreeMap<String, usize>, GraphError> {
        let mut producers: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (i, definition) in self.definitions.iter().enumerate() {
            for key in keys_of(definition) {
                let slot = producers.entry(key).or_default();
                if !slot.contains(&i) {
                    slot.push(i);
                }
            }
        }

        let mut unique = BTreeMap::new();
        for (key, stacks) in producers {
            if stacks.len() > 1 {
                let names = stacks
                    .iter()
                    .map(|&i| self.definitions[i].name.clone())
                    .collect();
                return Err(duplicate(key, names));
            }
            unique.insert(key, stacks[0]);
        }
        Ok(unique)
    }

    /// Kahn's algorithm; ready stacks are taken in declaration order.
    fn topological_order(&self, predecessors: &[BTreeSet<usize>]) -> Result<Vec<usize>, GraphError> {
        let n = predecessors.len();
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut in_degree = vec![0usize; n];
        for (consumer, producers) in predecessors.iter().enumerate() {
            in_degree[consumer] = producers.len();
            for &producer in producers {
                successors[producer].push(consumer);
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = (0..n)
            .filter(|&i| in_degree[i] == 0)
            .map(Reverse)
            .collect();
        let mut order = Vec::with_capacity(n);

        while let Some(Reverse(next)) = ready.pop() {
            order.push(next);
            for &consumer in &successors[next] {
                in_degree[consumer] -= 1;
                if in_degree[consumer] == 0 {
                    ready.push(Reverse(consumer));
                }
            }
        }

        if order.len() == n {
            return Ok(order);
        }

        let placed: HashSet<usize> = order.into_iter().collect();
        let cycle = self
            .find_cycle(predecessors, &placed)
            .unwrap_or_else(|| {
                (0..n)
                    .filter(|i| !placed.contains(i))
                    .map(|i| self.definitions[i].name.clone())
                    .collect()
            });
        Err(GraphError::CycleDetected { cycle })
    }

    fn find_cycle(&self, predecessors: &[BTreeSet<usize>], placed: &HashSet<usize>) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        let mut on_path = HashSet::new();
        let mut path = Vec::new();

        for start in (0..predecessors.len()).filter(|i| !placed.contains(i)) {
            if !visited.contains(&start) {
                if let Some(cycle) =
                    Self::dfs_cycle(start, predecessors, &mut visited, &mut on_path, &mut path)
                {
                    return Some(
                        cycle
                            .into_iter()
                            .map(|i| self.definitions[i].name.clone())
                            .collect(),
                    );
                }
            }
        }
        None
    }

    fn dfs_cycle(
        node: usize,
        predecessors: &[BTreeSet<usize>],
        visited: &mut HashSet<usize>,
        on_path: &mut HashSet<usize>,
        path: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        visited.insert(node);
        on_path.insert(node);
        path.push(node);

        for &dep in &predecessors[node] {
            if !visited.contains(&dep) {
                if let Some(cycle) = Self::dfs_cycle(dep, predecessors, visited, on_path, path) {
                    return Some(cycle);
                }
            } else if on_path.contains(&dep) {
                let start = path.iter().position(|&n| n == dep)?;
                let mut cycle = path[start..].to_vec();
                cycle.push(dep);
                return Some(cycle);
            }
        }

        path.pop();
        on_path.remove(&node);
        None
    }
}
