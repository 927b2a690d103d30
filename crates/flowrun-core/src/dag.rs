// Copyright (c) 2025 Flowrun Team
// SPDX-License-Identifier: Apache-2.0

//! Dependency resolution over the workflow step graph.
//!
//! Steps form a directed graph with an edge from each dependency to its
//! dependent. [`WorkflowDag`] produces a deterministic topological order
//! (Kahn's algorithm, ties broken by declaration order) and derives the
//! layered parallel groups the scheduler runs.

use crate::error::{EngineError, Result, ValidationError};
use crate::workflow::Workflow;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// A set of steps sharing the same dependency level, schedulable
/// concurrently under shared caps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParallelGroup {
    /// Zero-based group index; groups run strictly in index order.
    pub index: usize,

    /// Step ids in declaration order.
    pub step_ids: Vec<String>,

    /// Effective concurrency cap for this group.
    pub max_concurrency: usize,

    /// Set only when every step in the group names the same resource.
    pub resource: Option<String>,
}

/// DAG representation of a workflow.
#[derive(Debug, Clone)]
pub struct WorkflowDag {
    graph: DiGraph<String, ()>,
    indices: HashMap<String, NodeIndex>,
    declaration: HashMap<String, usize>,
}

impl WorkflowDag {
    /// Builds the DAG from a workflow definition.
    ///
    /// Missing references and self-dependencies surface here as
    /// validation errors; cycles are only detectable once the whole graph
    /// is walked, so they surface from [`execution_order`].
    ///
    /// [`execution_order`]: WorkflowDag::execution_order
    pub fn from_workflow(workflow: &Workflow) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut indices = HashMap::new();
        let mut declaration = HashMap::new();

        for (position, step) in workflow.steps.iter().enumerate() {
            if indices.contains_key(&step.id) {
                return Err(ValidationError::DuplicateStepId(step.id.clone()).into());
            }
            let idx = graph.add_node(step.id.clone());
            indices.insert(step.id.clone(), idx);
            declaration.insert(step.id.clone(), position);
        }

        for step in &workflow.steps {
            let to = indices[&step.id];
            for dep in &step.depends_on {
                if dep == &step.id {
                    return Err(ValidationError::SelfDependency(step.id.clone()).into());
                }
                let from = *indices.get(dep).ok_or_else(|| {
                    EngineError::from(ValidationError::MissingDependency {
                        step_id: step.id.clone(),
                        dependency: dep.clone(),
                    })
                })?;
                graph.add_edge(from, to, ());
            }
        }

        Ok(Self {
            graph,
            indices,
            declaration,
        })
    }

    /// Number of steps in the graph.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// True when the graph has no steps.
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Computes a deterministic topological order via Kahn's algorithm.
    ///
    /// Ready nodes are emitted in declaration order, so the result is
    /// stable across runs. When the graph contains a cycle the residual
    /// (unemitted) step ids are reported.
    pub fn execution_order(&self) -> Result<Vec<String>> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|n| (n, self.graph.neighbors_directed(n, Direction::Incoming).count()))
            .collect();

        // Min-heap keyed by declaration position keeps ties deterministic.
        let mut ready: BinaryHeap<Reverse<(usize, NodeIndex)>> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| Reverse((self.declaration[&self.graph[*n]], *n)))
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(Reverse((_, node))) = ready.pop() {
            order.push(self.graph[node].clone());
            for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
                let degree = in_degree.get_mut(&next).expect("node degree tracked");
                *degree -= 1;
                if *degree == 0 {
                    ready.push(Reverse((self.declaration[&self.graph[next]], next)));
                }
            }
        }

        if order.len() != self.graph.node_count() {
            let emitted: std::collections::HashSet<&str> =
                order.iter().map(String::as_str).collect();
            let mut remaining: Vec<String> = self
                .graph
                .node_indices()
                .map(|n| self.graph[n].clone())
                .filter(|id| !emitted.contains(id.as_str()))
                .collect();
            remaining.sort_by_key(|id| self.declaration[id]);
            return Err(ValidationError::Cycle { remaining }.into());
        }

        Ok(order)
    }

    /// Dependency level of every step: 0 for roots, otherwise one more
    /// than the deepest dependency.
    pub fn levels(&self) -> Result<HashMap<String, usize>> {
        let order = self.execution_order()?;
        let mut levels: HashMap<String, usize> = HashMap::with_capacity(order.len());
        for id in &order {
            let node = self.indices[id];
            let level = self
                .graph
                .neighbors_directed(node, Direction::Incoming)
                .map(|dep| levels[&self.graph[dep]] + 1)
                .max()
                .unwrap_or(0);
            levels.insert(id.clone(), level);
        }
        Ok(levels)
    }

    /// Derives the layered parallel groups.
    ///
    /// A group's cap is the smallest of the default cap, any step-declared
    /// cap in the group, and the group size. The group resource is set
    /// only when every member names the same one.
    pub fn parallel_groups(
        &self,
        workflow: &Workflow,
        default_max_concurrency: usize,
    ) -> Result<Vec<ParallelGroup>> {
        let levels = self.levels()?;
        let group_count = levels.values().copied().max().map_or(0, |m| m + 1);
        let mut groups: Vec<Vec<&str>> = vec![Vec::new(); group_count];
        for step in &workflow.steps {
            groups[levels[&step.id]].push(&step.id);
        }

        let mut result = Vec::with_capacity(group_count);
        for (index, members) in groups.into_iter().enumerate() {
            let mut cap = default_max_concurrency.max(1).min(members.len().max(1));
            let mut resource: Option<String> = None;
            let mut uniform_resource = true;

            for (position, id) in members.iter().enumerate() {
                let step = workflow.step(id).expect("group member exists");
                if let Some(parallel) = &step.parallel {
                    if !parallel.enabled {
                        cap = 1;
                    }
                    if let Some(declared) = parallel.max_concurrency {
                        cap = cap.min(declared.max(1));
                    }
                }
                let step_resource = step
                    .parallel
                    .as_ref()
                    .and_then(|p| p.resource.as_deref());
                if position == 0 {
                    resource = step_resource.map(String::from);
                } else if resource.as_deref() != step_resource {
                    uniform_resource = false;
                }
            }
            if !uniform_resource {
                resource = None;
            }

            result.push(ParallelGroup {
                index,
                step_ids: members.into_iter().map(String::from).collect(),
                max_concurrency: cap,
                resource,
            });
        }

        Ok(result)
    }
}
