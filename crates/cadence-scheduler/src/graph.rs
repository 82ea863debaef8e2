//! Project dependency graph.

use cadence_core::ids::ProjectId;
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Cycle detected in project dependencies")]
    CycleDetected,
    #[error("Unknown project dependency: {0}")]
    UnknownDependency(String),
    #[error("Duplicate project: {0}")]
    DuplicateProject(String),
}

/// A project in the dependency graph.
#[derive(Debug, Clone)]
pub struct ProjectNode {
    pub id: ProjectId,
    pub name: String,
    pub priority: i32,
}

/// Edge from a dependency to its dependent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependencyEdge {
    /// The dependent builds against the same revision as the dependency.
    pub propagate_revision: bool,
}

/// Directed acyclic graph of "depends on" relations between projects.
///
/// Edges point from a dependency to its dependent, so walking outgoing
/// edges moves downstream.
#[derive(Debug)]
pub struct ProjectGraph {
    graph: DiGraph<ProjectNode, DependencyEdge>,
    id_to_index: HashMap<ProjectId, NodeIndex>,
    name_to_index: HashMap<String, NodeIndex>,
}

impl ProjectGraph {
    pub fn builder() -> GraphBuilder {
        GraphBuilder::new()
    }

    pub fn project(&self, id: ProjectId) -> Option<&ProjectNode> {
        self.id_to_index
            .get(&id)
            .and_then(|&idx| self.graph.node_weight(idx))
    }

    pub fn project_by_name(&self, name: &str) -> Option<&ProjectNode> {
        self.name_to_index
            .get(name)
            .and_then(|&idx| self.graph.node_weight(idx))
    }

    /// All projects in declaration order.
    pub fn projects(&self) -> Vec<&ProjectNode> {
        self.graph
            .node_indices()
            .filter_map(|idx| self.graph.node_weight(idx))
            .collect()
    }

    /// Direct dependencies of a project.
    pub fn dependencies(&self, id: ProjectId) -> Vec<(&ProjectNode, DependencyEdge)> {
        self.neighbours(id, Direction::Incoming)
    }

    /// Projects that directly depend on a project.
    pub fn dependents(&self, id: ProjectId) -> Vec<(&ProjectNode, DependencyEdge)> {
        self.neighbours(id, Direction::Outgoing)
    }

    fn neighbours(&self, id: ProjectId, direction: Direction) -> Vec<(&ProjectNode, DependencyEdge)> {
        let Some(&idx) = self.id_to_index.get(&id) else {
            return Vec::new();
        };
        let mut edges: Vec<_> = self
            .graph
            .edges_directed(idx, direction)
            .map(|e| {
                let other = match direction {
                    Direction::Incoming => e.source(),
                    Direction::Outgoing => e.target(),
                };
                (other, *e.weight())
            })
            .collect();
        edges.sort_by_key(|(other, _)| *other);
        edges
            .into_iter()
            .filter_map(|(other, edge)| self.graph.node_weight(other).map(|n| (n, edge)))
            .collect()
    }

    /// The project plus everything that transitively depends on it.
    pub fn downstream_closure(&self, id: ProjectId) -> HashSet<ProjectId> {
        self.closure(id, Direction::Outgoing)
    }

    /// The project plus everything it transitively depends on.
    pub fn upstream_closure(&self, id: ProjectId) -> HashSet<ProjectId> {
        self.closure(id, Direction::Incoming)
    }

    fn closure(&self, id: ProjectId, direction: Direction) -> HashSet<ProjectId> {
        let mut seen = HashSet::new();
        let Some(&start) = self.id_to_index.get(&id) else {
            return seen;
        };
        let mut stack = vec![start];
        while let Some(idx) = stack.pop() {
            if seen.insert(self.graph[idx].id) {
                stack.extend(self.graph.neighbors_directed(idx, direction));
            }
        }
        seen
    }

    /// Orders a subset of projects so that dependencies come first. Ties keep
    /// declaration order.
    pub fn topological_order(&self, subset: &HashSet<ProjectId>) -> Vec<&ProjectNode> {
        let members: HashSet<NodeIndex> = subset
            .iter()
            .filter_map(|id| self.id_to_index.get(id).copied())
            .collect();

        let mut in_degree: HashMap<NodeIndex, usize> = members
            .iter()
            .map(|&idx| {
                let degree = self
                    .graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .filter(|n| members.contains(n))
                    .count();
                (idx, degree)
            })
            .collect();

        let mut ready: BinaryHeap<Reverse<NodeIndex>> = in_degree
            .iter()
            .filter(|&(_, &degree)| degree == 0)
            .map(|(&idx, _)| Reverse(idx))
            .collect();

        let mut order = Vec::with_capacity(members.len());
        while let Some(Reverse(idx)) = ready.pop() {
            order.push(&self.graph[idx]);
            for next in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                if let Some(degree) = in_degree.get_mut(&next) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse(next));
                    }
                }
            }
        }
        order
    }
}

/// A dependency declared by project name.
#[derive(Debug, Clone)]
struct PendingDependency {
    dependent: String,
    dependency: String,
    propagate_revision: bool,
}

/// Builder for constructing project graphs.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    projects: Vec<ProjectNode>,
    dependencies: Vec<PendingDependency>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn project(mut self, id: ProjectId, name: impl Into<String>) -> Self {
        self.projects.push(ProjectNode {
            id,
            name: name.into(),
            priority: 0,
        });
        self
    }

    pub fn project_with_priority(
        mut self,
        id: ProjectId,
        name: impl Into<String>,
        priority: i32,
    ) -> Self {
        self.projects.push(ProjectNode {
            id,
            name: name.into(),
            priority,
        });
        self
    }

    /// Declares that `dependent` depends on `dependency`.
    pub fn dependency(
        mut self,
        dependent: impl Into<String>,
        dependency: impl Into<String>,
        propagate_revision: bool,
    ) -> Self {
        self.dependencies.push(PendingDependency {
            dependent: dependent.into(),
            dependency: dependency.into(),
            propagate_revision,
        });
        self
    }

    pub fn build(self) -> Result<ProjectGraph, GraphError> {
        let mut graph = DiGraph::new();
        let mut id_to_index = HashMap::new();
        let mut name_to_index = HashMap::new();

        // Add all projects as nodes
        for project in self.projects {
            if name_to_index.contains_key(&project.name) || id_to_index.contains_key(&project.id) {
                return Err(GraphError::DuplicateProject(project.name));
            }
            let id = project.id;
            let name = project.name.clone();
            let idx = graph.add_node(project);
            id_to_index.insert(id, idx);
            name_to_index.insert(name, idx);
        }

        // Add edges for dependencies
        for dep in self.dependencies {
            let dependent = name_to_index
                .get(&dep.dependent)
                .ok_or_else(|| GraphError::UnknownDependency(dep.dependent.clone()))?;
            let dependency = name_to_index
                .get(&dep.dependency)
                .ok_or_else(|| GraphError::UnknownDependency(dep.dependency.clone()))?;
            graph.add_edge(
                *dependency,
                *dependent,
                DependencyEdge {
                    propagate_revision: dep.propagate_revision,
                },
            );
        }

        // Verify no cycles
        toposort(&graph, None).map_err(|_| GraphError::CycleDetected)?;

        Ok(ProjectGraph {
            graph,
            id_to_index,
            name_to_index,
        })
    }
}
