//! Dependency graph for stacks
//!
//! Builds the graph implied by each stack's upstream references, rejects
//! cycles and dangling references, and produces a deterministic execution
//! order. Uses petgraph for graph operations.

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use thiserror::Error;

use super::id::StackName;
use super::stack::{Stack, StackStatus};

#[derive(Debug, Error, PartialEq)]
pub enum GraphError {
    #[error("Cyclic dependency between stacks: {}", format_names(.0))]
    CyclicDependency(Vec<StackName>),

    #[error("Stack '{stack}' references undeclared stack '{reference}'")]
    UnknownStackReference {
        stack: StackName,
        reference: StackName,
    },

    #[error("Stack '{0}' is declared more than once")]
    DuplicateStack(StackName),

    #[error("Stack not found: {0}")]
    StackNotFound(StackName),
}

fn format_names(names: &[StackName]) -> String {
    names
        .iter()
        .map(StackName::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// A dependency graph over stack declarations
///
/// Edges point from a producing stack to its consumers, so "upstream must be
/// applied before downstream". Node indices follow declaration order, which
/// is the tie-break for independent stacks.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// The underlying directed graph
    graph: DiGraph<StackName, ()>,

    /// Map from stack name to node index
    node_map: HashMap<StackName, NodeIndex>,
}

impl DependencyGraph {
    /// Creates an empty dependency graph
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            node_map: HashMap::new(),
        }
    }

    /// Builds and validates a graph from stack declarations
    ///
    /// Fails on duplicate names, references to undeclared stacks, or cycles.
    pub fn from_stacks<'a>(stacks: impl IntoIterator<Item = &'a Stack>) -> Result<Self, GraphError> {
        let mut graph = Self::new();

        // First pass: add all nodes in declaration order
        let stacks: Vec<_> = stacks.into_iter().collect();
        for stack in &stacks {
            if !graph.add_stack(stack.name.clone()) {
                return Err(GraphError::DuplicateStack(stack.name.clone()));
            }
        }

        // Second pass: add all edges
        for stack in &stacks {
            for upstream in stack.dependencies() {
                graph.add_dependency(&stack.name, upstream)?;
            }
        }

        graph.check_acyclic()?;

        Ok(graph)
    }

    /// Adds a stack to the graph, returning false if it was already present
    pub fn add_stack(&mut self, name: StackName) -> bool {
        if self.node_map.contains_key(&name) {
            return false;
        }
        let idx = self.graph.add_node(name.clone());
        self.node_map.insert(name, idx);
        true
    }

    /// Adds a dependency edge: `stack` reads outputs of `upstream`
    ///
    /// Cycles are not rejected here; [`DependencyGraph::from_stacks`] checks
    /// the whole graph once all edges are in place.
    pub fn add_dependency(&mut self, stack: &StackName, upstream: &StackName) -> Result<(), GraphError> {
        let stack_idx = *self
            .node_map
            .get(stack)
            .ok_or_else(|| GraphError::StackNotFound(stack.clone()))?;

        let upstream_idx = *self
            .node_map
            .get(upstream)
            .ok_or_else(|| GraphError::UnknownStackReference {
                stack: stack.clone(),
                reference: upstream.clone(),
            })?;

        if self.graph.find_edge(upstream_idx, stack_idx).is_none() {
            self.graph.add_edge(upstream_idx, stack_idx, ());
        }

        Ok(())
    }

    /// Fails with every stack that participates in a cycle
    pub fn check_acyclic(&self) -> Result<(), GraphError> {
        let mut cyclic: Vec<NodeIndex> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|component| {
                component.len() > 1
                    || component
                        .first()
                        .is_some_and(|idx| self.graph.find_edge(*idx, *idx).is_some())
            })
            .flatten()
            .collect();

        if cyclic.is_empty() {
            return Ok(());
        }

        cyclic.sort();
        Err(GraphError::CyclicDependency(
            cyclic.into_iter().map(|idx| self.graph[idx].clone()).collect(),
        ))
    }

    /// Returns all stacks in execution order (dependencies before dependents)
    ///
    /// Kahn's algorithm with a min-heap on declaration index, so among stacks
    /// that are ready at the same time the first declared runs first.
    pub fn execution_order(&self) -> Result<Vec<StackName>, GraphError> {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .count()
            })
            .collect();

        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());

        while let Some(Reverse(i)) = ready.pop() {
            let idx = NodeIndex::new(i);
            order.push(self.graph[idx].clone());

            for next in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                let degree = &mut in_degree[next.index()];
                *degree -= 1;
                if *degree == 0 {
                    ready.push(Reverse(next.index()));
                }
            }
        }

        if order.len() != self.graph.node_count() {
            self.check_acyclic()?;
        }

        Ok(order)
    }

    /// Returns stacks that can start now: pending, with every dependency applied
    ///
    /// Dependencies missing from `statuses` are treated as applied: they are
    /// outside the current run and their outputs come from earlier runs.
    pub fn ready_stacks(&self, statuses: &HashMap<StackName, StackStatus>) -> Vec<StackName> {
        let mut ready: Vec<_> = self
            .graph
            .node_indices()
            .filter(|idx| {
                let name = &self.graph[*idx];
                if statuses.get(name) != Some(&StackStatus::Pending) {
                    return false;
                }

                self.graph
                    .neighbors_directed(*idx, Direction::Incoming)
                    .all(|dep| {
                        statuses
                            .get(&self.graph[dep])
                            .map(|s| *s == StackStatus::Applied)
                            .unwrap_or(true)
                    })
            })
            .collect();

        ready.sort();
        ready.into_iter().map(|idx| self.graph[idx].clone()).collect()
    }

    /// Returns the direct dependencies of a stack, in declaration order
    pub fn dependencies(&self, stack: &StackName) -> Vec<StackName> {
        self.neighbors(stack, Direction::Incoming)
    }

    /// Returns the direct dependents of a stack (stacks that read its outputs)
    pub fn dependents(&self, stack: &StackName) -> Vec<StackName> {
        self.neighbors(stack, Direction::Outgoing)
    }

    fn neighbors(&self, stack: &StackName, direction: Direction) -> Vec<StackName> {
        let idx = match self.node_map.get(stack) {
            Some(idx) => *idx,
            None => return vec![],
        };

        let mut neighbors: Vec<_> = self.graph.neighbors_directed(idx, direction).collect();
        neighbors.sort();
        neighbors.into_iter().map(|n| self.graph[n].clone()).collect()
    }

    /// Returns every stack that depends on `stack`, directly or transitively
    pub fn transitive_dependents(&self, stack: &StackName) -> Vec<StackName> {
        let start = match self.node_map.get(stack) {
            Some(idx) => *idx,
            None => return vec![],
        };

        let mut found = Vec::new();
        let mut bfs = Bfs::new(&self.graph, start);
        while let Some(idx) = bfs.next(&self.graph) {
            if idx != start {
                found.push(idx);
            }
        }

        found.sort();
        found.into_iter().map(|idx| self.graph[idx].clone()).collect()
    }

    /// Returns true if the graph contains the stack
    pub fn contains(&self, stack: &StackName) -> bool {
        self.node_map.contains_key(stack)
    }

    /// Returns the number of stacks in the graph
    pub fn len(&self) -> usize {
        self.node_map.len()
    }

    /// Returns true if the graph is empty
    pub fn is_empty(&self) -> bool {
        self.node_map.is_empty()
    }

    /// Returns all stack names in declaration order
    pub fn stack_names(&self) -> impl Iterator<Item = &StackName> {
        self.graph.node_indices().map(move |idx| &self.graph[idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::stack::StackReference;

    fn name(s: &str) -> StackName {
        StackName::new(s).unwrap()
    }

    fn stack(n: &str, deps: &[&str]) -> Stack {
        deps.iter().fold(Stack::new(name(n)), |s, d| {
            s.with_input(StackReference::new(name(d)))
        })
    }

    fn position(order: &[StackName], n: &str) -> usize {
        order.iter().position(|s| s.as_str() == n).unwrap()
    }

    /// The repository's real topology
    fn repo_stacks() -> Vec<Stack> {
        vec![
            stack("vpc", &[]),
            stack("aurora", &["vpc"]),
            stack("ecs", &["vpc", "aurora"]),
            stack("certificates", &[]),
            stack("load_balancer", &["vpc", "certificates"]),
            stack("users-api", &["vpc", "ecs", "load_balancer", "aurora"]),
            stack("reviews-api", &["vpc", "ecs", "load_balancer", "aurora"]),
            stack("github", &[]),
        ]
    }

    #[test]
    fn empty_graph() {
        let graph = DependencyGraph::new();
        assert!(graph.is_empty());
        assert_eq!(graph.len(), 0);
        assert!(graph.execution_order().unwrap().is_empty());
    }

    #[test]
    fn add_stacks() {
        let mut graph = DependencyGraph::new();
        assert!(graph.add_stack(name("vpc")));
        assert!(graph.add_stack(name("ecs")));
        assert!(!graph.add_stack(name("vpc")));

        assert_eq!(graph.len(), 2);
        assert!(graph.contains(&name("vpc")));
    }

    #[test]
    fn add_dependency() {
        let mut graph = DependencyGraph::new();
        graph.add_stack(name("vpc"));
        graph.add_stack(name("ecs"));

        graph.add_dependency(&name("ecs"), &name("vpc")).unwrap();

        assert_eq!(graph.dependencies(&name("ecs")), vec![name("vpc")]);
        assert_eq!(graph.dependents(&name("vpc")), vec![name("ecs")]);
    }

    #[test]
    fn example_order() {
        let stacks = vec![
            stack("vpc", &[]),
            stack("ecs", &["vpc", "aurora"]),
            stack("reviews-api", &["ecs"]),
            stack("users-api", &["ecs"]),
            stack("aurora", &["vpc"]),
        ];
        let graph = DependencyGraph::from_stacks(&stacks).unwrap();
        let order = graph.execution_order().unwrap();

        assert_eq!(order[0], name("vpc"));
        assert!(position(&order, "aurora") < position(&order, "ecs"));
        assert!(position(&order, "ecs") < position(&order, "reviews-api"));
        assert!(position(&order, "ecs") < position(&order, "users-api"));
    }

    #[test]
    fn ties_break_by_declaration_order() {
        let stacks = repo_stacks();
        let graph = DependencyGraph::from_stacks(&stacks).unwrap();
        let order: Vec<_> = graph
            .execution_order()
            .unwrap()
            .into_iter()
            .map(String::from)
            .collect();

        assert_eq!(
            order,
            vec![
                "vpc",
                "aurora",
                "ecs",
                "certificates",
                "load_balancer",
                "users-api",
                "reviews-api",
                "github"
            ]
        );
    }

    #[test]
    fn order_is_stable_across_builds() {
        let first = DependencyGraph::from_stacks(&repo_stacks())
            .unwrap()
            .execution_order()
            .unwrap();
        let second = DependencyGraph::from_stacks(&repo_stacks())
            .unwrap()
            .execution_order()
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn cycle_detection_names_participants() {
        let stacks = vec![
            stack("vpc", &[]),
            stack("ecs", &["aurora"]),
            stack("aurora", &["users-api"]),
            stack("users-api", &["ecs", "vpc"]),
            stack("github", &[]),
        ];

        let result = DependencyGraph::from_stacks(&stacks);
        assert_eq!(
            result.unwrap_err(),
            GraphError::CyclicDependency(vec![name("ecs"), name("aurora"), name("users-api")])
        );
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let stacks = vec![stack("vpc", &["vpc"])];
        assert_eq!(
            DependencyGraph::from_stacks(&stacks).unwrap_err(),
            GraphError::CyclicDependency(vec![name("vpc")])
        );
    }

    #[test]
    fn unknown_reference_returns_error() {
        let stacks = vec![stack("ecs", &["vpc"])];
        assert_eq!(
            DependencyGraph::from_stacks(&stacks).unwrap_err(),
            GraphError::UnknownStackReference {
                stack: name("ecs"),
                reference: name("vpc"),
            }
        );
    }

    #[test]
    fn duplicate_stack_returns_error() {
        let stacks = vec![stack("vpc", &[]), stack("vpc", &[])];
        assert_eq!(
            DependencyGraph::from_stacks(&stacks).unwrap_err(),
            GraphError::DuplicateStack(name("vpc"))
        );
    }

    #[test]
    fn ready_stacks() {
        let graph = DependencyGraph::from_stacks(&repo_stacks()).unwrap();
        let mut statuses: HashMap<_, _> = graph
            .stack_names()
            .map(|n| (n.clone(), StackStatus::Pending))
            .collect();

        let ready = graph.ready_stacks(&statuses);
        assert_eq!(ready, vec![name("vpc"), name("certificates"), name("github")]);

        statuses.insert(name("vpc"), StackStatus::Applied);
        let ready = graph.ready_stacks(&statuses);
        assert_eq!(ready, vec![name("aurora"), name("certificates"), name("github")]);
    }

    #[test]
    fn ready_treats_missing_dependencies_as_applied() {
        let graph = DependencyGraph::from_stacks(&repo_stacks()).unwrap();
        let mut statuses = HashMap::new();
        statuses.insert(name("ecs"), StackStatus::Pending);

        assert_eq!(graph.ready_stacks(&statuses), vec![name("ecs")]);
    }

    #[test]
    fn transitive_dependents() {
        let graph = DependencyGraph::from_stacks(&repo_stacks()).unwrap();
        let dependents = graph.transitive_dependents(&name("aurora"));

        assert_eq!(dependents, vec![name("ecs"), name("users-api"), name("reviews-api")]);
        assert!(!dependents.contains(&name("certificates")));
    }

    #[test]
    fn performance_500_stacks() {
        use std::time::Instant;

        let stacks: Vec<_> = (0..500)
            .map(|i| {
                let s = Stack::new(name(&format!("s{}", i)));
                if i == 0 {
                    s
                } else {
                    s.with_input(StackReference::new(name(&format!("s{}", i - 1))))
                }
            })
            .collect();

        let start = Instant::now();
        let graph = DependencyGraph::from_stacks(&stacks).unwrap();
        let order = graph.execution_order().unwrap();
        let duration = start.elapsed();

        assert_eq!(order.len(), 500);
        assert!(duration.as_millis() < 200, "Ordering took {:?}", duration);
    }
}
