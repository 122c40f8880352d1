//! Flow graph validation and linearization.
//!
//! The graph is held as flat arrays: node indices into the input slice and
//! per-node adjacency lists built from the edge list. Nodes never hold
//! references to each other.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use thiserror::Error;
use tracing::warn;

use super::types::{FlowEdge, FlowNode};

/// Reasons a flow cannot be saved or dispatched.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "code", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationError {
    #[error("flow has no start node")]
    MissingStart,

    #[error("flow has more than one start node: {}", .nodes.join(", "))]
    MultipleStarts { nodes: Vec<String> },

    #[error("duplicate node id '{node}'")]
    DuplicateNode { node: String },

    #[error("edge {source_node} -> {target_node} references unknown node '{missing}'")]
    UnknownEdgeEndpoint {
        source_node: String,
        target_node: String,
        missing: String,
    },

    #[error("flow contains a cycle through: {}", .nodes.join(", "))]
    CycleDetected { nodes: Vec<String> },

    #[error("node '{node}' references '{source_node}', which does not run before it")]
    ForwardReference { node: String, source_node: String },

    #[error("node '{node}' references unknown node '{source_node}'")]
    UnknownReferenceSource { node: String, source_node: String },

    #[error("template for '{param_path}' on node '{node}' uses {{value}} {count} times")]
    TemplatePlaceholders {
        node: String,
        param_path: String,
        count: usize,
    },
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::MissingStart => "MISSING_START",
            ValidationError::MultipleStarts { .. } => "MULTIPLE_STARTS",
            ValidationError::DuplicateNode { .. } => "DUPLICATE_NODE",
            ValidationError::UnknownEdgeEndpoint { .. } => "UNKNOWN_EDGE_ENDPOINT",
            ValidationError::CycleDetected { .. } => "CYCLE_DETECTED",
            ValidationError::ForwardReference { .. } => "FORWARD_REFERENCE",
            ValidationError::UnknownReferenceSource { .. } => "UNKNOWN_REFERENCE_SOURCE",
            ValidationError::TemplatePlaceholders { .. } => "TEMPLATE_PLACEHOLDERS",
        }
    }

    /// Structured report naming the offending nodes.
    pub fn report(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self)
            .unwrap_or_else(|_| serde_json::json!({ "code": self.code() }));
        if let Some(obj) = value.as_object_mut() {
            obj.insert("message".into(), self.to_string().into());
        }
        value
    }
}

/// Deterministic execution order of a flow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinearOrder {
    /// Node ids in execution order, orphans last.
    pub nodes: Vec<String>,
    /// Nodes with no path from `start`, in input order.
    pub orphans: Vec<String>,
}

impl LinearOrder {
    /// Position of a node in the order.
    pub fn position(&self, node_id: &str) -> Option<usize> {
        self.nodes.iter().position(|id| id == node_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Index-based view over a flow's nodes and edges.
#[derive(Debug)]
pub struct FlowGraph<'a> {
    nodes: &'a [FlowNode],
    start: usize,
    /// Successor indices per node, in edge insertion order.
    outgoing: Vec<Vec<usize>>,
    in_degree: Vec<usize>,
}

impl<'a> FlowGraph<'a> {
    /// Build the graph, checking structure before anything else.
    pub fn build(nodes: &'a [FlowNode], edges: &[FlowEdge]) -> Result<Self, ValidationError> {
        let mut index: HashMap<&str, usize> = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if index.insert(node.id(), i).is_some() {
                return Err(ValidationError::DuplicateNode {
                    node: node.id().to_string(),
                });
            }
        }

        let starts: Vec<usize> = nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| matches!(n, FlowNode::Start { .. }))
            .map(|(i, _)| i)
            .collect();
        let start = match starts.as_slice() {
            [] => return Err(ValidationError::MissingStart),
            [only] => *only,
            many => {
                return Err(ValidationError::MultipleStarts {
                    nodes: many.iter().map(|&i| nodes[i].id().to_string()).collect(),
                })
            }
        };

        let mut outgoing = vec![Vec::new(); nodes.len()];
        let mut in_degree = vec![0; nodes.len()];
        for edge in edges {
            let lookup = |id: &str| {
                index
                    .get(id)
                    .copied()
                    .ok_or_else(|| ValidationError::UnknownEdgeEndpoint {
                        source_node: edge.source.clone(),
                        target_node: edge.target.clone(),
                        missing: id.to_string(),
                    })
            };
            let from = lookup(&edge.source)?;
            let to = lookup(&edge.target)?;
            outgoing[from].push(to);
            in_degree[to] += 1;
        }

        Ok(Self {
            nodes,
            start,
            outgoing,
            in_degree,
        })
    }

    /// Kahn's algorithm over the whole graph.
    ///
    /// Nodes left with a non-zero in-degree sit on or behind a cycle.
    pub fn check_acyclic(&self) -> Result<(), ValidationError> {
        let mut remaining = self.in_degree.clone();
        let mut queue: VecDeque<usize> = (0..self.nodes.len())
            .filter(|&i| remaining[i] == 0)
            .collect();
        let mut removed = 0;

        while let Some(i) = queue.pop_front() {
            removed += 1;
            for &next in &self.outgoing[i] {
                remaining[next] -= 1;
                if remaining[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if removed == self.nodes.len() {
            return Ok(());
        }

        let unresolved = (0..self.nodes.len())
            .filter(|&i| remaining[i] > 0)
            .map(|i| self.nodes[i].id().to_string())
            .collect();
        Err(ValidationError::CycleDetected { nodes: unresolved })
    }

    /// Linear order of an acyclic graph.
    ///
    /// Breadth-first from `start`, in edge insertion order; a reachable node
    /// is released once all of its reachable predecessors have been placed.
    /// Unreachable nodes follow in input order.
    pub fn linearize(&self) -> LinearOrder {
        let reachable = self.reachable();

        let mut waiting = vec![0usize; self.nodes.len()];
        for (from, targets) in self.outgoing.iter().enumerate() {
            if reachable[from] {
                for &to in targets {
                    waiting[to] += 1;
                }
            }
        }

        let mut order = Vec::with_capacity(self.nodes.len());
        let mut queue = VecDeque::from([self.start]);
        while let Some(i) = queue.pop_front() {
            order.push(self.nodes[i].id().to_string());
            for &next in &self.outgoing[i] {
                waiting[next] -= 1;
                if waiting[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        let mut orphans = Vec::new();
        for (i, node) in self.nodes.iter().enumerate() {
            if !reachable[i] {
                warn!(
                    node_id = %node.id(),
                    "Node is not reachable from start, appending to end of execution order"
                );
                orphans.push(node.id().to_string());
            }
        }
        order.extend(orphans.iter().cloned());

        LinearOrder {
            nodes: order,
            orphans,
        }
    }

    fn reachable(&self) -> Vec<bool> {
        let mut seen = vec![false; self.nodes.len()];
        let mut queue = VecDeque::from([self.start]);
        seen[self.start] = true;
        while let Some(i) = queue.pop_front() {
            for &next in &self.outgoing[i] {
                if !seen[next] {
                    seen[next] = true;
                    queue.push_back(next);
                }
            }
        }
        seen
    }
}

/// Validate the graph structure and derive its execution order.
pub fn validate(nodes: &[FlowNode], edges: &[FlowEdge]) -> Result<LinearOrder, ValidationError> {
    let graph = FlowGraph::build(nodes, edges)?;
    graph.check_acyclic()?;
    Ok(graph.linearize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::types::{AssertionNodeData, FlowNode};

    fn start(id: &str) -> FlowNode {
        FlowNode::Start { id: id.into() }
    }

    fn end(id: &str) -> FlowNode {
        FlowNode::End { id: id.into() }
    }

    fn step(id: &str) -> FlowNode {
        FlowNode::Assertion {
            id: id.into(),
            data: AssertionNodeData {
                name: None,
                assertions: vec![],
            },
        }
    }

    fn edges(pairs: &[(&str, &str)]) -> Vec<FlowEdge> {
        pairs.iter().map(|(s, t)| FlowEdge::new(*s, *t)).collect()
    }

    fn assert_edges_respected(order: &LinearOrder, edges: &[FlowEdge]) {
        for e in edges {
            let (a, b) = (order.position(&e.source), order.position(&e.target));
            assert!(a < b, "edge {} -> {} out of order: {:?}", e.source, e.target, order);
        }
    }

    #[test]
    fn test_chain() {
        let nodes = vec![end("end"), step("b"), start("start"), step("a")];
        let edges = edges(&[("start", "a"), ("a", "b"), ("b", "end")]);
        let order = validate(&nodes, &edges).unwrap();
        assert_eq!(order.nodes, vec!["start", "a", "b", "end"]);
        assert!(order.orphans.is_empty());
    }

    #[test]
    fn test_branches_follow_edge_insertion_order() {
        let nodes = vec![start("start"), step("x"), step("y"), end("end")];
        let edges = edges(&[("start", "y"), ("start", "x"), ("x", "end"), ("y", "end")]);
        let order = validate(&nodes, &edges).unwrap();
        assert_eq!(order.nodes, vec!["start", "y", "x", "end"]);
    }

    #[test]
    fn test_join_waits_for_all_reachable_predecessors() {
        // Plain first-visit BFS would place c before b here.
        let nodes = vec![start("start"), step("a"), step("b"), step("c")];
        let edges = edges(&[("start", "a"), ("start", "c"), ("a", "b"), ("b", "c")]);
        let order = validate(&nodes, &edges).unwrap();
        assert_eq!(order.nodes, vec!["start", "a", "b", "c"]);
        assert_edges_respected(&order, &edges);
    }

    #[test]
    fn test_orphans_appended_in_input_order() {
        let nodes = vec![
            step("lonely_2"),
            start("start"),
            step("a"),
            step("lonely_1"),
            end("end"),
        ];
        let edges = edges(&[("start", "a"), ("a", "end")]);
        let order = validate(&nodes, &edges).unwrap();
        assert_eq!(
            order.nodes,
            vec!["start", "a", "end", "lonely_2", "lonely_1"]
        );
        assert_eq!(order.orphans, vec!["lonely_2", "lonely_1"]);
    }

    #[test]
    fn test_unreachable_edge_does_not_reorder_reachable_nodes() {
        let nodes = vec![start("start"), step("a"), step("island")];
        let edges = edges(&[("start", "a"), ("island", "a")]);
        let order = validate(&nodes, &edges).unwrap();
        assert_eq!(order.nodes, vec!["start", "a", "island"]);
        assert_eq!(order.orphans, vec!["island"]);
    }

    #[test]
    fn test_cycle_detected() {
        let nodes = vec![start("start"), step("a"), step("b"), step("c"), end("end")];
        let edges = edges(&[
            ("start", "a"),
            ("a", "b"),
            ("b", "c"),
            ("c", "a"),
            ("c", "end"),
        ]);
        let err = validate(&nodes, &edges).unwrap_err();
        match err {
            ValidationError::CycleDetected { nodes } => {
                assert!(nodes.contains(&"a".to_string()));
                assert!(nodes.contains(&"b".to_string()));
                assert!(nodes.contains(&"c".to_string()));
                assert!(!nodes.contains(&"start".to_string()));
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_cycle_among_orphans_detected() {
        let nodes = vec![start("start"), step("p"), step("q")];
        let edges = edges(&[("p", "q"), ("q", "p")]);
        assert!(matches!(
            validate(&nodes, &edges),
            Err(ValidationError::CycleDetected { .. })
        ));
    }

    #[test]
    fn test_self_loop_is_cycle() {
        let nodes = vec![start("start"), step("a")];
        let edges = edges(&[("start", "a"), ("a", "a")]);
        assert!(matches!(
            validate(&nodes, &edges),
            Err(ValidationError::CycleDetected { .. })
        ));
    }

    #[test]
    fn test_structural_errors() {
        let no_start = vec![step("a")];
        assert_eq!(
            validate(&no_start, &[]).unwrap_err(),
            ValidationError::MissingStart
        );

        let two_starts = vec![start("s1"), start("s2")];
        assert!(matches!(
            validate(&two_starts, &[]),
            Err(ValidationError::MultipleStarts { .. })
        ));

        let dup = vec![start("start"), step("a"), step("a")];
        assert_eq!(
            validate(&dup, &[]).unwrap_err(),
            ValidationError::DuplicateNode { node: "a".into() }
        );

        let nodes = vec![start("start")];
        let err = validate(&nodes, &edges(&[("start", "ghost")])).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::UnknownEdgeEndpoint { ref missing, .. } if missing == "ghost"
        ));
    }

    #[test]
    fn test_random_dags_respect_every_edge() {
        // Small linear congruential generator keeps the test deterministic.
        let mut seed: u64 = 0x5eed;
        let mut next = move |bound: usize| {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((seed >> 33) as usize) % bound
        };

        for _ in 0..200 {
            let count = 2 + next(10);
            let mut nodes = vec![start("n0")];
            for i in 1..count {
                nodes.push(step(&format!("n{}", i)));
            }
            // Edges only go from lower to higher index, so the graph is acyclic.
            let mut edge_list = Vec::new();
            for _ in 0..next(count * 2 + 1) {
                let a = next(count);
                let b = next(count);
                if a < b {
                    edge_list.push(FlowEdge::new(format!("n{}", a), format!("n{}", b)));
                }
            }

            let order = validate(&nodes, &edge_list).unwrap();
            assert_eq!(order.len(), count);
            let mut sorted = order.nodes.clone();
            sorted.sort();
            sorted.dedup();
            assert_eq!(sorted.len(), count, "duplicate node in {:?}", order);

            for e in &edge_list {
                let from_orphan = order.orphans.contains(&e.source);
                if !from_orphan {
                    assert!(order.position(&e.source) < order.position(&e.target));
                }
            }
        }
    }

    #[test]
    fn test_error_report_is_structured() {
        let err = ValidationError::CycleDetected {
            nodes: vec!["a".into(), "b".into()],
        };
        let report = err.report();
        assert_eq!(report["code"], "CYCLE_DETECTED");
        assert_eq!(report["nodes"][1], "b");
        assert!(report["message"].as_str().unwrap().contains("a, b"));
    }
}
