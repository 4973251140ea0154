use crate::error::EngineError;
use crate::types::{WorkflowDefinition, WorkflowNode};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Topo;
use petgraph::Direction;
use std::collections::HashMap;

/// DAG representation of a workflow
#[derive(Debug)]
pub struct WorkflowDag {
    graph: DiGraph<WorkflowNode, ()>,
    node_indices: HashMap<String, NodeIndex>,
    order: Vec<NodeIndex>,
}

impl WorkflowDag {
    /// Build a DAG from a workflow definition
    pub fn from_workflow(workflow: &WorkflowDefinition) -> Result<Self, EngineError> {
        let invalid = |reason: String| EngineError::InvalidWorkflow {
            workflow_id: workflow.id.to_string(),
            reason,
        };

        let mut graph = DiGraph::new();
        let mut node_indices = HashMap::new();

        // Add all nodes, in definition order
        for node in &workflow.nodes {
            if node.id.is_empty() {
                return Err(invalid("node with empty id".to_string()));
            }
            if node_indices.contains_key(&node.id) {
                return Err(invalid(format!("duplicate node id '{}'", node.id)));
            }
            let index = graph.add_node(node.clone());
            node_indices.insert(node.id.clone(), index);
        }

        // Edge from source to target; parallel edges collapse into one dependency
        for edge in &workflow.edges {
            let source = node_indices.get(&edge.source).ok_or_else(|| {
                invalid(format!("edge references unknown source node '{}'", edge.source))
            })?;
            let target = node_indices.get(&edge.target).ok_or_else(|| {
                invalid(format!("edge references unknown target node '{}'", edge.target))
            })?;
            graph.update_edge(*source, *target, ());
        }

        // Verify the graph is acyclic
        if petgraph::algo::is_cyclic_directed(&graph) {
            return Err(EngineError::CyclicGraph {
                workflow_id: workflow.id.to_string(),
            });
        }

        let mut order = Vec::with_capacity(graph.node_count());
        let mut topo = Topo::new(&graph);
        while let Some(index) = topo.next(&graph) {
            order.push(index);
        }

        Ok(Self {
            graph,
            node_indices,
            order,
        })
    }

    /// Nodes in topological order (dependencies first)
    pub fn topological_order(&self) -> impl Iterator<Item = &WorkflowNode> + '_ {
        self.order.iter().map(|index| &self.graph[*index])
    }

    pub fn node(&self, node_id: &str) -> Option<&WorkflowNode> {
        self.node_indices.get(node_id).map(|index| &self.graph[*index])
    }

    /// Direct predecessors of a node, in topological visit order
    pub fn predecessors(&self, node_id: &str) -> Vec<&WorkflowNode> {
        self.neighbors(node_id, Direction::Incoming)
    }

    /// Direct successors of a node, in topological visit order
    pub fn successors(&self, node_id: &str) -> Vec<&WorkflowNode> {
        self.neighbors(node_id, Direction::Outgoing)
    }

    fn neighbors(&self, node_id: &str, direction: Direction) -> Vec<&WorkflowNode> {
        let Some(index) = self.node_indices.get(node_id) else {
            return Vec::new();
        };

        let mut neighbors: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(*index, direction)
            .collect();
        neighbors.sort_by_key(|n| self.position(*n));
        neighbors.into_iter().map(|n| &self.graph[n]).collect()
    }

    fn position(&self, index: NodeIndex) -> usize {
        self.order
            .iter()
            .position(|i| *i == index)
            .unwrap_or(usize::MAX)
    }

    /// Whether the node has no incoming edges
    pub fn is_entry(&self, node_id: &str) -> bool {
        self.node_indices
            .get(node_id)
            .map(|index| {
                self.graph
                    .neighbors_directed(*index, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .unwrap_or(false)
    }

    /// All nodes with no dependencies
    pub fn entry_nodes(&self) -> Vec<&WorkflowNode> {
        self.topological_order()
            .filter(|node| self.is_entry(&node.id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{WorkflowEdge, WorkflowId};
    use proptest::prelude::*;

    fn workflow(nodes: &[&str], edges: &[(&str, &str)]) -> WorkflowDefinition {
        WorkflowDefinition {
            id: WorkflowId::new("wf"),
            name: String::new(),
            nodes: nodes.iter().map(|id| WorkflowNode::new(*id, "no-op")).collect(),
            edges: edges
                .iter()
                .map(|(source, target)| WorkflowEdge::new(*source, *target))
                .collect(),
        }
    }

    fn ids<'a>(nodes: impl IntoIterator<Item = &'a WorkflowNode>) -> Vec<&'a str> {
        nodes.into_iter().map(|n| n.id.as_str()).collect()
    }

    #[test]
    fn test_linear_dag() {
        let dag = WorkflowDag::from_workflow(&workflow(
            &["c", "b", "a"],
            &[("a", "b"), ("b", "c")],
        ))
        .unwrap();

        assert_eq!(ids(dag.topological_order()), vec!["a", "b", "c"]);
        assert_eq!(ids(dag.entry_nodes()), vec!["a"]);
    }

    #[test]
    fn test_diamond_dag() {
        let dag = WorkflowDag::from_workflow(&workflow(
            &["a", "b", "c", "d"],
            &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")],
        ))
        .unwrap();

        let order = ids(dag.topological_order());
        let preds = ids(dag.predecessors("d"));
        assert_eq!(preds.len(), 2);

        // Predecessors follow visit order
        let pos = |id: &str| order.iter().position(|n| *n == id).unwrap();
        assert!(pos(preds[0]) < pos(preds[1]));
        assert_eq!(dag.successors("a").len(), 2);
        assert!(dag.is_entry("a"));
        assert!(!dag.is_entry("d"));
    }

    #[test]
    fn test_duplicate_edges_collapse() {
        let dag =
            WorkflowDag::from_workflow(&workflow(&["a", "b"], &[("a", "b"), ("a", "b")])).unwrap();
        assert_eq!(ids(dag.predecessors("b")), vec!["a"]);
    }

    #[test]
    fn test_cyclic_dag_rejected() {
        let result = WorkflowDag::from_workflow(&workflow(&["a", "b"], &[("a", "b"), ("b", "a")]));
        assert!(matches!(result, Err(EngineError::CyclicGraph { .. })));

        let result = WorkflowDag::from_workflow(&workflow(&["a"], &[("a", "a")]));
        assert!(matches!(result, Err(EngineError::CyclicGraph { .. })));
    }

    #[test]
    fn test_structural_errors() {
        let result = WorkflowDag::from_workflow(&workflow(&["a", "a"], &[]));
        assert!(matches!(result, Err(EngineError::InvalidWorkflow { .. })));

        let err = WorkflowDag::from_workflow(&workflow(&["a"], &[("a", "ghost")])).unwrap_err();
        assert!(err.to_string().contains("ghost"));
        assert!(err.is_definition_error());
    }

    #[test]
    fn test_empty_workflow() {
        let dag = WorkflowDag::from_workflow(&workflow(&[], &[])).unwrap();
        assert!(dag.is_empty());
        assert_eq!(dag.topological_order().count(), 0);
    }

    /// Random DAG: nodes are shuffled in the definition, edges only point
    /// from a lower rank to a higher rank so the graph is always acyclic.
    fn arb_dag() -> impl Strategy<Value = (Vec<usize>, Vec<(usize, usize)>)> {
        (1usize..16).prop_flat_map(|n| {
            let ranks = Just((0..n).collect::<Vec<_>>()).prop_shuffle();
            let edges = proptest::collection::vec((0..n, 0..n), 0..n * 2).prop_map(|pairs| {
                pairs
                    .into_iter()
                    .filter(|(a, b)| a != b)
                    .map(|(a, b)| (a.min(b), a.max(b)))
                    .collect::<Vec<_>>()
            });
            (ranks, edges)
        })
    }

    proptest! {
        #[test]
        fn prop_topological_order_visits_every_node_once((ranks, edges) in arb_dag()) {
            let definition = WorkflowDefinition {
                id: WorkflowId::new("wf"),
                name: String::new(),
                nodes: ranks.iter().map(|r| WorkflowNode::new(format!("n{}", r), "no-op")).collect(),
                edges: edges
                    .iter()
                    .map(|(a, b)| WorkflowEdge::new(format!("n{}", a), format!("n{}", b)))
                    .collect(),
            };

            let dag = WorkflowDag::from_workflow(&definition).unwrap();
            let order: Vec<String> = dag.topological_order().map(|n| n.id.clone()).collect();

            prop_assert_eq!(order.len(), ranks.len());
            let mut unique = order.clone();
            unique.sort();
            unique.dedup();
            prop_assert_eq!(unique.len(), ranks.len());

            let pos = |id: &str| order.iter().position(|n| n == id).unwrap();
            for edge in &definition.edges {
                prop_assert!(pos(&edge.source) < pos(&edge.target));
            }
        }
    }
}
