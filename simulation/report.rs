//! Post-convergence reporting.

use serde::Serialize;

use spantree_protocol::{properties, NodeActor, NodeId, NodeSnapshot, Topology};

/// One agreed spanning-tree edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReportEdge {
    /// Smaller endpoint.
    pub a: NodeId,
    /// Larger endpoint.
    pub b: NodeId,
    /// Raw edge cost.
    pub cost: u64,
}

/// Outcome of one simulation run.
#[derive(Debug, Clone, Serialize)]
pub struct MstReport {
    /// Number of participating nodes.
    pub node_count: usize,
    /// Edges classified `Branch` at both endpoints, ascending by weight.
    pub edges: Vec<ReportEdge>,
    /// Sum of the agreed edges' costs.
    pub total_cost: u64,
    /// Whether the agreed edges span every node without a cycle.
    pub is_spanning_tree: bool,
    /// Whether the agreed edges equal the sequential Kruskal reference.
    pub matches_reference: bool,
    /// Protocol messages handled across all nodes.
    pub messages_delivered: usize,
    /// Final per-node state.
    pub nodes: Vec<NodeSnapshot>,
}

impl MstReport {
    /// Assemble the report from the final actor states.
    pub fn build(topology: &Topology, actors: &[NodeActor], messages_delivered: usize) -> Self {
        let agreed = properties::agreed_branches(actors.iter());
        let reference = properties::reference_mst(topology);
        let edges = agreed
            .iter()
            .map(|edge| {
                let (a, b) = edge.endpoints();
                ReportEdge {
                    a,
                    b,
                    cost: edge.weight().cost().unwrap_or(0),
                }
            })
            .collect();
        Self {
            node_count: topology.node_count(),
            edges,
            total_cost: properties::total_cost(&agreed),
            is_spanning_tree: properties::is_spanning_tree(topology, &agreed),
            matches_reference: agreed == reference,
            messages_delivered,
            nodes: actors.iter().map(NodeActor::snapshot).collect(),
        }
    }

    /// Human-readable rendering, one edge per line.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "minimum spanning tree over {} nodes ({} messages):\n",
            self.node_count, self.messages_delivered
        ));
        for edge in &self.edges {
            out.push_str(&format!("  {} - {}  cost {}\n", edge.a, edge.b, edge.cost));
        }
        out.push_str(&format!("total cost: {}\n", self.total_cost));
        if !self.is_spanning_tree {
            out.push_str("warning: agreed edges do not form a spanning tree\n");
        }
        out
    }
}
