//! # Spantree Protocol
//!
//! Distributed minimum-spanning-tree construction in the Gallager–Humblet–Spira
//! style: every node starts as its own single-node fragment, repeatedly finds
//! its fragment's minimum outgoing edge using only local knowledge and
//! asynchronous point-to-point messages, and merges with the neighbouring
//! fragment across it. Fragments are identified by the weight of the edge the
//! last equal-level merge happened over (the *core edge*) together with a
//! merge-round *level*; the run converges once a single fragment spans the
//! network, at which point every edge classified [`EdgeClassification::Branch`]
//! at both of its endpoints belongs to the minimum spanning tree.
//!
//! ## Architecture
//!
//! - [`node::NodeActor`] — the per-node protocol state machine: fragment
//!   bookkeeping, the seven message handlers, and the deferred-message queues
//!   that hold back messages whose causal preconditions are not satisfied yet.
//! - [`transport::Transport`] — the delivery contract the core requires from
//!   whatever network layer hosts it: resolve a peer, fire-and-forget a
//!   message, drop silently on failure.
//! - [`cluster::Cluster`] — a deterministic in-process driver delivering one
//!   message at a time under a pluggable ordering policy, used by the test
//!   suites to exercise interleavings exhaustively.
//! - [`properties`] — reference checks (Kruskal oracle, spanning-tree
//!   predicates) the tests and the simulator's report verify against.
//!
//! ## Usage
//!
//! ```
//! use spantree_protocol::{Cluster, DeliveryOrder, Topology};
//!
//! let topology = Topology::from_edges([(0, 1, 4), (1, 2, 7), (0, 2, 9)])?;
//! let mut cluster = Cluster::new(&topology, DeliveryOrder::Fifo)?;
//! cluster.wake_all()?;
//! cluster.run_to_quiescence(10_000)?;
//! assert_eq!(cluster.branch_edges().len(), 2);
//! # Ok::<(), spantree_protocol::ProtocolError>(())
//! ```

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod cluster;
pub mod node;
pub mod transport;

pub use cluster::{Cluster, ClusterTransport, DeliveryOrder};
pub use node::{NodeActor, NodeSnapshot};
pub use transport::{PeerHandle, Transport};

/// Node identifier type.
pub type NodeId = u32;

/// Fragment level: the number of equal-level merge rounds behind a fragment.
pub type Level = u64;

/// Totally-ordered, network-unique edge weight.
///
/// A finite weight folds the raw cost together with the normalized endpoint
/// pair of the edge that carries it, so no two edges in the whole network can
/// ever compare equal even when raw costs collide. `Infinite` orders above
/// every finite weight and doubles as the "no candidate found" sentinel in the
/// minimum-outgoing-edge search. `Copy` is deliberate: a weight crossing the
/// wire must never alias mutable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Weight {
    /// Weight of a real edge: raw cost, then the normalized endpoints as
    /// tie-break keys.
    Finite {
        /// Raw edge cost.
        cost: u64,
        /// Smaller endpoint identifier.
        lo: NodeId,
        /// Larger endpoint identifier.
        hi: NodeId,
    },
    /// Sentinel greater than every finite weight.
    Infinite,
}

impl Weight {
    /// Build the weight of the edge `a`–`b` with the given raw cost,
    /// normalizing the endpoint order.
    pub fn finite(cost: u64, a: NodeId, b: NodeId) -> Self {
        Weight::Finite {
            cost,
            lo: a.min(b),
            hi: a.max(b),
        }
    }

    /// Whether this is the `Infinite` sentinel.
    pub fn is_infinite(&self) -> bool {
        matches!(self, Weight::Infinite)
    }

    /// Raw cost of a finite weight.
    pub fn cost(&self) -> Option<u64> {
        match self {
            Weight::Finite { cost, .. } => Some(*cost),
            Weight::Infinite => None,
        }
    }
}

impl fmt::Display for Weight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Weight::Finite { cost, lo, hi } => write!(f, "{cost}({lo}-{hi})"),
            Weight::Infinite => write!(f, "inf"),
        }
    }
}

/// Undirected weighted edge between two distinct nodes.
///
/// Endpoints are stored normalized (`lo < hi`), so two edges are equal exactly
/// when they join the same pair with the same weight. Ordering compares
/// weights only; that is consistent with equality because weights are unique
/// across the network (the weight folds the endpoints in).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Edge {
    lo: NodeId,
    hi: NodeId,
    weight: Weight,
}

impl Edge {
    /// Construct the edge `a`–`b` with the given raw cost.
    ///
    /// Rejects self-loops; the weight is derived internally so callers cannot
    /// break the weight-uniqueness invariant.
    pub fn new(a: NodeId, b: NodeId, cost: u64) -> ProtocolResult<Self> {
        if a == b {
            return Err(ProtocolError::SelfLoop(a));
        }
        Ok(Self {
            lo: a.min(b),
            hi: a.max(b),
            weight: Weight::finite(cost, a, b),
        })
    }

    /// The normalized endpoint pair `(lo, hi)`.
    pub fn endpoints(&self) -> (NodeId, NodeId) {
        (self.lo, self.hi)
    }

    /// The edge's weight.
    pub fn weight(&self) -> Weight {
        self.weight
    }

    /// Whether `id` is one of the endpoints.
    pub fn touches(&self, id: NodeId) -> bool {
        self.lo == id || self.hi == id
    }

    /// The endpoint opposite to `id`.
    pub fn other_endpoint(&self, id: NodeId) -> ProtocolResult<NodeId> {
        if id == self.lo {
            Ok(self.hi)
        } else if id == self.hi {
            Ok(self.lo)
        } else {
            Err(ProtocolError::NotAnEndpoint {
                node: id,
                lo: self.lo,
                hi: self.hi,
            })
        }
    }
}

impl PartialOrd for Edge {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Edge {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.weight.cmp(&other.weight)
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}[{}]", self.lo, self.hi, self.weight)
    }
}

/// A node's belief about one of its incident edges.
///
/// Monotonic per edge: `Unknown` may move to `Branch` or `Rejected`, and
/// neither of those ever changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeClassification {
    /// Not yet decided.
    Unknown,
    /// Confirmed part of the minimum spanning tree.
    Branch,
    /// Confirmed not part of the minimum spanning tree.
    Rejected,
}

/// Algorithm phase of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodePhase {
    /// Initial state, before the spontaneous or induced wake.
    Sleeping,
    /// Actively searching for the fragment's minimum outgoing edge.
    Find,
    /// This round's search is resolved as far as this node is concerned.
    Found,
}

/// Protocol message vocabulary.
///
/// The sender is carried by the [`Envelope`], not the message itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Message {
    /// Ask the fragment across this edge to combine with the sender's.
    Connect {
        /// Level of the sending fragment.
        level: Level,
    },
    /// Propagate the (possibly new) fragment identity through the tree and,
    /// when `phase` is `Find`, start a new minimum-outgoing-edge search.
    Initiate {
        /// Level to adopt.
        level: Level,
        /// Fragment name (core-edge weight) to adopt.
        name: Weight,
        /// Phase to adopt.
        phase: NodePhase,
    },
    /// Probe whether the edge leaves the sending node's fragment.
    Test {
        /// Level of the sending fragment.
        level: Level,
        /// Name of the sending fragment.
        name: Weight,
    },
    /// The tested edge leads outside the sender's fragment.
    Accept,
    /// The tested edge is internal to the sender's fragment.
    Reject,
    /// Best outgoing-edge weight known to the sender's subtree.
    Report {
        /// Minimum outgoing weight found, `Infinite` when none.
        weight: Weight,
    },
    /// Move the fragment root toward the best outgoing edge.
    ChangeRoot,
}

/// One addressed protocol message in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Envelope {
    /// Sending node.
    pub from: NodeId,
    /// Receiving node.
    pub to: NodeId,
    /// Payload.
    pub message: Message,
}

/// Errors of the protocol core.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// An edge was constructed with equal endpoints.
    #[error("self-loop edge at node {0}")]
    SelfLoop(NodeId),

    /// Two edges were declared between the same endpoint pair.
    #[error("duplicate edge between {0} and {1}")]
    DuplicateEdge(NodeId, NodeId),

    /// A topology without any edges cannot host a run.
    #[error("topology has no edges")]
    EmptyTopology,

    /// A node was constructed without incident edges.
    #[error("node {0} constructed with no incident edges")]
    NoIncidentEdges(NodeId),

    /// A message referenced a peer absent from the local incident-edge list:
    /// the transport or driver misconfigured adjacency.
    #[error("node {node} has no incident edge to peer {peer}")]
    UnknownPeer {
        /// The node that received the message.
        node: NodeId,
        /// The alleged sender.
        peer: NodeId,
    },

    /// A node was asked about an edge it is not an endpoint of.
    #[error("node {node} is not an endpoint of edge {lo}-{hi}")]
    NotAnEndpoint {
        /// The queried node.
        node: NodeId,
        /// Smaller endpoint of the edge.
        lo: NodeId,
        /// Larger endpoint of the edge.
        hi: NodeId,
    },

    /// An internal invariant was broken; signals a programming or
    /// configuration defect, not a runtime condition to recover from.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The cluster driver delivered the given number of messages without
    /// reaching quiescence.
    #[error("cluster did not quiesce within {0} delivered messages")]
    NoQuiescence(usize),
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Validated graph description shared by the cluster driver and the simulator.
///
/// Rejects self-loops and parallel edges at construction; the node set is
/// derived from the edge list, and each node's incident edges come out sorted
/// ascending by weight, which is the order the protocol scans them in.
#[derive(Debug, Clone)]
pub struct Topology {
    nodes: BTreeSet<NodeId>,
    edges: Vec<Edge>,
}

impl Topology {
    /// Build a topology from `(a, b, cost)` triples.
    pub fn from_edges<I>(triples: I) -> ProtocolResult<Self>
    where
        I: IntoIterator<Item = (NodeId, NodeId, u64)>,
    {
        let mut nodes = BTreeSet::new();
        let mut seen_pairs = BTreeSet::new();
        let mut edges = Vec::new();
        for (a, b, cost) in triples {
            let edge = Edge::new(a, b, cost)?;
            if !seen_pairs.insert(edge.endpoints()) {
                let (lo, hi) = edge.endpoints();
                return Err(ProtocolError::DuplicateEdge(lo, hi));
            }
            nodes.insert(a);
            nodes.insert(b);
            edges.push(edge);
        }
        if edges.is_empty() {
            return Err(ProtocolError::EmptyTopology);
        }
        edges.sort_unstable();
        Ok(Self { nodes, edges })
    }

    /// All node identifiers, ascending.
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.iter().copied()
    }

    /// Number of nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// All edges, ascending by weight.
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// The edges incident to `id`, ascending by weight.
    pub fn incident_edges(&self, id: NodeId) -> SmallVec<[Edge; 8]> {
        self.edges.iter().copied().filter(|e| e.touches(id)).collect()
    }

    /// Whether the graph is connected. Disconnected inputs never converge to
    /// a single fragment, so drivers should reject them up front.
    pub fn is_connected(&self) -> bool {
        let mut components = properties::DisjointSet::new(&self.nodes);
        for edge in &self.edges {
            let (lo, hi) = edge.endpoints();
            components.union(lo, hi);
        }
        components.component_count() <= 1
    }
}

pub mod properties {
    //! Reference predicates for verifying protocol outcomes.
    //!
    //! The protocol's result is checked against a plain sequential Kruskal
    //! run over the same topology; because weights are globally unique the
    //! minimum spanning tree is unique and the comparison is exact equality.

    use std::collections::{BTreeMap, BTreeSet};

    use crate::{Edge, NodeId, Topology};

    /// Union-find over an arbitrary node-id set.
    pub(crate) struct DisjointSet {
        ids: Vec<NodeId>,
        parent: Vec<usize>,
        rank: Vec<u8>,
    }

    impl DisjointSet {
        pub(crate) fn new(nodes: &BTreeSet<NodeId>) -> Self {
            let ids: Vec<NodeId> = nodes.iter().copied().collect();
            let parent = (0..ids.len()).collect();
            let rank = vec![0; ids.len()];
            Self { ids, parent, rank }
        }

        fn index_of(&self, id: NodeId) -> Option<usize> {
            self.ids.binary_search(&id).ok()
        }

        fn find(&mut self, mut x: usize) -> usize {
            while self.parent[x] != x {
                self.parent[x] = self.parent[self.parent[x]];
                x = self.parent[x];
            }
            x
        }

        /// Join the components of `a` and `b`; true when they were distinct.
        pub(crate) fn union(&mut self, a: NodeId, b: NodeId) -> bool {
            let (Some(a), Some(b)) = (self.index_of(a), self.index_of(b)) else {
                return false;
            };
            let (ra, rb) = (self.find(a), self.find(b));
            if ra == rb {
                return false;
            }
            if self.rank[ra] < self.rank[rb] {
                self.parent[ra] = rb;
            } else if self.rank[ra] > self.rank[rb] {
                self.parent[rb] = ra;
            } else {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
            true
        }

        pub(crate) fn component_count(&mut self) -> usize {
            let mut roots = BTreeSet::new();
            for i in 0..self.ids.len() {
                let root = self.find(i);
                roots.insert(root);
            }
            roots.len()
        }
    }

    /// The unique minimum spanning tree of `topology`, by Kruskal's algorithm.
    pub fn reference_mst(topology: &Topology) -> BTreeSet<Edge> {
        let nodes: BTreeSet<NodeId> = topology.nodes().collect();
        let mut components = DisjointSet::new(&nodes);
        let mut mst = BTreeSet::new();
        // topology edges are already sorted ascending by weight
        for edge in topology.edges() {
            let (lo, hi) = edge.endpoints();
            if components.union(lo, hi) {
                mst.insert(*edge);
            }
        }
        mst
    }

    /// Whether `edges` forms a spanning tree of `topology`'s node set.
    pub fn is_spanning_tree(topology: &Topology, edges: &BTreeSet<Edge>) -> bool {
        if edges.len() + 1 != topology.node_count() {
            return false;
        }
        let nodes: BTreeSet<NodeId> = topology.nodes().collect();
        let mut components = DisjointSet::new(&nodes);
        for edge in edges {
            let (lo, hi) = edge.endpoints();
            if !components.union(lo, hi) {
                // cycle
                return false;
            }
        }
        components.component_count() == 1
    }

    /// Sum of the raw costs of `edges`.
    pub fn total_cost<'a, I>(edges: I) -> u64
    where
        I: IntoIterator<Item = &'a Edge>,
    {
        edges
            .into_iter()
            .filter_map(|e| e.weight().cost())
            .sum()
    }

    /// The spanning tree a set of nodes agrees on: every edge classified
    /// `Branch` at both of its endpoints.
    pub fn agreed_branches<'a, I>(nodes: I) -> BTreeSet<Edge>
    where
        I: IntoIterator<Item = &'a crate::NodeActor>,
    {
        let mut counts: BTreeMap<Edge, u8> = BTreeMap::new();
        for node in nodes {
            for edge in node.branch_edges() {
                *counts.entry(edge).or_insert(0) += 1;
            }
        }
        counts
            .into_iter()
            .filter(|(_, endpoints)| *endpoints == 2)
            .map(|(edge, _)| edge)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_infinite_is_greatest() {
        let w = Weight::finite(u64::MAX, 0, 1);
        assert!(w < Weight::Infinite);
        assert!(Weight::Infinite <= Weight::Infinite);
    }

    #[test]
    fn weight_folds_endpoints_for_uniqueness() {
        let a = Weight::finite(7, 0, 1);
        let b = Weight::finite(7, 2, 3);
        assert_ne!(a, b);
        assert!(a < b);
        // normalization makes the fold orientation-independent
        assert_eq!(Weight::finite(7, 1, 0), a);
    }

    #[test]
    fn edge_rejects_self_loop() {
        assert_eq!(Edge::new(3, 3, 1), Err(ProtocolError::SelfLoop(3)));
    }

    #[test]
    fn edge_orders_by_weight_only() {
        let cheap = Edge::new(5, 6, 1).unwrap();
        let dear = Edge::new(0, 1, 9).unwrap();
        assert!(cheap < dear);
    }

    #[test]
    fn edge_other_endpoint() {
        let e = Edge::new(2, 7, 4).unwrap();
        assert_eq!(e.other_endpoint(2), Ok(7));
        assert_eq!(e.other_endpoint(7), Ok(2));
        assert!(matches!(
            e.other_endpoint(9),
            Err(ProtocolError::NotAnEndpoint { node: 9, .. })
        ));
    }

    #[test]
    fn topology_rejects_parallel_edges() {
        let result = Topology::from_edges([(0, 1, 1), (1, 0, 2)]);
        assert_eq!(result.unwrap_err(), ProtocolError::DuplicateEdge(0, 1));
    }

    #[test]
    fn topology_incident_edges_sorted() {
        let topology = Topology::from_edges([(0, 1, 9), (0, 2, 3), (0, 3, 6)]).unwrap();
        let incident = topology.incident_edges(0);
        let costs: Vec<u64> = incident
            .iter()
            .filter_map(|e| e.weight().cost())
            .collect();
        assert_eq!(costs, vec![3, 6, 9]);
    }

    #[test]
    fn topology_connectivity() {
        let connected = Topology::from_edges([(0, 1, 1), (1, 2, 2)]).unwrap();
        assert!(connected.is_connected());
        let split = Topology::from_edges([(0, 1, 1), (2, 3, 2)]).unwrap();
        assert!(!split.is_connected());
    }

    #[test]
    fn reference_mst_on_triangle() {
        let topology = Topology::from_edges([(0, 1, 1), (1, 2, 2), (0, 2, 3)]).unwrap();
        let mst = properties::reference_mst(&topology);
        let costs: Vec<u64> = mst.iter().filter_map(|e| e.weight().cost()).collect();
        assert_eq!(costs, vec![1, 2]);
        assert!(properties::is_spanning_tree(&topology, &mst));
        assert_eq!(properties::total_cost(&mst), 3);
    }
}
