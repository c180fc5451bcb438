//! # Per-node protocol state machine
//!
//! One [`NodeActor`] per graph vertex. A node starts `Sleeping`, wakes either
//! spontaneously (driver-triggered) or on its first incoming message, marks
//! its minimum-weight incident edge as a branch and asks the neighbour to
//! connect. From then on everything is message-driven: handlers mutate the
//! node-local fragment bookkeeping, decide phase transitions and emit zero or
//! more outbound messages through the injected [`Transport`], until a received
//! `Report` carries `Infinite` back over the core edge and the node halts.
//!
//! ## Deferred messages
//!
//! Three FIFO buffers hold messages whose causal preconditions are not
//! satisfied yet:
//!
//! - `Connect` waits until the relative seniority of the edge it arrived on is
//!   decidable: its classification left `Unknown`, or this fragment's level
//!   rose above the sender's.
//! - `Test` waits until this node's level has caught up with the sender's.
//! - `Report` from the core direction waits until this node's own search is
//!   out of the `Find` phase.
//!
//! Every handler entry point finishes by draining the buffers to fixpoint
//! with an explicit work-list loop, so any state change that unlocks a
//! deferred message is acted on before the node goes idle.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::Serialize;
use smallvec::SmallVec;
use tracing::{debug, info, warn};

use crate::transport::Transport;
use crate::{
    Edge, EdgeClassification, Envelope, Level, Message, NodeId, NodePhase, ProtocolError,
    ProtocolResult, Weight,
};

/// Serializable snapshot of a node's observable state, for reports and tests.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    /// Node identifier.
    pub id: NodeId,
    /// Current phase.
    pub phase: NodePhase,
    /// Whether the node has taken the terminal halt transition.
    pub halted: bool,
    /// Current fragment level.
    pub level: Level,
    /// Current fragment name, `None` before the first `Initiate`.
    pub fragment: Option<Weight>,
    /// Incident edges classified `Branch`, ascending by weight.
    pub branch_edges: Vec<Edge>,
    /// Incident edges classified `Rejected`, ascending by weight.
    pub rejected_edges: Vec<Edge>,
    /// Deferred `Connect` messages still buffered.
    pub deferred_connects: usize,
    /// Deferred `Test` messages still buffered.
    pub deferred_tests: usize,
    /// Deferred `Report` messages still buffered.
    pub deferred_reports: usize,
}

/// The protocol state machine for one node.
///
/// All state is node-local and mutated exclusively by the node's own handlers;
/// callers must serialize invocations of [`NodeActor::wake`] and
/// [`NodeActor::handle`] (one logical worker per node). Outbound messages go
/// through the injected transport and never block.
pub struct NodeActor {
    id: NodeId,
    /// Incident edges, fixed at construction, ascending by weight.
    edges: SmallVec<[Edge; 8]>,
    /// Belief about each incident edge; iteration order mirrors `edges`.
    classification: IndexMap<Edge, EdgeClassification>,
    phase: NodePhase,
    halted: bool,
    level: Level,
    /// Core-edge weight naming this node's fragment; undefined until the
    /// first `Initiate` is adopted.
    fragment: Option<Weight>,
    /// Edge toward the fragment core.
    in_branch: Option<Edge>,
    /// Outstanding `Report` responses expected from branch children.
    find_count: u32,
    /// Running minimum-outgoing-edge candidate.
    best_edge: Option<Edge>,
    best_weight: Weight,
    /// Edge currently being probed for outgoingness.
    test_edge: Option<Edge>,
    pending_connect: VecDeque<(NodeId, Level)>,
    pending_test: VecDeque<(NodeId, Level, Weight)>,
    pending_report: VecDeque<(NodeId, Weight)>,
    transport: Arc<dyn Transport>,
}

impl fmt::Debug for NodeActor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeActor")
            .field("id", &self.id)
            .field("phase", &self.phase)
            .field("halted", &self.halted)
            .field("level", &self.level)
            .field("fragment", &self.fragment)
            .field("find_count", &self.find_count)
            .field("best_weight", &self.best_weight)
            .finish_non_exhaustive()
    }
}

impl NodeActor {
    /// Construct a node with its full incident-edge list.
    ///
    /// Every edge must touch `id` and the list must be non-empty; both are
    /// adjacency-configuration errors that abort construction. The list is
    /// sorted ascending by weight, the order all scans use.
    pub fn new<I>(id: NodeId, edges: I, transport: Arc<dyn Transport>) -> ProtocolResult<Self>
    where
        I: IntoIterator<Item = Edge>,
    {
        let mut edges: SmallVec<[Edge; 8]> = edges.into_iter().collect();
        if edges.is_empty() {
            return Err(ProtocolError::NoIncidentEdges(id));
        }
        for edge in &edges {
            if !edge.touches(id) {
                let (lo, hi) = edge.endpoints();
                return Err(ProtocolError::NotAnEndpoint { node: id, lo, hi });
            }
        }
        edges.sort_unstable();
        let classification = edges
            .iter()
            .map(|e| (*e, EdgeClassification::Unknown))
            .collect();
        Ok(Self {
            id,
            edges,
            classification,
            phase: NodePhase::Sleeping,
            halted: false,
            level: 0,
            fragment: None,
            in_branch: None,
            find_count: 0,
            best_edge: None,
            best_weight: Weight::Infinite,
            test_edge: None,
            pending_connect: VecDeque::new(),
            pending_test: VecDeque::new(),
            pending_report: VecDeque::new(),
            transport,
        })
    }

    /// Node identifier.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Current phase.
    pub fn phase(&self) -> NodePhase {
        self.phase
    }

    /// Current fragment level.
    pub fn level(&self) -> Level {
        self.level
    }

    /// Current fragment name, `None` before the first `Initiate`.
    pub fn fragment(&self) -> Option<Weight> {
        self.fragment
    }

    /// Whether the node has halted.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// This node's belief about `edge`, if incident.
    pub fn classification_of(&self, edge: Edge) -> Option<EdgeClassification> {
        self.classification.get(&edge).copied()
    }

    /// Incident edges currently classified `Branch`, ascending by weight.
    pub fn branch_edges(&self) -> Vec<Edge> {
        self.edges_classified(EdgeClassification::Branch)
    }

    /// Incident edges currently classified `Rejected`, ascending by weight.
    pub fn rejected_edges(&self) -> Vec<Edge> {
        self.edges_classified(EdgeClassification::Rejected)
    }

    /// Buffered deferral counts `(connect, test, report)`.
    pub fn deferred_len(&self) -> (usize, usize, usize) {
        (
            self.pending_connect.len(),
            self.pending_test.len(),
            self.pending_report.len(),
        )
    }

    /// Snapshot of the observable state.
    pub fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            id: self.id,
            phase: self.phase,
            halted: self.halted,
            level: self.level,
            fragment: self.fragment,
            branch_edges: self.branch_edges(),
            rejected_edges: self.rejected_edges(),
            deferred_connects: self.pending_connect.len(),
            deferred_tests: self.pending_test.len(),
            deferred_reports: self.pending_report.len(),
        }
    }

    /// Spontaneous wake. A no-op on a node that is already awake or halted,
    /// so drivers may trigger it at any time in any order.
    pub fn wake(&mut self) -> ProtocolResult<()> {
        if self.halted || self.phase != NodePhase::Sleeping {
            return Ok(());
        }
        self.wakeup()?;
        self.drain_deferred()
    }

    /// Handle one incoming message. Invocations must be serialized per node.
    pub fn handle(&mut self, from: NodeId, message: Message) -> ProtocolResult<()> {
        if self.halted {
            debug!(node = self.id, peer = from, msg = ?message, "halted, ignoring message");
            return Ok(());
        }
        self.dispatch(from, message)?;
        self.drain_deferred()
    }

    fn dispatch(&mut self, from: NodeId, message: Message) -> ProtocolResult<()> {
        match message {
            Message::Connect { level } => self.on_connect(from, level),
            Message::Initiate { level, name, phase } => self.on_initiate(from, level, name, phase),
            Message::Test { level, name } => self.on_test(from, level, name),
            Message::Accept => self.on_accept(from),
            Message::Reject => self.on_reject(from),
            Message::Report { weight } => self.on_report(from, weight),
            Message::ChangeRoot => self.change_root(),
        }
    }

    fn wakeup(&mut self) -> ProtocolResult<()> {
        // edges are sorted, so the fragment starts on the cheapest one
        let j = self.edges[0];
        info!(node = self.id, edge = %j, "waking up");
        self.classify(j, EdgeClassification::Branch)?;
        self.level = 0;
        self.find_count = 0;
        self.phase = NodePhase::Found;
        self.send(j, Message::Connect { level: 0 })
    }

    fn on_connect(&mut self, from: NodeId, level: Level) -> ProtocolResult<()> {
        if self.phase == NodePhase::Sleeping {
            self.wakeup()?;
        }
        let j = self.edge_to(from)?;
        if level < self.level {
            // the sender's fragment is junior: absorb it as a branch subtree
            self.classify(j, EdgeClassification::Branch)?;
            let name = self.named_fragment()?;
            self.send(
                j,
                Message::Initiate {
                    level: self.level,
                    name,
                    phase: self.phase,
                },
            )?;
            if self.phase == NodePhase::Find {
                self.find_count += 1;
            }
        } else if self.class_of(j) == EdgeClassification::Unknown {
            // relative seniority of the two fragments is not decidable yet
            debug!(node = self.id, peer = from, level, "deferring connect");
            self.pending_connect.push_back((from, level));
        } else {
            // equal-level fragments joined over their mutual minimum outgoing
            // edge: combine one level up, named after the connecting edge
            info!(node = self.id, peer = from, core = %j, "merging fragments");
            self.send(
                j,
                Message::Initiate {
                    level: self.level + 1,
                    name: j.weight(),
                    phase: NodePhase::Find,
                },
            )?;
        }
        Ok(())
    }

    fn on_initiate(
        &mut self,
        from: NodeId,
        level: Level,
        name: Weight,
        phase: NodePhase,
    ) -> ProtocolResult<()> {
        let j = self.edge_to(from)?;
        debug!(node = self.id, level, name = %name, ?phase, "adopting fragment identity");
        self.level = level;
        self.fragment = Some(name);
        self.phase = phase;
        self.in_branch = Some(j);
        self.best_edge = None;
        self.best_weight = Weight::Infinite;
        let children: SmallVec<[Edge; 8]> = self
            .classification
            .iter()
            .filter(|(e, c)| **e != j && **c == EdgeClassification::Branch)
            .map(|(e, _)| *e)
            .collect();
        for child in children {
            self.send(child, Message::Initiate { level, name, phase })?;
            if phase == NodePhase::Find {
                self.find_count += 1;
            }
        }
        // the level rise may unlock queued tests and connects; settle them
        // before scanning for candidates, so freshly rejected internal edges
        // are excluded from the search
        self.drain_deferred()?;
        if self.phase == NodePhase::Find {
            self.start_test()?;
        }
        Ok(())
    }

    /// Begin or continue the minimum-outgoing-edge search: probe the cheapest
    /// edge still `Unknown`, or conclude the local search when none remains.
    fn start_test(&mut self) -> ProtocolResult<()> {
        let candidate = self
            .classification
            .iter()
            .find(|(_, c)| **c == EdgeClassification::Unknown)
            .map(|(e, _)| *e);
        match candidate {
            Some(edge) => {
                self.test_edge = Some(edge);
                let name = self.named_fragment()?;
                self.send(
                    edge,
                    Message::Test {
                        level: self.level,
                        name,
                    },
                )
            }
            None => {
                self.test_edge = None;
                self.try_report()
            }
        }
    }

    fn on_test(&mut self, from: NodeId, level: Level, name: Weight) -> ProtocolResult<()> {
        if self.phase == NodePhase::Sleeping {
            self.wakeup()?;
        }
        if level > self.level {
            // the sender's fragment is ahead; answering now could misread an
            // edge that is about to become internal
            debug!(node = self.id, peer = from, level, "deferring test");
            self.pending_test.push_back((from, level, name));
            return Ok(());
        }
        let j = self.edge_to(from)?;
        if Some(name) != self.fragment {
            // the edge crosses fragments: a candidate outgoing edge
            self.send(j, Message::Accept)
        } else {
            if self.class_of(j) == EdgeClassification::Unknown {
                self.classify(j, EdgeClassification::Rejected)?;
            }
            if self.test_edge != Some(j) {
                self.send(j, Message::Reject)
            } else {
                // both ends are probing the same internal edge; the crossed
                // Test messages answer each other, so re-scan instead of
                // replying
                self.start_test()
            }
        }
    }

    fn on_accept(&mut self, from: NodeId) -> ProtocolResult<()> {
        let j = self.edge_to(from)?;
        self.test_edge = None;
        if j.weight() < self.best_weight {
            self.best_edge = Some(j);
            self.best_weight = j.weight();
        }
        self.try_report()
    }

    fn on_reject(&mut self, from: NodeId) -> ProtocolResult<()> {
        let j = self.edge_to(from)?;
        if self.class_of(j) == EdgeClassification::Unknown {
            self.classify(j, EdgeClassification::Rejected)?;
        }
        self.start_test()
    }

    fn on_report(&mut self, from: NodeId, weight: Weight) -> ProtocolResult<()> {
        let j = self.edge_to(from)?;
        if Some(j) != self.in_branch {
            // a branch child answered
            self.find_count = self.find_count.checked_sub(1).ok_or_else(|| {
                ProtocolError::ProtocolViolation(format!(
                    "node {}: report from {from} but no responses outstanding",
                    self.id
                ))
            })?;
            if weight < self.best_weight {
                self.best_weight = weight;
                self.best_edge = Some(j);
            }
            self.try_report()
        } else if self.phase == NodePhase::Find {
            // our own subtree has not resolved; judging the other side of the
            // core now would race the comparison
            debug!(node = self.id, peer = from, "deferring report");
            self.pending_report.push_back((from, weight));
            Ok(())
        } else if weight > self.best_weight {
            self.change_root()
        } else if weight == self.best_weight && self.best_weight == Weight::Infinite {
            // both halves of the fragment ran out of outgoing edges: the
            // fragment spans the network
            self.halt();
            Ok(())
        } else {
            debug!(node = self.id, %weight, "report resolved in the other side's favour");
            Ok(())
        }
    }

    /// Report upward once every subordinate has answered and the local probe
    /// is settled. The `Find` guard makes a duplicated `Accept`/`Reject`
    /// harmless: the first report moved the node to `Found`.
    fn try_report(&mut self) -> ProtocolResult<()> {
        if self.find_count == 0 && self.test_edge.is_none() && self.phase == NodePhase::Find {
            self.phase = NodePhase::Found;
            let toward_core = self.in_branch.ok_or_else(|| {
                ProtocolError::ProtocolViolation(format!(
                    "node {}: concluding a search without an in-branch",
                    self.id
                ))
            })?;
            debug!(node = self.id, best = %self.best_weight, "reporting");
            self.send(
                toward_core,
                Message::Report {
                    weight: self.best_weight,
                },
            )?;
        }
        Ok(())
    }

    /// Redirect the fragment toward its minimum outgoing edge: delegate
    /// downstream when the edge is already a branch, otherwise connect over
    /// it directly, marking it a branch right away.
    fn change_root(&mut self) -> ProtocolResult<()> {
        let best = self.best_edge.ok_or_else(|| {
            ProtocolError::ProtocolViolation(format!(
                "node {}: change of root without a best edge",
                self.id
            ))
        })?;
        if self.class_of(best) == EdgeClassification::Branch {
            self.send(best, Message::ChangeRoot)
        } else {
            self.send(best, Message::Connect { level: self.level })?;
            self.classify(best, EdgeClassification::Branch)
        }
    }

    /// Terminal transition: the node stops initiating protocol action.
    fn halt(&mut self) {
        info!(node = self.id, "spanning tree complete, halting");
        self.phase = NodePhase::Sleeping;
        self.halted = true;
    }

    /// Work-list drain of the three deferral buffers, to fixpoint.
    ///
    /// Each pass releases at most one message (connects first, then tests,
    /// then reports) and re-evaluates, since any release can change the
    /// conditions of the others.
    fn drain_deferred(&mut self) -> ProtocolResult<()> {
        loop {
            if self.halted {
                return Ok(());
            }
            if let Some(pos) = self.releasable_connect() {
                if let Some((from, level)) = self.pending_connect.remove(pos) {
                    debug!(node = self.id, peer = from, "releasing deferred connect");
                    self.on_connect(from, level)?;
                }
                continue;
            }
            if let Some(pos) = self.releasable_test() {
                if let Some((from, level, name)) = self.pending_test.remove(pos) {
                    debug!(node = self.id, peer = from, "releasing deferred test");
                    self.on_test(from, level, name)?;
                }
                continue;
            }
            if self.phase != NodePhase::Find {
                if let Some((from, weight)) = self.pending_report.pop_front() {
                    debug!(node = self.id, peer = from, "releasing deferred report");
                    self.on_report(from, weight)?;
                    continue;
                }
            }
            return Ok(());
        }
    }

    /// Oldest deferred connect whose seniority is now decidable: the edge's
    /// classification left `Unknown`, or this fragment outgrew the sender's
    /// level and can absorb it.
    fn releasable_connect(&self) -> Option<usize> {
        self.pending_connect.iter().position(|(from, level)| {
            *level < self.level
                || self
                    .edges
                    .iter()
                    .find(|e| e.touches(*from))
                    .is_some_and(|e| self.class_of(*e) != EdgeClassification::Unknown)
        })
    }

    /// Oldest deferred test whose level this node has caught up with.
    fn releasable_test(&self) -> Option<usize> {
        self.pending_test
            .iter()
            .position(|(_, level, _)| *level <= self.level)
    }

    fn edge_to(&self, peer: NodeId) -> ProtocolResult<Edge> {
        self.edges
            .iter()
            .copied()
            .find(|e| e.touches(peer))
            .ok_or(ProtocolError::UnknownPeer {
                node: self.id,
                peer,
            })
    }

    fn class_of(&self, edge: Edge) -> EdgeClassification {
        self.classification
            .get(&edge)
            .copied()
            .unwrap_or(EdgeClassification::Unknown)
    }

    fn classify(&mut self, edge: Edge, new: EdgeClassification) -> ProtocolResult<()> {
        let id = self.id;
        let Some(current) = self.classification.get_mut(&edge) else {
            let (lo, hi) = edge.endpoints();
            return Err(ProtocolError::NotAnEndpoint { node: id, lo, hi });
        };
        let previous = *current;
        if previous == new {
            return Ok(());
        }
        if previous != EdgeClassification::Unknown {
            return Err(ProtocolError::ProtocolViolation(format!(
                "node {id}: edge {edge} cannot move from {previous:?} to {new:?}"
            )));
        }
        *current = new;
        debug!(node = id, edge = %edge, classification = ?new, "classified edge");
        Ok(())
    }

    fn named_fragment(&self) -> ProtocolResult<Weight> {
        self.fragment.ok_or_else(|| {
            ProtocolError::ProtocolViolation(format!(
                "node {}: fragment name required before the first initiate",
                self.id
            ))
        })
    }

    fn send(&self, along: Edge, message: Message) -> ProtocolResult<()> {
        let to = along.other_endpoint(self.id)?;
        match self.transport.resolve(to) {
            Some(handle) => {
                debug!(node = self.id, peer = to, msg = ?message, "send");
                self.transport.send(
                    &handle,
                    Envelope {
                        from: self.id,
                        to,
                        message,
                    },
                );
            }
            // consistent with the no-failure assumption: no retry, no error
            None => warn!(node = self.id, peer = to, "peer unresolvable, dropping send"),
        }
        Ok(())
    }

    fn edges_classified(&self, class: EdgeClassification) -> Vec<Edge> {
        self.classification
            .iter()
            .filter(|(_, c)| **c == class)
            .map(|(e, _)| *e)
            .collect()
    }
}
