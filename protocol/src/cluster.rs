//! Deterministic in-process driver.
//!
//! The cluster owns one [`NodeActor`] per topology vertex and a single shared
//! message queue standing in for the network. Delivering one envelope at a
//! time trivially satisfies the per-node serialization requirement, and the
//! pluggable [`DeliveryOrder`] lets the test suites run the same input under
//! FIFO, LIFO and seeded-shuffle schedules — the protocol must produce the
//! same spanning tree under every interleaving.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::transport::{PeerHandle, Transport};
use crate::{
    properties, Edge, Envelope, NodeActor, NodeId, NodeSnapshot, ProtocolError, ProtocolResult,
    Topology,
};

/// Order in which queued envelopes are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOrder {
    /// Oldest first.
    Fifo,
    /// Newest first — adversarially reverses causal intuition.
    Lifo,
    /// Uniformly random pick, reproducible from the seed.
    Shuffled(u64),
}

enum Scheduler {
    Fifo,
    Lifo,
    Shuffled(StdRng),
}

impl Scheduler {
    fn new(order: DeliveryOrder) -> Self {
        match order {
            DeliveryOrder::Fifo => Scheduler::Fifo,
            DeliveryOrder::Lifo => Scheduler::Lifo,
            DeliveryOrder::Shuffled(seed) => Scheduler::Shuffled(StdRng::seed_from_u64(seed)),
        }
    }

    fn pick(&mut self, queue: &mut VecDeque<Envelope>) -> Option<Envelope> {
        match self {
            Scheduler::Fifo => queue.pop_front(),
            Scheduler::Lifo => queue.pop_back(),
            Scheduler::Shuffled(rng) => {
                if queue.is_empty() {
                    None
                } else {
                    let index = rng.gen_range(0..queue.len());
                    queue.remove(index)
                }
            }
        }
    }
}

/// In-process [`Transport`]: sends append to a shared queue the cluster later
/// drains. Resolution only succeeds for registered nodes.
pub struct ClusterTransport {
    known: BTreeSet<NodeId>,
    queue: Mutex<VecDeque<Envelope>>,
}

impl ClusterTransport {
    fn new(known: BTreeSet<NodeId>) -> Self {
        Self {
            known,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<Envelope>> {
        // a poisoned queue only means a panic mid-test; the data is still fine
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of undelivered envelopes.
    pub fn pending(&self) -> usize {
        self.queue().len()
    }
}

impl Transport for ClusterTransport {
    fn resolve(&self, peer: NodeId) -> Option<PeerHandle> {
        self.known.contains(&peer).then(|| PeerHandle::new(peer))
    }

    fn send(&self, _handle: &PeerHandle, envelope: Envelope) {
        self.queue().push_back(envelope);
    }
}

/// Deterministic driver over a full topology.
pub struct Cluster {
    transport: Arc<ClusterTransport>,
    nodes: BTreeMap<NodeId, NodeActor>,
    scheduler: Scheduler,
    delivered: usize,
}

impl Cluster {
    /// Build one actor per topology vertex, all wired to a shared in-process
    /// transport, delivering in the given order.
    pub fn new(topology: &Topology, order: DeliveryOrder) -> ProtocolResult<Self> {
        let transport = Arc::new(ClusterTransport::new(topology.nodes().collect()));
        let mut nodes = BTreeMap::new();
        for id in topology.nodes() {
            let actor = NodeActor::new(
                id,
                topology.incident_edges(id),
                Arc::clone(&transport) as Arc<dyn Transport>,
            )?;
            nodes.insert(id, actor);
        }
        Ok(Self {
            transport,
            nodes,
            scheduler: Scheduler::new(order),
            delivered: 0,
        })
    }

    /// Trigger the spontaneous wake of every node, in ascending id order.
    /// Waking twice is harmless.
    pub fn wake_all(&mut self) -> ProtocolResult<()> {
        for node in self.nodes.values_mut() {
            node.wake()?;
        }
        Ok(())
    }

    /// Trigger one node's spontaneous wake.
    pub fn wake(&mut self, id: NodeId) -> ProtocolResult<()> {
        match self.nodes.get_mut(&id) {
            Some(node) => node.wake(),
            None => Err(ProtocolError::ProtocolViolation(format!(
                "no node {id} in this cluster"
            ))),
        }
    }

    /// Deliver one envelope according to the delivery order. Returns `false`
    /// when the queue is empty.
    pub fn step(&mut self) -> ProtocolResult<bool> {
        let picked = {
            let mut queue = self.transport.queue();
            self.scheduler.pick(&mut queue)
        };
        let Some(envelope) = picked else {
            return Ok(false);
        };
        let node = self.nodes.get_mut(&envelope.to).ok_or_else(|| {
            ProtocolError::ProtocolViolation(format!(
                "envelope addressed to unregistered node {}",
                envelope.to
            ))
        })?;
        node.handle(envelope.from, envelope.message)?;
        self.delivered += 1;
        Ok(true)
    }

    /// Deliver until the queue is empty, failing if that takes more than
    /// `max_deliveries` messages — a convergence hang is a defect, not a
    /// condition to wait out.
    pub fn run_to_quiescence(&mut self, max_deliveries: usize) -> ProtocolResult<usize> {
        let before = self.delivered;
        while self.step()? {
            if self.delivered - before > max_deliveries {
                return Err(ProtocolError::NoQuiescence(max_deliveries));
            }
        }
        Ok(self.delivered - before)
    }

    /// Whether no messages remain in flight.
    pub fn is_quiescent(&self) -> bool {
        self.transport.pending() == 0
    }

    /// Number of undelivered envelopes.
    pub fn pending_messages(&self) -> usize {
        self.transport.pending()
    }

    /// Total envelopes delivered so far.
    pub fn delivered(&self) -> usize {
        self.delivered
    }

    /// Borrow one node.
    pub fn node(&self, id: NodeId) -> Option<&NodeActor> {
        self.nodes.get(&id)
    }

    /// Iterate all nodes in ascending id order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeActor> {
        self.nodes.values()
    }

    /// Snapshot every node.
    pub fn snapshots(&self) -> Vec<NodeSnapshot> {
        self.nodes.values().map(NodeActor::snapshot).collect()
    }

    /// The agreed spanning tree: every edge classified `Branch` at both of
    /// its endpoints.
    pub fn branch_edges(&self) -> BTreeSet<Edge> {
        properties::agreed_branches(self.nodes.values())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle() -> Topology {
        Topology::from_edges([(0, 1, 1), (1, 2, 2), (0, 2, 3)]).unwrap()
    }

    #[test]
    fn triangle_converges_to_the_reference_mst() {
        let topology = triangle();
        let mut cluster = Cluster::new(&topology, DeliveryOrder::Fifo).unwrap();
        cluster.wake_all().unwrap();
        cluster.run_to_quiescence(10_000).unwrap();
        assert!(cluster.is_quiescent());
        assert_eq!(cluster.branch_edges(), properties::reference_mst(&topology));
    }

    #[test]
    fn delivery_orders_agree_on_the_result() {
        let topology = triangle();
        let expected = properties::reference_mst(&topology);
        for order in [
            DeliveryOrder::Fifo,
            DeliveryOrder::Lifo,
            DeliveryOrder::Shuffled(7),
            DeliveryOrder::Shuffled(1234),
        ] {
            let mut cluster = Cluster::new(&topology, order).unwrap();
            cluster.wake_all().unwrap();
            cluster.run_to_quiescence(10_000).unwrap();
            assert_eq!(cluster.branch_edges(), expected, "order {order:?}");
        }
    }

    #[test]
    fn partial_wake_still_converges() {
        // a single wake is enough: connects induce the rest of the network
        let topology = triangle();
        let mut cluster = Cluster::new(&topology, DeliveryOrder::Fifo).unwrap();
        cluster.wake(0).unwrap();
        cluster.run_to_quiescence(10_000).unwrap();
        assert_eq!(cluster.branch_edges(), properties::reference_mst(&topology));
    }

    #[test]
    fn quiescence_budget_is_enforced() {
        let topology = triangle();
        let mut cluster = Cluster::new(&topology, DeliveryOrder::Fifo).unwrap();
        cluster.wake_all().unwrap();
        assert_eq!(
            cluster.run_to_quiescence(1),
            Err(ProtocolError::NoQuiescence(1))
        );
    }
}
